pub mod document_ctx;
pub mod metaphor_flow;
pub mod pacing;

pub use document_ctx::DocumentCtx;
pub use metaphor_flow::{FlowSettings, MetaphorFlow, PipelineState};
pub use pacing::PacingStrategy;
