pub mod document;
pub mod limits;
pub mod metaphor;

pub use document::{Document, ProcessedSummary, StoreStats};
pub use limits::{combined_quota, quota_for, ModelQuota};
pub use metaphor::{
    CandidateMetaphor, ParseFailureRecord, ProcessingResult, Stage, ValidatedMetaphor,
};
