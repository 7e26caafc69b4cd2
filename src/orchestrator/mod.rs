//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和应用装配，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用装配
//! - 由配置构建推理客户端、限流器、外部调用和分析流程
//! - 提供单篇、批量、统计三种运行方式
//!
//! ### `batch_runner` - 批量文档处理器
//! - 按额度预估本次处理数量
//! - 逐篇处理，单篇失败不影响其他文档
//! - 当日额度耗尽后停止发请求，剩余文档记为未处理
//!
//! ## 层次关系
//!
//! ```text
//! app (配置 → 对象图)
//!     ↓
//! batch_runner (处理文档流)
//!     ↓
//! workflow::MetaphorFlow (处理单篇文本)
//!     ↓
//! services (能力层：限流 / 外部调用 / 解析)
//!     ↓
//! clients (推理 API)
//! ```

pub mod app;
pub mod batch_runner;

pub use app::{show_stats, App};
pub use batch_runner::{BatchReport, BatchRunner, BatchSettings, ItemFailure, ItemOutcome};
