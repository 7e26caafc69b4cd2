//! # Metaphor Pipeline
//!
//! 双代理隐喻分析流水线：agent1 检测候选隐喻，agent2 严格验证，
//! 两者共用一个按分钟和按天计数的合并请求额度。
//!
//! ## 架构设计
//!
//! ### ① 客户端层（Clients）
//! - `clients/` - `InferenceApi` 接缝，输入模型名和提示词，输出原始文本
//! - `GeminiRestClient` - Gemini 原生 REST 接口
//! - `OpenAiCompatClient` - OpenAI 兼容接口
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `RateLimiter` - 单调用方 + 合并额度的分钟/日窗口
//! - `ExternalCaller` - 限流、超时、指数退避重试
//! - `response_parser` - 四级回退的 JSON 解析
//! - `ParseFailureLog` - 记录无法解析的原始响应
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一篇文本"的完整处理流程
//! - `MetaphorFlow` - 状态机：检测 → 等待 → 验证 → 完成
//! - `PacingStrategy` - 两次调用之间的节奏
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_runner` - 批量处理存储中的文档，额度耗尽即停
//! - `orchestrator/app` - 由配置装配整个对象图
//!
//! ### 存储（Storage）
//! - `storage/` - `Storage` trait，内存实现和 JSON 文件实现

pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod storage;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{InferenceApi, InferenceError, InferenceRequest};
pub use config::Config;
pub use error::{ApiError, ConfigError, StorageError};
pub use models::{CandidateMetaphor, Document, ProcessingResult, ValidatedMetaphor};
pub use orchestrator::{App, BatchReport, BatchRunner, ItemFailure, ItemOutcome};
pub use services::{ExternalCaller, RateLimiter, RateLimits};
pub use storage::{JsonFileStore, MemoryStore, Storage};
pub use workflow::{MetaphorFlow, PipelineState};
