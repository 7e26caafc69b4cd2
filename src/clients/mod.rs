//! 推理 API 客户端
//!
//! `InferenceApi` 是核心流程与外部模型之间唯一的接缝：
//! 输入模型名和提示词，输出原始文本或带类型的错误。

pub mod gemini_rest;
pub mod openai_compat;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use gemini_rest::GeminiRestClient;
pub use openai_compat::OpenAiCompatClient;

/// 生成参数
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// 单次推理请求
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// 推理 API 错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("请求超时")]
    Timeout,
    #[error("网络传输失败: {0}")]
    Transport(String),
    #[error("认证失败: {0}")]
    Auth(String),
    #[error("请求格式错误: {0}")]
    BadRequest(String),
    #[error("服务端限流, 建议等待: {retry_after:?}")]
    RateLimitedByServer { retry_after: Option<Duration> },
    #[error("服务端错误 (status={status}): {message}")]
    Server { status: u16, message: String },
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl InferenceError {
    /// 是否值得退避重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout
                | InferenceError::Transport(_)
                | InferenceError::RateLimitedByServer { .. }
                | InferenceError::Server { .. }
        )
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = message.into();
        match status {
            401 | 403 => InferenceError::Auth(message),
            429 => InferenceError::RateLimitedByServer { retry_after },
            408 => InferenceError::Timeout,
            400..=499 => InferenceError::BadRequest(message),
            500..=599 => InferenceError::Server { status, message },
            _ => InferenceError::Unknown(format!("status={} {}", status, message)),
        }
    }
}

/// 推理 API
#[async_trait]
pub trait InferenceApi: Send + Sync {
    /// 发送请求，返回模型的原始文本输出
    async fn send(&self, request: &InferenceRequest) -> Result<String, InferenceError>;
}
