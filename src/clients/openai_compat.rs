//! OpenAI 兼容接口客户端
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Gemini 的 OpenAI 兼容端点）

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{InferenceApi, InferenceError, InferenceRequest};

/// OpenAI 兼容客户端
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiCompatClient {
    pub fn new(api_key: &str, api_base_url: &str) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base_url.trim_end_matches('/'));

        Self {
            client: Client::with_config(openai_config),
        }
    }
}

#[async_trait]
impl InferenceApi for OpenAiCompatClient {
    async fn send(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        debug!("调用 LLM API，模型: {}", request.model);
        debug!("提示词长度: {} 字符", request.prompt.len());

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.as_str())
            .build()
            .map_err(|e| InferenceError::BadRequest(e.to_string()))?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&request.model)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)]);
        if let Some(temperature) = request.params.temperature {
            builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.params.max_output_tokens {
            builder.max_tokens(max_tokens);
        }
        let chat_request = builder
            .build()
            .map_err(|e| InferenceError::BadRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                classify_openai_error(e)
            })?;

        debug!("LLM API 调用成功");

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| InferenceError::Unknown("LLM 返回内容为空".to_string()))
    }
}

fn classify_openai_error(err: OpenAIError) -> InferenceError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                InferenceError::Timeout
            } else if let Some(status) = e.status() {
                InferenceError::from_status(status.as_u16(), e.to_string(), None)
            } else {
                InferenceError::Transport(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => classify_api_message(&api.to_string()),
        other => InferenceError::Unknown(other.to_string()),
    }
}

/// API 错误体里没有状态码，只能按内容判断
fn classify_api_message(message: &str) -> InferenceError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("resource_exhausted")
    {
        InferenceError::RateLimitedByServer { retry_after: None }
    } else if lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("permission")
        || lower.contains("401")
        || lower.contains("403")
    {
        InferenceError::Auth(message.to_string())
    } else if lower.contains("unavailable")
        || lower.contains("overloaded")
        || lower.contains("internal")
    {
        InferenceError::Server {
            status: 503,
            message: message.to_string(),
        }
    } else {
        InferenceError::BadRequest(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_api_message() {
        assert_eq!(
            classify_api_message("Resource has been exhausted (RESOURCE_EXHAUSTED)"),
            InferenceError::RateLimitedByServer { retry_after: None }
        );
        assert!(matches!(
            classify_api_message("API key not valid. Please pass a valid API key."),
            InferenceError::Auth(_)
        ));
        assert!(classify_api_message("The model is overloaded").is_transient());
        assert!(matches!(
            classify_api_message("Invalid value at 'contents'"),
            InferenceError::BadRequest(_)
        ));
    }

    /// 测试通用 LLM 调用
    ///
    /// 运行方式：
    /// ```bash
    /// GEMINI_API_KEY=... cargo test test_send_live -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_send_live() {
        let _ = tracing_subscriber::fmt::try_init();

        let api_key = std::env::var("GEMINI_API_KEY").expect("需要 GEMINI_API_KEY");
        let client = OpenAiCompatClient::new(
            &api_key,
            "https://generativelanguage.googleapis.com/v1beta/openai",
        );
        let request = InferenceRequest::new("gemini-2.0-flash", "Reply with the word: ok");

        let response = client.send(&request).await.expect("LLM 调用失败");
        println!("LLM 响应: {}", response);
        assert!(!response.is_empty());
    }
}
