//! 程序配置
//!
//! 优先级：默认值 < TOML 配置文件 < 环境变量。

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::clients::gemini_rest::DEFAULT_GEMINI_BASE_URL;
use crate::error::ConfigError;
use crate::models::limits;
use crate::services::rate_limiter::{CallerLimits, RateLimits};
use crate::services::RetryPolicy;
use crate::workflow::PacingStrategy;

/// 检测阶段的调用方名称
pub const DETECTOR_CALLER: &str = "agent1";
/// 验证阶段的调用方名称
pub const VALIDATOR_CALLER: &str = "agent2";

/// 两个模型都不在已知额度表中时的合并上限
const FALLBACK_COMBINED_QUOTA: (u32, u32) = (10, 200);

const DEFAULT_OPENAI_COMPAT_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai";

/// 推理 API 后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiBackend {
    /// OpenAI 兼容接口（async-openai）
    OpenaiCompat,
    /// Gemini 原生 REST 接口（reqwest）
    GeminiRest,
}

impl FromStr for ApiBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai_compat" | "openai" => Ok(ApiBackend::OpenaiCompat),
            "gemini_rest" | "gemini" => Ok(ApiBackend::GeminiRest),
            other => Err(ConfigError::invalid(
                "api_backend",
                format!("未知后端 '{}'", other),
            )),
        }
    }
}

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 推理 API 配置 ---
    pub api_backend: ApiBackend,
    pub api_key: String,
    /// 不填则使用所选后端的默认地址
    pub api_base_url: Option<String>,
    /// 检测模型（agent1）
    pub detector_model: String,
    /// 验证模型（agent2）
    pub validator_model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,

    // --- 限流配置 ---
    /// 合并每分钟请求上限，不填则取两个模型中最严格的已知额度
    pub combined_rpm: Option<u32>,
    /// 合并每日请求上限，不填则取两个模型中最严格的已知额度
    pub combined_rpd: Option<u32>,
    /// 可选的单调用方上限
    pub detector_rpm: Option<u32>,
    pub detector_rpd: Option<u32>,
    pub validator_rpm: Option<u32>,
    pub validator_rpd: Option<u32>,

    // --- 重试配置 ---
    pub max_retry_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,

    // --- 节奏控制 ---
    /// none / fixed / minute_headroom / spread_daily
    pub pacing: String,
    pub pacing_min_delay_secs: u64,

    // --- 批处理配置 ---
    /// 单次运行最多处理的文档数
    pub max_items_per_run: usize,
    /// 文本最短长度（字符），短于此直接跳过
    pub min_text_chars: usize,
    /// 文档存储文件
    pub store_path: String,
    /// 解析失败的原始响应写入此文件（可选）
    pub parse_failure_log: Option<String>,
    /// 输出日志文件（可选）
    pub output_log_file: Option<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_backend: ApiBackend::GeminiRest,
            api_key: String::new(),
            api_base_url: None,
            detector_model: "gemini-2.0-flash".to_string(),
            validator_model: "gemini-2.5-flash".to_string(),
            temperature: None,
            max_output_tokens: None,
            request_timeout_secs: 120,
            combined_rpm: None,
            combined_rpd: None,
            detector_rpm: None,
            detector_rpd: None,
            validator_rpm: None,
            validator_rpd: None,
            max_retry_attempts: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            pacing: "minute_headroom".to_string(),
            pacing_min_delay_secs: 6,
            max_items_per_run: 50,
            min_text_chars: 100,
            store_path: "data/documents.json".to_string(),
            parse_failure_log: None,
            output_log_file: None,
            verbose_logging: false,
        }
    }
}

impl Config {
    /// 默认值 + 环境变量
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// TOML 文件 + 环境变量
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::FileReadFailed {
                path: path.display().to_string(),
                source,
            }
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        config.with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(key) = env_string("GEMINI_API_KEY").or_else(|| env_string("GOOGLE_API_KEY")) {
            self.api_key = key;
        }
        if let Some(backend) = env_string("API_BACKEND") {
            self.api_backend = backend.parse()?;
        }
        if let Some(url) = env_string("API_BASE_URL") {
            self.api_base_url = Some(url);
        }
        if let Some(model) = env_string("DETECTOR_MODEL") {
            self.detector_model = model;
        }
        if let Some(model) = env_string("VALIDATOR_MODEL") {
            self.validator_model = model;
        }
        if let Some(pacing) = env_string("PACING") {
            self.pacing = pacing;
        }
        if let Some(path) = env_string("STORE_PATH") {
            self.store_path = path;
        }
        if let Some(path) = env_string("PARSE_FAILURE_LOG") {
            self.parse_failure_log = Some(path);
        }
        if let Some(path) = env_string("OUTPUT_LOG_FILE") {
            self.output_log_file = Some(path);
        }

        override_parsed("REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        override_optional("COMBINED_RPM", &mut self.combined_rpm)?;
        override_optional("COMBINED_RPD", &mut self.combined_rpd)?;
        override_parsed("MAX_RETRY_ATTEMPTS", &mut self.max_retry_attempts)?;
        override_parsed("BASE_BACKOFF_MS", &mut self.base_backoff_ms)?;
        override_parsed("MAX_BACKOFF_MS", &mut self.max_backoff_ms)?;
        override_parsed("PACING_MIN_DELAY_SECS", &mut self.pacing_min_delay_secs)?;
        override_parsed("MAX_ITEMS_PER_RUN", &mut self.max_items_per_run)?;
        override_parsed("MIN_TEXT_CHARS", &mut self.min_text_chars)?;
        override_parsed("VERBOSE_LOGGING", &mut self.verbose_logging)?;

        Ok(self)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (rpm, rpd) = self.combined_ceilings();
        if rpm == 0 {
            return Err(ConfigError::invalid("combined_rpm", "必须大于 0"));
        }
        if rpd == 0 {
            return Err(ConfigError::invalid("combined_rpd", "必须大于 0"));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::invalid("max_retry_attempts", "至少为 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("request_timeout_secs", "必须大于 0"));
        }
        if self.detector_model.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "detector_model".to_string(),
            });
        }
        if self.validator_model.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "validator_model".to_string(),
            });
        }
        self.pacing_strategy()?;
        Ok(())
    }

    /// 调用 API 前额外要求 api_key
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        if self.api_key.trim().is_empty() {
            Err(ConfigError::Missing {
                key: "GEMINI_API_KEY / GOOGLE_API_KEY".to_string(),
            })
        } else {
            Ok(&self.api_key)
        }
    }

    pub fn base_url(&self) -> &str {
        match (&self.api_base_url, self.api_backend) {
            (Some(url), _) => url,
            (None, ApiBackend::GeminiRest) => DEFAULT_GEMINI_BASE_URL,
            (None, ApiBackend::OpenaiCompat) => DEFAULT_OPENAI_COMPAT_BASE_URL,
        }
    }

    /// 合并上限 (rpm, rpd)：显式配置优先，其次是已配置模型的已知额度
    pub fn combined_ceilings(&self) -> (u32, u32) {
        let (model_rpm, model_rpd) =
            limits::combined_quota(&self.detector_model, &self.validator_model)
                .unwrap_or(FALLBACK_COMBINED_QUOTA);
        (
            self.combined_rpm.unwrap_or(model_rpm),
            self.combined_rpd.unwrap_or(model_rpd),
        )
    }

    pub fn rate_limits(&self) -> RateLimits {
        let (rpm, rpd) = self.combined_ceilings();
        RateLimits::new(rpm, rpd)
            .with_caller(
                DETECTOR_CALLER,
                CallerLimits {
                    rpm: self.detector_rpm,
                    rpd: self.detector_rpd,
                },
            )
            .with_caller(
                VALIDATOR_CALLER,
                CallerLimits {
                    rpm: self.validator_rpm,
                    rpd: self.validator_rpd,
                },
            )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pacing_strategy(&self) -> Result<PacingStrategy, ConfigError> {
        let min_delay = Duration::from_secs(self.pacing_min_delay_secs);
        match self.pacing.trim().to_lowercase().as_str() {
            "none" => Ok(PacingStrategy::None),
            "fixed" => Ok(PacingStrategy::Fixed(min_delay)),
            "minute_headroom" => Ok(PacingStrategy::MinuteHeadroom { min_delay }),
            "spread_daily" => Ok(PacingStrategy::SpreadDaily { min_delay }),
            other => Err(ConfigError::invalid(
                "pacing",
                format!("未知节奏策略 '{}'", other),
            )),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn override_optional<T: FromStr>(name: &str, target: &mut Option<T>) -> Result<(), ConfigError> {
    if let Some(raw) = env_string(name) {
        *target = Some(parse_env(name, &raw)?);
    }
    Ok(())
}

fn override_parsed<T: FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Some(raw) = env_string(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: name.to_string(),
            value: raw.to_string(),
            expected_type: std::any::type_name::<T>().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_uses_most_restrictive_model_quota() {
        let config = Config::default();
        assert_eq!(config.combined_ceilings(), (10, 200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ceilings_follow_models_chosen_in_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"validator_model = "gemini-2.5-pro""#).unwrap();

        let config = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(config.combined_ceilings(), (5, 100));
        assert_eq!(config.rate_limits().effective_rpm(), 5);
        assert_eq!(config.rate_limits().effective_rpd(), 100);
    }

    #[test]
    fn test_explicit_ceiling_overrides_model_quota() {
        let config = Config {
            validator_model: "gemini-2.5-pro".to_string(),
            combined_rpd: Some(40),
            ..Config::default()
        };
        assert_eq!(config.combined_ceilings(), (5, 40));

        let unknown = Config {
            detector_model: "local-a".to_string(),
            validator_model: "local-b".to_string(),
            ..Config::default()
        };
        assert_eq!(unknown.combined_ceilings(), FALLBACK_COMBINED_QUOTA);
    }

    #[test]
    fn test_pacing_strategy_parsing() {
        let mut config = Config::default();
        config.pacing = "spread_daily".to_string();
        assert_eq!(
            config.pacing_strategy().unwrap(),
            PacingStrategy::SpreadDaily {
                min_delay: Duration::from_secs(6)
            }
        );

        config.pacing = "sometimes".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let config = Config {
            combined_rpm: Some(0),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_toml_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
api_backend = "gemini_rest"
combined_rpm = 4
detector_rpd = 120
pacing = "fixed"
"#
        )
        .unwrap();

        let config = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(config.api_backend, ApiBackend::GeminiRest);
        assert_eq!(config.combined_rpm, Some(4));
        assert_eq!(config.combined_ceilings(), (4, 200));
        assert_eq!(config.detector_rpd, Some(120));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.validator_model, "gemini-2.5-flash");
        assert_eq!(config.base_url(), DEFAULT_GEMINI_BASE_URL);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("gemini".parse::<ApiBackend>().unwrap(), ApiBackend::GeminiRest);
        assert_eq!(
            "OpenAI_Compat".parse::<ApiBackend>().unwrap(),
            ApiBackend::OpenaiCompat
        );
        assert!("bedrock".parse::<ApiBackend>().is_err());
    }
}
