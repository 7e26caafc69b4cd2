use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::clients::InferenceError;

/// 配额窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    /// 每分钟窗口，等待即可恢复
    Minute,
    /// 每日窗口，当天内不可恢复
    Day,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Minute => write!(f, "每分钟"),
            QuotaWindow::Day => write!(f, "每日"),
        }
    }
}

/// 外部调用错误
///
/// `ExternalCaller` 唯一会返回的错误类型。解析失败和契约违规不在此列，
/// 它们只记录在 `ProcessingResult` 中。
#[derive(Debug, Error)]
pub enum ApiError {
    /// 本地配额耗尽
    #[error("{window}配额已耗尽 (调用方: {caller}), {resets_in:?} 后重置")]
    QuotaExhausted {
        caller: String,
        window: QuotaWindow,
        resets_in: Duration,
    },
    /// 瞬时错误，已重试到上限
    #[error("请求 {model} 失败 (调用方: {caller}, 已尝试 {attempts} 次): {source}")]
    Transient {
        caller: String,
        model: String,
        attempts: u32,
        #[source]
        source: InferenceError,
    },
    /// 非瞬时错误，不重试
    #[error("请求 {model} 失败 (调用方: {caller}): {source}")]
    NonTransient {
        caller: String,
        model: String,
        #[source]
        source: InferenceError,
    },
}

impl ApiError {
    /// 是否为当日配额耗尽（批处理应立即停止）
    pub fn is_daily_exhaustion(&self) -> bool {
        matches!(
            self,
            ApiError::QuotaExhausted {
                window: QuotaWindow::Day,
                ..
            }
        )
    }
}

/// 存储层错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 读取失败
    #[error("读取存储失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入失败
    #[error("写入存储失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 文档格式错误
    #[error("存储内容解析失败: {0}")]
    Malformed(#[from] serde_json::Error),
    /// 文档不存在
    #[error("文档不存在: {id}")]
    NotFound { id: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 缺少必填项
    #[error("缺少必填配置: {key}")]
    Missing { key: String },
    /// 取值非法
    #[error("配置项 {key} 取值非法: {message}")]
    InvalidValue { key: String, message: String },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 便捷构造函数 ==========

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl StorageError {
    pub fn read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::ReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::WriteFailed {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_exhaustion_detection() {
        let day = ApiError::QuotaExhausted {
            caller: "agent1".to_string(),
            window: QuotaWindow::Day,
            resets_in: Duration::from_secs(3600),
        };
        let minute = ApiError::QuotaExhausted {
            caller: "agent1".to_string(),
            window: QuotaWindow::Minute,
            resets_in: Duration::from_secs(20),
        };
        let auth = ApiError::NonTransient {
            caller: "agent2".to_string(),
            model: "gemini-2.5-flash".to_string(),
            source: InferenceError::Auth("bad key".to_string()),
        };

        assert!(day.is_daily_exhaustion());
        assert!(!minute.is_daily_exhaustion());
        assert!(!auth.is_daily_exhaustion());
    }
}
