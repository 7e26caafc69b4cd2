//! 解析失败记录服务 - 业务能力层
//!
//! 只负责"把解析失败的原始响应追加到文件"，不关心流程

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::models::Stage;
use crate::services::response_parser::ParseFailure;

/// 解析失败记录服务
///
/// 职责：
/// - 将无法解析的模型响应完整写入文件，日志里只打印截断后的内容
/// - 只处理单条失败记录
pub struct ParseFailureLog {
    path: PathBuf,
}

impl ParseFailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// 追加一条失败记录
    pub async fn write(&self, stage: Stage, failure: &ParseFailure) -> Result<(), StorageError> {
        let path = self.path.display().to_string();
        debug!(
            "写入解析失败记录: {}阶段 | 策略 {} | 原文长度: {}",
            stage,
            failure.last_strategy,
            failure.raw.len()
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::write_failed(&path, e))?;

        let entry = format!(
            "[{}] {}阶段 | 最后策略: {}\n{}\n{}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            stage,
            failure.last_strategy,
            failure.raw,
            "-".repeat(60)
        );

        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| StorageError::write_failed(&path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::response_parser::ParseStrategy;

    #[tokio::test]
    async fn test_entries_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = ParseFailureLog::new(dir.path().join("parse_failures.txt"));

        for raw in ["{\"metaphors\": [", "not json at all"] {
            let failure = ParseFailure {
                raw: raw.to_string(),
                last_strategy: ParseStrategy::FieldExtraction,
            };
            log.write(Stage::Validation, &failure).await.unwrap();
        }

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("{\"metaphors\": ["));
        assert!(content.contains("not json at all"));
        assert_eq!(content.matches("验证阶段").count(), 2);
    }
}
