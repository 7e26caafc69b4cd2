//! JSON 文件文档存储
//!
//! 文件内容是文档数组，每篇文档可以带一个 `analysis` 字段。
//! 写入先落到临时文件再 rename，中途崩溃不会留下半截文件。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::models::{ProcessedSummary, ProcessingResult, StoreStats};
use crate::storage::{
    sample_of, stats_of, unprocessed_of, AnalysisRecord, DocumentStream, Storage, StoredDocument,
};

/// JSON 文件文档存储
pub struct JsonFileStore {
    path: PathBuf,
    /// 串行化读-改-写
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Vec<StoredDocument>, StorageError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StorageError::read_failed(self.display_path(), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, documents: &[StoredDocument]) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(documents)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| StorageError::write_failed(tmp_path.display().to_string(), e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StorageError::write_failed(self.display_path(), e))?;

        debug!("已写入 {} 篇文档到 {}", documents.len(), self.display_path());
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStore {
    async fn fetch_unprocessed(
        &self,
        limit: Option<usize>,
    ) -> Result<DocumentStream, StorageError> {
        let documents = self.load().await?;
        let batch = unprocessed_of(&documents, limit);
        Ok(Box::pin(stream::iter(batch.into_iter().map(Ok))))
    }

    async fn persist_result(
        &self,
        id: &str,
        result: &ProcessingResult,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut documents = self.load().await?;
        let stored = documents
            .iter_mut()
            .find(|d| d.document.id == id)
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
        stored.analysis = Some(AnalysisRecord::from_result(
            result,
            chrono::Local::now().naive_local(),
        ));

        self.save(&documents).await
    }

    async fn read_stats(&self) -> Result<StoreStats, StorageError> {
        Ok(stats_of(&self.load().await?))
    }

    async fn processed_sample(&self, limit: usize) -> Result<Vec<ProcessedSummary>, StorageError> {
        Ok(sample_of(&self.load().await?, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ValidatedMetaphor;
    use futures::StreamExt;
    use std::time::Duration;

    const DOCUMENTS: &str = r#"[
        {"id": "speech-1", "title": "Financial stability", "text": "Banks held fire sales."},
        {"id": "speech-2", "text": "Nothing figurative here."}
    ]"#;

    fn result() -> ProcessingResult {
        ProcessingResult {
            validated: vec![ValidatedMetaphor {
                text: "fire sales".to_string(),
                context: "Banks held fire sales.".to_string(),
            }],
            candidates: Vec::new(),
            detector_model: "gemini-2.0-flash".to_string(),
            validator_model: "gemini-2.5-flash".to_string(),
            elapsed: Duration::from_millis(1500),
            detector_requests: 1,
            validator_requests: 1,
            candidate_count: 1,
            validated_count: 1,
            rejected_count: 0,
            contract_violations: 0,
            parse_failures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_persist_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        std::fs::write(&path, DOCUMENTS).unwrap();
        let store = JsonFileStore::new(&path);

        store.persist_result("speech-1", &result()).await.unwrap();

        // 新实例从磁盘读取
        let reopened = JsonFileStore::new(&path);
        let stats = reopened.read_stats().await.unwrap();
        assert_eq!((stats.total, stats.processed), (2, 1));

        let remaining: Vec<_> = reopened.fetch_unprocessed(None).await.unwrap().collect().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].as_ref().unwrap().id, "speech-2");

        let sample = reopened.processed_sample(5).await.unwrap();
        assert_eq!(sample[0].title.as_deref(), Some("Financial stability"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["analysis"]["metaphor_count"], 1);
        assert_eq!(raw[0]["analysis"]["stats"]["processing_time_secs"], 1.5);
        assert!(raw[1].get("analysis").is_none());
        assert!(!dir.path().join("documents.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.read_stats().await,
            Err(StorageError::ReadFailed { .. })
        ));

        let broken_path = dir.path().join("broken.json");
        std::fs::write(&broken_path, "[{\"id\": ").unwrap();
        let broken = JsonFileStore::new(&broken_path);
        assert!(matches!(
            broken.read_stats().await,
            Err(StorageError::Malformed(_))
        ));
    }
}
