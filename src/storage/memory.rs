//! 内存文档存储

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::models::{Document, ProcessedSummary, ProcessingResult, StoreStats};
use crate::storage::{
    sample_of, stats_of, unprocessed_of, AnalysisRecord, DocumentStream, Storage, StoredDocument,
};

/// 内存文档存储
///
/// 按插入顺序返回文档；进程退出后数据丢失。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<Vec<StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let documents = documents.into_iter().map(StoredDocument::from).collect();
        Self {
            documents: Arc::new(RwLock::new(documents)),
        }
    }

    pub async fn insert(&self, document: Document) {
        self.documents.write().await.push(document.into());
    }

    /// 读取某篇文档的分析记录
    pub async fn analysis(&self, id: &str) -> Option<AnalysisRecord> {
        self.documents
            .read()
            .await
            .iter()
            .find(|d| d.document.id == id)
            .and_then(|d| d.analysis.clone())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn fetch_unprocessed(
        &self,
        limit: Option<usize>,
    ) -> Result<DocumentStream, StorageError> {
        let documents = self.documents.read().await;
        let batch = unprocessed_of(&documents, limit);
        Ok(Box::pin(stream::iter(batch.into_iter().map(Ok))))
    }

    async fn persist_result(
        &self,
        id: &str,
        result: &ProcessingResult,
    ) -> Result<(), StorageError> {
        let mut documents = self.documents.write().await;
        let stored = documents
            .iter_mut()
            .find(|d| d.document.id == id)
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
        stored.analysis = Some(AnalysisRecord::from_result(
            result,
            chrono::Local::now().naive_local(),
        ));
        Ok(())
    }

    async fn read_stats(&self) -> Result<StoreStats, StorageError> {
        Ok(stats_of(&self.documents.read().await))
    }

    async fn processed_sample(&self, limit: usize) -> Result<Vec<ProcessedSummary>, StorageError> {
        Ok(sample_of(&self.documents.read().await, limit))
    }
}
