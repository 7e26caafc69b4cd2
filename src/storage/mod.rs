//! 文档存储
//!
//! 批处理只通过 `Storage` trait 访问文档：取未处理文档、写回分析结果、读统计。
//! 提供两个实现：内存存储（测试和单次运行）与 JSON 文件存储。

pub mod json_file;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::models::{
    CandidateMetaphor, Document, ProcessedSummary, ProcessingResult, StoreStats,
    ValidatedMetaphor,
};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// 写入记录的分析方法标识
pub const ANALYSIS_METHOD: &str = "two_agent_detect_validate";

/// 未处理文档流（有限、只能消费一次）
pub type DocumentStream =
    Pin<Box<dyn Stream<Item = Result<Document, StorageError>> + Send + 'static>>;

/// 文档存储接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 取未处理文档，`limit` 为 None 时不限制数量
    async fn fetch_unprocessed(&self, limit: Option<usize>) -> Result<DocumentStream, StorageError>;

    /// 写回一篇文档的分析结果，写入后该文档视为已处理
    async fn persist_result(&self, id: &str, result: &ProcessingResult) -> Result<(), StorageError>;

    async fn read_stats(&self) -> Result<StoreStats, StorageError>;

    /// 已处理文档的抽样
    async fn processed_sample(&self, limit: usize) -> Result<Vec<ProcessedSummary>, StorageError>;
}

/// 写回文档的分析记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub metaphors: Vec<ValidatedMetaphor>,
    pub metaphor_count: usize,
    pub candidates: Vec<CandidateMetaphor>,
    pub method: String,
    pub processed_at: NaiveDateTime,
    pub stats: AnalysisStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub detector_model: String,
    pub validator_model: String,
    pub candidate_count: usize,
    pub validated_count: usize,
    pub rejected_count: usize,
    pub contract_violations: usize,
    pub parse_failures: usize,
    pub processing_time_secs: f64,
}

impl AnalysisRecord {
    pub fn from_result(result: &ProcessingResult, processed_at: NaiveDateTime) -> Self {
        Self {
            metaphors: result.validated.clone(),
            metaphor_count: result.validated_count,
            candidates: result.candidates.clone(),
            method: ANALYSIS_METHOD.to_string(),
            processed_at,
            stats: AnalysisStats {
                detector_model: result.detector_model.clone(),
                validator_model: result.validator_model.clone(),
                candidate_count: result.candidate_count,
                validated_count: result.validated_count,
                rejected_count: result.rejected_count,
                contract_violations: result.contract_violations,
                parse_failures: result.parse_failures.len(),
                processing_time_secs: result.elapsed.as_secs_f64(),
            },
        }
    }
}

/// 文档加上可选的分析记录，两种存储共用的持久化形态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    #[serde(flatten)]
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisRecord>,
}

impl StoredDocument {
    pub fn is_processed(&self) -> bool {
        self.analysis.is_some()
    }

    fn summary(&self) -> Option<ProcessedSummary> {
        self.analysis.as_ref().map(|analysis| ProcessedSummary {
            id: self.document.id.clone(),
            title: self.document.title.clone(),
            metaphor_count: analysis.metaphor_count,
        })
    }
}

impl From<Document> for StoredDocument {
    fn from(document: Document) -> Self {
        Self {
            document,
            analysis: None,
        }
    }
}

fn stats_of(documents: &[StoredDocument]) -> StoreStats {
    let processed = documents.iter().filter(|d| d.is_processed()).count();
    StoreStats {
        total: documents.len(),
        processed,
        unprocessed: documents.len() - processed,
    }
}

fn unprocessed_of(documents: &[StoredDocument], limit: Option<usize>) -> Vec<Document> {
    documents
        .iter()
        .filter(|d| !d.is_processed())
        .take(limit.unwrap_or(usize::MAX))
        .map(|d| d.document.clone())
        .collect()
}

fn sample_of(documents: &[StoredDocument], limit: usize) -> Vec<ProcessedSummary> {
    documents.iter().filter_map(StoredDocument::summary).take(limit).collect()
}
