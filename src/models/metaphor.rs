use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::response_parser::ParseStrategy;

/// 候选隐喻（检测阶段产出，未经验证）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMetaphor {
    pub text: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_domain: Option<String>,
}

/// 验证通过的隐喻
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedMetaphor {
    pub text: String,
    #[serde(default)]
    pub context: String,
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Validation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Detection => write!(f, "检测"),
            Stage::Validation => write!(f, "验证"),
        }
    }
}

/// 一次解析失败的记录（原始文本只进日志，不进结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailureRecord {
    pub stage: Stage,
    pub last_strategy: ParseStrategy,
    pub raw_len: usize,
}

/// 单篇文本的处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// 最终保留的隐喻
    pub validated: Vec<ValidatedMetaphor>,
    /// 检测阶段的全部候选（审计用）
    pub candidates: Vec<CandidateMetaphor>,
    pub detector_model: String,
    pub validator_model: String,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// 检测阶段实际发出的请求数（含重试）
    pub detector_requests: u32,
    /// 验证阶段实际发出的请求数（含重试）
    pub validator_requests: u32,
    pub candidate_count: usize,
    pub validated_count: usize,
    pub rejected_count: usize,
    /// 验证器返回了不在候选中的条目的次数
    pub contract_violations: usize,
    #[serde(default)]
    pub parse_failures: Vec<ParseFailureRecord>,
}

impl ProcessingResult {
    /// 拒绝率（百分比）
    pub fn rejection_rate(&self) -> f64 {
        if self.candidate_count == 0 {
            0.0
        } else {
            self.rejected_count as f64 / self.candidate_count as f64 * 100.0
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
