//! 隐喻分析流程 - 流程层
//!
//! 核心职责：定义"一篇文本"的完整处理流程
//!
//! 流程顺序：
//! 1. Detecting      agent1 检测候选
//! 2. AwaitingDelay  按节奏策略等待（没有候选时跳过 2、3）
//! 3. Validating     agent2 验证，只保留候选集合内的条目
//! 4. Done           汇总耗时和调用次数
//!
//! 任意一步的 `ApiError` 都会让流程进入 `Failed` 并原样返回；
//! 流程本身不做重试，重试只发生在 `ExternalCaller` 内部。

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clients::{GenerationParams, InferenceRequest};
use crate::config::{Config, DETECTOR_CALLER, VALIDATOR_CALLER};
use crate::error::{ApiError, ConfigError};
use crate::models::{
    CandidateMetaphor, ParseFailureRecord, ProcessingResult, Stage, ValidatedMetaphor,
};
use crate::services::prompts::{build_detection_prompt, build_validation_prompt};
use crate::services::response_parser::{parse_candidates, parse_validated};
use crate::services::{
    CallResponse, ExternalCaller, ParseFailure, ParseFailureLog, ParseOutcome, UsageSummary,
};
use crate::utils::clock::elapsed_since;
use crate::utils::logging::truncate_text;
use crate::workflow::document_ctx::DocumentCtx;
use crate::workflow::pacing::PacingStrategy;

/// 日志中原始响应的最大显示长度
const RAW_PREVIEW_CHARS: usize = 200;

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Detecting,
    AwaitingDelay,
    Validating,
    Done,
    Failed,
}

/// 流程参数
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    pub detector_model: String,
    pub validator_model: String,
    pub params: GenerationParams,
    pub pacing: PacingStrategy,
}

impl FlowSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            detector_model: config.detector_model.clone(),
            validator_model: config.validator_model.clone(),
            params: GenerationParams {
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
            },
            pacing: config.pacing_strategy()?,
        })
    }
}

/// 隐喻分析流程
///
/// - 编排检测、等待、验证的顺序
/// - 持有唯一的 `ExternalCaller`，同一时刻最多一个请求在途
/// - 解析失败和契约违规只记录，不中断流程
pub struct MetaphorFlow {
    caller: ExternalCaller,
    settings: FlowSettings,
    failure_log: Option<ParseFailureLog>,
    state: PipelineState,
}

impl MetaphorFlow {
    pub fn new(caller: ExternalCaller, settings: FlowSettings) -> Self {
        Self {
            caller,
            settings,
            failure_log: None,
            state: PipelineState::Idle,
        }
    }

    /// 解析失败时把完整原文追加到文件
    pub fn with_failure_log(mut self, log: ParseFailureLog) -> Self {
        self.failure_log = Some(log);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn caller_mut(&mut self) -> &mut ExternalCaller {
        &mut self.caller
    }

    pub fn usage_summary(&mut self) -> UsageSummary {
        self.caller.limiter_mut().usage_summary()
    }

    /// 分析单篇文本
    pub async fn analyze(&mut self, text: &str) -> Result<ProcessingResult, ApiError> {
        self.analyze_in(&DocumentCtx::single(), text).await
    }

    /// 分析单篇文本（带文档上下文，用于批处理日志）
    pub async fn analyze_in(
        &mut self,
        ctx: &DocumentCtx,
        text: &str,
    ) -> Result<ProcessingResult, ApiError> {
        self.state = PipelineState::Idle;
        match self.run(ctx, text).await {
            Ok(result) => {
                self.state = PipelineState::Done;
                Ok(result)
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    async fn run(&mut self, ctx: &DocumentCtx, text: &str) -> Result<ProcessingResult, ApiError> {
        let clock = self.caller.clock();
        let started = clock.now();
        let mut parse_failures = Vec::new();

        // ========== 1. 检测 ==========
        self.state = PipelineState::Detecting;
        info!("{} 🤖 Agent 1 ({}): 检测候选隐喻...", ctx, self.settings.detector_model);

        let detector_model = self.settings.detector_model.clone();
        let detection = self
            .send(DETECTOR_CALLER, &detector_model, build_detection_prompt(text))
            .await?;

        let candidates = match parse_candidates(&detection.text) {
            ParseOutcome::Parsed { value, strategy } => {
                debug!("{} 检测响应解析成功 (策略: {})", ctx, strategy);
                dedupe_candidates(value)
            }
            ParseOutcome::Failed(failure) => {
                let record = self
                    .record_parse_failure(ctx, Stage::Detection, &failure)
                    .await;
                parse_failures.push(record);
                Vec::new()
            }
        };

        info!("{} ✅ 检测到 {} 个候选", ctx, candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            debug!("{}    {}. '{}'", ctx, i + 1, candidate.text);
        }

        let mut result = ProcessingResult {
            validated: Vec::new(),
            candidates,
            detector_model: self.settings.detector_model.clone(),
            validator_model: self.settings.validator_model.clone(),
            elapsed: Duration::ZERO,
            detector_requests: detection.attempts,
            validator_requests: 0,
            candidate_count: 0,
            validated_count: 0,
            rejected_count: 0,
            contract_violations: 0,
            parse_failures: Vec::new(),
        };
        result.candidate_count = result.candidates.len();

        if result.candidates.is_empty() {
            info!("{} ⚠️ 没有候选，跳过验证", ctx);
            result.parse_failures = parse_failures;
            result.elapsed = elapsed_since(clock.as_ref(), started);
            return Ok(result);
        }

        // ========== 2. 等待 ==========
        self.state = PipelineState::AwaitingDelay;
        let usage = self.caller.limiter_mut().usage_summary();
        let until_reset = self.caller.limiter().until_day_reset();
        let delay = self.settings.pacing.delay(&usage, until_reset);
        if !delay.is_zero() {
            info!(
                "{} ⏳ 两次调用之间等待 {:.0}s (本分钟已用 {} 次)",
                ctx,
                delay.as_secs_f64(),
                usage.rpm_used
            );
            clock.sleep(delay).await;
        }

        // ========== 3. 验证 ==========
        self.state = PipelineState::Validating;
        info!("{} 🔬 Agent 2 ({}): 验证候选...", ctx, self.settings.validator_model);

        let validator_model = self.settings.validator_model.clone();
        let validation = self
            .send(
                VALIDATOR_CALLER,
                &validator_model,
                build_validation_prompt(&result.candidates),
            )
            .await?;
        result.validator_requests = validation.attempts;

        match parse_validated(&validation.text) {
            ParseOutcome::Parsed { value, strategy } => {
                debug!("{} 验证响应解析成功 (策略: {})", ctx, strategy);
                let (validated, violations) = intersect_with_candidates(&result.candidates, value);
                if violations > 0 {
                    warn!("{} ⚠️ 验证器返回了 {} 个不在候选中的条目，已丢弃", ctx, violations);
                }
                result.validated = validated;
                result.contract_violations = violations;
            }
            ParseOutcome::Failed(failure) => {
                let record = self
                    .record_parse_failure(ctx, Stage::Validation, &failure)
                    .await;
                parse_failures.push(record);
            }
        }

        // ========== 4. 完成 ==========
        result.validated_count = result.validated.len();
        result.rejected_count = result.candidate_count - result.validated_count;
        result.parse_failures = parse_failures;
        result.elapsed = elapsed_since(clock.as_ref(), started);

        info!(
            "{} ✅ 通过 {} 个, 拒绝 {} 个 (拒绝率 {:.1}%)",
            ctx,
            result.validated_count,
            result.rejected_count,
            result.rejection_rate()
        );

        Ok(result)
    }

    async fn send(
        &mut self,
        caller: &str,
        model: &str,
        prompt: String,
    ) -> Result<CallResponse, ApiError> {
        let request = InferenceRequest::new(model, prompt).with_params(self.settings.params);
        self.caller.call(caller, &request).await
    }

    async fn record_parse_failure(
        &self,
        ctx: &DocumentCtx,
        stage: Stage,
        failure: &ParseFailure,
    ) -> ParseFailureRecord {
        warn!(
            "{} ⚠️ {}阶段响应解析失败 (最后策略: {}), 原始响应: {}",
            ctx,
            stage,
            failure.last_strategy,
            truncate_text(&failure.raw, RAW_PREVIEW_CHARS)
        );

        if let Some(log) = &self.failure_log {
            if let Err(e) = log.write(stage, failure).await {
                warn!("{} 写入解析失败记录失败: {}", ctx, e);
            }
        }

        ParseFailureRecord {
            stage,
            last_strategy: failure.last_strategy,
            raw_len: failure.raw.len(),
        }
    }
}

/// 按去空白后的 text 去重，保留第一次出现的
fn dedupe_candidates(candidates: Vec<CandidateMetaphor>) -> Vec<CandidateMetaphor> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.text.trim().to_string()))
        .collect()
}

/// 只保留候选集合内的条目，返回 (保留结果, 违规条目数)
///
/// 验证器没有给出 context 时沿用候选的 context。
pub fn intersect_with_candidates(
    candidates: &[CandidateMetaphor],
    proposed: Vec<ValidatedMetaphor>,
) -> (Vec<ValidatedMetaphor>, usize) {
    let mut kept: Vec<ValidatedMetaphor> = Vec::new();
    let mut seen = HashSet::new();
    let mut violations = 0;

    for metaphor in proposed {
        let key = metaphor.text.trim();
        let Some(candidate) = candidates.iter().find(|c| c.text.trim() == key) else {
            debug!("丢弃候选之外的条目: '{}'", key);
            violations += 1;
            continue;
        };
        if !seen.insert(key.to_string()) {
            continue;
        }

        let context = if metaphor.context.trim().is_empty() {
            candidate.context.clone()
        } else {
            metaphor.context
        };
        kept.push(ValidatedMetaphor {
            text: candidate.text.trim().to_string(),
            context,
        });
    }

    (kept, violations)
}
