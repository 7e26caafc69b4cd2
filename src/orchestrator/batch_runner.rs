//! 批量文档处理器 - 编排层
//!
//! ## 职责
//!
//! 1. **额度预估**：未指定数量时，按今日剩余请求数 / 2 估算可处理的文档数
//! 2. **顺序处理**：逐篇从存储取文档，交给 `MetaphorFlow`，成功则写回
//! 3. **故障隔离**：单篇失败只影响该篇，继续下一篇
//! 4. **配额熔断**：当日额度耗尽后，剩余文档全部记为 `QuotaExhausted`，不再发请求
//! 5. **进度统计**：每 5 篇输出一次进度和预计剩余时间，结束时输出汇总

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ApiError, StorageError};
use crate::models::{Document, ProcessingResult};
use crate::services::UsageSummary;
use crate::storage::Storage;
use crate::utils::clock::elapsed_since;
use crate::utils::logging;
use crate::workflow::{DocumentCtx, MetaphorFlow};

/// 每处理多少篇输出一次进度
const PROGRESS_EVERY: usize = 5;

/// 单篇文档失败的原因
#[derive(Debug, Error)]
pub enum ItemFailure {
    /// 当日额度已耗尽，本篇未处理
    #[error("当日额度已耗尽, {resets_in:?} 后重置")]
    QuotaExhausted { resets_in: Duration },
    /// 外部调用失败
    #[error("{0}")]
    Api(ApiError),
    /// 文本过短，未调用模型
    #[error("文本过短 ({len} 字符, 至少需要 {min} 字符)")]
    TextTooShort { len: usize, min: usize },
    /// 读取文档失败
    #[error("读取文档失败: {0}")]
    Fetch(StorageError),
    /// 写回结果失败（分析本身已完成）
    #[error("写回结果失败: {0}")]
    Persist(StorageError),
}

/// 单篇文档的处理结果
#[derive(Debug)]
pub struct ItemOutcome {
    pub id: String,
    pub result: Result<ProcessingResult, ItemFailure>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// 批处理报告
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
    /// 是否因当日额度耗尽提前停止
    pub halted_on_quota: bool,
    pub elapsed: Duration,
    pub usage: UsageSummary,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// 文本过短被跳过的数量
    pub fn skipped(&self) -> usize {
        self.count_failures(|f| matches!(f, ItemFailure::TextTooShort { .. }))
    }

    /// 因额度耗尽未处理的数量
    pub fn quota_blocked(&self) -> usize {
        self.count_failures(|f| matches!(f, ItemFailure::QuotaExhausted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded() - self.skipped()
    }

    pub fn total_metaphors(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.validated_count)
            .sum()
    }

    fn count_failures(&self, pred: impl Fn(&ItemFailure) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result.as_ref().err().is_some_and(&pred))
            .count()
    }
}

/// 批处理参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// 未指定数量时单次运行的上限
    pub max_items_per_run: usize,
    /// 文本最少字符数
    pub min_text_chars: usize,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_items_per_run: config.max_items_per_run,
            min_text_chars: config.min_text_chars,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_items_per_run: 50,
            min_text_chars: 100,
        }
    }
}

/// 批量文档处理器
pub struct BatchRunner {
    flow: MetaphorFlow,
    store: Arc<dyn Storage>,
    settings: BatchSettings,
}

impl BatchRunner {
    pub fn new(flow: MetaphorFlow, store: Arc<dyn Storage>, settings: BatchSettings) -> Self {
        Self {
            flow,
            store,
            settings,
        }
    }

    pub fn flow_mut(&mut self) -> &mut MetaphorFlow {
        &mut self.flow
    }

    /// 处理未处理的文档
    ///
    /// `limit` 为 None 时按今日剩余额度估算，且不超过 `max_items_per_run`。
    pub async fn run(&mut self, limit: Option<usize>) -> Result<BatchReport, StorageError> {
        let clock = self.flow.caller_mut().clock();
        let started = clock.now();

        let limit = match limit {
            Some(limit) => limit,
            None => self.budgeted_limit(),
        };

        let mut outcomes = Vec::new();
        let mut halted_on_quota = false;

        if limit == 0 {
            warn!("⚠️ 今日剩余额度不足以处理任何文档");
        } else {
            let stats = self.store.read_stats().await?;
            info!(
                "📊 文档统计: 共 {} 篇, 已处理 {} 篇 ({:.1}%), 待处理 {} 篇",
                stats.total,
                stats.processed,
                stats.processing_percentage(),
                stats.unprocessed
            );

            let mut documents = self.store.fetch_unprocessed(Some(limit)).await?;
            let total = limit.min(stats.unprocessed);
            logging::log_batch_start(total, limit);

            let mut index = 0;
            while let Some(item) = documents.next().await {
                index += 1;

                let outcome = match item {
                    Err(e) => {
                        error!("[文档 {}] ❌ 读取失败: {}", index, e);
                        ItemOutcome {
                            id: format!("#{}", index),
                            result: Err(ItemFailure::Fetch(e)),
                        }
                    }
                    Ok(document) if halted_on_quota => ItemOutcome {
                        id: document.id,
                        result: Err(ItemFailure::QuotaExhausted {
                            resets_in: self.until_day_reset(),
                        }),
                    },
                    Ok(document) => {
                        let ctx = DocumentCtx::new(&document.id, index);
                        let outcome = self.process_document(&ctx, document).await;
                        if matches!(outcome.result, Err(ItemFailure::QuotaExhausted { .. })) {
                            warn!("{} ⛔ 当日额度已耗尽, 停止处理剩余文档", ctx);
                            halted_on_quota = true;
                        }
                        outcome
                    }
                };
                outcomes.push(outcome);

                if index % PROGRESS_EVERY == 0 {
                    let elapsed = elapsed_since(clock.as_ref(), started);
                    logging::log_progress(index, total.max(index), elapsed);
                }
            }
        }

        let report = BatchReport {
            outcomes,
            halted_on_quota,
            elapsed: elapsed_since(clock.as_ref(), started),
            usage: self.flow.usage_summary(),
        };
        log_report(&report);
        Ok(report)
    }

    async fn process_document(&mut self, ctx: &DocumentCtx, document: Document) -> ItemOutcome {
        let len = document.text.trim().chars().count();
        if len < self.settings.min_text_chars {
            warn!("{} ⚠️ 文本过短 ({} 字符), 跳过", ctx, len);
            return ItemOutcome {
                id: document.id,
                result: Err(ItemFailure::TextTooShort {
                    len,
                    min: self.settings.min_text_chars,
                }),
            };
        }

        match &document.title {
            Some(title) => info!("{} 📄 {} ({} 字符)", ctx, title, len),
            None => info!("{} 📄 {} ({} 字符)", ctx, document.id, len),
        }

        let result = match self.flow.analyze_in(ctx, &document.text).await {
            Ok(result) => result,
            Err(e) if e.is_daily_exhaustion() => {
                let resets_in = match &e {
                    ApiError::QuotaExhausted { resets_in, .. } => *resets_in,
                    _ => self.until_day_reset(),
                };
                return ItemOutcome {
                    id: document.id,
                    result: Err(ItemFailure::QuotaExhausted { resets_in }),
                };
            }
            Err(e) => {
                error!("{} ❌ 分析失败: {}", ctx, e);
                return ItemOutcome {
                    id: document.id,
                    result: Err(ItemFailure::Api(e)),
                };
            }
        };

        if let Err(e) = self.store.persist_result(&document.id, &result).await {
            error!("{} ❌ 写回结果失败: {}", ctx, e);
            return ItemOutcome {
                id: document.id,
                result: Err(ItemFailure::Persist(e)),
            };
        }

        info!(
            "{} 💾 已保存: {} 个隐喻 ({:.1}s)",
            ctx,
            result.validated_count,
            result.elapsed.as_secs_f64()
        );
        ItemOutcome {
            id: document.id,
            result: Ok(result),
        }
    }

    /// 每篇文档最多需要两次请求
    fn budgeted_limit(&mut self) -> usize {
        let usage = self.flow.usage_summary();
        let possible = (usage.rpd_remaining() / 2) as usize;
        info!(
            "📈 今日剩余 {} 次请求, 约可处理 {} 篇文档 (单次上限 {})",
            usage.rpd_remaining(),
            possible,
            self.settings.max_items_per_run
        );
        possible.min(self.settings.max_items_per_run)
    }

    fn until_day_reset(&mut self) -> Duration {
        self.flow.caller_mut().limiter().until_day_reset()
    }
}

fn log_report(report: &BatchReport) {
    let total = report.total();
    let average = if total == 0 {
        Duration::ZERO
    } else {
        report.elapsed / total as u32
    };

    logging::print_final_stats(&logging::FinalStats {
        success: report.succeeded(),
        failed: report.failed(),
        skipped: report.skipped(),
        total,
        metaphors: report.total_metaphors(),
        elapsed: report.elapsed,
        average,
    });
    logging::log_usage(&report.usage);

    if report.halted_on_quota {
        warn!(
            "⛔ 因当日额度耗尽, {} 篇文档未处理, 请在额度重置后继续",
            report.quota_blocked()
        );
    }
}
