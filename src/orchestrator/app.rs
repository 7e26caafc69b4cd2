//! 应用装配 - 编排层
//!
//! 把配置变成可运行的对象图：推理客户端 → 限流器 → 外部调用 → 分析流程 → 存储。
//! 这里是唯一使用 `anyhow` 的编排代码，下层都返回带类型的错误。

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::clients::{GeminiRestClient, InferenceApi, OpenAiCompatClient};
use crate::config::{ApiBackend, Config};
use crate::models::ProcessingResult;
use crate::orchestrator::batch_runner::{BatchReport, BatchRunner, BatchSettings};
use crate::services::{ExternalCaller, ParseFailureLog, RateLimiter};
use crate::storage::{JsonFileStore, Storage};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::logging;
use crate::workflow::{FlowSettings, MetaphorFlow};

/// 应用主结构
pub struct App {
    config: Config,
    flow: MetaphorFlow,
}

impl App {
    /// 初始化应用（需要 API key）
    pub fn initialize(config: Config) -> Result<Self> {
        config.validate()?;

        if let Some(path) = &config.output_log_file {
            logging::init_log_file(path)
                .with_context(|| format!("无法初始化日志文件: {}", path))?;
        }

        let api = build_api(&config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let limiter = RateLimiter::starting_now(config.rate_limits(), clock);
        let caller = ExternalCaller::new(
            api,
            limiter,
            config.retry_policy(),
            config.request_timeout(),
        );

        let mut flow = MetaphorFlow::new(caller, FlowSettings::from_config(&config)?);
        if let Some(path) = &config.parse_failure_log {
            flow = flow.with_failure_log(ParseFailureLog::new(path));
        }

        info!(
            "⚙️ 合并限额: {} RPM / {} RPD, 节奏策略: {}",
            config.rate_limits().effective_rpm(),
            config.rate_limits().effective_rpd(),
            config.pacing
        );

        Ok(Self { config, flow })
    }

    /// 分析单篇文本
    pub async fn run_single(&mut self, text: &str) -> Result<ProcessingResult> {
        logging::log_startup(
            "单篇文本模式",
            &self.config.detector_model,
            &self.config.validator_model,
        );

        let result = self.flow.analyze(text).await?;
        logging::log_usage(&self.flow.usage_summary());
        Ok(result)
    }

    /// 批量处理存储中的未处理文档
    pub async fn run_batch(self, limit: Option<usize>) -> Result<BatchReport> {
        logging::log_startup(
            "批量文档模式",
            &self.config.detector_model,
            &self.config.validator_model,
        );

        let store: Arc<dyn Storage> = Arc::new(JsonFileStore::new(&self.config.store_path));
        let settings = BatchSettings::from_config(&self.config);
        let mut runner = BatchRunner::new(self.flow, store, settings);

        let report = runner
            .run(limit)
            .await
            .with_context(|| format!("读取文档存储失败: {}", self.config.store_path))?;
        Ok(report)
    }
}

/// 显示存储统计和已处理文档抽样（不需要 API key）
pub async fn show_stats(config: &Config, sample_size: usize) -> Result<()> {
    let store = JsonFileStore::new(&config.store_path);

    let stats = store.read_stats().await?;
    info!("{}", "=".repeat(60));
    info!("📊 文档存储统计: {}", config.store_path);
    info!("{}", "=".repeat(60));
    info!("总文档数: {}", stats.total);
    info!("已处理: {}", stats.processed);
    info!("待处理: {}", stats.unprocessed);
    info!("完成度: {:.1}%", stats.processing_percentage());

    let sample = store.processed_sample(sample_size).await?;
    if !sample.is_empty() {
        info!("\n📋 已处理文档抽样:");
        for (i, summary) in sample.iter().enumerate() {
            info!(
                "   {}. {} - {} 个隐喻",
                i + 1,
                summary.title.as_deref().unwrap_or(&summary.id),
                summary.metaphor_count
            );
        }
    }
    Ok(())
}

fn build_api(config: &Config) -> Result<Arc<dyn InferenceApi>> {
    let api_key = config.require_api_key()?;
    let base_url = config.base_url();

    let api: Arc<dyn InferenceApi> = match config.api_backend {
        ApiBackend::GeminiRest => Arc::new(GeminiRestClient::new(api_key, base_url)),
        ApiBackend::OpenaiCompat => Arc::new(OpenAiCompatClient::new(api_key, base_url)),
    };
    info!("🔗 推理后端: {:?} ({})", config.api_backend, base_url);
    Ok(api)
}
