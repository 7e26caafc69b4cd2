//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数

use std::fs;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::services::UsageSummary;

/// 初始化 tracing 订阅者
///
/// 优先使用 `RUST_LOG`，否则默认 `info`，`verbose` 时为 `debug`。
/// 重复调用不会报错。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化运行日志文件（写入表头）
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n隐喻分析运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(mode: &str, detector_model: &str, validator_model: &str) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {}", mode);
    info!("🤖 检测模型: {} | 🔬 验证模型: {}", detector_model, validator_model);
    info!("{}", "=".repeat(60));
}

/// 记录批处理开始信息
pub fn log_batch_start(total: usize, limit: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始批处理: 本次处理 {} 篇文档 (上限 {})", total, limit);
    info!("{}", "=".repeat(60));
}

/// 记录批处理进度和预计剩余时间
pub fn log_progress(done: usize, total: usize, elapsed: Duration) {
    let average = if done == 0 {
        Duration::ZERO
    } else {
        elapsed / done as u32
    };
    let eta = average * total.saturating_sub(done) as u32;

    info!("\n{}", "─".repeat(60));
    info!(
        "📈 进度: {}/{} ({:.1}%) | 平均 {:.1}s/篇 | 预计剩余 {:.1} 分钟",
        done,
        total,
        done as f64 / total.max(1) as f64 * 100.0,
        average.as_secs_f64(),
        eta.as_secs_f64() / 60.0
    );
    info!("{}", "─".repeat(60));
}

/// 最终统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalStats {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub metaphors: usize,
    pub elapsed: Duration,
    pub average: Duration,
}

/// 打印最终统计信息
pub fn print_final_stats(stats: &FinalStats) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("❌ 失败: {}", stats.failed);
    info!("⏭️ 跳过: {}", stats.skipped);
    info!("🎯 共识别隐喻: {} 个", stats.metaphors);
    info!(
        "⏱️ 总耗时: {:.1} 分钟, 平均 {:.1}s/篇",
        stats.elapsed.as_secs_f64() / 60.0,
        stats.average.as_secs_f64()
    );
    info!("{}", "=".repeat(60));
}

/// 打印额度使用情况
pub fn log_usage(usage: &UsageSummary) {
    info!(
        "📊 合并额度: {}/{} RPD, {}/{} RPM",
        usage.rpd_used, usage.rpd_limit, usage.rpm_used, usage.rpm_limit
    );
    for (caller, caller_usage) in &usage.by_caller {
        info!("   {}: 今日 {} 次", caller, caller_usage.rpd_used);
    }
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
