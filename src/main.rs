use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use metaphor_pipeline::orchestrator::show_stats;
use metaphor_pipeline::utils::logging;
use metaphor_pipeline::{App, Config};

/// 双代理隐喻分析
#[derive(Debug, Parser)]
#[command(name = "metaphor-pipeline", version, about)]
struct Cli {
    /// TOML 配置文件（不指定则只用默认值和环境变量）
    #[arg(long, global = true, env = "METAPHOR_CONFIG")]
    config: Option<PathBuf>,

    /// 显示详细日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 分析单篇文本，结果以 JSON 输出
    Single {
        /// 要分析的文本
        #[arg(long)]
        text: String,
    },
    /// 批量处理存储中的未处理文档
    Batch {
        /// 最多处理的文档数（默认按今日剩余额度估算）
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 显示存储统计
    Stats {
        /// 已处理文档抽样数量
        #[arg(long, default_value_t = 5)]
        sample: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };
    config.verbose_logging |= cli.verbose;

    // 初始化日志
    logging::init(config.verbose_logging);

    match cli.command {
        Command::Single { text } => {
            let mut app = App::initialize(config)?;
            match app.run_single(&text).await {
                Ok(result) => {
                    let json = serde_json::to_string_pretty(&result)
                        .context("无法序列化分析结果")?;
                    println!("{}", json);
                }
                Err(e) => {
                    error!("❌ 分析失败: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Batch { limit } => {
            let app = App::initialize(config)?;
            let report = app.run_batch(limit).await?;
            info!(
                "🏁 批处理结束: 成功 {}/{}, 共识别 {} 个隐喻",
                report.succeeded(),
                report.total(),
                report.total_metaphors()
            );
        }
        Command::Stats { sample } => {
            show_stats(&config, sample).await?;
        }
    }

    Ok(())
}
