use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use directory_submit::models::{load_seed_file, SubmissionStatus};
use directory_submit::utils::logging;
use directory_submit::browser::DemoSessionFactory;
use directory_submit::{
    ChromeSessionFactory, Config, DetectionGateway, MemoryStore, SessionFactory, SubmissionEngine,
    SubmissionStore,
};

#[derive(Parser)]
#[command(name = "directory-submit")]
#[command(about = "Submit products to web directories with a headless browser", long_about = None)]
struct Cli {
    /// Seed file with products, directories and submissions
    #[arg(long, global = true, env = "SEED_FILE")]
    seed: Option<PathBuf>,

    /// State file (restored when present, written after every change)
    #[arg(long, global = true, env = "STATE_FILE")]
    state: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Simulate browser sessions instead of launching Chrome
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim up to `limit` eligible submissions and wait for them to finish
    RunBatch {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Run a single submission now
    RunOne {
        #[arg(long)]
        id: u64,
    },
    /// Keep polling for eligible submissions until Ctrl-C
    Daemon {
        #[arg(long)]
        poll_secs: Option<u64>,
    },
    /// Print every submission and its status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let mut config = Config::from_env();
    if let Some(seed) = cli.seed {
        config.seed_file = seed;
    }
    if let Some(state) = cli.state {
        config.state_file = state;
    }
    config.verbose_logging |= cli.verbose;
    config.demo_mode |= cli.demo;
    config.validate()?;

    // 初始化日志
    logging::init(config.verbose_logging);
    logging::init_log_file(&config.output_log_file)?;

    let store = Arc::new(open_store(&config).await?);

    if let Commands::Status = cli.command {
        print_status(store.as_ref()).await?;
        return Ok(());
    }

    logging::log_startup(&config);

    let sessions: Arc<dyn SessionFactory> = if config.demo_mode {
        warn!("🎭 演示模式：使用模拟会话，不会真正提交");
        Arc::new(DemoSessionFactory::new(1.0))
    } else {
        Arc::new(ChromeSessionFactory::from_config(&config).await?)
    };
    let gateway = Arc::new(DetectionGateway::from_config(&config));
    let engine = SubmissionEngine::new(config.clone(), store.clone(), sessions, gateway)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到 Ctrl-C，正在取消执行中的投递...");
                shutdown.cancel();
                engine.cancel_all();
            }
        });
    }

    match cli.command {
        Commands::RunBatch { limit } => {
            let batch = engine.run_batch(limit).await?;
            for (id, reason) in &batch.skipped {
                info!("[投递 #{}] 跳过: {}", id, reason);
            }
            let summary = batch.join().await;
            logging::print_final_stats(
                summary.count(SubmissionStatus::Submitted),
                summary.count(SubmissionStatus::Pending),
                summary.count(SubmissionStatus::RequiresReview),
                summary.count(SubmissionStatus::Failed) + summary.errors.len(),
                &config.output_log_file,
            );
        }
        Commands::RunOne { id } => {
            let report = engine.run_one(id).await?.await??;
            info!(
                "[投递 #{}] 第{}次尝试结束: {} → {}",
                report.submission_id, report.attempt_no, report.outcome, report.status
            );
        }
        Commands::Daemon { poll_secs } => {
            let poll = Duration::from_secs(poll_secs.unwrap_or(config.poll_interval_secs));
            engine.run_until_cancelled(poll, shutdown).await?;
        }
        Commands::Status => {}
    }

    store.flush().await?;
    Ok(())
}

/// 有状态文件时从中恢复，否则从种子文件初始化
async fn open_store(config: &Config) -> Result<MemoryStore> {
    if config.state_file.exists() {
        return Ok(MemoryStore::load(&config.state_file).await?);
    }

    let seed = load_seed_file(&config.seed_file).await?;
    logging::log_seed_loaded(
        seed.products.len(),
        seed.directories.len(),
        seed.submissions.len(),
        &config.seed_file,
    );
    let store = MemoryStore::from_seed(seed, config.default_max_attempts).with_persistence(&config.state_file);
    store.flush().await?;
    Ok(store)
}

async fn print_status(store: &MemoryStore) -> Result<()> {
    let submissions = store.list_submissions().await?;
    info!("{}", "=".repeat(60));
    for s in &submissions {
        info!(
            "#{:<5} 产品 #{:<4} 目录 #{:<4} {:<16} {}/{} {}",
            s.id,
            s.product_id,
            s.directory_id,
            s.status.to_string(),
            s.attempt_count,
            s.max_attempts,
            s.error_message
                .as_deref()
                .map(|e| logging::truncate_text(e, 60))
                .unwrap_or_default()
        );
    }
    info!("{}", "=".repeat(60));
    info!("共 {} 条投递", submissions.len());
    Ok(())
}
