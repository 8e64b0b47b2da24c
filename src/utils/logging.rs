/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::path::Path;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 初始化 tracing 订阅者
///
/// 设置了 `RUST_LOG` 时以其为准，否则按 `verbose` 选择默认级别。
/// 重复调用是安全的（测试中会多次初始化）。
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "directory_submit=debug,info"
        } else {
            "directory_submit=info,warn"
        })
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n目录投递日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    std::fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 目录自动投递");
    info!("📊 最大并发数: {}", config.max_concurrent_submissions);
    info!("🔁 默认最大尝试次数: {}", config.default_max_attempts);
    info!(
        "🤖 表单识别: {}",
        if config.demo_mode {
            "演示模式（模拟会话）"
        } else if config.llm_api_key.is_some() {
            config.llm_model_name.as_str()
        } else {
            "仅规则识别"
        }
    );
    info!("{}", "=".repeat(60));
}

/// 记录数据加载信息
pub fn log_seed_loaded(products: usize, directories: usize, submissions: usize, path: &Path) {
    info!(
        "✓ 已加载 {} 个产品 / {} 个目录 / {} 条投递 ({})",
        products,
        directories,
        submissions,
        path.display()
    );
}

/// 记录批次开始信息
///
/// # 参数
/// - `dispatched`: 本批派发数量
/// - `skipped`: 本批跳过数量
pub fn log_batch_start(dispatched: usize, skipped: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理本批投递: 派发 {} / 跳过 {}", dispatched, skipped);
    info!("{}", "=".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `submitted`: 已提交数量
/// - `retrying`: 等待重试数量
/// - `review`: 转人工数量
/// - `failed`: 最终失败数量
pub fn print_final_stats(submitted: usize, retrying: usize, review: usize, failed: usize, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 已提交: {}", submitted);
    info!("🔁 等待重试: {}", retrying);
    info!("👀 待人工审核: {}", review);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
