use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// 租约上限（7 天）
const MAX_CLAIM_LEASE_SECS: u64 = 7 * 24 * 3_600;

/// 程序配置文件
///
/// 所有字段都是简单的标量开关，由调用方显式传入 [`crate::SubmissionEngine`]，
/// 同一进程内可以并存多个配置不同的引擎。
#[derive(Clone, Debug)]
pub struct Config {
    /// 系统范围内同时执行的投递数量上限
    pub max_concurrent_submissions: usize,
    /// 新建投递的默认最大尝试次数
    pub default_max_attempts: u32,
    // --- 单步超时（毫秒） ---
    pub navigation_timeout_ms: u64,
    pub detection_timeout_ms: u64,
    pub fill_timeout_ms: u64,
    pub submit_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    /// 两次尝试之间的基础间隔（秒）
    pub submission_delay_secs: u64,
    /// 普通失败的最大退避（秒），反爬拦截的上限为其 4 倍
    pub max_retry_delay_secs: u64,
    /// 执行租约时长（秒），worker 崩溃后租约到期可被回收
    pub claim_lease_secs: u64,
    /// 表单识别 / 映射置信度低于该值时转人工审核
    pub review_confidence_threshold: f32,
    /// 缓存表单结构的有效天数
    pub schema_max_age_days: i64,
    /// 守护模式下的轮询间隔（秒）
    pub poll_interval_secs: u64,
    // --- 浏览器配置 ---
    pub headless: bool,
    pub screenshot_on_submit: bool,
    pub screenshot_dir: PathBuf,
    /// 若设置则连接已有浏览器的调试端口，否则自行启动
    pub browser_debug_port: Option<u16>,
    pub chrome_executable: Option<PathBuf>,
    // --- LLM 配置 ---
    pub llm_api_key: Option<String>,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- 数据与日志 ---
    pub seed_file: PathBuf,
    pub state_file: PathBuf,
    pub review_log_file: PathBuf,
    pub output_log_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 演示模式：使用模拟会话，不启动浏览器也不调用 LLM
    pub demo_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_submissions: 3,
            default_max_attempts: 3,
            navigation_timeout_ms: 30_000,
            detection_timeout_ms: 60_000,
            fill_timeout_ms: 30_000,
            submit_timeout_ms: 15_000,
            confirmation_timeout_ms: 15_000,
            submission_delay_secs: 60,
            max_retry_delay_secs: 3_600,
            claim_lease_secs: 900,
            review_confidence_threshold: 0.3,
            schema_max_age_days: 30,
            poll_interval_secs: 30,
            headless: true,
            screenshot_on_submit: true,
            screenshot_dir: PathBuf::from("uploads/screenshots"),
            browser_debug_port: None,
            chrome_executable: None,
            llm_api_key: None,
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o".to_string(),
            seed_file: PathBuf::from("seed.toml"),
            state_file: PathBuf::from("state.json"),
            review_log_file: PathBuf::from("review.txt"),
            output_log_file: "output.txt".to_string(),
            verbose_logging: false,
            demo_mode: false,
        }
    }
}

/// 单步超时集合
#[derive(Clone, Copy, Debug)]
pub struct StepTimeouts {
    pub navigation: Duration,
    pub detection: Duration,
    pub fill: Duration,
    pub submit: Duration,
    pub confirmation: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_submissions: env_or("MAX_CONCURRENT_SUBMISSIONS", default.max_concurrent_submissions),
            default_max_attempts: env_or("DEFAULT_MAX_ATTEMPTS", default.default_max_attempts),
            navigation_timeout_ms: env_or("NAVIGATION_TIMEOUT_MS", default.navigation_timeout_ms),
            detection_timeout_ms: env_or("DETECTION_TIMEOUT_MS", default.detection_timeout_ms),
            fill_timeout_ms: env_or("FILL_TIMEOUT_MS", default.fill_timeout_ms),
            submit_timeout_ms: env_or("SUBMIT_TIMEOUT_MS", default.submit_timeout_ms),
            confirmation_timeout_ms: env_or("CONFIRMATION_TIMEOUT_MS", default.confirmation_timeout_ms),
            submission_delay_secs: env_or("SUBMISSION_DELAY_SECS", default.submission_delay_secs),
            max_retry_delay_secs: env_or("MAX_RETRY_DELAY_SECS", default.max_retry_delay_secs),
            claim_lease_secs: env_or("CLAIM_LEASE_SECS", default.claim_lease_secs),
            review_confidence_threshold: env_or("REVIEW_CONFIDENCE_THRESHOLD", default.review_confidence_threshold),
            schema_max_age_days: env_or("SCHEMA_MAX_AGE_DAYS", default.schema_max_age_days),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", default.poll_interval_secs),
            headless: env_or("BROWSER_HEADLESS", default.headless),
            screenshot_on_submit: env_or("SCREENSHOT_ON_SUBMIT", default.screenshot_on_submit),
            screenshot_dir: std::env::var("SCREENSHOT_DIR").map(PathBuf::from).unwrap_or(default.screenshot_dir),
            browser_debug_port: std::env::var("BROWSER_DEBUG_PORT").ok().and_then(|v| v.parse().ok()),
            chrome_executable: std::env::var("CHROME_EXECUTABLE").ok().map(PathBuf::from),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            seed_file: std::env::var("SEED_FILE").map(PathBuf::from).unwrap_or(default.seed_file),
            state_file: std::env::var("STATE_FILE").map(PathBuf::from).unwrap_or(default.state_file),
            review_log_file: std::env::var("REVIEW_LOG_FILE").map(PathBuf::from).unwrap_or(default.review_log_file),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            verbose_logging: env_or("VERBOSE_LOGGING", default.verbose_logging),
            demo_mode: env_or("DEMO_MODE", default.demo_mode),
        }
    }

    /// 校验配置的取值范围
    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent_submissions == 0 {
            return Err(AppError::invalid_config(
                "MAX_CONCURRENT_SUBMISSIONS",
                self.max_concurrent_submissions,
                "必须大于 0",
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(AppError::invalid_config(
                "DEFAULT_MAX_ATTEMPTS",
                self.default_max_attempts,
                "必须大于 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.review_confidence_threshold) {
            return Err(AppError::invalid_config(
                "REVIEW_CONFIDENCE_THRESHOLD",
                self.review_confidence_threshold,
                "必须位于 [0, 1]",
            ));
        }
        if self.claim_lease_secs == 0 || self.claim_lease_secs > MAX_CLAIM_LEASE_SECS {
            return Err(AppError::invalid_config(
                "CLAIM_LEASE_SECS",
                self.claim_lease_secs,
                "必须位于 [1, 604800]",
            ));
        }
        if self.schema_max_age_days < 0 {
            return Err(AppError::invalid_config(
                "SCHEMA_MAX_AGE_DAYS",
                self.schema_max_age_days,
                "不能为负数",
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            navigation: Duration::from_millis(self.navigation_timeout_ms),
            detection: Duration::from_millis(self.detection_timeout_ms),
            fill: Duration::from_millis(self.fill_timeout_ms),
            submit: Duration::from_millis(self.submit_timeout_ms),
            confirmation: Duration::from_millis(self.confirmation_timeout_ms),
        }
    }

    pub fn submission_delay(&self) -> Duration {
        Duration::from_secs(self.submission_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    /// 超出上限的取值按上限处理（`validate` 会拒绝这类配置）
    pub fn claim_lease(&self) -> chrono::Duration {
        let secs = self.claim_lease_secs.min(MAX_CLAIM_LEASE_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn schema_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.schema_max_age_days)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
