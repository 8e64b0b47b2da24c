//! 投递处理流程 - 流程层
//!
//! 核心职责：定义"一次尝试"的完整处理流程
//!
//! 流程顺序：
//! 1. 打开隔离会话 → 导航到提交页
//! 2. 识别表单结构 → 映射字段（不可靠时转人工）
//! 3. 检查验证码 → 填写 → 点击提交
//! 4. 截图 → 读取确认信号
//!
//! 每一步都有独立超时，超时转换为该步骤的失败类型。
//! 取消只在步骤边界检查；点击提交之后本次尝试不再可取消。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, PageState, SessionFactory};
use crate::config::{Config, StepTimeouts};
use crate::models::{
    AttemptOutcome, AttemptRecord, AttemptStep, ConfirmationSignal, Directory, FailureKind,
    FieldMapping, FormSchema, Product, StepLog, StepStatus,
};
use crate::services::{map_fields, DetectionGateway, FieldMapOutcome};
use crate::utils::logging::truncate_text;
use crate::workflow::submission_ctx::SubmissionCtx;

/// 读取确认信号的轮询间隔
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SUCCESS_PHRASES: [&str; 9] = [
    "thank you",
    "thanks for",
    "successfully submitted",
    "submission received",
    "we will review",
    "pending approval",
    "listing added",
    "product added",
    "successfully added",
];

const ERROR_PHRASES: [&str; 7] = [
    "error",
    "failed",
    "invalid",
    "required field",
    "please fill",
    "already exists",
    "duplicate",
];

const BLOCKED_PHRASES: [&str; 7] = [
    "verify you are human",
    "are you a robot",
    "checking your browser",
    "access denied",
    "too many requests",
    "unusual traffic",
    "captcha",
];

/// 单次尝试的中间结果
struct AttemptBuilder {
    started: Instant,
    started_at: DateTime<Utc>,
    detected_fields: Option<FormSchema>,
    filled_fields: Option<FieldMapping>,
    confirmation: Option<ConfirmationSignal>,
    screenshot_path: Option<String>,
    steps: Vec<StepLog>,
}

impl AttemptBuilder {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            detected_fields: None,
            filled_fields: None,
            confirmation: None,
            screenshot_path: None,
            steps: Vec::new(),
        }
    }

    fn step(&mut self, step: AttemptStep, status: StepStatus, detail: Option<String>) {
        self.steps.push(StepLog {
            step,
            status,
            at: Utc::now(),
            detail,
        });
    }

    fn finish(
        self,
        ctx: &SubmissionCtx,
        product: &Product,
        directory: &Directory,
        outcome: AttemptOutcome,
        error_message: Option<String>,
    ) -> AttemptRecord {
        AttemptRecord {
            attempt_no: ctx.attempt_no,
            owner: ctx.owner.to_string(),
            product: product.clone(),
            directory_id: directory.id,
            target_url: directory.target_url().to_string(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            detected_fields: self.detected_fields,
            filled_fields: self.filled_fields,
            confirmation: self.confirmation,
            outcome,
            error_message,
            screenshot_path: self.screenshot_path,
            steps: self.steps,
        }
    }
}

/// 步骤提前结束的原因
enum Stop {
    Failed(FailureKind, String),
    Review(FailureKind, String),
    Cancelled,
}

/// 投递处理流程（自动化驱动）
///
/// - 编排一次尝试的所有步骤
/// - 不修改任何持久化状态，只返回尝试记录
/// - 只依赖浏览器会话与业务能力（services）
pub struct SubmissionFlow {
    gateway: Arc<DetectionGateway>,
    timeouts: StepTimeouts,
    review_threshold: f32,
    screenshot_on_submit: bool,
    screenshot_dir: PathBuf,
    verbose_logging: bool,
}

impl SubmissionFlow {
    pub fn new(config: &Config, gateway: Arc<DetectionGateway>) -> Self {
        Self {
            gateway,
            timeouts: config.timeouts(),
            review_threshold: config.review_confidence_threshold,
            screenshot_on_submit: config.screenshot_on_submit,
            screenshot_dir: config.screenshot_dir.clone(),
            verbose_logging: config.verbose_logging,
        }
    }

    /// 执行一次尝试，总是返回一条尝试记录
    pub async fn run(
        &self,
        sessions: &dyn SessionFactory,
        product: &Product,
        directory: &Directory,
        ctx: &SubmissionCtx,
        cancel: &CancellationToken,
    ) -> AttemptRecord {
        let mut attempt = AttemptBuilder::new();

        if cancel.is_cancelled() {
            return attempt.finish(ctx, product, directory, AttemptOutcome::Cancelled, None);
        }

        attempt.step(AttemptStep::OpenSession, StepStatus::Started, None);
        let session = match timeout(self.timeouts.navigation, sessions.open()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("{} ❌ 无法创建浏览器会话: {}", ctx, e);
                attempt.step(AttemptStep::OpenSession, StepStatus::Failed, Some(e.to_string()));
                let message = format!("无法创建浏览器会话: {}", e);
                return attempt.finish(
                    ctx,
                    product,
                    directory,
                    AttemptOutcome::Failed(FailureKind::NavigationTimeout),
                    Some(message),
                );
            }
            Err(_) => {
                attempt.step(AttemptStep::OpenSession, StepStatus::Failed, Some("timeout".into()));
                return attempt.finish(
                    ctx,
                    product,
                    directory,
                    AttemptOutcome::Failed(FailureKind::NavigationTimeout),
                    Some("创建浏览器会话超时".to_string()),
                );
            }
        };
        attempt.step(AttemptStep::OpenSession, StepStatus::Success, None);

        let result = self
            .drive(session.as_ref(), product, directory, ctx, cancel, &mut attempt)
            .await;

        match timeout(self.timeouts.navigation, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} 关闭浏览器会话失败: {}", ctx, e),
            Err(_) => warn!("{} 关闭浏览器会话超时 ({:?})，放弃等待", ctx, self.timeouts.navigation),
        }

        let (outcome, message) = match result {
            Ok(()) => {
                info!("{} ✅ 提交完成", ctx);
                (AttemptOutcome::Submitted, None)
            }
            Err(Stop::Failed(kind, message)) => {
                warn!("{} ❌ 失败 ({}): {}", ctx, kind, message);
                (AttemptOutcome::Failed(kind), Some(message))
            }
            Err(Stop::Review(kind, message)) => {
                warn!("{} ⚠️ 需要人工审核 ({}): {}", ctx, kind, message);
                (AttemptOutcome::RequiresReview(kind), Some(message))
            }
            Err(Stop::Cancelled) => {
                info!("{} 🛑 已取消", ctx);
                (AttemptOutcome::Cancelled, None)
            }
        };
        attempt.finish(ctx, product, directory, outcome, message)
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        product: &Product,
        directory: &Directory,
        ctx: &SubmissionCtx,
        cancel: &CancellationToken,
        attempt: &mut AttemptBuilder,
    ) -> Result<(), Stop> {
        let target_url = directory.target_url();

        // ========== 1. 导航 ==========
        check_cancelled(cancel)?;
        info!("{} 🌐 打开提交页: {}", ctx, target_url);
        attempt.step(AttemptStep::Navigate, StepStatus::Started, None);
        match timeout(self.timeouts.navigation, session.navigate(target_url)).await {
            Ok(Ok(())) => attempt.step(AttemptStep::Navigate, StepStatus::Success, None),
            Ok(Err(e)) => {
                attempt.step(AttemptStep::Navigate, StepStatus::Failed, Some(e.to_string()));
                return Err(Stop::Failed(FailureKind::NavigationTimeout, format!("页面加载失败: {}", e)));
            }
            Err(_) => {
                attempt.step(AttemptStep::Navigate, StepStatus::Failed, Some("timeout".into()));
                return Err(Stop::Failed(
                    FailureKind::NavigationTimeout,
                    format!("页面加载超时 ({:?})", self.timeouts.navigation),
                ));
            }
        }

        // ========== 2. 识别表单 ==========
        check_cancelled(cancel)?;
        attempt.step(AttemptStep::DetectForm, StepStatus::Started, None);
        let schema = match timeout(self.timeouts.detection, self.detect(session, directory)).await {
            Ok(Ok(schema)) => schema,
            Ok(Err(message)) => {
                attempt.step(AttemptStep::DetectForm, StepStatus::Failed, Some(message.clone()));
                return Err(Stop::Failed(FailureKind::DetectionFailed, message));
            }
            Err(_) => {
                attempt.step(AttemptStep::DetectForm, StepStatus::Failed, Some("timeout".into()));
                return Err(Stop::Failed(
                    FailureKind::DetectionFailed,
                    format!("表单识别超时 ({:?})", self.timeouts.detection),
                ));
            }
        };
        info!(
            "{} 🔍 识别到 {} 个字段 (来源 {:?}, 置信度 {:.2})",
            ctx,
            schema.fields.len(),
            schema.source,
            schema.confidence
        );
        attempt.step(
            AttemptStep::DetectForm,
            StepStatus::Success,
            Some(format!("{} fields", schema.fields.len())),
        );
        attempt.detected_fields = Some(schema.clone());

        if schema.confidence < self.review_threshold {
            return Err(Stop::Review(
                FailureKind::DetectionFailed,
                format!(
                    "表单识别置信度 {:.2} 低于阈值 {:.2}",
                    schema.confidence, self.review_threshold
                ),
            ));
        }

        // ========== 3. 字段映射 ==========
        let outcome = map_fields(product, &schema);
        attempt.filled_fields = Some(outcome.mapping().clone());
        let coverage = outcome.required_coverage();
        let mapping = match outcome {
            FieldMapOutcome::Complete(mapping) if !mapping.is_empty() => mapping,
            FieldMapOutcome::Complete(_) => {
                attempt.step(AttemptStep::MapFields, StepStatus::Failed, None);
                return Err(Stop::Review(
                    FailureKind::MappingIncomplete,
                    "表单中没有可用产品资料填写的字段".to_string(),
                ));
            }
            FieldMapOutcome::Incomplete(incomplete) => {
                let detail = incomplete.unmapped_required.join(", ");
                attempt.step(AttemptStep::MapFields, StepStatus::Failed, Some(detail.clone()));
                return Err(Stop::Review(
                    FailureKind::MappingIncomplete,
                    format!(
                        "必填字段无法映射: {} (必填覆盖率 {:.0}%，综合置信度 {:.2})",
                        detail,
                        coverage * 100.0,
                        schema.confidence * coverage
                    ),
                ));
            }
        };
        attempt.step(
            AttemptStep::MapFields,
            StepStatus::Success,
            Some(format!("{} fields", mapping.len())),
        );

        // ========== 4. 验证码检查 ==========
        check_cancelled(cancel)?;
        match timeout(self.timeouts.fill, session.detect_captcha()).await {
            Ok(Ok(Some(marker))) => {
                attempt.step(AttemptStep::CaptchaCheck, StepStatus::Failed, Some(marker.clone()));
                self.capture(session, ctx, "blocked", attempt).await;
                return Err(Stop::Failed(
                    FailureKind::Blocked,
                    format!("检测到验证码 ({})，需要人工处理", marker),
                ));
            }
            Ok(Ok(None)) => attempt.step(AttemptStep::CaptchaCheck, StepStatus::Success, None),
            Ok(Err(e)) => {
                debug!("{} 验证码检查失败，继续: {}", ctx, e);
                attempt.step(AttemptStep::CaptchaCheck, StepStatus::Skipped, Some(e.to_string()));
            }
            Err(_) => attempt.step(AttemptStep::CaptchaCheck, StepStatus::Skipped, Some("timeout".into())),
        }

        // ========== 5. 填写 ==========
        check_cancelled(cancel)?;
        attempt.step(AttemptStep::FillForm, StepStatus::Started, None);
        let fill_result = timeout(self.timeouts.fill, self.fill(session, &mapping, ctx, cancel)).await;
        match fill_result {
            Ok(Ok(failed_optional)) => attempt.step(
                AttemptStep::FillForm,
                StepStatus::Success,
                Some(format!("filled {}, skipped {}", mapping.len() - failed_optional, failed_optional)),
            ),
            Ok(Err(Stop::Cancelled)) => return Err(Stop::Cancelled),
            Ok(Err(stop)) => {
                attempt.step(AttemptStep::FillForm, StepStatus::Failed, None);
                self.capture(session, ctx, "error", attempt).await;
                return Err(stop);
            }
            Err(_) => {
                attempt.step(AttemptStep::FillForm, StepStatus::Failed, Some("timeout".into()));
                self.capture(session, ctx, "error", attempt).await;
                return Err(Stop::Failed(
                    FailureKind::FillError,
                    format!("填写表单超时 ({:?})", self.timeouts.fill),
                ));
            }
        }

        // ========== 6. 提交 ==========
        check_cancelled(cancel)?;
        attempt.step(AttemptStep::Submit, StepStatus::Started, None);
        let before = match timeout(self.timeouts.submit, session.page_state()).await {
            Ok(Ok(state)) => state.url,
            Ok(Err(e)) => {
                debug!("{} 提交前读取页面状态失败: {}", ctx, e);
                String::new()
            }
            Err(_) => {
                warn!("{} 提交前读取页面状态超时 ({:?})", ctx, self.timeouts.submit);
                String::new()
            }
        };
        let submit = async {
            let selector = session
                .find_submit(schema.submit_selector.as_deref())
                .await
                .map_err(|e| format!("查找提交按钮失败: {}", e))?
                .ok_or_else(|| "找不到提交按钮".to_string())?;
            session
                .click(&selector)
                .await
                .map_err(|e| format!("点击提交按钮失败 ({}): {}", selector, e))?;
            Ok::<String, String>(selector)
        };
        match timeout(self.timeouts.submit, submit).await {
            Ok(Ok(selector)) => {
                info!("{} 📤 已点击提交: {}", ctx, selector);
                attempt.step(AttemptStep::Submit, StepStatus::Success, Some(selector));
            }
            Ok(Err(message)) => {
                attempt.step(AttemptStep::Submit, StepStatus::Failed, Some(message.clone()));
                self.capture(session, ctx, "error", attempt).await;
                return Err(Stop::Failed(FailureKind::SubmitError, message));
            }
            Err(_) => {
                attempt.step(AttemptStep::Submit, StepStatus::Failed, Some("timeout".into()));
                self.capture(session, ctx, "error", attempt).await;
                return Err(Stop::Failed(
                    FailureKind::SubmitError,
                    format!("提交超时 ({:?})", self.timeouts.submit),
                ));
            }
        }

        // ========== 7. 确认 ==========
        let signal = self.await_confirmation(session, &before).await;
        self.capture(session, ctx, "result", attempt).await;

        match signal {
            None => {
                attempt.step(AttemptStep::Confirm, StepStatus::Failed, Some("timeout".into()));
                Err(Stop::Failed(
                    FailureKind::ConfirmationTimeout,
                    format!("等待提交结果超时 ({:?})", self.timeouts.confirmation),
                ))
            }
            Some(signal) => {
                attempt.confirmation = Some(signal.clone());
                match signal {
                    ConfirmationSignal::Error(phrase) => {
                        attempt.step(AttemptStep::Confirm, StepStatus::Failed, Some(phrase.clone()));
                        Err(Stop::Failed(
                            FailureKind::SubmitError,
                            format!("页面出现错误提示: {}", phrase),
                        ))
                    }
                    ConfirmationSignal::Blocked(phrase) => {
                        attempt.step(AttemptStep::Confirm, StepStatus::Failed, Some(phrase.clone()));
                        Err(Stop::Failed(
                            FailureKind::Blocked,
                            format!("提交被拦截: {}", phrase),
                        ))
                    }
                    ConfirmationSignal::Ambiguous => {
                        attempt.step(
                            AttemptStep::Confirm,
                            StepStatus::Success,
                            Some("无法确认结果，未发现错误".into()),
                        );
                        Ok(())
                    }
                    ConfirmationSignal::Success(detail) | ConfirmationSignal::Redirected(detail) => {
                        attempt.step(AttemptStep::Confirm, StepStatus::Success, Some(detail));
                        Ok(())
                    }
                }
            }
        }
    }

    /// 取快照并交给识别网关
    async fn detect(&self, session: &dyn BrowserSession, directory: &Directory) -> Result<FormSchema, String> {
        let now = Utc::now();
        let snapshot = session
            .snapshot(self.gateway.needs_screenshot(directory, now))
            .await
            .map_err(|e| format!("获取页面快照失败: {}", e))?;
        self.gateway
            .detect(directory, &snapshot, now)
            .await
            .map_err(|failure| failure.to_string())
    }

    /// 逐个填写字段，返回失败的可选字段数
    async fn fill(
        &self,
        session: &dyn BrowserSession,
        mapping: &FieldMapping,
        ctx: &SubmissionCtx,
        cancel: &CancellationToken,
    ) -> Result<usize, Stop> {
        let mut failed_optional = 0;
        for entry in &mapping.entries {
            check_cancelled(cancel)?;
            if self.verbose_logging {
                debug!("{} 填写 {} = {}", ctx, entry.field_id, truncate_text(&entry.value, 50));
            }
            if let Err(e) = session.fill_field(entry).await {
                if entry.required {
                    return Err(Stop::Failed(
                        FailureKind::FillError,
                        format!("必填字段 {} 填写失败: {}", entry.field_id, e),
                    ));
                }
                warn!("{} 可选字段 {} 填写失败，跳过: {}", ctx, entry.field_id, e);
                failed_optional += 1;
            }
        }
        Ok(failed_optional)
    }

    /// 轮询页面直到出现明确信号；超时前一次都没读到页面返回 `None`
    async fn await_confirmation(&self, session: &dyn BrowserSession, before_url: &str) -> Option<ConfirmationSignal> {
        let deadline = Instant::now() + self.timeouts.confirmation;
        let mut last = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return last;
            }
            match timeout(remaining, session.page_state()).await {
                Ok(Ok(state)) => {
                    let signal = classify_confirmation(before_url, &state);
                    if signal != ConfirmationSignal::Ambiguous {
                        return Some(signal);
                    }
                    last = Some(signal);
                }
                Ok(Err(e)) => debug!("读取页面状态失败: {}", e),
                Err(_) => return last,
            }
            sleep(CONFIRM_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    /// 保存截图，失败只记录日志
    async fn capture(&self, session: &dyn BrowserSession, ctx: &SubmissionCtx, label: &str, attempt: &mut AttemptBuilder) {
        if !self.screenshot_on_submit {
            return;
        }
        let file_name = format!(
            "{}_{}_{}_{}.png",
            label,
            ctx.submission_id,
            ctx.attempt_no,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let path = self.screenshot_dir.join(file_name);
        match timeout(self.timeouts.confirmation, session.screenshot(&path)).await {
            Ok(Ok(())) => {
                attempt.screenshot_path = Some(path.display().to_string());
                attempt.step(AttemptStep::Screenshot, StepStatus::Success, Some(label.to_string()));
            }
            Ok(Err(e)) => {
                warn!("{} 截图失败: {}", ctx, e);
                attempt.step(AttemptStep::Screenshot, StepStatus::Failed, Some(e.to_string()));
            }
            Err(_) => {
                warn!("{} 截图超时 ({:?})", ctx, self.timeouts.confirmation);
                attempt.step(AttemptStep::Screenshot, StepStatus::Failed, Some("timeout".into()));
            }
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), Stop> {
    if cancel.is_cancelled() {
        Err(Stop::Cancelled)
    } else {
        Ok(())
    }
}

/// 根据提交后的页面判断结果
///
/// 拦截特征优先，其次成功文案、错误文案，最后看地址是否跳转。
pub fn classify_confirmation(before_url: &str, state: &PageState) -> ConfirmationSignal {
    let text = state.text.to_lowercase();

    if let Some(phrase) = BLOCKED_PHRASES.iter().find(|p| text.contains(*p)) {
        return ConfirmationSignal::Blocked(phrase.to_string());
    }
    if let Some(phrase) = SUCCESS_PHRASES.iter().find(|p| text.contains(*p)) {
        return ConfirmationSignal::Success(phrase.to_string());
    }
    if let Some(phrase) = ERROR_PHRASES.iter().find(|p| text.contains(*p)) {
        return ConfirmationSignal::Error(phrase.to_string());
    }
    if !state.url.is_empty() && normalize_url(&state.url) != normalize_url(before_url) {
        return ConfirmationSignal::Redirected(state.url.clone());
    }
    ConfirmationSignal::Ambiguous
}

fn normalize_url(url: &str) -> &str {
    let url = url.split('#').next().unwrap_or(url);
    url.trim_end_matches('/')
}
