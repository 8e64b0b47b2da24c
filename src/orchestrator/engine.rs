//! 投递调度引擎 - 编排层
//!
//! ## 职责
//!
//! 1. **准入控制**：认领（id + 持有者令牌 + 租约）保证同一投递同一时刻只有一个 worker
//! 2. **并发控制**：使用 Semaphore 限制系统范围内同时执行的投递数量
//! 3. **批量调度**：按最早可执行时间取出投递并派发，报告派发 / 跳过原因
//! 4. **取消**：协作式取消，正在执行的尝试在步骤边界停止
//! 5. **人工操作**：重试、撤回、人工覆盖
//! 6. **守护模式**：定期轮询可执行投递直到关闭

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::{AttemptReport, SubmissionWorker};
use crate::browser::SessionFactory;
use crate::config::Config;
use crate::error::{AppError, AppResult, EngineError};
use crate::models::{ClaimToken, Submission, SubmissionId, SubmissionStatus, Transition};
use crate::services::DetectionGateway;
use crate::store::{keep_claim_alive, SubmissionStore};
use crate::utils::logging::log_batch_start;

/// 派发出去的一次尝试
pub type AttemptHandle = JoinHandle<AppResult<AttemptReport>>;

/// 批量调度中被跳过的原因
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyRunning,
    NotEligible(SubmissionStatus),
    RetryNotDue(DateTime<Utc>),
    AttemptsExhausted,
    Error(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyRunning => f.write_str("already_running"),
            SkipReason::NotEligible(status) => write!(f, "not_eligible({})", status),
            SkipReason::RetryNotDue(at) => write!(f, "retry_not_due({})", at),
            SkipReason::AttemptsExhausted => f.write_str("attempts_exhausted"),
            SkipReason::Error(e) => write!(f, "error({})", e),
        }
    }
}

impl From<AppError> for SkipReason {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Engine(EngineError::AlreadyRunning { .. }) => SkipReason::AlreadyRunning,
            AppError::Engine(EngineError::NotEligible { status, .. }) => SkipReason::NotEligible(status),
            AppError::Engine(EngineError::RetryNotDue { at, .. }) => SkipReason::RetryNotDue(at),
            AppError::Engine(EngineError::AttemptsExhausted { .. }) => SkipReason::AttemptsExhausted,
            other => SkipReason::Error(other.to_string()),
        }
    }
}

/// 一次批量调度的结果
pub struct BatchDispatch {
    pub dispatched: Vec<SubmissionId>,
    pub skipped: Vec<(SubmissionId, SkipReason)>,
    handles: Vec<(SubmissionId, AttemptHandle)>,
}

impl BatchDispatch {
    /// 等待本批所有尝试结束
    pub async fn join(self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (id, handle) in self.handles {
            match handle.await {
                Ok(Ok(report)) => summary.reports.push(report),
                Ok(Err(e)) => {
                    error!("[投递 #{}] ❌ 处理过程中发生错误: {}", id, e);
                    summary.errors.push((id, e.to_string()));
                }
                Err(e) => {
                    error!("[投递 #{}] 任务执行失败: {}", id, e);
                    summary.errors.push((id, e.to_string()));
                }
            }
        }
        summary
    }
}

/// 批次汇总
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub reports: Vec<AttemptReport>,
    pub errors: Vec<(SubmissionId, String)>,
}

impl BatchSummary {
    pub fn count(&self, status: SubmissionStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }
}

/// `cancel` 的效果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 已通知正在执行的尝试，将在下一个步骤边界停止
    Signalled,
    /// 未在执行，直接撤回为 cancelled
    Withdrawn,
}

struct EngineInner {
    config: Config,
    store: Arc<dyn SubmissionStore>,
    sessions: Arc<dyn SessionFactory>,
    worker: SubmissionWorker,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<SubmissionId, CancellationToken>>,
    /// 认领 + 登记取消令牌与 `cancel` 互斥，取消不会落在两者之间
    admission: tokio::sync::Mutex<()>,
    worker_id: String,
}

impl EngineInner {
    fn register(&self, id: SubmissionId, token: CancellationToken) {
        if let Ok(mut running) = self.running.lock() {
            running.insert(id, token);
        }
    }

    fn unregister(&self, id: SubmissionId) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&id);
        }
    }

    fn token_for(&self, id: SubmissionId) -> Option<CancellationToken> {
        self.running.lock().ok().and_then(|running| running.get(&id).cloned())
    }
}

/// 投递调度引擎
///
/// 可以廉价 clone，所有副本共享同一个并发池与执行表。
#[derive(Clone)]
pub struct SubmissionEngine {
    inner: Arc<EngineInner>,
}

impl SubmissionEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn SubmissionStore>,
        sessions: Arc<dyn SessionFactory>,
        gateway: Arc<DetectionGateway>,
    ) -> AppResult<Self> {
        config.validate()?;
        let worker = SubmissionWorker::new(&config, gateway);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_submissions));
        Ok(Self {
            inner: Arc::new(EngineInner {
                worker,
                semaphore,
                store,
                sessions,
                running: Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
                worker_id: format!("engine-{}", std::process::id()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.inner.store
    }

    /// 正在执行的投递
    pub fn running(&self) -> Vec<SubmissionId> {
        self.inner
            .running
            .lock()
            .map(|running| running.keys().copied().collect())
            .unwrap_or_default()
    }

    /// 空闲的执行槽位数
    pub fn available_slots(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// 标记为可立即执行（清除重试等待）
    ///
    /// 执行中或终态的投递保持不变；失败 / 被拒且仍有次数的回到 pending。
    pub async fn enqueue(&self, id: SubmissionId) -> AppResult<Submission> {
        self.inner
            .store
            .update_submission(
                id,
                Box::new(|s: &mut Submission| {
                    let remaining = s.attempts_remaining();
                    match s.status {
                        SubmissionStatus::Pending => {}
                        SubmissionStatus::Failed | SubmissionStatus::Rejected if remaining => {
                            s.status = s.status.apply(Transition::Requeue, remaining)?;
                        }
                        _ => return Ok(()),
                    }
                    s.retry_at = None;
                    s.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await
    }

    /// 立即执行一条投递
    ///
    /// 并发槽位已满返回 `PoolSaturated`，已在执行返回 `AlreadyRunning`，
    /// 其他不可执行的情况返回 `NotEligible` / `RetryNotDue` / `AttemptsExhausted`。
    pub async fn run_one(&self, id: SubmissionId) -> AppResult<AttemptHandle> {
        self.inner.store.reclaim_expired(Utc::now()).await?;

        let permit = Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .map_err(|_| EngineError::PoolSaturated {
                max: self.inner.config.max_concurrent_submissions,
            })?;

        let _admission = self.inner.admission.lock().await;
        let owner = ClaimToken::generate(&self.inner.worker_id);
        let claimed = self
            .inner
            .store
            .try_claim(id, owner.clone(), Utc::now(), self.inner.config.claim_lease())
            .await?;

        Ok(self.dispatch(claimed, owner, Some(permit)))
    }

    /// 认领最多 `limit` 条可执行投递并派发，成员排队等待执行槽位
    pub async fn run_batch(&self, limit: usize) -> AppResult<BatchDispatch> {
        let now = Utc::now();
        self.inner.store.reclaim_expired(now).await?;
        let candidates = self.inner.store.list_eligible(limit, now).await?;

        let mut batch = BatchDispatch {
            dispatched: Vec::with_capacity(candidates.len()),
            skipped: Vec::new(),
            handles: Vec::with_capacity(candidates.len()),
        };

        let _admission = self.inner.admission.lock().await;
        for candidate in candidates {
            let owner = ClaimToken::generate(&self.inner.worker_id);
            match self
                .inner
                .store
                .try_claim(candidate.id, owner.clone(), Utc::now(), self.inner.config.claim_lease())
                .await
            {
                Ok(claimed) => {
                    batch.dispatched.push(claimed.id);
                    batch.handles.push((claimed.id, self.dispatch(claimed, owner, None)));
                }
                Err(e) => {
                    let reason = SkipReason::from(e);
                    debug!("[投递 #{}] 跳过: {}", candidate.id, reason);
                    batch.skipped.push((candidate.id, reason));
                }
            }
        }

        log_batch_start(batch.dispatched.len(), batch.skipped.len());
        Ok(batch)
    }

    /// 重新入队一条已结束的投递，不重置尝试次数
    ///
    /// 次数已用尽时把上限提高到 `attempt_count + 1`，只多给一次机会。
    pub async fn retry(&self, id: SubmissionId) -> AppResult<Submission> {
        let submission = self
            .inner
            .store
            .update_submission(
                id,
                Box::new(|s: &mut Submission| {
                    if !s.attempts_remaining() {
                        s.max_attempts = s.attempt_count + 1;
                    }
                    s.status = s.status.apply(Transition::Override(SubmissionStatus::Pending), true)?;
                    s.retry_at = None;
                    s.listing_url = None;
                    s.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        info!(
            "[投递 #{}] 🔁 人工重试 ({}/{})",
            id, submission.attempt_count, submission.max_attempts
        );
        Ok(submission)
    }

    /// 取消：执行中的通知其停止，未执行的直接撤回
    ///
    /// 由其他引擎持有的执行中投递无法通知，返回 `AlreadyRunning`。
    pub async fn cancel(&self, id: SubmissionId) -> AppResult<CancelOutcome> {
        let _admission = self.inner.admission.lock().await;
        if let Some(token) = self.inner.token_for(id) {
            token.cancel();
            info!("[投递 #{}] 🛑 已发送取消信号", id);
            return Ok(CancelOutcome::Signalled);
        }

        self.inner
            .store
            .update_submission(
                id,
                Box::new(|s: &mut Submission| {
                    if s.status == SubmissionStatus::InProgress {
                        return Err(EngineError::AlreadyRunning { id: s.id }.into());
                    }
                    s.status = s.status.apply(Transition::Withdraw, s.attempts_remaining())?;
                    s.retry_at = None;
                    s.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        info!("[投递 #{}] 已撤回", id);
        Ok(CancelOutcome::Withdrawn)
    }

    /// 人工覆盖为 approved / rejected / pending
    ///
    /// approved 可附带上架链接；rejected / pending 会清除上架链接。
    pub async fn manual_override(
        &self,
        id: SubmissionId,
        status: SubmissionStatus,
        listing_url: Option<String>,
    ) -> AppResult<Submission> {
        let submission = self
            .inner
            .store
            .update_submission(
                id,
                Box::new(move |s: &mut Submission| {
                    let now = Utc::now();
                    s.status = s.status.apply(Transition::Override(status), s.attempts_remaining())?;
                    match status {
                        SubmissionStatus::Approved => {
                            s.submitted_at.get_or_insert(now);
                            s.approved_at.get_or_insert(now);
                            if listing_url.is_some() {
                                s.listing_url = listing_url;
                            }
                        }
                        _ => {
                            s.listing_url = None;
                            s.retry_at = None;
                        }
                    }
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        info!("[投递 #{}] ✍ 人工设置为 {}", id, submission.status);
        Ok(submission)
    }

    /// 通知所有正在执行的尝试停止
    pub fn cancel_all(&self) {
        if let Ok(running) = self.inner.running.lock() {
            for token in running.values() {
                token.cancel();
            }
        }
    }

    /// 守护模式：每隔 `poll_interval` 按空闲槽位派发，直到 `shutdown`
    ///
    /// 关闭时取消所有执行中的尝试并等待它们落盘。
    pub async fn run_until_cancelled(&self, poll_interval: Duration, shutdown: CancellationToken) -> AppResult<()> {
        info!("🕒 守护模式启动，轮询间隔 {:?}", poll_interval);
        let mut in_flight: Vec<(SubmissionId, AttemptHandle)> = Vec::new();

        loop {
            in_flight.retain(|(_, handle)| !handle.is_finished());

            let free = self.available_slots().saturating_sub(self.queued(&in_flight));
            if free > 0 {
                match self.run_batch(free).await {
                    Ok(batch) => in_flight.extend(batch.handles),
                    Err(e) => error!("调度失败: {}", e),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("🛑 收到关闭信号，等待 {} 个执行中的投递结束", in_flight.len());
        self.cancel_all();
        for (id, handle) in in_flight {
            match handle.await {
                Ok(Ok(report)) => debug!("[投递 #{}] 已结束: {}", id, report.status),
                Ok(Err(e)) => warn!("[投递 #{}] 结束时出错: {}", id, e),
                Err(e) => warn!("[投递 #{}] 任务执行失败: {}", id, e),
            }
        }
        Ok(())
    }

    /// 已派发但还没拿到槽位的数量
    fn queued(&self, in_flight: &[(SubmissionId, AttemptHandle)]) -> usize {
        let holding = self.inner.config.max_concurrent_submissions - self.available_slots();
        in_flight.len().saturating_sub(holding)
    }

    /// 为已认领的投递启动任务
    ///
    /// 没有预先拿到槽位的任务先排队；排队期间被取消仍会写入一条 cancelled 记录。
    fn dispatch(&self, claimed: Submission, owner: ClaimToken, permit: Option<OwnedSemaphorePermit>) -> AttemptHandle {
        let id = claimed.id;
        let cancel = CancellationToken::new();
        self.inner.register(id, cancel.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let permit = match permit {
                Some(permit) => Some(permit),
                None => {
                    // 排队期间也要续租，否则租约会在拿到槽位前过期
                    let semaphore = Arc::clone(&inner.semaphore);
                    let lease = inner.config.claim_lease();
                    tokio::select! {
                        acquired = semaphore.acquire_owned() => acquired.ok(),
                        _ = cancel.cancelled() => None,
                        _ = keep_claim_alive(inner.store.as_ref(), id, &owner, lease) => None,
                    }
                }
            };
            let _permit = permit;

            let result = inner
                .worker
                .process(inner.store.as_ref(), inner.sessions.as_ref(), claimed, owner, &cancel)
                .await;
            inner.unregister(id);
            result
        })
    }
}
