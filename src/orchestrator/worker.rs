//! 单条投递处理器 - 编排层
//!
//! ## 职责
//!
//! 持有一条已认领的投递，完成一次尝试并把结果落盘：
//!
//! 1. **读取输入**：产品与目录快照
//! 2. **执行流程**：委托 `SubmissionFlow` 得到尝试记录
//! 3. **状态迁移**：按状态机与重试策略算出下一状态和 `retry_at`
//! 4. **副作用**：目录成功率、表单结构缓存、人工审核清单

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::SessionFactory;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::{
    AttemptOutcome, AttemptRecord, ClaimToken, DirectoryOutcome, SchemaFeedback, Submission,
    SubmissionId, SubmissionStatus, Transition,
};
use crate::services::{DetectionGateway, RetryDecision, RetryPolicy, ReviewWriter};
use crate::store::{keep_claim_alive, SubmissionStore};
use crate::workflow::{SubmissionCtx, SubmissionFlow};

/// 一次尝试落盘后的结果
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub submission_id: SubmissionId,
    pub attempt_no: u32,
    pub outcome: AttemptOutcome,
    /// 落盘后的状态
    pub status: SubmissionStatus,
    pub retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// 投递处理器
pub struct SubmissionWorker {
    flow: SubmissionFlow,
    retry_policy: RetryPolicy,
    review_writer: ReviewWriter,
    lease: chrono::Duration,
}

impl SubmissionWorker {
    pub fn new(config: &Config, gateway: Arc<DetectionGateway>) -> Self {
        Self {
            flow: SubmissionFlow::new(config, gateway),
            retry_policy: RetryPolicy::from_config(config),
            review_writer: ReviewWriter::with_path(config.review_log_file.clone()),
            lease: config.claim_lease(),
        }
    }

    /// 处理一条已认领的投递
    ///
    /// 开始前先续租确认仍持有该投递，失去持有权时直接返回 `ClaimMismatch`，
    /// 不打开浏览器也不写任何记录。输入读取失败时释放认领（归还尝试次数）。
    pub async fn process(
        &self,
        store: &dyn SubmissionStore,
        sessions: &dyn SessionFactory,
        claimed: Submission,
        owner: ClaimToken,
        cancel: &CancellationToken,
    ) -> AppResult<AttemptReport> {
        store
            .renew_claim(claimed.id, owner.clone(), Utc::now(), self.lease)
            .await
            .inspect_err(|e| warn!("[投递 #{}] 已不再持有，放弃执行: {}", claimed.id, e))?;

        let inputs = async {
            let product = store.get_product(claimed.product_id).await?;
            let directory = store.get_directory(claimed.directory_id).await?;
            Ok::<_, crate::error::AppError>((product, directory))
        };
        let (product, directory) = match inputs.await {
            Ok(inputs) => inputs,
            Err(e) => {
                error!("[投递 #{}] ❌ 读取产品 / 目录失败: {}", claimed.id, e);
                if let Err(release) = store.release_claim(claimed.id, owner).await {
                    warn!("[投递 #{}] 释放认领失败: {}", claimed.id, release);
                }
                return Err(e);
            }
        };

        let ctx = SubmissionCtx::new(claimed.id, claimed.attempt_count, &directory.name, owner.clone());
        info!("{} ▶ 开始 (剩余 {} 次)", ctx, claimed.max_attempts - claimed.attempt_count);

        // 执行期间持续续租；续租失败说明已被回收，让流程在下一个步骤边界停下
        let attempt_cancel = cancel.child_token();
        let flow = self.flow.run(sessions, &product, &directory, &ctx, &attempt_cancel);
        tokio::pin!(flow);
        let record = tokio::select! {
            record = &mut flow => record,
            _ = keep_claim_alive(store, claimed.id, &owner, self.lease) => {
                attempt_cancel.cancel();
                flow.await
            }
        };
        let now = Utc::now();
        let (next_status, retry_at) = self.next_state(&claimed, &record, now)?;

        let outcome = record.outcome;
        let schema = record.detected_fields.clone();
        let error_message = record.error_message.clone();
        let target_url = record.target_url.clone();

        let saved = store
            .save_attempt_result(claimed.id, owner, record, next_status, retry_at)
            .await?;
        log_outcome(&ctx, &saved);

        // ========== 目录副作用（失败只记录日志） ==========
        let directory_outcome = match outcome {
            AttemptOutcome::Submitted => Some(DirectoryOutcome::Success),
            AttemptOutcome::Failed(_) => Some(DirectoryOutcome::Failure),
            _ => None,
        };
        if let Some(directory_outcome) = directory_outcome {
            if let Err(e) = store
                .update_directory_success_rate(directory.id, directory_outcome)
                .await
            {
                warn!("{} 更新目录成功率失败: {}", ctx, e);
            }
        }

        let feedback = match outcome {
            AttemptOutcome::Submitted => Some(SchemaFeedback::Succeeded),
            AttemptOutcome::Failed(kind) => Some(SchemaFeedback::FailedAt(kind)),
            _ => None,
        };
        if let (Some(schema), Some(feedback)) = (schema, feedback) {
            if let Err(e) = store.learn_form_schema(directory.id, schema, feedback, now).await {
                warn!("{} 更新表单结构缓存失败: {}", ctx, e);
            }
        }

        if saved.status == SubmissionStatus::RequiresReview {
            let reason = error_message.as_deref().unwrap_or("需要人工审核");
            if let Err(e) = self
                .review_writer
                .write(saved.id, &directory.name, &target_url, reason)
                .await
            {
                warn!("{} 写入审核清单失败: {}", ctx, e);
            }
        }

        Ok(AttemptReport {
            submission_id: saved.id,
            attempt_no: ctx.attempt_no,
            outcome,
            status: saved.status,
            retry_at: saved.retry_at,
            error_message: saved.error_message,
        })
    }

    /// 根据尝试结果计算下一状态
    fn next_state(
        &self,
        claimed: &Submission,
        record: &AttemptRecord,
        now: DateTime<Utc>,
    ) -> AppResult<(SubmissionStatus, Option<DateTime<Utc>>)> {
        let remaining = claimed.attempts_remaining();
        let from = SubmissionStatus::InProgress;

        let next = match record.outcome {
            AttemptOutcome::Submitted => (from.apply(Transition::Submit, remaining)?, None),
            AttemptOutcome::Cancelled => (from.apply(Transition::Cancel, true)?, None),
            AttemptOutcome::RequiresReview(_) => (from.apply(Transition::Escalate, remaining)?, None),
            AttemptOutcome::Failed(kind) => {
                let elapsed = now
                    .signed_duration_since(record.started_at)
                    .to_std()
                    .unwrap_or_default();
                match self
                    .retry_policy
                    .decide(claimed.attempt_count, claimed.max_attempts, kind, elapsed)
                {
                    RetryDecision::RetryAfter(delay) => {
                        let failed = from.apply(Transition::Fail, remaining)?;
                        let retry_at = chrono::Duration::from_std(delay)
                            .ok()
                            .filter(|d| *d > chrono::Duration::zero())
                            .and_then(|d| now.checked_add_signed(d));
                        (failed.apply(Transition::Requeue, remaining)?, retry_at)
                    }
                    RetryDecision::Terminal => (from.apply(Transition::Fail, remaining)?, None),
                    RetryDecision::Escalate => (from.apply(Transition::Escalate, remaining)?, None),
                }
            }
        };
        Ok(next)
    }
}

fn log_outcome(ctx: &SubmissionCtx, saved: &Submission) {
    match saved.status {
        SubmissionStatus::Submitted => info!("{} ✅ 已提交", ctx),
        SubmissionStatus::Pending => match saved.retry_at {
            Some(at) => info!("{} 🔁 将于 {} 后重试", ctx, at.format("%Y-%m-%d %H:%M:%S")),
            None => info!("{} ↩ 已回到待执行队列", ctx),
        },
        SubmissionStatus::RequiresReview => warn!("{} 👀 已转人工审核", ctx),
        SubmissionStatus::Failed => error!(
            "{} ❌ 尝试次数已用尽 ({}/{}): {}",
            ctx,
            saved.attempt_count,
            saved.max_attempts,
            saved.error_message.as_deref().unwrap_or("-")
        ),
        other => info!("{} 状态: {}", ctx, other),
    }
}
