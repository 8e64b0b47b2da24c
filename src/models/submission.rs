use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AttemptOutcome, AttemptRecord, FailureKind};
use super::directory::DirectoryId;
use super::form_schema::{FieldMapping, FormSchema};
use super::product::{Product, ProductId};
use super::state_machine::{SubmissionStatus, Transition};
use crate::error::EngineError;

pub type SubmissionId = u64;

/// 执行持有者令牌（worker 标识 + 随机串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub String);

impl ClaimToken {
    pub fn generate(worker_id: &str) -> Self {
        ClaimToken(format!("{}:{}", worker_id, uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 执行租约：谁持有、何时过期
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub owner: ClaimToken,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// 一个（产品, 目录）组合的投递任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub product_id: ProductId,
    pub directory_id: DirectoryId,
    #[serde(default)]
    pub status: SubmissionStatus,

    #[serde(default)]
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// 重试策略给出的最早可执行时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,

    // 最近一次尝试的证据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_fields: Option<FormSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_fields: Option<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimLease>,
    #[serde(default)]
    pub attempt_log: Vec<AttemptRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(
        id: SubmissionId,
        product_id: ProductId,
        directory_id: DirectoryId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            directory_id,
            status: SubmissionStatus::Pending,
            attempt_count: 0,
            max_attempts,
            last_attempt_at: None,
            retry_at: None,
            submitted_at: None,
            approved_at: None,
            listing_url: None,
            error_message: None,
            detected_fields: None,
            filled_fields: None,
            screenshot_path: None,
            claim: None,
            attempt_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal(self.attempts_remaining())
    }

    /// pending、未被持有、重试等待已结束、仍有剩余次数
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == SubmissionStatus::Pending
            && self.claim.is_none()
            && self.attempts_remaining()
            && self.retry_at.map_or(true, |at| at <= now)
    }

    /// FIFO 排序键：最早的尝试 / 创建时间优先
    pub fn eligibility_key(&self) -> (DateTime<Utc>, SubmissionId) {
        (self.last_attempt_at.unwrap_or(self.created_at), self.id)
    }

    /// 原子认领：进入 in_progress 并增加尝试次数
    ///
    /// 调用方需在同一把锁内完成检查与写入。失败时不改变任何字段。
    pub fn claim(
        &mut self,
        owner: ClaimToken,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<(), EngineError> {
        match self.status {
            SubmissionStatus::InProgress => {
                return Err(EngineError::AlreadyRunning { id: self.id });
            }
            SubmissionStatus::Pending => {}
            status => {
                return Err(EngineError::NotEligible { id: self.id, status });
            }
        }
        if !self.attempts_remaining() {
            return Err(EngineError::AttemptsExhausted {
                id: self.id,
                attempts: self.attempt_count,
                max_attempts: self.max_attempts,
            });
        }
        if let Some(at) = self.retry_at.filter(|at| *at > now) {
            return Err(EngineError::RetryNotDue { id: self.id, at });
        }

        self.status = self.status.apply(Transition::Claim, true)?;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.retry_at = None;
        self.claim = Some(ClaimLease {
            owner,
            claimed_at: now,
            expires_at: now + lease,
        });
        self.updated_at = now;
        Ok(())
    }

    /// 租约是否已过期（持有者可能已崩溃）
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SubmissionStatus::InProgress
            && self.claim.as_ref().map_or(true, |c| c.expires_at <= now)
    }

    /// 续租：只有当前持有者可以延长租约
    pub fn renew_lease(&mut self, owner: &ClaimToken, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        if self.status != SubmissionStatus::InProgress {
            return false;
        }
        match self.claim.as_mut() {
            Some(claim) if &claim.owner == owner => {
                claim.expires_at = now + lease;
                true
            }
            _ => false,
        }
    }

    /// 回收过期租约，上一个持有者的那次尝试照常计数并补一条失败记录
    ///
    /// 次数已耗尽时直接判定失败。没有可回收的租约时返回 `false`。
    pub fn reclaim_expired_lease(&mut self, now: DateTime<Utc>, product: Product, target_url: String) -> bool {
        if !self.lease_expired(now) {
            return false;
        }
        let message = "执行租约过期，worker 可能已崩溃".to_string();
        let (owner, started_at) = match self.claim.take() {
            Some(claim) => (claim.owner.0, claim.claimed_at),
            None => (String::new(), self.last_attempt_at.unwrap_or(now)),
        };
        self.attempt_log.push(AttemptRecord {
            attempt_no: self.attempt_count,
            owner,
            product,
            directory_id: self.directory_id,
            target_url,
            started_at,
            finished_at: now,
            duration_ms: now
                .signed_duration_since(started_at)
                .num_milliseconds()
                .max(0) as u64,
            detected_fields: None,
            filled_fields: None,
            confirmation: None,
            outcome: AttemptOutcome::Failed(FailureKind::LeaseExpired),
            error_message: Some(message.clone()),
            screenshot_path: None,
            steps: Vec::new(),
        });
        self.error_message = Some(message);
        self.status = if self.attempts_remaining() {
            SubmissionStatus::Pending
        } else {
            SubmissionStatus::Failed
        };
        self.updated_at = now;
        true
    }

    /// 释放尚未开始执行的认领，归还尝试次数
    pub fn release_claim(&mut self, owner: &ClaimToken, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.is_held_by(owner) {
            return Err(EngineError::NotEligible {
                id: self.id,
                status: self.status,
            });
        }
        self.status = self.status.apply(Transition::Cancel, self.attempts_remaining())?;
        self.attempt_count = self.attempt_count.saturating_sub(1);
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }

    /// 检查持有者令牌
    pub fn is_held_by(&self, owner: &ClaimToken) -> bool {
        self.claim.as_ref().map_or(false, |c| &c.owner == owner)
    }

    /// 写入一次尝试的证据与结果，并释放租约
    ///
    /// `next_status` 由调用方根据状态机与重试策略算好；取消时归还尝试次数。
    pub fn record_attempt(
        &mut self,
        record: AttemptRecord,
        next_status: SubmissionStatus,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if record.outcome == AttemptOutcome::Cancelled {
            self.attempt_count = self.attempt_count.saturating_sub(1);
        }

        self.detected_fields = record.detected_fields.clone();
        self.filled_fields = record.filled_fields.clone();
        if record.screenshot_path.is_some() {
            self.screenshot_path = record.screenshot_path.clone();
        }
        match record.outcome {
            AttemptOutcome::Submitted => {
                self.error_message = None;
                if self.submitted_at.is_none() {
                    self.submitted_at = Some(record.finished_at);
                }
                if let Some(url) = record.redirected_url() {
                    self.listing_url = Some(url.to_string());
                }
            }
            AttemptOutcome::Cancelled => {}
            _ => {
                if record.error_message.is_some() {
                    self.error_message = record.error_message.clone();
                }
            }
        }

        self.status = next_status;
        self.retry_at = retry_at;
        self.claim = None;
        self.updated_at = now;
        self.attempt_log.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(n: u8) -> ClaimToken {
        ClaimToken(format!("worker-{n}"))
    }

    #[test]
    fn claim_increments_attempt_count_once() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.claim(token(1), now, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(s.status, SubmissionStatus::InProgress);
        assert_eq!(s.attempt_count, 1);

        let err = s.claim(token(2), now, chrono::Duration::minutes(5)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { id: 1 }));
        assert_eq!(s.attempt_count, 1);
        assert!(s.is_held_by(&token(1)));
    }

    #[test]
    fn exhausted_submission_cannot_be_claimed() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 2, now);
        s.attempt_count = 2;
        let err = s.claim(token(1), now, chrono::Duration::minutes(5)).unwrap_err();
        assert!(matches!(err, EngineError::AttemptsExhausted { .. }));
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.attempt_count, 2);
    }

    #[test]
    fn retry_delay_blocks_claim_until_due() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!s.is_eligible(now));
        assert!(matches!(
            s.claim(token(1), now, chrono::Duration::minutes(5)),
            Err(EngineError::RetryNotDue { .. })
        ));
        let later = now + chrono::Duration::seconds(31);
        assert!(s.is_eligible(later));
        s.claim(token(1), later, chrono::Duration::minutes(5)).unwrap();
    }

    #[test]
    fn live_lease_is_not_reclaimed() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.claim(token(1), now, chrono::Duration::seconds(10)).unwrap();
        assert!(!s.reclaim_expired_lease(now + chrono::Duration::seconds(5), Product::default(), String::new()));
        assert!(s.is_held_by(&token(1)));
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.claim(token(1), now, chrono::Duration::seconds(10)).unwrap();

        let later = now + chrono::Duration::seconds(11);
        assert!(s.reclaim_expired_lease(later, Product::default(), "https://dir.example/submit".into()));
        assert_eq!(s.attempt_log.len() as u32, s.attempt_count);
        let lost = &s.attempt_log[0];
        assert_eq!(lost.outcome, AttemptOutcome::Failed(FailureKind::LeaseExpired));
        assert_eq!(lost.owner, "worker-1");
        assert_eq!(lost.attempt_no, 1);
        assert_eq!(lost.started_at, now);

        s.claim(token(2), later, chrono::Duration::seconds(10)).unwrap();
        assert!(s.is_held_by(&token(2)));
        assert_eq!(s.attempt_count, 2);
    }

    #[test]
    fn expired_lease_on_last_attempt_fails_terminally() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 1, now);
        s.claim(token(1), now, chrono::Duration::seconds(10)).unwrap();

        let later = now + chrono::Duration::seconds(11);
        assert!(s.reclaim_expired_lease(later, Product::default(), String::new()));
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert_eq!(s.attempt_log.len(), 1);
        assert!(s.is_terminal());
        assert!(s.claim(token(2), later, chrono::Duration::seconds(10)).is_err());
    }

    #[test]
    fn only_the_holder_can_renew() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.claim(token(1), now, chrono::Duration::seconds(10)).unwrap();

        let later = now + chrono::Duration::seconds(8);
        assert!(!s.renew_lease(&token(2), later, chrono::Duration::seconds(10)));
        assert!(s.renew_lease(&token(1), later, chrono::Duration::seconds(10)));
        // 原租约 10 秒已过，但续租后仍然有效
        assert!(!s.lease_expired(now + chrono::Duration::seconds(12)));
        assert!(s.lease_expired(now + chrono::Duration::seconds(19)));
    }

    #[test]
    fn release_returns_the_attempt() {
        let now = Utc::now();
        let mut s = Submission::new(1, 1, 1, 3, now);
        s.claim(token(1), now, chrono::Duration::minutes(5)).unwrap();
        assert!(s.release_claim(&token(2), now).is_err());
        s.release_claim(&token(1), now).unwrap();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.attempt_count, 0);
        assert!(s.claim.is_none());
    }
}
