//! 投递状态机
//!
//! ```text
//! pending ──claim──▶ in_progress ──submit──▶ submitted ──approve──▶ approved
//!    ▲                  │  │  │                  │
//!    │                  │  │  └─escalate─▶ requires_review
//!    │                  │  └─cancel──▶ pending（归还尝试次数）
//!    │                  └─fail──▶ failed
//!    └──────requeue────── failed / rejected（尚有剩余次数）◀──reject──┘
//! ```
//!
//! `approved`、`cancelled` 以及次数耗尽的 `failed` / `rejected` 为终态，
//! 只能通过人工覆盖离开。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// 投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    Pending,
    InProgress,
    Submitted,
    Approved,
    Rejected,
    Failed,
    RequiresReview,
    /// 已撤回
    Cancelled,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::InProgress => "in_progress",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::RequiresReview => "requires_review",
            SubmissionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 状态迁移事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// worker 认领（进入 in_progress）
    Claim,
    /// 提交完成
    Submit,
    /// 本次尝试失败
    Fail,
    /// 转人工审核
    Escalate,
    /// 执行中被取消，归还为 pending
    Cancel,
    /// 重试策略重新入队
    Requeue,
    /// 目录审核通过 / 拒绝
    Approve,
    Reject,
    /// 撤回未在执行中的投递
    Withdraw,
    /// 人工覆盖到指定状态
    Override(SubmissionStatus),
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Override(target) => write!(f, "override({})", target),
            other => write!(f, "{:?}", other),
        }
    }
}

impl SubmissionStatus {
    /// 是否为终态（`attempts_remaining` 表示还有剩余尝试次数）
    pub fn is_terminal(self, attempts_remaining: bool) -> bool {
        match self {
            SubmissionStatus::Approved | SubmissionStatus::Cancelled => true,
            SubmissionStatus::Failed | SubmissionStatus::Rejected => !attempts_remaining,
            _ => false,
        }
    }

    /// 计算迁移后的状态；非法迁移返回错误且不改变任何东西
    pub fn apply(
        self,
        transition: Transition,
        attempts_remaining: bool,
    ) -> Result<SubmissionStatus, EngineError> {
        use SubmissionStatus::*;

        let next = match (self, transition) {
            (Pending, Transition::Claim) if attempts_remaining => Some(InProgress),
            (InProgress, Transition::Submit) => Some(Submitted),
            (InProgress, Transition::Fail) => Some(Failed),
            (InProgress, Transition::Escalate) => Some(RequiresReview),
            (InProgress, Transition::Cancel) => Some(Pending),
            (Failed | Rejected, Transition::Requeue) if attempts_remaining => Some(Pending),
            (Submitted, Transition::Approve) => Some(Approved),
            (Submitted, Transition::Reject) => Some(Rejected),
            (Pending | Failed | Rejected | RequiresReview, Transition::Withdraw) => Some(Cancelled),
            // 人工覆盖：除执行中以外的任何状态都可以直接判定结果
            (from, Transition::Override(to @ (Approved | Rejected))) if from != InProgress => Some(to),
            // 人工重试：回到 pending，仍受次数上限约束
            (Failed | Rejected | RequiresReview | Cancelled, Transition::Override(Pending))
                if attempts_remaining =>
            {
                Some(Pending)
            }
            _ => None,
        };

        next.ok_or_else(|| EngineError::IllegalTransition {
            from: self,
            transition: transition.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SubmissionStatus::*;
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let s = Pending.apply(Transition::Claim, true).unwrap();
        assert_eq!(s, InProgress);
        let s = s.apply(Transition::Submit, true).unwrap();
        assert_eq!(s, Submitted);
        let s = s.apply(Transition::Approve, true).unwrap();
        assert_eq!(s, Approved);
    }

    #[test]
    fn claim_requires_remaining_attempts() {
        assert!(Pending.apply(Transition::Claim, false).is_err());
    }

    #[test]
    fn nothing_but_pending_can_be_claimed() {
        for status in [InProgress, Submitted, Approved, Rejected, Failed, RequiresReview, Cancelled] {
            assert!(status.apply(Transition::Claim, true).is_err(), "{status}");
        }
    }

    #[test]
    fn failed_requeues_only_with_attempts_left() {
        assert_eq!(Failed.apply(Transition::Requeue, true).unwrap(), Pending);
        assert!(Failed.apply(Transition::Requeue, false).is_err());
        assert!(Failed.is_terminal(false));
        assert!(!Failed.is_terminal(true));
    }

    #[test]
    fn cancel_returns_in_progress_to_pending() {
        assert_eq!(InProgress.apply(Transition::Cancel, true).unwrap(), Pending);
        assert!(Pending.apply(Transition::Cancel, true).is_err());
    }

    #[test]
    fn approved_is_terminal_except_for_override() {
        assert!(Approved.is_terminal(true));
        assert!(Approved.apply(Transition::Requeue, true).is_err());
        assert!(Approved.apply(Transition::Withdraw, true).is_err());
        assert_eq!(
            Approved.apply(Transition::Override(Rejected), true).unwrap(),
            Rejected
        );
    }

    #[test]
    fn review_resolves_manually() {
        assert_eq!(
            RequiresReview.apply(Transition::Override(Approved), false).unwrap(),
            Approved
        );
        assert_eq!(
            RequiresReview.apply(Transition::Override(Pending), true).unwrap(),
            Pending
        );
        assert!(RequiresReview.apply(Transition::Override(Pending), false).is_err());
    }

    #[test]
    fn in_progress_cannot_be_overridden() {
        assert!(InProgress.apply(Transition::Override(Approved), true).is_err());
        assert!(InProgress.apply(Transition::Withdraw, true).is_err());
    }
}
