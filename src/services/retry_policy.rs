//! 重试策略
//!
//! 普通失败线性退避，被拦截时指数退避，且拦截的上限是普通上限的 4 倍，
//! 并且不少于 [`MIN_BLOCKED_DELAY`]，因此相同尝试次数下拦截的等待时间总是更长，
//! 基础间隔配置为 0 时也一样。

use std::time::Duration;

use crate::config::Config;
use crate::models::FailureKind;

/// 拦截退避上限相对普通上限的倍数
const BLOCKED_CAP_FACTOR: u32 = 4;

/// 被拦截后至少等待的时长
pub const MIN_BLOCKED_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待给定时长后重新进入可执行队列
    RetryAfter(Duration),
    /// 次数耗尽，不再重试
    Terminal,
    /// 不自动重试，交给人工
    Escalate,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.submission_delay(), config.max_retry_delay())
    }

    /// 决定下一步
    ///
    /// `elapsed` 为距上次尝试开始已经过去的时间，会从等待时长中扣除。
    pub fn decide(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        kind: FailureKind,
        elapsed: Duration,
    ) -> RetryDecision {
        if attempt_count >= max_attempts {
            return RetryDecision::Terminal;
        }
        if kind == FailureKind::MappingIncomplete {
            return RetryDecision::Escalate;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt_count, kind).saturating_sub(elapsed))
    }

    /// 第 `attempt_count` 次尝试失败后的完整等待时长
    pub fn delay_for(&self, attempt_count: u32, kind: FailureKind) -> Duration {
        let n = attempt_count.max(1);
        match kind {
            FailureKind::Blocked => {
                let cap = self.blocked_cap();
                2u32.checked_pow(n)
                    .and_then(|factor| self.base_delay.checked_mul(factor))
                    .map_or(cap, |d| d.min(cap))
                    .max(MIN_BLOCKED_DELAY)
            }
            _ => self
                .base_delay
                .checked_mul(n)
                .map_or(self.max_delay, |d| d.min(self.max_delay)),
        }
    }

    fn blocked_cap(&self) -> Duration {
        self.max_delay.saturating_mul(BLOCKED_CAP_FACTOR)
    }
}
