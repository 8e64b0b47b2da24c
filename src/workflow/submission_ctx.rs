//! 投递处理上下文
//!
//! 封装"我正在处理哪个投递的第几次尝试"这一信息

use std::fmt::Display;

use crate::models::{ClaimToken, SubmissionId};

/// 投递处理上下文
#[derive(Debug, Clone)]
pub struct SubmissionCtx {
    pub submission_id: SubmissionId,

    /// 本次尝试序号（从1开始）
    pub attempt_no: u32,

    /// 目录名称（仅用于日志显示）
    pub directory_name: String,

    /// 持有者令牌
    pub owner: ClaimToken,
}

impl SubmissionCtx {
    pub fn new(
        submission_id: SubmissionId,
        attempt_no: u32,
        directory_name: impl Into<String>,
        owner: ClaimToken,
    ) -> Self {
        Self {
            submission_id,
            attempt_no,
            directory_name: directory_name.into(),
            owner,
        }
    }
}

impl Display for SubmissionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[投递 #{} 第{}次 {}]",
            self.submission_id, self.attempt_no, self.directory_name
        )
    }
}
