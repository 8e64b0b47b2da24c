//! 单次尝试的审计记录

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::directory::DirectoryId;
use super::form_schema::{FieldMapping, FormSchema};
use super::product::Product;

/// 失败类型，每一步都可能独立失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NavigationTimeout,
    DetectionFailed,
    MappingIncomplete,
    FillError,
    SubmitError,
    ConfirmationTimeout,
    /// 验证码 / 反爬拦截
    Blocked,
    /// 持有者在租约内没有写回结果（多半已崩溃）
    LeaseExpired,
}

impl FailureKind {
    /// 是否发生在填写 / 提交阶段（用于判定缓存结构可能已失效）
    pub fn is_fill_or_submit_stage(self) -> bool {
        matches!(
            self,
            FailureKind::FillError | FailureKind::SubmitError | FailureKind::ConfirmationTimeout
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NavigationTimeout => "navigation_timeout",
            FailureKind::DetectionFailed => "detection_failed",
            FailureKind::MappingIncomplete => "mapping_incomplete",
            FailureKind::FillError => "fill_error",
            FailureKind::SubmitError => "submit_error",
            FailureKind::ConfirmationTimeout => "confirmation_timeout",
            FailureKind::Blocked => "blocked",
            FailureKind::LeaseExpired => "lease_expired",
        };
        f.write_str(s)
    }
}

/// 一次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 已提交（确认成功，或没有检测到错误）
    Submitted,
    Failed(FailureKind),
    /// 识别 / 映射不够可靠，转人工
    RequiresReview(FailureKind),
    /// 协作式取消，不消耗重试次数
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Submitted => f.write_str("submitted"),
            AttemptOutcome::Failed(kind) => write!(f, "failed({})", kind),
            AttemptOutcome::RequiresReview(kind) => write!(f, "requires_review({})", kind),
            AttemptOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// 提交后的确认信号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "detail", rename_all = "snake_case")]
pub enum ConfirmationSignal {
    /// 命中成功文案
    Success(String),
    /// 跳转到了新页面且无错误
    Redirected(String),
    /// 命中错误文案
    Error(String),
    /// 命中反爬特征
    Blocked(String),
    /// 无法判断，也没有错误
    Ambiguous,
}

/// 流程步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStep {
    OpenSession,
    Navigate,
    DetectForm,
    MapFields,
    CaptchaCheck,
    FillForm,
    Submit,
    Screenshot,
    Confirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Success,
    Failed,
    Skipped,
}

/// 步骤日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: AttemptStep,
    pub status: StepStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 一次尝试的完整记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_no: u32,
    /// 执行该尝试的持有者令牌
    pub owner: String,
    /// 输入快照
    pub product: Product,
    pub directory_id: DirectoryId,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_fields: Option<FormSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_fields: Option<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationSignal>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepLog>,
}

impl AttemptRecord {
    /// 确认页跳转后的地址（可作为上架链接）
    pub fn redirected_url(&self) -> Option<&str> {
        match &self.confirmation {
            Some(ConfirmationSignal::Redirected(url)) => Some(url.as_str()),
            _ => None,
        }
    }
}
