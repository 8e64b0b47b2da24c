use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::FailureKind;
use super::form_schema::{FormSchema, SchemaSource};

pub type DirectoryId = u64;

/// 投递目标目录
///
/// 对引擎只读，`success_rate` 与学习到的表单结构除外
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub id: DirectoryId,
    pub name: String,
    pub url: String,
    /// 提交表单的直达链接
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    // 提交要求
    #[serde(default)]
    pub requires_account: bool,
    #[serde(default = "default_true")]
    pub requires_approval: bool,
    #[serde(default)]
    pub requires_payment: bool,

    /// 已知 / 学习到的表单结构
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_schema: Option<CachedSchema>,

    /// 成功率（0 ~ 100）
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

fn default_true() -> bool {
    true
}

/// 一次尝试对目录成功率的贡献
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryOutcome {
    Success,
    Failure,
}

/// 一次尝试对表单结构缓存的反馈
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFeedback {
    /// 使用该结构提交成功
    Succeeded,
    /// 在填写 / 提交阶段失败
    FailedAt(FailureKind),
}

/// 目录上缓存的表单结构以及使用情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSchema {
    pub schema: FormSchema,
    pub learned_at: DateTime<Utc>,
    /// 最近一次使用该结构提交成功的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// 最近一次使用该结构在填写 / 提交阶段失败（可能是页面改版）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_stage: Option<FailureKind>,
}

impl CachedSchema {
    pub fn new(schema: FormSchema, learned_at: DateTime<Utc>) -> Self {
        Self {
            schema,
            learned_at,
            last_success_at: None,
            last_failed_stage: None,
        }
    }

    /// 缓存是否仍可直接使用
    ///
    /// 最近一次使用在填写 / 提交阶段失败，或 `max_age` 内没有成功使用过
    /// （从未成功时以学习时间为准）都视为过期。
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        if self.last_failed_stage.is_some() {
            return false;
        }
        let reference = self.last_success_at.unwrap_or(self.learned_at);
        now.signed_duration_since(reference) <= max_age
    }
}

impl Directory {
    /// 实际要打开的提交页面
    pub fn target_url(&self) -> &str {
        self.submission_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(&self.url)
    }

    /// 累计成功率：successes / (successes + failures) * 100
    pub fn record_outcome(&mut self, outcome: DirectoryOutcome) {
        match outcome {
            DirectoryOutcome::Success => self.success_count += 1,
            DirectoryOutcome::Failure => self.failure_count += 1,
        }
        let total = self.success_count + self.failure_count;
        self.success_rate = if total == 0 {
            0.0
        } else {
            f64::from(self.success_count) * 100.0 / f64::from(total)
        };
    }

    /// 根据尝试结果更新缓存的表单结构
    ///
    /// 成功时记住本次使用的结构；缓存结构在填写 / 提交阶段失败时标记为失效，
    /// 下次重新识别。其他阶段的失败与缓存无关，不做改动。
    pub fn learn_schema(&mut self, schema: &FormSchema, feedback: SchemaFeedback, now: DateTime<Utc>) {
        match feedback {
            SchemaFeedback::Succeeded => {
                let reused = schema.source == SchemaSource::Cached;
                match self.form_schema.as_mut() {
                    Some(cached) if reused => {
                        cached.last_success_at = Some(now);
                        cached.last_failed_stage = None;
                    }
                    _ => {
                        let mut cached = CachedSchema::new(schema.clone(), now);
                        cached.last_success_at = Some(now);
                        self.form_schema = Some(cached);
                    }
                }
            }
            SchemaFeedback::FailedAt(kind) if kind.is_fill_or_submit_stage() => {
                if let Some(cached) = self.form_schema.as_mut() {
                    cached.last_failed_stage = Some(kind);
                }
            }
            SchemaFeedback::FailedAt(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(learned_days_ago: i64) -> (CachedSchema, DateTime<Utc>) {
        let now = Utc::now();
        let schema = FormSchema::new(Vec::new(), 0.9, SchemaSource::Oracle);
        (
            CachedSchema::new(schema, now - chrono::Duration::days(learned_days_ago)),
            now,
        )
    }

    #[test]
    fn success_rate_is_ratio_of_outcomes() {
        let mut dir = Directory::default();
        dir.record_outcome(DirectoryOutcome::Success);
        dir.record_outcome(DirectoryOutcome::Failure);
        assert!((dir.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn more_successes_never_lower_the_rate() {
        let mut good = Directory::default();
        let mut bad = Directory::default();
        for i in 0..10 {
            good.record_outcome(if i < 7 { DirectoryOutcome::Success } else { DirectoryOutcome::Failure });
            bad.record_outcome(if i < 3 { DirectoryOutcome::Success } else { DirectoryOutcome::Failure });
        }
        assert!(good.success_rate > bad.success_rate);
    }

    #[test]
    fn schema_expires_after_max_age_without_success() {
        let (schema, now) = cached(40);
        assert!(!schema.is_fresh(now, chrono::Duration::days(30)));

        let (mut schema, now) = cached(40);
        schema.last_success_at = Some(now - chrono::Duration::days(2));
        assert!(schema.is_fresh(now, chrono::Duration::days(30)));
    }

    #[test]
    fn schema_with_fill_failure_is_stale() {
        let (mut schema, now) = cached(1);
        schema.last_failed_stage = Some(FailureKind::FillError);
        assert!(!schema.is_fresh(now, chrono::Duration::days(30)));
    }

    #[test]
    fn target_url_prefers_submission_url() {
        let mut dir = Directory {
            url: "https://dir.example".into(),
            ..Default::default()
        };
        assert_eq!(dir.target_url(), "https://dir.example");
        dir.submission_url = Some("https://dir.example/submit".into());
        assert_eq!(dir.target_url(), "https://dir.example/submit");
    }

    #[test]
    fn successful_detection_is_cached() {
        let now = Utc::now();
        let mut dir = Directory::default();
        let schema = FormSchema::new(Vec::new(), 0.8, SchemaSource::Oracle);
        dir.learn_schema(&schema, SchemaFeedback::Succeeded, now);

        let cached = dir.form_schema.as_ref().unwrap();
        assert_eq!(cached.learned_at, now);
        assert_eq!(cached.last_success_at, Some(now));
        assert!(cached.is_fresh(now, chrono::Duration::days(30)));
    }

    #[test]
    fn fill_failure_invalidates_cache_but_navigation_does_not() {
        let (schema, now) = cached(1);
        let mut dir = Directory {
            form_schema: Some(schema.clone()),
            ..Default::default()
        };
        dir.learn_schema(&schema.schema, SchemaFeedback::FailedAt(FailureKind::NavigationTimeout), now);
        assert!(dir.form_schema.as_ref().unwrap().last_failed_stage.is_none());

        dir.learn_schema(&schema.schema, SchemaFeedback::FailedAt(FailureKind::SubmitError), now);
        assert_eq!(
            dir.form_schema.as_ref().unwrap().last_failed_stage,
            Some(FailureKind::SubmitError)
        );
    }
}
