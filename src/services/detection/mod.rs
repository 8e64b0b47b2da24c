//! 表单识别网关
//!
//! 对外只暴露 `detect(snapshot) -> FormSchema | DetectionFailure`。
//! 识别能力由 [`FormDetector`] 提供，按顺序尝试：
//! 目录上未过期的缓存结构 → LLM 实时识别 → HTML 规则兜底。

pub mod cached;
pub mod llm_detector;
pub mod rule_based;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Directory, FormSchema, PageSnapshot};
use crate::services::LlmService;

pub use cached::CachedSchemaDetector;
pub use llm_detector::LlmFormDetector;
pub use rule_based::RuleBasedDetector;

/// 识别失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionFailureReason {
    /// 页面上没有找到提交表单
    NoFormFound,
    /// 识别服务不可用（网络 / 鉴权 / 限流）
    OracleUnavailable,
    /// 识别结果无法解析或自相矛盾
    AmbiguousSchema,
}

impl fmt::Display for DetectionFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionFailureReason::NoFormFound => "no_form_found",
            DetectionFailureReason::OracleUnavailable => "oracle_unavailable",
            DetectionFailureReason::AmbiguousSchema => "ambiguous_schema",
        };
        f.write_str(s)
    }
}

/// 识别失败，总是可重试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFailure {
    pub reason: DetectionFailureReason,
    pub detail: String,
}

impl DetectionFailure {
    pub fn new(reason: DetectionFailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn no_form_found(detail: impl Into<String>) -> Self {
        Self::new(DetectionFailureReason::NoFormFound, detail)
    }

    pub fn oracle_unavailable(detail: impl Into<String>) -> Self {
        Self::new(DetectionFailureReason::OracleUnavailable, detail)
    }

    pub fn ambiguous(detail: impl Into<String>) -> Self {
        Self::new(DetectionFailureReason::AmbiguousSchema, detail)
    }
}

impl fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

impl std::error::Error for DetectionFailure {}

/// 表单结构识别能力
#[async_trait]
pub trait FormDetector: Send + Sync {
    /// 用于日志的名称
    fn name(&self) -> &'static str;

    async fn detect(&self, snapshot: &PageSnapshot) -> Result<FormSchema, DetectionFailure>;
}

/// 识别网关
pub struct DetectionGateway {
    oracle: Option<Arc<dyn FormDetector>>,
    fallback: Arc<dyn FormDetector>,
    schema_max_age: chrono::Duration,
}

impl DetectionGateway {
    /// `oracle` 为空时只使用缓存与规则兜底
    pub fn new(oracle: Option<Arc<dyn FormDetector>>, schema_max_age: chrono::Duration) -> Self {
        Self {
            oracle,
            fallback: Arc::new(RuleBasedDetector::new()),
            schema_max_age,
        }
    }

    /// 配置了 LLM 密钥时使用 LLM 识别，否则只用缓存与规则
    pub fn from_config(config: &Config) -> Self {
        if config.demo_mode {
            info!("演示模式：表单识别只使用缓存与 HTML 规则");
            return Self::new(None, config.schema_max_age());
        }
        let oracle = LlmService::new(config)
            .map(|llm| Arc::new(LlmFormDetector::new(llm)) as Arc<dyn FormDetector>);
        if oracle.is_none() {
            warn!("未配置 LLM_API_KEY，表单识别只使用缓存与 HTML 规则");
        }
        Self::new(oracle, config.schema_max_age())
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FormDetector>) -> Self {
        self.fallback = fallback;
        self
    }

    /// 只有要调用 LLM 时才需要截图
    pub fn needs_screenshot(&self, directory: &Directory, now: DateTime<Utc>) -> bool {
        self.oracle.is_some()
            && CachedSchemaDetector::from_directory(directory, now, self.schema_max_age).is_none()
    }

    /// 识别目录提交页上的表单
    pub async fn detect(
        &self,
        directory: &Directory,
        snapshot: &PageSnapshot,
        now: DateTime<Utc>,
    ) -> Result<FormSchema, DetectionFailure> {
        if let Some(cached) = CachedSchemaDetector::from_directory(directory, now, self.schema_max_age) {
            debug!("使用目录 {} 的缓存表单结构", directory.name);
            return cached.detect(snapshot).await;
        }

        let oracle_failure = match &self.oracle {
            Some(oracle) => match oracle.detect(snapshot).await {
                Ok(schema) if !schema.fields.is_empty() => {
                    info!(
                        "{} 识别到 {} 个字段 (置信度 {:.2})",
                        oracle.name(),
                        schema.fields.len(),
                        schema.confidence
                    );
                    return Ok(schema);
                }
                Ok(_) => DetectionFailure::no_form_found(format!("{} 未返回任何字段", oracle.name())),
                Err(failure) => failure,
            },
            None => DetectionFailure::oracle_unavailable("未配置 LLM 识别服务"),
        };

        warn!("识别失败 ({}), 尝试 {} 兜底识别", oracle_failure, self.fallback.name());
        match self.fallback.detect(snapshot).await {
            Ok(schema) => {
                info!("{} 识别到 {} 个字段", self.fallback.name(), schema.fields.len());
                Ok(schema)
            }
            Err(fallback_failure) => {
                debug!("兜底识别同样失败: {}", fallback_failure);
                Err(oracle_failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CachedSchema, FormField, SchemaSource, SemanticType};

    struct FixedDetector(Result<FormSchema, DetectionFailure>);

    #[async_trait]
    impl FormDetector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn detect(&self, _snapshot: &PageSnapshot) -> Result<FormSchema, DetectionFailure> {
            self.0.clone()
        }
    }

    fn schema(source: SchemaSource) -> FormSchema {
        FormSchema::new(
            vec![FormField::new("#name", SemanticType::ProductName, true)],
            0.9,
            source,
        )
    }

    fn snapshot(html: &str) -> PageSnapshot {
        PageSnapshot {
            url: "https://dir.example/submit".into(),
            html: html.into(),
            screenshot_base64: None,
        }
    }

    #[tokio::test]
    async fn fresh_cache_wins_over_oracle() {
        let now = Utc::now();
        let directory = Directory {
            form_schema: Some(CachedSchema::new(schema(SchemaSource::Oracle), now)),
            ..Default::default()
        };
        let oracle = Arc::new(FixedDetector(Err(DetectionFailure::oracle_unavailable("down"))));
        let gateway = DetectionGateway::new(Some(oracle), chrono::Duration::days(30));

        let detected = gateway.detect(&directory, &snapshot(""), now).await.unwrap();
        assert_eq!(detected.source, SchemaSource::Cached);
    }

    #[tokio::test]
    async fn empty_oracle_result_falls_back_to_html_rules() {
        let oracle = Arc::new(FixedDetector(Ok(FormSchema::new(Vec::new(), 0.9, SchemaSource::Oracle))));
        let gateway = DetectionGateway::new(Some(oracle), chrono::Duration::days(30));

        let html = r#"<form><input id="name" name="name" required></form>"#;
        let detected = gateway
            .detect(&Directory::default(), &snapshot(html), Utc::now())
            .await
            .unwrap();
        assert_eq!(detected.source, SchemaSource::RuleBased);
        assert_eq!(detected.fields.len(), 1);
    }

    #[tokio::test]
    async fn reports_oracle_failure_when_fallback_finds_nothing() {
        let oracle = Arc::new(FixedDetector(Err(DetectionFailure::oracle_unavailable("429"))));
        let gateway = DetectionGateway::new(Some(oracle), chrono::Duration::days(30));

        let failure = gateway
            .detect(&Directory::default(), &snapshot("<p>nothing here</p>"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(failure.reason, DetectionFailureReason::OracleUnavailable);
    }

    #[tokio::test]
    async fn oracle_schema_is_used_when_present() {
        let oracle = Arc::new(FixedDetector(Ok(schema(SchemaSource::Oracle))));
        let gateway = DetectionGateway::new(Some(oracle), chrono::Duration::days(30));
        let detected = gateway
            .detect(&Directory::default(), &snapshot(""), Utc::now())
            .await
            .unwrap();
        assert_eq!(detected.source, SchemaSource::Oracle);
    }
}
