//! LLM 实时识别
//!
//! 把页面截图和截断后的 HTML 交给视觉模型，要求返回固定结构的 JSON。

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DetectionFailure, FormDetector};
use crate::models::{FieldKind, FormField, FormSchema, PageSnapshot, SchemaSource, SemanticType};
use crate::services::field_mapper::infer_semantic_type;
use crate::services::llm_service::{ChatPrompt, LlmService};

/// 发给模型的 HTML 最大字符数
const HTML_LIMIT: usize = 15_000;

const SYSTEM_PROMPT: &str = r#"You are an expert web form analyzer. Your task is to identify submission forms on directory websites where SaaS products can be listed.

Analyze both the screenshot and HTML to find:
1. The main submission form (for adding a new product/tool/website)
2. All form fields with their types, labels, and CSS selectors
3. The submit button

Return a JSON object with this exact structure:
{
    "form_found": boolean,
    "form_selector": "CSS selector for the form element",
    "fields": [
        {
            "name": "field name/id",
            "field_type": "text|email|url|textarea|select|file|checkbox|radio",
            "label": "field label text",
            "placeholder": "placeholder text if any",
            "required": boolean,
            "selector": "CSS selector to locate this field",
            "options": ["option1", "option2"]
        }
    ],
    "submit_button_selector": "CSS selector for submit button",
    "confidence": 0.0-1.0
}"#;

/// 模型返回的 JSON
#[derive(Debug, Deserialize)]
struct LlmDetection {
    #[serde(default)]
    form_found: bool,
    #[serde(default)]
    form_selector: Option<String>,
    #[serde(default)]
    fields: Vec<LlmField>,
    #[serde(default)]
    submit_button_selector: Option<String>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct LlmField {
    #[serde(default)]
    name: String,
    #[serde(default)]
    field_type: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    placeholder: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    selector: String,
    #[serde(default)]
    options: Option<Vec<String>>,
}

/// 基于 LLM 的表单识别
pub struct LlmFormDetector {
    llm: LlmService,
}

impl LlmFormDetector {
    pub fn new(llm: LlmService) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl FormDetector for LlmFormDetector {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn detect(&self, snapshot: &PageSnapshot) -> Result<FormSchema, DetectionFailure> {
        debug!("LLM 识别表单: {} (模型 {})", snapshot.url, self.llm.model_name());

        let prompt = build_prompt(truncate_chars(&snapshot.html, HTML_LIMIT));
        let response = self
            .llm
            .chat(ChatPrompt {
                system: SYSTEM_PROMPT,
                text: &prompt,
                screenshot_base64: snapshot.screenshot_base64.as_deref(),
            })
            .await
            .map_err(|e| DetectionFailure::oracle_unavailable(e.to_string()))?;

        parse_detection(&response)
    }
}

fn build_prompt(html: &str) -> String {
    format!(
        r#"Analyze this webpage screenshot and HTML to detect the SaaS/product submission form.

Look for:
- Forms for submitting a new tool, product, startup, or website
- Input fields for: name, URL, description, email, category, logo upload
- Submit/Add/Create buttons

HTML Content:
```html
{}
```

Provide your analysis as a JSON object. Focus on finding the most relevant submission form, not login or search forms."#,
        html
    )
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// 取出回复中的 JSON（兼容 ```json 代码块）
fn extract_json(content: &str) -> &str {
    let content = content.trim();
    let body = if let Some((_, rest)) = content.split_once("```json") {
        rest
    } else if let Some((_, rest)) = content.split_once("```") {
        rest
    } else {
        return content;
    };
    body.split("```").next().unwrap_or(body).trim()
}

/// 解析模型回复为表单结构
pub fn parse_detection(content: &str) -> Result<FormSchema, DetectionFailure> {
    let detection: LlmDetection = serde_json::from_str(extract_json(content)).map_err(|e| {
        warn!("无法解析 LLM 响应: {}", e);
        DetectionFailure::ambiguous(format!("无法解析 LLM 响应: {}", e))
    })?;

    if !detection.form_found {
        return Err(DetectionFailure::no_form_found("LLM 未在页面上找到提交表单"));
    }

    let fields: Vec<FormField> = detection
        .fields
        .into_iter()
        .filter_map(into_form_field)
        .collect();

    if fields.is_empty() {
        return Err(DetectionFailure::no_form_found("LLM 未返回可定位的字段"));
    }

    Ok(FormSchema {
        form_selector: detection.form_selector.filter(|s| !s.trim().is_empty()),
        fields,
        submit_selector: detection.submit_button_selector.filter(|s| !s.trim().is_empty()),
        confidence: detection.confidence.clamp(0.0, 1.0),
        source: SchemaSource::Oracle,
    })
}

/// 没有选择器也没有名称的字段无法定位，直接丢弃
fn into_form_field(raw: LlmField) -> Option<FormField> {
    let field_id = if !raw.selector.trim().is_empty() {
        raw.selector.trim().to_string()
    } else if !raw.name.trim().is_empty() {
        format!("[name='{}']", raw.name.trim())
    } else {
        return None;
    };

    let kind = match raw.field_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("textarea") => FieldKind::Textarea,
        Some("select") => FieldKind::Select,
        other => FieldKind::from_html("input", other),
    };

    let mut field = FormField {
        field_id,
        name: raw.name,
        label: raw.label.filter(|s| !s.trim().is_empty()),
        placeholder: raw.placeholder.filter(|s| !s.trim().is_empty()),
        semantic_type: SemanticType::Unknown,
        kind,
        required: raw.required,
        options: raw.options.filter(|o| !o.is_empty()),
    };
    field.semantic_type = infer_semantic_type(&field);
    Some(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FENCED: &str = r##"Here is the analysis:
```json
{
  "form_found": true,
  "form_selector": "#submit-tool",
  "fields": [
    {"name": "tool_name", "field_type": "text", "label": "Tool name", "required": true, "selector": "#tool_name"},
    {"name": "website", "field_type": "url", "label": "Website", "required": true, "selector": "input[name='website']"},
    {"name": "about", "field_type": "textarea", "label": "About", "required": false, "selector": ""},
    {"name": "", "field_type": "text", "selector": ""}
  ],
  "submit_button_selector": "button[type='submit']",
  "confidence": 0.87
}
```"##;

    #[test]
    fn parses_fenced_response() {
        let schema = parse_detection(FENCED).unwrap();
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.form_selector.as_deref(), Some("#submit-tool"));
        assert_eq!(schema.submit_selector.as_deref(), Some("button[type='submit']"));
        assert!((schema.confidence - 0.87).abs() < 1e-6);

        assert_eq!(schema.fields[0].semantic_type, SemanticType::ProductName);
        assert_eq!(schema.fields[1].kind, FieldKind::Url);
        assert_eq!(schema.fields[1].semantic_type, SemanticType::Url);
        assert_eq!(schema.fields[2].field_id, "[name='about']");
        assert_eq!(schema.fields[2].kind, FieldKind::Textarea);
    }

    #[test]
    fn form_not_found_is_reported() {
        let failure = parse_detection(r#"{"form_found": false, "fields": []}"#).unwrap_err();
        assert_eq!(failure.reason, super::super::DetectionFailureReason::NoFormFound);
    }

    #[test]
    fn garbage_is_ambiguous() {
        let failure = parse_detection("I could not find anything useful.").unwrap_err();
        assert_eq!(failure.reason, super::super::DetectionFailureReason::AmbiguousSchema);
    }

    #[test]
    fn confidence_is_clamped() {
        let schema = parse_detection(
            r##"{"form_found": true, "fields": [{"name": "email", "selector": "#email"}], "confidence": 7}"##,
        )
        .unwrap();
        assert_eq!(schema.confidence, 1.0);
    }

    #[test]
    fn html_is_truncated_on_char_boundary() {
        let text = "表单".repeat(10);
        assert_eq!(truncate_chars(&text, 3).chars().count(), 3);
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
