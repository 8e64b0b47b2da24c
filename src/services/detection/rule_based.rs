//! HTML 规则兜底识别
//!
//! 不依赖任何外部服务：扫描 `input` / `textarea` / `select`，
//! 通过 `<label for>` 取标签文本，置信度固定为 0.5。

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{DetectionFailure, FormDetector};
use crate::models::{FieldKind, FormField, FormSchema, PageSnapshot, SchemaSource, SemanticType};
use crate::services::field_mapper::infer_semantic_type;

const RULE_BASED_CONFIDENCE: f32 = 0.5;

/// 不需要填写的 input 类型
const SKIPPED_INPUT_TYPES: [&str; 7] = ["hidden", "submit", "button", "image", "reset", "search", "password"];

struct Patterns {
    element: Regex,
    attr: Regex,
    label: Regex,
    option: Regex,
    form: Regex,
    tag: Regex,
    space: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        element: Regex::new(r"(?is)<(input|textarea|select)\b([^>]*)>")
            .expect("hardcoded element regex is valid"),
        attr: Regex::new(r#"(?s)([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
            .expect("hardcoded attribute regex is valid"),
        label: Regex::new(r"(?is)<label\b([^>]*)>(.*?)</label>")
            .expect("hardcoded label regex is valid"),
        option: Regex::new(r"(?is)<option\b([^>]*)>(.*?)</option>")
            .expect("hardcoded option regex is valid"),
        form: Regex::new(r"(?is)<form\b([^>]*)>").expect("hardcoded form regex is valid"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("hardcoded tag regex is valid"),
        space: Regex::new(r"\s+").expect("hardcoded whitespace regex is valid"),
    })
}

/// 基于 HTML 规则的表单识别
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedDetector;

impl RuleBasedDetector {
    pub fn new() -> Self {
        Self
    }

    /// 从 HTML 中提取表单字段
    pub fn detect_fields_from_html(&self, html: &str) -> Vec<FormField> {
        let p = patterns();
        let labels = collect_labels(html);
        let mut fields = Vec::new();

        for caps in p.element.captures_iter(html) {
            let tag = caps[1].to_ascii_lowercase();
            let attrs = parse_attrs(&caps[2]);
            let type_attr = attrs.get("type").map(String::as_str);

            if tag == "input"
                && type_attr.map_or(false, |t| SKIPPED_INPUT_TYPES.contains(&t.to_ascii_lowercase().as_str()))
            {
                continue;
            }

            let id = attrs.get("id").filter(|v| !v.is_empty());
            let name = attrs.get("name").filter(|v| !v.is_empty());
            let field_id = match (id, name) {
                (Some(id), _) if is_plain_ident(id) => format!("#{}", id),
                (Some(id), _) => format!("[id='{}']", id),
                (None, Some(name)) => format!("[name='{}']", name),
                (None, None) => continue,
            };

            let kind = FieldKind::from_html(&tag, type_attr);
            let options = if kind == FieldKind::Select {
                let end = caps.get(0).map_or(0, |m| m.end());
                Some(select_options(&html[end..])).filter(|o| !o.is_empty())
            } else {
                None
            };

            let mut field = FormField {
                field_id,
                name: name.or(id).cloned().unwrap_or_default(),
                label: id.and_then(|id| labels.get(id.as_str()).cloned()),
                placeholder: attrs.get("placeholder").filter(|v| !v.is_empty()).cloned(),
                semantic_type: SemanticType::Unknown,
                kind,
                required: attrs.contains_key("required")
                    || attrs.get("aria-required").map_or(false, |v| v == "true"),
                options,
            };
            field.semantic_type = infer_semantic_type(&field);
            fields.push(field);
        }

        fields
    }

    fn form_selector(&self, html: &str) -> Option<String> {
        patterns()
            .form
            .captures_iter(html)
            .filter_map(|caps| parse_attrs(&caps[1]).remove("id"))
            .find(|id| is_plain_ident(id))
            .map(|id| format!("#{}", id))
    }
}

#[async_trait]
impl FormDetector for RuleBasedDetector {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn detect(&self, snapshot: &PageSnapshot) -> Result<FormSchema, DetectionFailure> {
        let fields = self.detect_fields_from_html(&snapshot.html);
        if fields.is_empty() {
            return Err(DetectionFailure::no_form_found("HTML 中没有可填写的表单字段"));
        }

        let mut schema = FormSchema::new(fields, RULE_BASED_CONFIDENCE, SchemaSource::RuleBased);
        schema.form_selector = self.form_selector(&snapshot.html);
        Ok(schema)
    }
}

/// 解析属性，键统一小写；无值属性（如 `required`）记为空串
fn parse_attrs(raw: &str) -> HashMap<String, String> {
    patterns()
        .attr
        .captures_iter(raw)
        .map(|caps| {
            let key = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// `label[for]` → 标签文本
fn collect_labels(html: &str) -> HashMap<String, String> {
    patterns()
        .label
        .captures_iter(html)
        .filter_map(|caps| {
            let target = parse_attrs(&caps[1]).remove("for")?;
            let text = clean_text(&caps[2]);
            (!text.is_empty()).then_some((target, text))
        })
        .collect()
}

/// 取 `select` 开标签之后到 `</select>` 之间的选项文本
fn select_options(after_open: &str) -> Vec<String> {
    let body = match after_open.to_ascii_lowercase().find("</select") {
        Some(end) => &after_open[..end],
        None => after_open,
    };
    patterns()
        .option
        .captures_iter(body)
        .filter_map(|caps| {
            let text = clean_text(&caps[2]);
            let value = parse_attrs(&caps[1]).remove("value").unwrap_or_default();
            // 占位选项（value 为空）不算
            (!text.is_empty() && !value.is_empty()).then_some(text)
        })
        .collect()
}

fn clean_text(fragment: &str) -> String {
    let p = patterns();
    let stripped = p.tag.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    p.space.replace_all(decoded.trim(), " ").trim_end_matches('*').trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn is_plain_ident(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().map_or(false, |c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &str = r#"
<html><body>
<form id="submit-tool" action="/tools/add" method="post">
  <input type="hidden" name="csrf" value="abc">
  <label for="tool-name">Tool Name *</label>
  <input type="text" id="tool-name" name="tool_name" required>
  <label for="site">Website <span class="hint">(https)</span></label>
  <input type='url' id='site' name='website' placeholder="https://">
  <textarea name="description" aria-required="true"></textarea>
  <select id="cat" name="category">
    <option value="">Choose one</option>
    <option value="dev">Developer Tools</option>
    <option value="ai">AI &amp; ML</option>
  </select>
  <input type="file" id="logo" name="logo">
  <input type="checkbox" id="tos" name="tos" required>
  <input type="submit" value="Submit">
</form>
</body></html>"#;

    #[test]
    fn extracts_fillable_fields() {
        let fields = RuleBasedDetector::new().detect_fields_from_html(FORM);
        let ids: Vec<&str> = fields.iter().map(|f| f.field_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["#tool-name", "#site", "[name='description']", "#cat", "#logo", "#tos"]
        );

        assert_eq!(fields[0].label.as_deref(), Some("Tool Name"));
        assert!(fields[0].required);
        assert_eq!(fields[0].semantic_type, SemanticType::ProductName);

        assert_eq!(fields[1].kind, FieldKind::Url);
        assert_eq!(fields[1].label.as_deref(), Some("Website (https)"));
        assert!(!fields[1].required);

        assert_eq!(fields[2].kind, FieldKind::Textarea);
        assert!(fields[2].required);

        assert_eq!(
            fields[3].options,
            Some(vec!["Developer Tools".to_string(), "AI & ML".to_string()])
        );
        assert_eq!(fields[4].kind, FieldKind::File);
        assert_eq!(fields[5].semantic_type, SemanticType::Consent);
    }

    #[tokio::test]
    async fn detect_builds_rule_based_schema() {
        let snapshot = PageSnapshot {
            url: "https://dir.example/submit".into(),
            html: FORM.into(),
            screenshot_base64: None,
        };
        let schema = RuleBasedDetector::new().detect(&snapshot).await.unwrap();
        assert_eq!(schema.source, SchemaSource::RuleBased);
        assert_eq!(schema.confidence, 0.5);
        assert_eq!(schema.form_selector.as_deref(), Some("#submit-tool"));
    }

    #[tokio::test]
    async fn page_without_inputs_has_no_form() {
        let snapshot = PageSnapshot {
            html: "<html><body><h1>Closed for submissions</h1></body></html>".into(),
            ..Default::default()
        };
        assert!(RuleBasedDetector::new().detect(&snapshot).await.is_err());
    }
}
