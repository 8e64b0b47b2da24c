//! 表单结构与字段映射
//!
//! `FormSchema` 由表单识别网关产出，`FieldMapping` 由字段映射器产出，
//! 两者都会原样写入投递记录，便于事后排查。

use serde::{Deserialize, Serialize};

/// 字段的语义类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    ProductName,
    Url,
    Tagline,
    Email,
    DescriptionShort,
    DescriptionLong,
    Category,
    ContactName,
    Pricing,
    Tags,
    Twitter,
    Linkedin,
    Github,
    Logo,
    /// 同意条款类勾选框
    Consent,
    #[default]
    #[serde(other)]
    Unknown,
}

/// 表单控件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Email,
    Url,
    Textarea,
    Select,
    File,
    Checkbox,
    Radio,
    /// 未知的控件类型按文本框处理
    #[default]
    #[serde(other)]
    Text,
}

impl FieldKind {
    /// 按 HTML 的 type 属性 / 标签名解析
    pub fn from_html(tag: &str, type_attr: Option<&str>) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "textarea" => FieldKind::Textarea,
            "select" => FieldKind::Select,
            _ => match type_attr.map(|t| t.to_ascii_lowercase()).as_deref() {
                Some("email") => FieldKind::Email,
                Some("url") => FieldKind::Url,
                Some("file") => FieldKind::File,
                Some("checkbox") => FieldKind::Checkbox,
                Some("radio") => FieldKind::Radio,
                _ => FieldKind::Text,
            },
        }
    }
}

/// 表单中的一个字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    /// 定位字段用的 CSS 选择器，同时作为映射结果的键
    pub field_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub semantic_type: SemanticType,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl FormField {
    pub fn new(field_id: impl Into<String>, semantic_type: SemanticType, required: bool) -> Self {
        let field_id = field_id.into();
        Self {
            name: field_id.trim_start_matches('#').to_string(),
            field_id,
            label: None,
            placeholder: None,
            semantic_type,
            kind: FieldKind::Text,
            required,
            options: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }
}

/// 结构来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    /// 目录上缓存的已知结构
    Cached,
    /// LLM 实时识别
    #[default]
    Oracle,
    /// HTML 规则兜底识别
    RuleBased,
}

/// 目标表单的结构描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_selector: Option<String>,
    pub fields: Vec<FormField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_selector: Option<String>,
    /// 0.0 ~ 1.0
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub source: SchemaSource,
}

impl FormSchema {
    pub fn new(fields: Vec<FormField>, confidence: f32, source: SchemaSource) -> Self {
        Self {
            form_selector: None,
            fields,
            submit_selector: None,
            confidence,
            source,
        }
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FormField> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// 实际填入的一个字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledField {
    pub field_id: String,
    pub name: String,
    pub kind: FieldKind,
    pub semantic_type: SemanticType,
    pub required: bool,
    pub value: String,
}

/// 字段映射结果 `field_id → value`，保持表单中的字段顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub entries: Vec<FilledField>,
}

impl FieldMapping {
    pub fn get(&self, field_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.field_id == field_id)
            .map(|e| e.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 提交页面的快照，交给识别网关使用
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
    /// PNG 截图的 base64 编码（可选）
    pub screenshot_base64: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_fall_back_to_text() {
        let kind: FieldKind = serde_json::from_str("\"datetime_local\"").unwrap();
        assert_eq!(kind, FieldKind::Text);
        let kind: FieldKind = serde_json::from_str("\"textarea\"").unwrap();
        assert_eq!(kind, FieldKind::Textarea);

        let semantic: SemanticType = serde_json::from_str("\"favourite_colour\"").unwrap();
        assert_eq!(semantic, SemanticType::Unknown);
    }

    #[test]
    fn html_type_attribute_picks_the_kind() {
        assert_eq!(FieldKind::from_html("input", Some("email")), FieldKind::Email);
        assert_eq!(FieldKind::from_html("input", Some("password")), FieldKind::Text);
        assert_eq!(FieldKind::from_html("select", None), FieldKind::Select);
    }
}
