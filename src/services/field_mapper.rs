//! 字段映射器 - 纯函数
//!
//! 把产品资料映射到表单结构上：先看字段声明的语义类型，没有声明时
//! 按名称 / 标签 / 占位符文本推断。结果确定、无副作用。

use phf::phf_map;

use crate::models::{
    FieldKind, FieldMapping, FilledField, FormField, FormSchema, Product, SemanticType,
};

/// 文本相似度阈值（字符二元组 Dice 系数）
const SIMILARITY_THRESHOLD: f64 = 0.6;

/// 归一化后的关键词 → 语义类型
static KEYWORDS: phf::Map<&'static str, SemanticType> = phf_map! {
    "name" => SemanticType::ProductName,
    "product" => SemanticType::ProductName,
    "product_name" => SemanticType::ProductName,
    "saas_name" => SemanticType::ProductName,
    "tool" => SemanticType::ProductName,
    "tool_name" => SemanticType::ProductName,
    "startup" => SemanticType::ProductName,
    "startup_name" => SemanticType::ProductName,
    "app_name" => SemanticType::ProductName,
    "company_name" => SemanticType::ProductName,
    "title" => SemanticType::ProductName,

    "url" => SemanticType::Url,
    "website" => SemanticType::Url,
    "website_url" => SemanticType::Url,
    "link" => SemanticType::Url,
    "homepage" => SemanticType::Url,
    "site" => SemanticType::Url,
    "domain" => SemanticType::Url,

    "tagline" => SemanticType::Tagline,
    "slogan" => SemanticType::Tagline,
    "headline" => SemanticType::Tagline,
    "one_liner" => SemanticType::Tagline,

    "email" => SemanticType::Email,
    "e_mail" => SemanticType::Email,
    "mail" => SemanticType::Email,
    "contact" => SemanticType::Email,
    "contact_email" => SemanticType::Email,

    "description" => SemanticType::DescriptionShort,
    "short_description" => SemanticType::DescriptionShort,
    "summary" => SemanticType::DescriptionShort,
    "intro" => SemanticType::DescriptionShort,
    "long_description" => SemanticType::DescriptionLong,
    "full_description" => SemanticType::DescriptionLong,
    "about" => SemanticType::DescriptionLong,
    "details" => SemanticType::DescriptionLong,

    "category" => SemanticType::Category,
    "categories" => SemanticType::Category,
    "industry" => SemanticType::Category,
    "niche" => SemanticType::Category,

    "contact_name" => SemanticType::ContactName,
    "your_name" => SemanticType::ContactName,
    "full_name" => SemanticType::ContactName,
    "first_name" => SemanticType::ContactName,
    "author" => SemanticType::ContactName,
    "maker" => SemanticType::ContactName,
    "founder" => SemanticType::ContactName,

    "pricing" => SemanticType::Pricing,
    "price" => SemanticType::Pricing,
    "pricing_model" => SemanticType::Pricing,
    "plan" => SemanticType::Pricing,

    "tags" => SemanticType::Tags,
    "tag" => SemanticType::Tags,
    "keywords" => SemanticType::Tags,
    "labels" => SemanticType::Tags,

    "twitter" => SemanticType::Twitter,
    "twitter_url" => SemanticType::Twitter,
    "x_com" => SemanticType::Twitter,
    "linkedin" => SemanticType::Linkedin,
    "linkedin_url" => SemanticType::Linkedin,
    "github" => SemanticType::Github,
    "github_url" => SemanticType::Github,

    "logo" => SemanticType::Logo,
    "icon" => SemanticType::Logo,
    "image" => SemanticType::Logo,
    "avatar" => SemanticType::Logo,
    "picture" => SemanticType::Logo,

    "terms" => SemanticType::Consent,
    "agree" => SemanticType::Consent,
    "consent" => SemanticType::Consent,
    "tos" => SemanticType::Consent,
    "privacy" => SemanticType::Consent,
};

/// 单词命中多个类型时的优先级（越靠前越具体）
const TOKEN_PRIORITY: [SemanticType; 15] = [
    SemanticType::Twitter,
    SemanticType::Linkedin,
    SemanticType::Github,
    SemanticType::Email,
    SemanticType::Logo,
    SemanticType::Consent,
    SemanticType::ContactName,
    SemanticType::Tags,
    SemanticType::Pricing,
    SemanticType::Category,
    SemanticType::Url,
    SemanticType::DescriptionLong,
    SemanticType::DescriptionShort,
    SemanticType::Tagline,
    SemanticType::ProductName,
];

/// 映射结果
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMapOutcome {
    /// 所有必填字段都有值
    Complete(FieldMapping),
    /// 有必填字段无法填写（不是错误，交给调用方决定）
    Incomplete(MappingIncomplete),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingIncomplete {
    pub partial: FieldMapping,
    /// 无法填写的必填字段 `field_id`
    pub unmapped_required: Vec<String>,
    pub required_total: usize,
}

impl FieldMapOutcome {
    pub fn mapping(&self) -> &FieldMapping {
        match self {
            FieldMapOutcome::Complete(mapping) => mapping,
            FieldMapOutcome::Incomplete(incomplete) => &incomplete.partial,
        }
    }

    /// 必填字段覆盖率（没有必填字段时为 1.0）
    pub fn required_coverage(&self) -> f32 {
        match self {
            FieldMapOutcome::Complete(_) => 1.0,
            FieldMapOutcome::Incomplete(incomplete) if incomplete.required_total == 0 => 1.0,
            FieldMapOutcome::Incomplete(incomplete) => {
                let mapped = incomplete.required_total - incomplete.unmapped_required.len();
                mapped as f32 / incomplete.required_total as f32
            }
        }
    }
}

/// 把产品资料映射到表单字段
pub fn map_fields(product: &Product, schema: &FormSchema) -> FieldMapOutcome {
    let mut entries = Vec::new();
    let mut unmapped_required = Vec::new();
    let mut logo_used = false;

    for field in &schema.fields {
        let mut semantic = resolve_semantic_type(field);
        if field.kind == FieldKind::File && semantic == SemanticType::Unknown {
            semantic = SemanticType::Logo;
        }

        // 只把 logo 填进第一个文件字段
        let value = if semantic == SemanticType::Logo && logo_used {
            None
        } else {
            product_value(product, semantic, field.kind)
                .and_then(|v| fit_options(field, v))
        };

        match value {
            Some(value) => {
                if semantic == SemanticType::Logo {
                    logo_used = true;
                }
                entries.push(FilledField {
                    field_id: field.field_id.clone(),
                    name: field.name.clone(),
                    kind: field.kind,
                    semantic_type: semantic,
                    required: field.required,
                    value,
                });
            }
            None if field.required => unmapped_required.push(field.field_id.clone()),
            None => {}
        }
    }

    let mapping = FieldMapping { entries };
    if unmapped_required.is_empty() {
        FieldMapOutcome::Complete(mapping)
    } else {
        FieldMapOutcome::Incomplete(MappingIncomplete {
            partial: mapping,
            unmapped_required,
            required_total: schema.required_fields().count(),
        })
    }
}

/// 字段的语义类型：声明优先，其次推断
pub fn resolve_semantic_type(field: &FormField) -> SemanticType {
    if field.semantic_type != SemanticType::Unknown {
        return field.semantic_type;
    }
    infer_semantic_type(field)
}

/// 按名称 / 标签 / 占位符推断语义类型
pub fn infer_semantic_type(field: &FormField) -> SemanticType {
    let candidates: Vec<String> = [
        Some(field.name.as_str()),
        field.label.as_deref(),
        field.placeholder.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(normalize)
    .filter(|s| !s.is_empty())
    .collect();

    // 1. 整串命中
    for c in &candidates {
        if let Some(t) = KEYWORDS.get(c.as_str()) {
            return adjust_for_kind(*t, field.kind, c);
        }
    }

    // 2. 相邻两个词 / 单个词命中，取优先级最高的
    for c in &candidates {
        let tokens: Vec<&str> = c.split('_').collect();
        let mut hits: Vec<SemanticType> = tokens
            .windows(2)
            .filter_map(|w| KEYWORDS.get(format!("{}_{}", w[0], w[1]).as_str()).copied())
            .collect();
        if hits.is_empty() {
            hits = tokens.iter().filter_map(|t| KEYWORDS.get(*t).copied()).collect();
        }
        if let Some(best) = TOKEN_PRIORITY.iter().find(|p| hits.contains(p)) {
            return adjust_for_kind(*best, field.kind, c);
        }
    }

    // 3. 相似度兜底
    let mut best: Option<(f64, SemanticType)> = None;
    for c in &candidates {
        for (key, t) in KEYWORDS.entries() {
            let score = similarity(c, key);
            if score >= SIMILARITY_THRESHOLD && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, *t));
            }
        }
    }
    match best {
        Some((_, t)) => adjust_for_kind(t, field.kind, ""),
        None => SemanticType::Unknown,
    }
}

/// 未注明长短的"描述"放在多行文本框里时按长描述处理
fn adjust_for_kind(t: SemanticType, kind: FieldKind, text: &str) -> SemanticType {
    match t {
        SemanticType::DescriptionShort
            if kind == FieldKind::Textarea && !text.contains("short") =>
        {
            SemanticType::DescriptionLong
        }
        SemanticType::Email if kind == FieldKind::Url => SemanticType::Url,
        other => other,
    }
}

/// 产品资料中对应语义类型的值，空串视为缺失
fn product_value(product: &Product, semantic: SemanticType, kind: FieldKind) -> Option<String> {
    fn present(v: &Option<String>) -> Option<&str> {
        v.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
    fn non_empty(v: &str) -> Option<&str> {
        Some(v.trim()).filter(|s| !s.is_empty())
    }

    let value = match semantic {
        SemanticType::ProductName => non_empty(&product.name),
        SemanticType::Url => non_empty(&product.website_url),
        SemanticType::Tagline => {
            present(&product.tagline).or_else(|| present(&product.short_description))
        }
        SemanticType::Email => non_empty(&product.contact_email),
        SemanticType::DescriptionShort => {
            present(&product.short_description).or_else(|| present(&product.tagline))
        }
        SemanticType::DescriptionLong => present(&product.long_description)
            .or_else(|| present(&product.short_description))
            .or_else(|| present(&product.tagline)),
        SemanticType::Category => present(&product.category),
        SemanticType::ContactName => present(&product.contact_name),
        SemanticType::Pricing => {
            present(&product.pricing_model).or_else(|| present(&product.pricing_details))
        }
        SemanticType::Tags => {
            return Some(product.tags.join(", ")).filter(|s| !s.trim().is_empty());
        }
        SemanticType::Twitter => present(&product.twitter_url),
        SemanticType::Linkedin => present(&product.linkedin_url),
        SemanticType::Github => present(&product.github_url),
        SemanticType::Logo if kind == FieldKind::File => present(&product.logo_path),
        SemanticType::Consent if kind == FieldKind::Checkbox => Some("true"),
        _ => None,
    };
    value.map(str::to_string)
}

/// 下拉 / 单选字段必须落在给定选项里
fn fit_options(field: &FormField, value: String) -> Option<String> {
    let options = match (&field.options, field.kind) {
        (Some(options), FieldKind::Select | FieldKind::Radio) if !options.is_empty() => options,
        _ => return Some(value),
    };

    let wanted = value.to_lowercase();
    if let Some(exact) = options.iter().find(|o| o.to_lowercase() == wanted) {
        return Some(exact.clone());
    }
    if let Some(partial) = options.iter().find(|o| {
        let o = o.to_lowercase();
        !o.is_empty() && (o.contains(&wanted) || wanted.contains(&o))
    }) {
        return Some(partial.clone());
    }

    options
        .iter()
        .map(|o| (similarity(&normalize(o), &normalize(&value)), o))
        .filter(|(score, _)| *score >= SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, o)| o.clone())
}

/// 小写，非字母数字折叠成单个下划线
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// 字符二元组 Dice 系数，忽略下划线
fn similarity(a: &str, b: &str) -> f64 {
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().filter(|c| *c != '_').collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a = bigrams(a);
    let mut b = bigrams(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let total = a.len() + b.len();
    let mut common = 0;
    for pair in &a {
        if let Some(pos) = b.iter().position(|p| p == pair) {
            b.swap_remove(pos);
            common += 1;
        }
    }
    (2 * common) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SchemaSource;

    fn product() -> Product {
        Product {
            id: 1,
            name: "Acme Analytics".into(),
            website_url: "https://acme.example".into(),
            tagline: Some("Metrics without the mess".into()),
            short_description: None,
            long_description: None,
            category: Some("Analytics".into()),
            tags: vec!["analytics".into(), "saas".into()],
            contact_email: "founder@acme.example".into(),
            logo_path: Some("/tmp/logo.png".into()),
            ..Default::default()
        }
    }

    fn field(name: &str) -> FormField {
        FormField::new(format!("#{name}"), SemanticType::Unknown, false)
    }

    #[test]
    fn declared_name_url_tagline_are_all_filled() {
        let schema = FormSchema::new(
            vec![
                FormField::new("#name", SemanticType::ProductName, true),
                FormField::new("#url", SemanticType::Url, true),
                FormField::new("#tagline", SemanticType::Tagline, true),
            ],
            0.9,
            SchemaSource::Oracle,
        );

        let outcome = map_fields(&product(), &schema);
        assert!(matches!(outcome, FieldMapOutcome::Complete(_)));
        assert_eq!(outcome.required_coverage(), 1.0);
        let mapping = outcome.mapping();
        assert_eq!(mapping.get("#name"), Some("Acme Analytics"));
        assert_eq!(mapping.get("#url"), Some("https://acme.example"));
        assert_eq!(mapping.get("#tagline"), Some("Metrics without the mess"));
    }

    #[test]
    fn infers_types_from_names_and_labels() {
        assert_eq!(infer_semantic_type(&field("product_url")), SemanticType::Url);
        assert_eq!(infer_semantic_type(&field("twitter-url")), SemanticType::Twitter);
        assert_eq!(infer_semantic_type(&field("contact_email")), SemanticType::Email);
        assert_eq!(infer_semantic_type(&field("your-name")), SemanticType::ContactName);
        assert_eq!(
            infer_semantic_type(&field("f_12").with_label("Company Website")),
            SemanticType::Url
        );
        assert_eq!(infer_semantic_type(&field("zzz")), SemanticType::Unknown);
    }

    #[test]
    fn misspelled_label_falls_back_to_similarity() {
        let f = field("x1").with_label("Categorie");
        assert_eq!(infer_semantic_type(&f), SemanticType::Category);
    }

    #[test]
    fn description_in_textarea_prefers_long_text() {
        let f = field("description").with_kind(FieldKind::Textarea);
        assert_eq!(infer_semantic_type(&f), SemanticType::DescriptionLong);
        assert_eq!(infer_semantic_type(&field("description")), SemanticType::DescriptionShort);
    }

    #[test]
    fn description_falls_back_to_tagline() {
        let schema = FormSchema::new(
            vec![FormField::new("#desc", SemanticType::DescriptionLong, true)],
            0.9,
            SchemaSource::Oracle,
        );
        let outcome = map_fields(&product(), &schema);
        assert_eq!(outcome.mapping().get("#desc"), Some("Metrics without the mess"));
    }

    #[test]
    fn missing_required_value_reports_incomplete() {
        let schema = FormSchema::new(
            vec![
                FormField::new("#name", SemanticType::ProductName, true),
                FormField::new("#pricing", SemanticType::Pricing, true),
                FormField::new("#github", SemanticType::Github, false),
            ],
            0.9,
            SchemaSource::Oracle,
        );

        match map_fields(&product(), &schema) {
            FieldMapOutcome::Incomplete(incomplete) => {
                assert_eq!(incomplete.unmapped_required, vec!["#pricing".to_string()]);
                assert_eq!(incomplete.partial.len(), 1);
                assert!((0.49..0.51).contains(
                    &FieldMapOutcome::Incomplete(incomplete).required_coverage()
                ));
            }
            other => panic!("expected incomplete mapping, got {other:?}"),
        }
    }

    #[test]
    fn select_value_snaps_to_available_option() {
        let mut f = FormField::new("#cat", SemanticType::Category, true).with_kind(FieldKind::Select);
        f.options = Some(vec!["Marketing".into(), "Data & Analytics".into()]);
        let schema = FormSchema::new(vec![f], 0.9, SchemaSource::Oracle);
        let outcome = map_fields(&product(), &schema);
        assert_eq!(outcome.mapping().get("#cat"), Some("Data & Analytics"));
    }

    #[test]
    fn logo_goes_into_first_file_field_only() {
        let schema = FormSchema::new(
            vec![
                field("upload").with_kind(FieldKind::File),
                field("screenshot").with_kind(FieldKind::File),
            ],
            0.9,
            SchemaSource::RuleBased,
        );
        let mapping = map_fields(&product(), &schema);
        assert_eq!(mapping.mapping().get("#upload"), Some("/tmp/logo.png"));
        assert_eq!(mapping.mapping().get("#screenshot"), None);
    }

    #[test]
    fn consent_checkbox_is_ticked() {
        let f = field("agree_terms").with_kind(FieldKind::Checkbox);
        let schema = FormSchema::new(vec![f], 0.9, SchemaSource::RuleBased);
        let mapping = map_fields(&product(), &schema);
        assert_eq!(mapping.mapping().get("#agree_terms"), Some("true"));
    }

    #[test]
    fn mapping_is_deterministic() {
        let schema = FormSchema::new(
            vec![field("name"), field("email"), field("tags"), field("website")],
            0.5,
            SchemaSource::RuleBased,
        );
        assert_eq!(map_fields(&product(), &schema), map_fields(&product(), &schema));
    }
}
