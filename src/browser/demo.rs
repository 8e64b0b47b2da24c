//! 演示模式的模拟会话
//!
//! 不启动浏览器、不访问网络：按目录 URL 生成常见的提交表单，
//! 各步骤带有随机延迟，提交后按成功率给出确认文案或失败提示。
//! 流程、识别、映射与状态机都走真实代码路径。

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BrowserSession, PageState, SessionFactory};
use crate::models::{FilledField, PageSnapshot};

const DEFAULT_SUCCESS_RATE: f64 = 0.9;

const SUCCESS_MESSAGES: [&str; 6] = [
    "Thank you for your submission! We'll review it within 24-48 hours.",
    "Your product has been successfully submitted. You'll receive a confirmation email.",
    "Submission received! Our team will review and publish within 3-5 business days.",
    "Thanks for submitting! Your listing is now pending approval.",
    "Success! Your SaaS has been successfully added to our review queue.",
    "Submission received. Expect an update within 1 week.",
];

/// 按确认信号分类能识别的失败提示
const FAILURE_MESSAGES: [&str; 3] = [
    "CAPTCHA detected - manual intervention required",
    "Too many requests - please try again in 24 hours",
    "Error: account verification required",
];

const CATEGORY_OPTIONS: [&str; 7] = [
    "Analytics",
    "Marketing",
    "Developer Tools",
    "Productivity",
    "Design",
    "AI & ML",
    "Other",
];

const PRICING_OPTIONS: [&str; 4] = ["Free", "Freemium", "Paid", "Open Source"];

#[derive(Clone, Copy)]
enum DemoInput {
    Text,
    Url,
    Email,
    Textarea,
    Select(&'static [&'static str]),
    File,
}

struct DemoField {
    name: &'static str,
    label: &'static str,
    input: DemoInput,
    required: bool,
}

const fn field(name: &'static str, label: &'static str, input: DemoInput, required: bool) -> DemoField {
    DemoField {
        name,
        label,
        input,
        required,
    }
}

/// 模拟的目录提交表单
struct DemoForm {
    form_id: &'static str,
    submit_id: &'static str,
    fields: &'static [DemoField],
}

const PRODUCT_HUNT: DemoForm = DemoForm {
    form_id: "product-submission",
    submit_id: "submit",
    fields: &[
        field("product_name", "Product Name", DemoInput::Text, true),
        field("tagline", "Tagline", DemoInput::Text, true),
        field("description", "Description", DemoInput::Textarea, true),
        field("website_url", "Website URL", DemoInput::Url, true),
        field("category", "Category", DemoInput::Select(&CATEGORY_OPTIONS), true),
        field("logo", "Logo", DemoInput::File, false),
    ],
};

const BETALIST: DemoForm = DemoForm {
    form_id: "startup-form",
    submit_id: "submit-btn",
    fields: &[
        field("startup_name", "Startup Name", DemoInput::Text, true),
        field("url", "URL", DemoInput::Url, true),
        field("pitch", "One-line Pitch", DemoInput::Textarea, true),
        field("description", "Description", DemoInput::Textarea, true),
        field("email", "Contact Email", DemoInput::Email, true),
    ],
};

const SAAS_HUB: DemoForm = DemoForm {
    form_id: "tool-submission-form",
    submit_id: "submit-tool",
    fields: &[
        field("tool_name", "Tool Name", DemoInput::Text, true),
        field("website", "Website", DemoInput::Url, true),
        field("short_description", "Short Description", DemoInput::Text, true),
        field("long_description", "Full Description", DemoInput::Textarea, true),
        field("pricing", "Pricing Model", DemoInput::Select(&PRICING_OPTIONS), true),
        field("category", "Category", DemoInput::Select(&CATEGORY_OPTIONS), true),
    ],
};

const GENERIC: DemoForm = DemoForm {
    form_id: "submit-form",
    submit_id: "submit",
    fields: &[
        field("name", "Product/Company Name", DemoInput::Text, true),
        field("url", "Website URL", DemoInput::Url, true),
        field("description", "Description", DemoInput::Textarea, true),
        field("email", "Contact Email", DemoInput::Email, true),
        field("category", "Category", DemoInput::Select(&CATEGORY_OPTIONS), false),
    ],
};

impl DemoForm {
    fn for_url(url: &str) -> &'static DemoForm {
        let url = url.to_lowercase();
        if url.contains("producthunt") {
            &PRODUCT_HUNT
        } else if url.contains("betalist") {
            &BETALIST
        } else if url.contains("saashub") || url.contains("saas") {
            &SAAS_HUB
        } else {
            &GENERIC
        }
    }

    fn html(&self) -> String {
        let mut html = format!(
            "<html><body>\n<h1>Submit your product</h1>\n<form id=\"{}\" method=\"post\">\n",
            self.form_id
        );
        for f in self.fields {
            let required = if f.required { " required" } else { "" };
            html.push_str(&format!("  <label for=\"{}\">{}</label>\n", f.name, f.label));
            let control = match f.input {
                DemoInput::Text => input_tag("text", f.name, required),
                DemoInput::Url => input_tag("url", f.name, required),
                DemoInput::Email => input_tag("email", f.name, required),
                DemoInput::File => input_tag("file", f.name, required),
                DemoInput::Textarea => format!(
                    "<textarea id=\"{0}\" name=\"{0}\"{1}></textarea>",
                    f.name, required
                ),
                DemoInput::Select(options) => {
                    let options: String = options
                        .iter()
                        .map(|o| o.replace('&', "&amp;"))
                        .map(|o| format!("<option value=\"{0}\">{0}</option>", o))
                        .collect();
                    format!(
                        "<select id=\"{0}\" name=\"{0}\"{1}><option value=\"\">Choose one</option>{2}</select>",
                        f.name, required, options
                    )
                }
            };
            html.push_str("  ");
            html.push_str(&control);
            html.push('\n');
        }
        html.push_str(&format!(
            "  <button type=\"submit\" id=\"{}\">Submit</button>\n</form>\n</body></html>",
            self.submit_id
        ));
        html
    }
}

fn input_tag(kind: &str, name: &str, required: &str) -> String {
    format!("<input type=\"{0}\" id=\"{1}\" name=\"{1}\"{2}>", kind, name, required)
}

/// 演示模式的会话工厂
pub struct DemoSessionFactory {
    /// 延迟倍率，0 表示不等待
    speed: f64,
    success_rate: f64,
}

impl DemoSessionFactory {
    pub fn new(speed: f64) -> Self {
        Self {
            speed: speed.max(0.0),
            success_rate: DEFAULT_SUCCESS_RATE,
        }
    }

    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl SessionFactory for DemoSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        Ok(Box::new(DemoSession {
            speed: self.speed,
            success_rate: self.success_rate,
            page: Mutex::new(DemoPage::default()),
        }))
    }
}

#[derive(Default)]
struct DemoPage {
    url: String,
    form: Option<&'static DemoForm>,
    result: Option<String>,
}

pub struct DemoSession {
    speed: f64,
    success_rate: f64,
    page: Mutex<DemoPage>,
}

impl DemoSession {
    /// 在 `[min, max)` 秒之间随机等待（乘以倍率）
    async fn pause(&self, min: f64, max: f64) {
        let secs = (min + (max - min) * rand::random::<f64>()) * self.speed;
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    async fn form(&self) -> Result<&'static DemoForm> {
        self.page.lock().await.form.ok_or_else(|| anyhow!("no page loaded"))
    }
}

#[async_trait]
impl BrowserSession for DemoSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        info!("[DEMO] 打开提交页: {}", url);
        self.pause(1.0, 2.5).await;
        if rand::random::<f64>() < 0.1 {
            debug!("[DEMO] 页面加载较慢...");
            self.pause(1.0, 2.0).await;
        }

        let mut page = self.page.lock().await;
        page.url = url.to_string();
        page.form = Some(DemoForm::for_url(url));
        page.result = None;
        Ok(())
    }

    async fn snapshot(&self, _with_screenshot: bool) -> Result<PageSnapshot> {
        self.pause(0.5, 1.5).await;
        let page = self.page.lock().await;
        let form = page.form.ok_or_else(|| anyhow!("no page loaded"))?;
        Ok(PageSnapshot {
            url: page.url.clone(),
            html: form.html(),
            screenshot_base64: None,
        })
    }

    async fn fill_field(&self, field: &FilledField) -> Result<()> {
        self.form().await?;
        self.pause(0.3, 0.8).await;
        debug!("[DEMO] 填写 {} ({:?})", field.field_id, field.kind);
        Ok(())
    }

    async fn detect_captcha(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn find_submit(&self, hint: Option<&str>) -> Result<Option<String>> {
        let form = self.form().await?;
        Ok(Some(
            hint.map(str::to_string)
                .unwrap_or_else(|| format!("#{}", form.submit_id)),
        ))
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        self.form().await?;
        self.pause(1.0, 2.0).await;

        let message = if rand::random::<f64>() < self.success_rate {
            pick(&SUCCESS_MESSAGES)
        } else {
            pick(&FAILURE_MESSAGES)
        };
        info!("[DEMO] 提交结果: {}", message);
        self.page.lock().await.result = Some(message.to_string());
        Ok(())
    }

    async fn page_state(&self) -> Result<PageState> {
        let page = self.page.lock().await;
        Ok(PageState {
            url: page.url.clone(),
            text: page
                .result
                .clone()
                .unwrap_or_else(|| "Submit your product".to_string()),
        })
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        debug!("[DEMO] 跳过截图: {}", path.display());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn pick(messages: &[&'static str]) -> &'static str {
    let idx = (rand::random::<u64>() as usize) % messages.len();
    messages[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SemanticType;
    use crate::services::detection::RuleBasedDetector;

    #[test]
    fn directory_url_picks_the_form() {
        assert_eq!(DemoForm::for_url("https://www.producthunt.com/posts/new").form_id, "product-submission");
        assert_eq!(DemoForm::for_url("https://betalist.com/submit").form_id, "startup-form");
        assert_eq!(DemoForm::for_url("https://www.saashub.com/submit").form_id, "tool-submission-form");
        assert_eq!(DemoForm::for_url("https://dir.example/add").form_id, "submit-form");
    }

    #[test]
    fn generated_form_is_readable_by_rule_detector() {
        let fields = RuleBasedDetector::new().detect_fields_from_html(&GENERIC.html());
        assert_eq!(fields.len(), GENERIC.fields.len());
        assert_eq!(fields[0].label.as_deref(), Some("Product/Company Name"));
        assert!(fields[0].required);
        assert_eq!(fields[0].semantic_type, SemanticType::ProductName);
        let category = fields.last().unwrap();
        assert!(!category.required);
        assert!(category
            .options
            .as_ref()
            .is_some_and(|o| o.iter().any(|o| o == "AI & ML")));
    }

    #[tokio::test]
    async fn certain_success_confirms_submission() {
        let sessions = DemoSessionFactory::new(0.0).with_success_rate(1.0);
        let session = sessions.open().await.unwrap();
        session.navigate("https://dir.example/add").await.unwrap();
        assert_eq!(
            session.find_submit(None).await.unwrap().as_deref(),
            Some("#submit")
        );
        session.click("#submit").await.unwrap();
        let state = session.page_state().await.unwrap();
        assert!(SUCCESS_MESSAGES.contains(&state.text.as_str()));
    }

    #[tokio::test]
    async fn certain_failure_shows_failure_message() {
        let sessions = DemoSessionFactory::new(0.0).with_success_rate(0.0);
        let session = sessions.open().await.unwrap();
        session.navigate("https://betalist.com/submit").await.unwrap();
        session.click("#submit-btn").await.unwrap();
        let state = session.page_state().await.unwrap();
        assert!(FAILURE_MESSAGES.contains(&state.text.as_str()));
    }

    #[tokio::test]
    async fn actions_before_navigation_fail() {
        let session = DemoSessionFactory::new(0.0).open().await.unwrap();
        assert!(session.snapshot(false).await.is_err());
        assert!(session.click("#submit").await.is_err());
    }
}
