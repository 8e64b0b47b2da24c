//! 基于 chromiumoxide 的浏览器会话
//!
//! 一个浏览器进程，多个隔离的 browser context：每次尝试创建新的 context，
//! 结束时整体销毁，会话之间不共享 cookie / localStorage。

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Browser;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{connect_to_browser, launch_browser, BrowserSession, PageState, SessionFactory};
use crate::config::Config;
use crate::error::{AppError, BrowserError};
use crate::infrastructure::JsExecutor;
use crate::models::{FieldKind, FilledField, PageSnapshot};

/// 常见验证码 / 反爬特征
const CAPTCHA_SELECTORS: [&str; 8] = [
    "iframe[src*=\"recaptcha\"]",
    "iframe[src*=\"captcha\"]",
    "iframe[src*=\"hcaptcha\"]",
    ".g-recaptcha",
    ".h-captcha",
    ".cf-turnstile",
    "#captcha",
    "[data-captcha]",
];

/// 识别结果没有给出提交按钮时依次尝试
const SUBMIT_SELECTORS: [&str; 7] = [
    "button[type=\"submit\"]",
    "input[type=\"submit\"]",
    ".submit-btn",
    ".btn-submit",
    "#submit",
    "#submit-btn",
    "form button:not([type])",
];

/// 按钮文本兜底匹配
const SUBMIT_TEXTS: [&str; 5] = ["submit", "add", "create", "post", "send"];

const FIND_SUBMIT_JS: &str = r#"(selectors, texts) => {
    const visible = (el) => !!el && !el.disabled && el.offsetParent !== null;
    for (const sel of selectors) {
        let el = null;
        try { el = document.querySelector(sel); } catch (e) { continue; }
        if (visible(el)) return sel;
    }
    const buttons = Array.from(document.querySelectorAll('button, input[type="button"], a[role="button"]'));
    for (const el of buttons) {
        const text = (el.innerText || el.value || '').trim().toLowerCase();
        if (visible(el) && texts.some((t) => text.startsWith(t))) {
            el.setAttribute('data-submit-candidate', '1');
            return '[data-submit-candidate="1"]';
        }
    }
    return null;
}"#;

const FILL_TEXT_JS: &str = r#"(sel, value) => {
    const el = document.querySelector(sel);
    if (!el) return false;
    el.scrollIntoView({ block: 'center' });
    el.focus();
    const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
    const setter = Object.getOwnPropertyDescriptor(proto, 'value');
    if (setter && setter.set) { setter.set.call(el, value); } else { el.value = value; }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    el.blur();
    return true;
}"#;

const FILL_SELECT_JS: &str = r#"(sel, value) => {
    const el = document.querySelector(sel);
    if (!el || !el.options) return false;
    const wanted = value.trim().toLowerCase();
    const option = Array.from(el.options).find((o) =>
        o.text.trim().toLowerCase() === wanted || o.value.trim().toLowerCase() === wanted);
    if (!option) return false;
    el.value = option.value;
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
}"#;

const FILL_CHECK_JS: &str = r#"(sel, checked) => {
    const el = document.querySelector(sel);
    if (!el) return false;
    if (el.checked !== checked) el.click();
    return true;
}"#;

const CAPTCHA_JS: &str = r#"(selectors) => {
    for (const sel of selectors) {
        try { if (document.querySelector(sel)) return sel; } catch (e) {}
    }
    return null;
}"#;

const PAGE_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

/// 浏览器会话工厂
pub struct ChromeSessionFactory {
    browser: Arc<Mutex<Browser>>,
}

impl ChromeSessionFactory {
    pub fn new(browser: Browser) -> Self {
        Self {
            browser: Arc::new(Mutex::new(browser)),
        }
    }

    /// 配置了调试端口时连接已有浏览器，否则自行启动
    pub async fn from_config(config: &Config) -> Result<Self> {
        let browser = match config.browser_debug_port {
            Some(port) => connect_to_browser(port).await?,
            None => launch_browser(config.headless, config.chrome_executable.as_deref()).await?,
        };
        Ok(Self::new(browser))
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        let browser = self.browser.lock().await;
        let context_id = browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .map_err(|e| AppError::Browser(BrowserError::SessionFailed { source: Box::new(e) }))?;

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(|e| anyhow!("构建页面参数失败: {}", e))?;
        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.dispose_browser_context(context_id).await;
                return Err(AppError::Browser(BrowserError::SessionFailed { source: Box::new(e) }).into());
            }
        };
        drop(browser);

        debug!("已创建隔离会话: {:?}", context_id);
        Ok(Box::new(ChromeSession {
            executor: JsExecutor::new(page),
            browser: Arc::clone(&self.browser),
            context_id,
        }))
    }
}

/// 单次尝试使用的会话
pub struct ChromeSession {
    executor: JsExecutor,
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
}

impl ChromeSession {
    async fn upload_file(&self, selector: &str, path: &str) -> Result<()> {
        if !Path::new(path).exists() {
            return Err(anyhow!("上传文件不存在: {}", path));
        }
        let page = self.executor.page();
        let element = page.find_element(selector).await?;
        let params = SetFileInputFilesParams::builder()
            .files(vec![path.to_string()])
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(|e| anyhow!("构建上传参数失败: {}", e))?;
        page.execute(params).await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        info!("正在导航: {}", url);
        self.executor.page().goto(url).await?;
        Ok(())
    }

    async fn snapshot(&self, with_screenshot: bool) -> Result<PageSnapshot> {
        let page = self.executor.page();
        let url = page.url().await?.unwrap_or_default();
        let html = page.content().await?;
        let screenshot_base64 = if with_screenshot {
            let png = page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await?;
            Some(base64::engine::general_purpose::STANDARD.encode(png))
        } else {
            None
        };
        Ok(PageSnapshot {
            url,
            html,
            screenshot_base64,
        })
    }

    async fn fill_field(&self, field: &FilledField) -> Result<()> {
        let filled: bool = match field.kind {
            FieldKind::File => {
                self.upload_file(&field.field_id, &field.value).await?;
                true
            }
            FieldKind::Checkbox | FieldKind::Radio => {
                let checked = matches!(field.value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
                    || field.kind == FieldKind::Radio;
                self.executor
                    .invoke(FILL_CHECK_JS, &[json!(field.field_id), json!(checked)])
                    .await?
            }
            FieldKind::Select => {
                self.executor
                    .invoke(FILL_SELECT_JS, &[json!(field.field_id), json!(field.value)])
                    .await?
            }
            _ => {
                self.executor
                    .invoke(FILL_TEXT_JS, &[json!(field.field_id), json!(field.value)])
                    .await?
            }
        };

        if filled {
            Ok(())
        } else {
            Err(anyhow!("无法填写字段 {}", field.field_id))
        }
    }

    async fn detect_captcha(&self) -> Result<Option<String>> {
        let hit: Option<String> = self.executor.invoke(CAPTCHA_JS, &[json!(CAPTCHA_SELECTORS)]).await?;
        if let Some(selector) = &hit {
            warn!("检测到验证码: {}", selector);
        }
        Ok(hit)
    }

    async fn find_submit(&self, hint: Option<&str>) -> Result<Option<String>> {
        let selectors: Vec<&str> = hint.into_iter().chain(SUBMIT_SELECTORS).collect();
        self.executor
            .invoke(FIND_SUBMIT_JS, &[json!(selectors), json!(SUBMIT_TEXTS)])
            .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self.executor.page().find_element(selector).await?;
        element.scroll_into_view().await?;
        element.click().await?;
        debug!("已点击: {}", selector);
        Ok(())
    }

    async fn page_state(&self) -> Result<PageState> {
        let url = self.executor.page().url().await?.unwrap_or_default();
        let text: String = self.executor.eval_as(PAGE_TEXT_JS).await?;
        Ok(PageState { url, text })
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.executor
            .page()
            .save_screenshot(ScreenshotParams::builder().full_page(true).build(), path)
            .await?;
        info!("截图已保存: {}", path.display());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let page = self.executor.page().clone();
        if let Err(e) = page.close().await {
            debug!("关闭页面失败: {}", e);
        }
        self.browser
            .lock()
            .await
            .dispose_browser_context(self.context_id.clone())
            .await?;
        Ok(())
    }
}
