//! 集成测试共用的假浏览器
//!
//! 每个目录 URL 对应一段脚本化的页面行为；会话工厂记录同时打开的会话数。

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use directory_submit::browser::PageState;
use directory_submit::models::{FilledField, PageSnapshot};
use directory_submit::{
    BrowserSession, Config, DetectionGateway, Directory, MemoryStore, Product, SessionFactory,
    Submission, SubmissionEngine,
};

pub const ACCEPTING_FORM: &str = r#"
<html><body>
<form id="submit-form" action="/submit" method="post">
  <label for="name">Tool Name</label>
  <input type="text" id="name" name="name" required>
  <label for="url">Website URL</label>
  <input type="url" id="url" name="url" required>
  <label for="tagline">Tagline</label>
  <input type="text" id="tagline" name="tagline">
  <button type="submit">Submit</button>
</form>
</body></html>"#;

pub const FORM_WITH_VAT: &str = r#"
<html><body>
<form id="submit-form">
  <label for="name">Tool Name</label>
  <input type="text" id="name" name="name" required>
  <label for="vat">VAT number</label>
  <input type="text" id="vat" name="vat" required>
  <button type="submit">Submit</button>
</form>
</body></html>"#;

/// 一个目录站点的脚本化行为
#[derive(Debug, Clone)]
pub struct SiteBehavior {
    pub html: String,
    pub navigate_delay: Duration,
    pub navigate_fails: bool,
    pub captcha: Option<String>,
    pub fill_delay: Duration,
    pub after_submit: String,
    pub redirect_to: Option<String>,
    /// `close()` 永远不返回
    pub close_hangs: bool,
}

impl SiteBehavior {
    pub fn accepting() -> Self {
        Self {
            html: ACCEPTING_FORM.to_string(),
            navigate_delay: Duration::ZERO,
            navigate_fails: false,
            captcha: None,
            fill_delay: Duration::ZERO,
            after_submit: "Thank you! We will review your submission shortly.".to_string(),
            redirect_to: None,
            close_hangs: false,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            navigate_fails: true,
            ..Self::accepting()
        }
    }

    pub fn with_captcha() -> Self {
        Self {
            captcha: Some("iframe[src*=\"recaptcha\"]".to_string()),
            ..Self::accepting()
        }
    }

    pub fn with_unmappable_field() -> Self {
        Self {
            html: FORM_WITH_VAT.to_string(),
            ..Self::accepting()
        }
    }

    pub fn hanging_on_close() -> Self {
        Self {
            close_hangs: true,
            ..Self::accepting()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            navigate_delay: delay,
            ..Self::accepting()
        }
    }
}

/// 脚本化的会话工厂
#[derive(Default)]
pub struct FakeSessions {
    sites: Mutex<HashMap<String, SiteBehavior>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl FakeSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_site(&self, url: &str, behavior: SiteBehavior) {
        self.sites.lock().unwrap().insert(url.to_string(), behavior);
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            sites: self.sites.lock().unwrap().clone(),
            active: Arc::clone(&self.active),
            page: Mutex::new(PageSim::default()),
        }))
    }
}

#[derive(Default)]
struct PageSim {
    url: String,
    behavior: Option<SiteBehavior>,
    submitted: bool,
}

struct FakeSession {
    sites: HashMap<String, SiteBehavior>,
    active: Arc<AtomicUsize>,
    page: Mutex<PageSim>,
}

impl FakeSession {
    fn behavior(&self) -> Result<SiteBehavior> {
        self.page
            .lock()
            .unwrap()
            .behavior
            .clone()
            .ok_or_else(|| anyhow!("no page loaded"))
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let behavior = self
            .sites
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("net::ERR_NAME_NOT_RESOLVED {}", url))?;
        tokio::time::sleep(behavior.navigate_delay).await;
        if behavior.navigate_fails {
            return Err(anyhow!("net::ERR_CONNECTION_REFUSED"));
        }
        let mut page = self.page.lock().unwrap();
        page.url = url.to_string();
        page.behavior = Some(behavior);
        page.submitted = false;
        Ok(())
    }

    async fn snapshot(&self, _with_screenshot: bool) -> Result<PageSnapshot> {
        let behavior = self.behavior()?;
        let url = self.page.lock().unwrap().url.clone();
        Ok(PageSnapshot {
            url,
            html: behavior.html,
            screenshot_base64: None,
        })
    }

    async fn fill_field(&self, _field: &FilledField) -> Result<()> {
        let behavior = self.behavior()?;
        tokio::time::sleep(behavior.fill_delay).await;
        Ok(())
    }

    async fn detect_captcha(&self) -> Result<Option<String>> {
        Ok(self.behavior()?.captcha)
    }

    async fn find_submit(&self, hint: Option<&str>) -> Result<Option<String>> {
        Ok(Some(hint.unwrap_or("button[type=\"submit\"]").to_string()))
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        let behavior = self.behavior()?;
        let mut page = self.page.lock().unwrap();
        page.submitted = true;
        if let Some(url) = behavior.redirect_to {
            page.url = url;
        }
        Ok(())
    }

    async fn page_state(&self) -> Result<PageState> {
        let page = self.page.lock().unwrap();
        let text = match (&page.behavior, page.submitted) {
            (Some(behavior), true) => behavior.after_submit.clone(),
            _ => "Submit your tool".to_string(),
        };
        Ok(PageState {
            url: page.url.clone(),
            text,
        })
    }

    async fn screenshot(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let hangs = self
            .page
            .lock()
            .unwrap()
            .behavior
            .as_ref()
            .is_some_and(|b| b.close_hangs);
        if hangs {
            std::future::pending::<()>().await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========== 测试数据 ==========

pub fn test_config(dir: &Path) -> Config {
    Config {
        max_concurrent_submissions: 3,
        default_max_attempts: 3,
        navigation_timeout_ms: 2_000,
        detection_timeout_ms: 2_000,
        fill_timeout_ms: 2_000,
        submit_timeout_ms: 2_000,
        confirmation_timeout_ms: 500,
        submission_delay_secs: 0,
        screenshot_on_submit: false,
        screenshot_dir: dir.join("screenshots"),
        review_log_file: dir.join("review.txt"),
        output_log_file: dir.join("output.txt").display().to_string(),
        ..Config::default()
    }
}

pub fn product() -> Product {
    Product {
        id: 1,
        name: "Acme Analytics".into(),
        website_url: "https://acme.example".into(),
        tagline: Some("Metrics without the mess".into()),
        contact_email: "founder@acme.example".into(),
        ..Default::default()
    }
}

pub fn directory_url(id: u64) -> String {
    format!("https://dir{}.example/submit", id)
}

pub fn directory(id: u64) -> Directory {
    Directory {
        id,
        name: format!("Directory {}", id),
        url: directory_url(id),
        ..Default::default()
    }
}

/// 一个产品 + 给定目录，每个目录一条投递（投递 id 与目录 id 相同）
pub fn seeded_store(directory_ids: &[u64], max_attempts: u32) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_product(product()).unwrap();
    let now = Utc::now();
    for (offset, id) in directory_ids.iter().enumerate() {
        store.insert_directory(directory(*id)).unwrap();
        let created = now - chrono::Duration::seconds((directory_ids.len() - offset) as i64);
        store
            .insert_submission(Submission::new(*id, 1, *id, max_attempts, created))
            .unwrap();
    }
    Arc::new(store)
}

pub fn engine(config: Config, store: Arc<MemoryStore>, sessions: Arc<FakeSessions>) -> SubmissionEngine {
    let gateway = Arc::new(DetectionGateway::new(None, config.schema_max_age()));
    SubmissionEngine::new(config, store, sessions, gateway).unwrap()
}
