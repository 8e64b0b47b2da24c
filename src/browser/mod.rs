//! 浏览器会话
//!
//! 自动化流程只依赖 [`BrowserSession`] / [`SessionFactory`] 两个接口，
//! 每次尝试打开一个独立会话（独立的 cookie 与存储），用完即关闭。

pub mod chrome;
pub mod connection;
pub mod demo;
pub mod headless;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{FilledField, PageSnapshot};

pub use chrome::ChromeSessionFactory;
pub use connection::connect_to_browser;
pub use demo::DemoSessionFactory;
pub use headless::launch_browser;

/// 提交后页面的可见状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    pub url: String,
    /// 页面可见文本
    pub text: String,
}

/// 一个隔离的浏览器会话
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// 当前页面的 URL + HTML（可选附带截图）
    async fn snapshot(&self, with_screenshot: bool) -> Result<PageSnapshot>;

    async fn fill_field(&self, field: &FilledField) -> Result<()>;

    /// 命中的验证码 / 反爬特征（没有则为 `None`）
    async fn detect_captcha(&self) -> Result<Option<String>>;

    /// 查找可见的提交按钮，`hint` 为识别结果给出的选择器
    async fn find_submit(&self, hint: Option<&str>) -> Result<Option<String>>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn page_state(&self) -> Result<PageState>;

    async fn screenshot(&self, path: &Path) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// 打开新的隔离会话
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>>;
}
