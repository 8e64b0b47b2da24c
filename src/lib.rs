//! # Directory Submit
//!
//! 把产品资料自动投递到大量第三方目录网站的 Rust 引擎
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure / Browser）
//! - `browser/` - 连接或启动 Chrome，每次尝试打开隔离的 browser context
//! - `infrastructure/` - `JsExecutor`，持有 page，提供 eval / invoke 能力
//!
//! ### ② 业务能力层（Services）
//! - `FieldMapper` - 产品资料 → 表单字段的纯函数映射
//! - `DetectionGateway` - 缓存结构 / LLM / HTML 规则三级表单识别
//! - `RetryPolicy` - 失败后的等待时长
//! - `ReviewWriter` - 写人工审核清单
//!
//! ### ③ 流程层（Workflow）
//! - `SubmissionFlow` - 一次尝试：导航 → 识别 → 映射 → 填写 → 提交 → 确认
//!
//! ### ④ 编排层（Orchestration）
//! - `SubmissionEngine` - 认领、并发、批量调度、取消、人工操作
//!
//! ### 数据与持久化
//! - `models/` - 投递 / 产品 / 目录 / 尝试记录与状态机
//! - `store/` - `SubmissionStore` 接口与内存实现
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod store;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::{BrowserSession, ChromeSessionFactory, SessionFactory};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::JsExecutor;
pub use models::{Directory, Product, Submission, SubmissionStatus};
pub use orchestrator::{AttemptReport, BatchDispatch, CancelOutcome, SkipReason, SubmissionEngine};
pub use services::DetectionGateway;
pub use store::{MemoryStore, SubmissionStore};
pub use workflow::{SubmissionCtx, SubmissionFlow};
