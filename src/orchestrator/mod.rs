//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责准入、并发与结果落盘，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `engine` - 投递调度引擎
//! - 认领投递（租约 + 持有者令牌），拒绝重复执行
//! - 控制并发数量（Semaphore）
//! - 批量派发、单条派发、守护轮询
//! - 取消、重试、人工覆盖
//!
//! ### `worker` - 单条投递处理器
//! - 读取产品与目录快照
//! - 调用 `SubmissionFlow` 完成一次尝试
//! - 按状态机与重试策略落盘，更新目录成功率与表单结构缓存
//!
//! ## 层次关系
//!
//! ```text
//! engine (准入 / 并发 / 调度)
//!     ↓
//! worker (一次尝试的落盘)
//!     ↓
//! workflow::SubmissionFlow (浏览器自动化步骤)
//!     ↓
//! services (能力层：识别 / 映射 / 重试策略 / 审核清单)
//!     ↓
//! browser + infrastructure (隔离会话、JsExecutor)
//! ```

pub mod engine;
pub mod worker;

// 重新导出主要类型
pub use engine::{
    AttemptHandle, BatchDispatch, BatchSummary, CancelOutcome, SkipReason, SubmissionEngine,
};
pub use worker::{AttemptReport, SubmissionWorker};
