use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{SubmissionId, SubmissionStatus};

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] BrowserError),
    /// 调度 / 准入错误（同步返回给调用方）
    #[error("调度错误: {0}")]
    Engine(#[from] EngineError),
    /// 数据层错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 浏览器相关错误
#[derive(Debug, Error)]
pub enum BrowserError {
    /// 连接浏览器失败
    #[error("无法连接到浏览器 (端口: {port}): {source}")]
    ConnectionFailed { port: u16, source: BoxedSource },
    /// 启动浏览器失败
    #[error("启动浏览器失败: {source}")]
    LaunchFailed { source: BoxedSource },
    /// 创建隔离会话失败
    #[error("创建浏览器会话失败: {source}")]
    SessionFailed { source: BoxedSource },
    /// 执行脚本失败
    #[error("执行脚本失败: {source}")]
    ScriptExecutionFailed { source: BoxedSource },
}

/// 调度错误：策略 / 资源类失败，不进入队列，直接拒绝
#[derive(Debug, Error)]
pub enum EngineError {
    /// 已有 worker 持有该投递
    #[error("投递 #{id} 正在执行中")]
    AlreadyRunning { id: SubmissionId },
    /// 当前状态不可调度
    #[error("投递 #{id} 当前状态 {status} 不可执行")]
    NotEligible { id: SubmissionId, status: SubmissionStatus },
    /// 重试等待期未结束
    #[error("投递 #{id} 需等待至 {at} 后才能重试")]
    RetryNotDue { id: SubmissionId, at: DateTime<Utc> },
    /// 尝试次数已用尽
    #[error("投递 #{id} 尝试次数已用尽 ({attempts}/{max_attempts})")]
    AttemptsExhausted {
        id: SubmissionId,
        attempts: u32,
        max_attempts: u32,
    },
    /// 并发槽位已满
    #[error("并发槽位已满 (上限: {max})")]
    PoolSaturated { max: usize },
    /// 非法状态迁移
    #[error("非法状态迁移: {from} --{transition}--> ?")]
    IllegalTransition {
        from: SubmissionStatus,
        transition: String,
    },
}

/// 数据层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("投递不存在: #{0}")]
    SubmissionNotFound(SubmissionId),
    #[error("产品不存在: #{0}")]
    ProductNotFound(u64),
    #[error("目录不存在: #{0}")]
    DirectoryNotFound(u64),
    /// 持有者令牌不匹配（租约已被回收或从未持有）
    #[error("投递 #{id} 的执行令牌不匹配")]
    ClaimMismatch { id: SubmissionId },
    #[error("存储锁已损坏")]
    Poisoned,
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed { path: String, source: BoxedSource },
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed { path: String, source: BoxedSource },
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed { path: String, source: BoxedSource },
    #[error("JSON解析失败: {source}")]
    JsonParseFailed { source: BoxedSource },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置项 {name} 的值 '{value}' 无效: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(BrowserError::ScriptExecutionFailed {
            source: Box::new(err),
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::File(FileError::JsonParseFailed {
            source: Box::new(err),
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(), // TOML错误通常不包含路径信息
            source: Box::new(err),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建浏览器连接错误
    pub fn browser_connection_failed(
        port: u16,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Browser(BrowserError::ConnectionFailed {
            port,
            source: Box::new(source),
        })
    }

    /// 创建文件读取错误
    pub fn file_read_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建配置值错误
    pub fn invalid_config(
        name: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            name: name.into(),
            value: value.to_string(),
            reason: reason.into(),
        })
    }

    /// 是否为"已在执行中"
    pub fn is_already_running(&self) -> bool {
        matches!(self, AppError::Engine(EngineError::AlreadyRunning { .. }))
    }

    /// 是否为准入类拒绝（不可调度 / 槽位满 / 已在执行）
    pub fn is_rejection(&self) -> bool {
        matches!(self, AppError::Engine(_))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
