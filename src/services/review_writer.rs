//! 人工审核记录 - 业务能力层
//!
//! 只负责"追加写审核清单"能力，不关心流程

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::SubmissionId;

/// 审核清单写入服务
///
/// 每一条转人工的投递追加一行，供运营人员逐条处理
pub struct ReviewWriter {
    path: PathBuf,
}

impl ReviewWriter {
    pub fn new() -> Self {
        Self::with_path("review.txt")
    }

    /// 使用自定义文件路径创建
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 追加一条审核记录
    pub async fn write(
        &self,
        submission_id: SubmissionId,
        directory_name: &str,
        target_url: &str,
        reason: &str,
    ) -> AppResult<()> {
        debug!("写入审核记录: 投递 #{} | 目录 {}", submission_id, directory_name);

        let shown = self.path.display().to_string();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::file_write_failed(&shown, e))?;

        let line = format!(
            "{} | 投递 #{} | 目录 {} | {} | 原因: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            submission_id,
            directory_name,
            target_url,
            reason.replace('\n', " ")
        );

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::file_write_failed(&shown, e))?;
        Ok(())
    }
}

impl Default for ReviewWriter {
    fn default() -> Self {
        Self::new()
    }
}
