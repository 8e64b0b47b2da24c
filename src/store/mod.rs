//! 持久化边界
//!
//! 引擎只通过 [`SubmissionStore`] 读写投递、产品与目录。
//! 所有"检查后写入"的操作都在存储内部的同一把锁里完成，
//! 认领、成功率累加都不会出现读后写竞争。

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult, EngineError, StoreError};
use crate::models::{
    AttemptRecord, ClaimToken, Directory, DirectoryId, DirectoryOutcome, FormSchema, Product,
    ProductId, SchemaFeedback, Submission, SubmissionId, SubmissionStatus,
};

pub use memory::MemoryStore;

/// 在锁内对投递做读改写；返回错误时不落盘
pub type SubmissionUpdate = Box<dyn FnOnce(&mut Submission) -> AppResult<()> + Send>;

/// 在锁内对目录做读改写；返回错误时不落盘
pub type DirectoryUpdate = Box<dyn FnOnce(&mut Directory) -> AppResult<()> + Send>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get_submission(&self, id: SubmissionId) -> AppResult<Submission>;

    async fn list_submissions(&self) -> AppResult<Vec<Submission>>;

    /// 可执行的投递，按最早尝试 / 创建时间排序，最多 `limit` 条
    async fn list_eligible(&self, limit: usize, now: DateTime<Utc>) -> AppResult<Vec<Submission>>;

    async fn get_product(&self, id: ProductId) -> AppResult<Product>;

    async fn get_directory(&self, id: DirectoryId) -> AppResult<Directory>;

    /// 原子读改写一条投递
    async fn update_submission(&self, id: SubmissionId, update: SubmissionUpdate) -> AppResult<Submission>;

    /// 原子读改写一个目录
    async fn update_directory(&self, id: DirectoryId, update: DirectoryUpdate) -> AppResult<Directory>;

    /// 认领投递：进入 in_progress、尝试次数 +1、写入租约
    async fn try_claim(
        &self,
        id: SubmissionId,
        owner: ClaimToken,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> AppResult<Submission> {
        self.update_submission(
            id,
            Box::new(move |s: &mut Submission| s.claim(owner, now, lease).map_err(AppError::from)),
        )
        .await
    }

    /// 释放尚未开始执行的认领，归还尝试次数
    async fn release_claim(&self, id: SubmissionId, owner: ClaimToken) -> AppResult<Submission> {
        self.update_submission(
            id,
            Box::new(move |s: &mut Submission| {
                if !s.is_held_by(&owner) {
                    return Err(StoreError::ClaimMismatch { id: s.id }.into());
                }
                s.release_claim(&owner, Utc::now()).map_err(AppError::from)
            }),
        )
        .await
    }

    /// 写入一次尝试的结果并释放租约
    ///
    /// 只有当前持有者可以写入；租约已被回收时返回 `ClaimMismatch`。
    async fn save_attempt_result(
        &self,
        id: SubmissionId,
        owner: ClaimToken,
        record: AttemptRecord,
        next_status: SubmissionStatus,
        retry_at: Option<DateTime<Utc>>,
    ) -> AppResult<Submission> {
        self.update_submission(
            id,
            Box::new(move |s: &mut Submission| {
                if s.status != SubmissionStatus::InProgress || !s.is_held_by(&owner) {
                    return Err(StoreError::ClaimMismatch { id: s.id }.into());
                }
                s.record_attempt(record, next_status, retry_at, Utc::now());
                Ok(())
            }),
        )
        .await
    }

    /// 续租；持有者已变化时返回 `ClaimMismatch`
    async fn renew_claim(
        &self,
        id: SubmissionId,
        owner: ClaimToken,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> AppResult<Submission> {
        self.update_submission(
            id,
            Box::new(move |s: &mut Submission| {
                if s.renew_lease(&owner, now, lease) {
                    Ok(())
                } else {
                    Err(StoreError::ClaimMismatch { id: s.id }.into())
                }
            }),
        )
        .await
    }

    /// 回收所有过期租约，返回被回收的投递
    ///
    /// 被回收的那次尝试以 `lease_expired` 失败写入尝试记录。
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<SubmissionId>> {
        let expired: Vec<Submission> = self
            .list_submissions()
            .await?
            .into_iter()
            .filter(|s| s.lease_expired(now))
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for submission in expired {
            let id = submission.id;
            let product = self.get_product(submission.product_id).await.unwrap_or_default();
            let target_url = self
                .get_directory(submission.directory_id)
                .await
                .map(|d| d.target_url().to_string())
                .unwrap_or_default();
            let result = self
                .update_submission(
                    id,
                    Box::new(move |s: &mut Submission| {
                        if s.reclaim_expired_lease(now, product, target_url) {
                            Ok(())
                        } else {
                            Err(EngineError::AlreadyRunning { id: s.id }.into())
                        }
                    }),
                )
                .await;
            // 期间被持有者正常写回或续租的不算
            if result.is_ok() {
                tracing::warn!("[投递 #{}] 执行租约已过期，已回收", id);
                reclaimed.push(id);
            }
        }
        Ok(reclaimed)
    }

    /// 累加目录成功率
    async fn update_directory_success_rate(
        &self,
        id: DirectoryId,
        outcome: DirectoryOutcome,
    ) -> AppResult<Directory> {
        self.update_directory(
            id,
            Box::new(move |d: &mut Directory| {
                d.record_outcome(outcome);
                Ok(())
            }),
        )
        .await
    }

    /// 根据尝试结果更新目录上缓存的表单结构
    async fn learn_form_schema(
        &self,
        id: DirectoryId,
        schema: FormSchema,
        feedback: SchemaFeedback,
        now: DateTime<Utc>,
    ) -> AppResult<Directory> {
        self.update_directory(
            id,
            Box::new(move |d: &mut Directory| {
                d.learn_schema(&schema, feedback, now);
                Ok(())
            }),
        )
        .await
    }
}

/// 周期性续租，直到失去持有权才返回
///
/// 与排队等待或正在执行的尝试一起 `select!`，租约只会在 worker 真正停止后过期。
pub async fn keep_claim_alive(
    store: &dyn SubmissionStore,
    id: SubmissionId,
    owner: &ClaimToken,
    lease: chrono::Duration,
) {
    let every = lease
        .to_std()
        .map(|d| d / 3)
        .unwrap_or_default()
        .max(std::time::Duration::from_millis(100));
    loop {
        tokio::time::sleep(every).await;
        if let Err(e) = store.renew_claim(id, owner.clone(), Utc::now(), lease).await {
            tracing::warn!("[投递 #{}] 续租失败，已失去执行权: {}", id, e);
            return;
        }
    }
}
