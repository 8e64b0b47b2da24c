//! 内存存储
//!
//! 单把互斥锁保护全部数据。可选地在每次修改后把完整快照写入 JSON 状态文件，
//! 进程重启后从该文件恢复。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{DirectoryUpdate, SubmissionStore, SubmissionUpdate};
use crate::error::{AppError, AppResult, FileError, StoreError};
use crate::models::{
    Directory, DirectoryId, Product, ProductId, SeedData, Submission, SubmissionId,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    products: BTreeMap<ProductId, Product>,
    #[serde(default)]
    directories: BTreeMap<DirectoryId, Directory>,
    #[serde(default)]
    submissions: BTreeMap<SubmissionId, Submission>,
    /// 每次修改递增，用于丢弃过期快照
    #[serde(skip)]
    version: u64,
}

/// 状态文件写入：只写比已落盘版本更新的快照
struct Persistence {
    path: PathBuf,
    written: tokio::sync::Mutex<u64>,
}

type Snapshot = Option<(u64, String)>;

/// 内存实现的 [`SubmissionStore`]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    persistence: Option<Persistence>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            persistence: None,
        }
    }

    /// 用种子数据初始化；种子中未指定次数上限的投递使用 `default_max_attempts`
    pub fn from_seed(seed: SeedData, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let state = StoreState {
            products: seed.products.into_iter().map(|p| (p.id, p)).collect(),
            directories: seed.directories.into_iter().map(|d| (d.id, d)).collect(),
            submissions: seed
                .submissions
                .into_iter()
                .map(|s| {
                    let max = s.max_attempts.unwrap_or(default_max_attempts);
                    (s.id, Submission::new(s.id, s.product_id, s.directory_id, max, now))
                })
                .collect(),
            version: 0,
        };
        Self {
            state: Mutex::new(state),
            persistence: None,
        }
    }

    /// 从状态文件恢复，并继续写回该文件
    pub async fn load(path: &Path) -> AppResult<Self> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(AppError::File(FileError::NotFound { path: shown }));
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::file_read_failed(&shown, e))?;
        let state: StoreState = serde_json::from_str(&content)?;
        info!(
            "已从 {} 恢复状态: {} 条投递",
            shown,
            state.submissions.len()
        );
        Ok(Self {
            state: Mutex::new(state),
            persistence: None,
        }
        .with_persistence(path))
    }

    /// 每次修改后把快照写入 `path`
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = Some(Persistence {
            path: path.into(),
            written: tokio::sync::Mutex::new(0),
        });
        self
    }

    /// 立即把当前状态写入状态文件（未启用持久化时什么也不做）
    pub async fn flush(&self) -> AppResult<()> {
        let snapshot = {
            let state = self.lock()?;
            self.snapshot(&state)?
        };
        self.write_snapshot(snapshot, true).await
    }

    pub fn insert_product(&self, product: Product) -> AppResult<()> {
        let mut state = self.lock()?;
        state.products.insert(product.id, product);
        state.version += 1;
        Ok(())
    }

    pub fn insert_directory(&self, directory: Directory) -> AppResult<()> {
        let mut state = self.lock()?;
        state.directories.insert(directory.id, directory);
        state.version += 1;
        Ok(())
    }

    pub fn insert_submission(&self, submission: Submission) -> AppResult<()> {
        let mut state = self.lock()?;
        state.submissions.insert(submission.id, submission);
        state.version += 1;
        Ok(())
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned.into())
    }

    fn snapshot(&self, state: &StoreState) -> AppResult<Snapshot> {
        match &self.persistence {
            Some(_) => Ok(Some((state.version, serde_json::to_string_pretty(state)?))),
            None => Ok(None),
        }
    }

    fn mutate_submission(&self, id: SubmissionId, update: SubmissionUpdate) -> AppResult<(Submission, Snapshot)> {
        let mut state = self.lock()?;
        let mut next = state
            .submissions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubmissionNotFound(id))?;
        update(&mut next)?;

        state.submissions.insert(id, next.clone());
        state.version += 1;
        let snapshot = self.snapshot(&state)?;
        Ok((next, snapshot))
    }

    fn mutate_directory(&self, id: DirectoryId, update: DirectoryUpdate) -> AppResult<(Directory, Snapshot)> {
        let mut state = self.lock()?;
        let mut next = state
            .directories
            .get(&id)
            .cloned()
            .ok_or(StoreError::DirectoryNotFound(id))?;
        update(&mut next)?;

        state.directories.insert(id, next.clone());
        state.version += 1;
        let snapshot = self.snapshot(&state)?;
        Ok((next, snapshot))
    }

    /// 内存中的修改已经生效；写文件失败只记录日志
    async fn persist(&self, snapshot: Snapshot) {
        if let Err(e) = self.write_snapshot(snapshot, false).await {
            error!("写入状态文件失败: {}", e);
        }
    }

    async fn write_snapshot(&self, snapshot: Snapshot, force: bool) -> AppResult<()> {
        let (Some(persistence), Some((version, json))) = (&self.persistence, snapshot) else {
            return Ok(());
        };

        let mut written = persistence.written.lock().await;
        if *written >= version && !force {
            return Ok(());
        }

        let shown = persistence.path.display().to_string();
        if let Some(parent) = persistence.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::file_write_failed(&shown, e))?;
        }
        let tmp = persistence.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AppError::file_write_failed(&shown, e))?;
        tokio::fs::rename(&tmp, &persistence.path)
            .await
            .map_err(|e| AppError::file_write_failed(&shown, e))?;

        *written = (*written).max(version);
        debug!("状态已写入 {} (版本 {})", shown, version);
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get_submission(&self, id: SubmissionId) -> AppResult<Submission> {
        let state = self.lock()?;
        state
            .submissions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::SubmissionNotFound(id).into())
    }

    async fn list_submissions(&self) -> AppResult<Vec<Submission>> {
        let state = self.lock()?;
        Ok(state.submissions.values().cloned().collect())
    }

    async fn list_eligible(&self, limit: usize, now: DateTime<Utc>) -> AppResult<Vec<Submission>> {
        let state = self.lock()?;
        let mut eligible: Vec<&Submission> = state
            .submissions
            .values()
            .filter(|s| s.is_eligible(now))
            .collect();
        eligible.sort_by_key(|s| s.eligibility_key());
        Ok(eligible.into_iter().take(limit).cloned().collect())
    }

    async fn get_product(&self, id: ProductId) -> AppResult<Product> {
        let state = self.lock()?;
        state
            .products
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::ProductNotFound(id).into())
    }

    async fn get_directory(&self, id: DirectoryId) -> AppResult<Directory> {
        let state = self.lock()?;
        state
            .directories
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::DirectoryNotFound(id).into())
    }

    async fn update_submission(&self, id: SubmissionId, update: SubmissionUpdate) -> AppResult<Submission> {
        let (submission, snapshot) = self.mutate_submission(id, update)?;
        self.persist(snapshot).await;
        Ok(submission)
    }

    async fn update_directory(&self, id: DirectoryId, update: DirectoryUpdate) -> AppResult<Directory> {
        let (directory, snapshot) = self.mutate_directory(id, update)?;
        self.persist(snapshot).await;
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::EngineError;
    use crate::models::{
        AttemptOutcome, AttemptRecord, ClaimToken, DirectoryOutcome, FailureKind, SubmissionStatus,
    };

    fn store_with(submissions: &[(SubmissionId, u32)]) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_product(Product {
                id: 1,
                name: "Acme".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .insert_directory(Directory {
                id: 1,
                name: "Tool Hunt".into(),
                ..Default::default()
            })
            .unwrap();
        let now = Utc::now();
        for (id, max) in submissions {
            store.insert_submission(Submission::new(*id, 1, 1, *max, now)).unwrap();
        }
        store
    }

    fn record(owner: &ClaimToken, outcome: AttemptOutcome) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            attempt_no: 1,
            owner: owner.to_string(),
            product: Product::default(),
            directory_id: 1,
            target_url: "https://dir.example/submit".into(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            detected_fields: None,
            filled_fields: None,
            confirmation: None,
            outcome,
            error_message: Some("boom".into()),
            screenshot_path: None,
            steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let store = Arc::new(store_with(&[(7, 3)]));
        let mut handles = Vec::new();
        for worker in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .try_claim(
                        7,
                        ClaimToken::generate(&format!("w{}", worker)),
                        Utc::now(),
                        chrono::Duration::minutes(5),
                    )
                    .await
            }));
        }

        let mut won = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(e.is_already_running(), "{e}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(store.get_submission(7).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn failed_update_changes_nothing() {
        let store = store_with(&[(1, 3)]);
        let err = store
            .update_submission(
                1,
                Box::new(|s: &mut Submission| {
                    s.attempt_count = 99;
                    Err(EngineError::PoolSaturated { max: 1 }.into())
                }),
            )
            .await;
        assert!(err.is_err());
        assert_eq!(store.get_submission(1).await.unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn stale_owner_cannot_write_result() {
        let store = store_with(&[(1, 3)]);
        let owner = ClaimToken::generate("w1");
        store
            .try_claim(1, owner.clone(), Utc::now(), chrono::Duration::minutes(5))
            .await
            .unwrap();

        let intruder = ClaimToken::generate("w2");
        let err = store
            .save_attempt_result(
                1,
                intruder.clone(),
                record(&intruder, AttemptOutcome::Submitted),
                SubmissionStatus::Submitted,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::ClaimMismatch { id: 1 })));

        let saved = store
            .save_attempt_result(
                1,
                owner.clone(),
                record(&owner, AttemptOutcome::Submitted),
                SubmissionStatus::Submitted,
                None,
            )
            .await
            .unwrap();
        assert_eq!(saved.status, SubmissionStatus::Submitted);
        assert!(saved.claim.is_none());
        assert_eq!(saved.attempt_log.len(), 1);
    }

    #[tokio::test]
    async fn eligible_list_is_fifo_and_respects_retry_at() {
        let store = store_with(&[(1, 3), (2, 3), (3, 3)]);
        let now = Utc::now();
        store
            .update_submission(
                1,
                Box::new(move |s: &mut Submission| {
                    s.retry_at = Some(now + chrono::Duration::hours(1));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let ids: Vec<SubmissionId> = store
            .list_eligible(10, now)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(store.list_eligible(1, now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_outcomes_are_not_lost() {
        let store = Arc::new(store_with(&[]));
        let mut handles = Vec::new();
        for i in 0..100 {
            let store = Arc::clone(&store);
            let outcome = if i % 2 == 0 {
                DirectoryOutcome::Success
            } else {
                DirectoryOutcome::Failure
            };
            handles.push(tokio::spawn(async move {
                store.update_directory_success_rate(1, outcome).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let dir = store.get_directory(1).await.unwrap();
        assert_eq!(dir.success_count + dir.failure_count, 100);
        assert!((dir.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let store = store_with(&[(1, 3), (2, 3)]);
        let then = Utc::now() - chrono::Duration::minutes(10);
        store
            .try_claim(1, ClaimToken::generate("dead"), then, chrono::Duration::minutes(1))
            .await
            .unwrap();
        store
            .try_claim(2, ClaimToken::generate("alive"), Utc::now(), chrono::Duration::minutes(5))
            .await
            .unwrap();

        let reclaimed = store.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(reclaimed, vec![1]);
        let s = store.get_submission(1).await.unwrap();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.attempt_count, 1);
        // 丢失的那次尝试也有记录
        assert_eq!(s.attempt_log.len() as u32, s.attempt_count);
        assert_eq!(
            s.attempt_log[0].outcome,
            AttemptOutcome::Failed(FailureKind::LeaseExpired)
        );
    }

    #[tokio::test]
    async fn renewed_lease_is_not_reclaimed() {
        let store = store_with(&[(1, 3)]);
        let owner = ClaimToken::generate("w1");
        let then = Utc::now() - chrono::Duration::minutes(10);
        store
            .try_claim(1, owner.clone(), then, chrono::Duration::minutes(1))
            .await
            .unwrap();
        store
            .renew_claim(1, owner.clone(), Utc::now(), chrono::Duration::minutes(1))
            .await
            .unwrap();

        assert!(store.reclaim_expired(Utc::now()).await.unwrap().is_empty());
        let err = store
            .renew_claim(1, ClaimToken::generate("w2"), Utc::now(), chrono::Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::ClaimMismatch { id: 1 })));
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = store_with(&[(1, 3)]).with_persistence(&path);
        store.flush().await.unwrap();
        store
            .try_claim(1, ClaimToken::generate("w1"), Utc::now(), chrono::Duration::minutes(5))
            .await
            .unwrap();

        let restored = MemoryStore::load(&path).await.unwrap();
        let s = restored.get_submission(1).await.unwrap();
        assert_eq!(s.status, SubmissionStatus::InProgress);
        assert_eq!(restored.get_product(1).await.unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn seed_uses_default_max_attempts() {
        let seed = crate::models::parse_seed(
            r#"
[[products]]
id = 1
name = "Acme"
website_url = "https://acme.example"
contact_email = "a@acme.example"

[[directories]]
id = 2
name = "Dir"
url = "https://dir.example"

[[submissions]]
id = 3
product_id = 1
directory_id = 2
"#,
            "inline",
        )
        .unwrap();
        let store = MemoryStore::from_seed(seed, 4);
        assert_eq!(store.get_submission(3).await.unwrap().max_attempts, 4);
    }
}
