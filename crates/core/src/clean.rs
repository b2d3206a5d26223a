use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CleanConfig;
use crate::error::{Result, SweepError};
use crate::flight::SingleFlight;
use crate::fs::FileSystem;
use crate::model::{CleanResult, CleanableItem, FailedItem, FailureReason, ItemCategory};

/// Describes the items handed to a backup before they are deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotDescriptor {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub category: ItemCategory,
    pub total_size_bytes: u64,
    pub item_count: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// External collaborator that copies items somewhere safe.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Returns the snapshot id the backup was stored under.
    async fn create_snapshot(
        &self,
        items: &[CleanableItem],
        descriptor: &SnapshotDescriptor,
    ) -> Result<String>;
}

#[derive(Debug)]
enum DeleteOutcome {
    Deleted(u64),
    AlreadyAbsent,
    Failed(FailureReason),
}

#[derive(Debug, Default)]
struct Tally {
    deleted: Vec<CleanableItem>,
    failed: Vec<FailedItem>,
    freed: u64,
}

impl Tally {
    fn fail_all(&mut self, items: impl IntoIterator<Item = CleanableItem>, reason: FailureReason) {
        self.failed.extend(items.into_iter().map(|item| FailedItem {
            item,
            reason: reason.clone(),
        }));
    }

    fn into_result(self, snapshot_ids: Vec<String>) -> CleanResult {
        CleanResult {
            deleted_items: self.deleted,
            failed_items: self.failed,
            freed_space: self.freed,
            finished_at: Utc::now(),
            dry_run: false,
            snapshot_ids,
        }
    }

    fn record(&mut self, item: CleanableItem, outcome: DeleteOutcome) {
        match outcome {
            DeleteOutcome::Deleted(bytes) => {
                self.freed = self.freed.saturating_add(bytes);
                self.deleted.push(item);
            }
            DeleteOutcome::AlreadyAbsent => self.deleted.push(item),
            DeleteOutcome::Failed(reason) => self.failed.push(FailedItem { item, reason }),
        }
    }
}

pub struct DeletionEngine {
    fs: Arc<dyn FileSystem>,
    backup: Option<Arc<dyn BackupService>>,
    flight: SingleFlight,
}

impl std::fmt::Debug for DeletionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionEngine")
            .field("backup", &self.backup.is_some())
            .field("busy", &self.flight.is_busy())
            .finish()
    }
}

impl DeletionEngine {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            backup: None,
            flight: SingleFlight::new("clean"),
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub async fn clean(
        &self,
        items: Vec<CleanableItem>,
        config: &CleanConfig,
    ) -> Result<CleanResult> {
        self.clean_with_cancel(items, config, &CancellationToken::new())
            .await
    }

    /// Cancellation before any removal starts returns `Cancelled`; later it
    /// only stops new removals, which are reported as cancelled failures.
    /// Running out of the whole-call budget returns `CleanTimedOut` carrying
    /// the partial result.
    pub async fn clean_with_cancel(
        &self,
        items: Vec<CleanableItem>,
        config: &CleanConfig,
        cancel: &CancellationToken,
    ) -> Result<CleanResult> {
        let _flight = self.flight.try_begin()?;
        config.validate()?;

        if config.dry_run {
            return Ok(dry_run_result(items));
        }
        if cancel.is_cancelled() {
            return Err(SweepError::Cancelled);
        }

        let mut groups: HashMap<ItemCategory, Vec<CleanableItem>> = HashMap::new();
        for item in items {
            groups.entry(item.category).or_default().push(item);
        }

        let snapshot_ids = if config.auto_backup {
            self.back_up_groups(&groups, config).await?
        } else {
            Vec::new()
        };
        if cancel.is_cancelled() {
            return Err(SweepError::Cancelled);
        }

        let call_timeout = Duration::from_secs(config.timeout_secs);
        let call_deadline = Instant::now() + call_timeout;
        let (tally, call_expired) = self
            .delete_groups(groups, config, cancel, call_deadline)
            .await;
        let result = tally.into_result(snapshot_ids);

        if call_expired {
            warn!(
                timeout_secs = config.timeout_secs,
                deleted = result.deleted_items.len(),
                failed = result.failed_items.len(),
                "clean call timed out"
            );
            return Err(SweepError::CleanTimedOut {
                after: call_timeout,
                partial: Box::new(result),
            });
        }
        info!(
            deleted = result.deleted_items.len(),
            failed = result.failed_items.len(),
            freed_bytes = result.freed_space,
            "clean finished"
        );
        Ok(result)
    }

    /// Every group is backed up before the first removal, so a failed backup
    /// leaves the file system untouched.
    async fn back_up_groups(
        &self,
        groups: &HashMap<ItemCategory, Vec<CleanableItem>>,
        config: &CleanConfig,
    ) -> Result<Vec<String>> {
        let backup = self.backup.as_ref().ok_or_else(|| {
            SweepError::BackupFailed(
                "auto backup requested but no backup service is configured".to_string(),
            )
        })?;
        let budget = Duration::from_secs(config.backup_timeout_secs);

        let mut snapshot_ids = Vec::with_capacity(groups.len());
        for (category, group) in groups {
            let descriptor = SnapshotDescriptor {
                id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                category: *category,
                total_size_bytes: group.iter().map(|item| item.size_bytes).sum(),
                item_count: group.len(),
                metadata: BTreeMap::from([("category".to_string(), category.to_string())]),
            };
            info!(
                snapshot = %descriptor.id,
                category = %category,
                items = descriptor.item_count,
                "creating backup snapshot"
            );
            match tokio::time::timeout(budget, backup.create_snapshot(group, &descriptor)).await {
                Ok(Ok(snapshot_id)) => snapshot_ids.push(snapshot_id),
                Ok(Err(err)) => {
                    warn!(category = %category, error = %err, "backup failed, aborting clean");
                    return Err(SweepError::BackupFailed(format!("{category}: {err}")));
                }
                Err(_) => {
                    warn!(category = %category, "backup timed out, aborting clean");
                    return Err(SweepError::BackupFailed(format!(
                        "{category}: timed out after {}s",
                        budget.as_secs()
                    )));
                }
            }
        }
        Ok(snapshot_ids)
    }

    async fn delete_groups(
        &self,
        groups: HashMap<ItemCategory, Vec<CleanableItem>>,
        config: &CleanConfig,
        cancel: &CancellationToken,
        call_deadline: Instant,
    ) -> (Tally, bool) {
        let mut tally = Tally::default();
        let mut call_expired = false;
        let category_budget = Duration::from_secs(config.category_timeout_secs);
        for (category, group) in groups {
            let remaining = call_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                call_expired = true;
                tally.fail_all(group, FailureReason::Timeout);
                continue;
            }
            let budget = category_budget.min(remaining);
            let before = (tally.deleted.len(), tally.failed.len());
            let timed_out = self
                .delete_group(group, config.workers, budget, cancel, &mut tally)
                .await;
            if timed_out && remaining <= category_budget {
                call_expired = true;
            }
            info!(
                category = %category,
                deleted = tally.deleted.len() - before.0,
                failed = tally.failed.len() - before.1,
                "category cleaned"
            );
        }
        (tally, call_expired)
    }

    /// When the budget runs out, removals not yet started are failed with
    /// `Timeout`; removals already in flight finish and are reported with
    /// their real outcome. Returns whether the budget ran out.
    ///
    /// Items stay in `waiting` until their task reports back, so a task
    /// that dies still leaves its item in the tally.
    async fn delete_group(
        &self,
        group: Vec<CleanableItem>,
        workers: usize,
        budget: Duration,
        cancel: &CancellationToken,
        tally: &mut Tally,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let stop = cancel.child_token();
        let mut set = JoinSet::new();
        let mut waiting = HashMap::with_capacity(group.len());

        for (slot, item) in group.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let fs = Arc::clone(&self.fs);
            let stop = stop.clone();
            let expected = item.size_bytes;
            let path = item.path.clone();
            waiting.insert(slot, item);
            set.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit,
                    _ = stop.cancelled() => return (slot, None),
                };
                let Ok(permit) = permit else {
                    return (slot, None);
                };
                if stop.is_cancelled() {
                    return (slot, None);
                }
                let outcome = tokio::task::spawn_blocking(move || {
                    delete_one(fs.as_ref(), &path, expected)
                })
                .await
                .unwrap_or_else(|err| DeleteOutcome::Failed(FailureReason::Io(err.to_string())));
                drop(permit);
                (slot, Some(outcome))
            });
        }

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut aborted = None;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((slot, outcome))) => {
                        let Some(item) = waiting.remove(&slot) else {
                            continue;
                        };
                        match outcome {
                            Some(outcome) => tally.record(item, outcome),
                            None if timed_out => tally.fail_all([item], FailureReason::Timeout),
                            None => tally.fail_all([item], FailureReason::Cancelled),
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "deletion task aborted");
                        aborted = Some(err.to_string());
                    }
                },
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(budget_secs = budget.as_secs(), "category deletion timed out");
                    stop.cancel();
                }
            }
        }

        if !waiting.is_empty() {
            let detail = aborted.unwrap_or_else(|| "deletion task lost".to_string());
            tally.fail_all(
                waiting.into_values(),
                FailureReason::Io(format!("deletion task aborted: {detail}")),
            );
        }
        timed_out
    }
}

fn dry_run_result(items: Vec<CleanableItem>) -> CleanResult {
    let freed_space = items.iter().map(|item| item.size_bytes).sum();
    info!(items = items.len(), freed_bytes = freed_space, "dry run clean");
    CleanResult {
        deleted_items: items,
        failed_items: Vec::new(),
        freed_space,
        finished_at: Utc::now(),
        dry_run: true,
        snapshot_ids: Vec::new(),
    }
}

fn delete_one(fs: &dyn FileSystem, path: &Path, expected_size: u64) -> DeleteOutcome {
    if !fs.exists(path) {
        return DeleteOutcome::AlreadyAbsent;
    }
    let captured = match fs.stat(path) {
        Ok(metadata) if metadata.is_dir => expected_size,
        Ok(metadata) => metadata.size_bytes,
        Err(err) if err.is_not_found() => return DeleteOutcome::AlreadyAbsent,
        Err(_) => expected_size,
    };

    match fs.remove(path) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return DeleteOutcome::AlreadyAbsent,
        Err(SweepError::PermissionDenied(_)) => {
            return DeleteOutcome::Failed(FailureReason::PermissionDenied)
        }
        Err(err) => return DeleteOutcome::Failed(FailureReason::Io(err.to_string())),
    }

    if fs.exists(path) {
        return DeleteOutcome::Failed(FailureReason::VerificationFailed);
    }
    DeleteOutcome::Deleted(captured)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::{BackupService, DeletionEngine, SnapshotDescriptor};
    use crate::config::CleanConfig;
    use crate::error::{Result, SweepError};
    use crate::fs::{DirEntry, FileMetadata, FileSystem, LocalFileSystem};
    use crate::model::{CleanableItem, FailureReason, ItemCategory};

    fn live_config() -> CleanConfig {
        CleanConfig {
            dry_run: false,
            workers: 2,
            ..CleanConfig::default()
        }
    }

    fn write_item(dir: &Path, name: &str, size: usize, category: ItemCategory) -> CleanableItem {
        let path = dir.join(name);
        fs::write(&path, vec![0_u8; size]).expect("write item");
        CleanableItem::new(path, category, size as u64)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dry_run_touches_nothing() {
        let temp = TempDir::new().expect("tempdir");
        let items = vec![
            write_item(temp.path(), "a.log", 10, ItemCategory::Logs),
            write_item(temp.path(), "b.tmp", 20, ItemCategory::Temporary),
        ];
        let engine = DeletionEngine::new(Arc::new(LocalFileSystem));
        let result = engine
            .clean(items.clone(), &CleanConfig::default())
            .await
            .expect("dry run");
        assert!(result.dry_run);
        assert_eq!(result.freed_space, 30);
        assert_eq!(result.deleted_items.len(), 2);
        assert!(items.iter().all(|item| item.path.exists()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletes_and_verifies_each_item() {
        let temp = TempDir::new().expect("tempdir");
        let tree = temp.path().join("node_modules");
        fs::create_dir_all(tree.join("pkg")).expect("mkdir");
        fs::write(tree.join("pkg/index.js"), vec![0_u8; 64]).expect("write");
        let items = vec![
            write_item(temp.path(), "a.log", 10, ItemCategory::Logs),
            CleanableItem::new(tree.clone(), ItemCategory::NodeModules, 64),
            CleanableItem::new(temp.path().join("never-existed"), ItemCategory::Cache, 999),
        ];

        let engine = DeletionEngine::new(Arc::new(LocalFileSystem));
        let result = engine.clean(items, &live_config()).await.expect("clean");
        assert_eq!(result.deleted_items.len(), 3);
        assert!(result.failed_items.is_empty());
        assert_eq!(result.freed_space, 74);
        assert!(result.deleted_items.iter().all(|item| !item.path.exists()));
    }

    /// Removal reports success but leaves the file in place.
    struct StubbornFs;

    impl FileSystem for StubbornFs {
        fn exists(&self, path: &Path) -> bool {
            LocalFileSystem.exists(path)
        }

        fn stat(&self, path: &Path) -> Result<FileMetadata> {
            LocalFileSystem.stat(path)
        }

        fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
            LocalFileSystem.list_directory(path)
        }

        fn remove(&self, path: &Path) -> Result<()> {
            if path.ends_with("locked.bin") {
                return Err(SweepError::PermissionDenied(path.to_path_buf()));
            }
            Ok(())
        }

        fn read_symlink_target(&self, path: &Path) -> Result<PathBuf> {
            LocalFileSystem.read_symlink_target(path)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_are_collected_not_fatal() {
        let temp = TempDir::new().expect("tempdir");
        let items = vec![
            write_item(temp.path(), "sticky.bin", 5, ItemCategory::Cache),
            write_item(temp.path(), "locked.bin", 5, ItemCategory::Cache),
        ];
        let engine = DeletionEngine::new(Arc::new(StubbornFs));
        let result = engine.clean(items, &live_config()).await.expect("clean");

        assert!(result.deleted_items.is_empty());
        assert_eq!(result.freed_space, 0);
        let mut reasons = result
            .failed_items
            .iter()
            .map(|failed| (failed.item.name.clone(), failed.reason.clone()))
            .collect::<Vec<_>>();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            reasons,
            vec![
                ("locked.bin".to_string(), FailureReason::PermissionDenied),
                ("sticky.bin".to_string(), FailureReason::VerificationFailed),
            ]
        );
        assert!(result.failed_items.iter().all(|failed| failed.item.path.exists()));
    }

    struct FailingBackup;

    #[async_trait]
    impl BackupService for FailingBackup {
        async fn create_snapshot(
            &self,
            _items: &[CleanableItem],
            _descriptor: &SnapshotDescriptor,
        ) -> Result<String> {
            Err(SweepError::Internal("disk full".to_string()))
        }
    }

    struct RecordingBackup;

    #[async_trait]
    impl BackupService for RecordingBackup {
        async fn create_snapshot(
            &self,
            items: &[CleanableItem],
            descriptor: &SnapshotDescriptor,
        ) -> Result<String> {
            assert_eq!(items.len(), descriptor.item_count);
            Ok(format!("snap-{}", descriptor.category))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backup_failure_aborts_before_any_deletion() {
        let temp = TempDir::new().expect("tempdir");
        let items = vec![
            write_item(temp.path(), "a.log", 1, ItemCategory::Logs),
            write_item(temp.path(), "b.cache", 1, ItemCategory::Cache),
        ];
        let engine =
            DeletionEngine::new(Arc::new(LocalFileSystem)).with_backup(Arc::new(FailingBackup));
        let config = CleanConfig {
            auto_backup: true,
            ..live_config()
        };
        let err = engine.clean(items.clone(), &config).await.expect_err("backup");
        assert!(matches!(err, SweepError::BackupFailed(_)));
        assert!(items.iter().all(|item| item.path.exists()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_backup_service_is_a_backup_failure() {
        let engine = DeletionEngine::new(Arc::new(LocalFileSystem));
        let config = CleanConfig {
            auto_backup: true,
            ..live_config()
        };
        let err = engine
            .clean(Vec::new(), &config)
            .await
            .expect_err("no backup service");
        assert!(matches!(err, SweepError::BackupFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_backup_records_snapshot_per_category() {
        let temp = TempDir::new().expect("tempdir");
        let items = vec![
            write_item(temp.path(), "a.log", 1, ItemCategory::Logs),
            write_item(temp.path(), "b.cache", 1, ItemCategory::Cache),
        ];
        let engine =
            DeletionEngine::new(Arc::new(LocalFileSystem)).with_backup(Arc::new(RecordingBackup));
        let config = CleanConfig {
            auto_backup: true,
            ..live_config()
        };
        let result = engine.clean(items, &config).await.expect("clean");
        let mut ids = result.snapshot_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["snap-cache".to_string(), "snap-logs".to_string()]);
        assert_eq!(result.deleted_items.len(), 2);
    }

    /// Every removal takes long enough to blow a one second category budget.
    struct SlowFs;

    impl FileSystem for SlowFs {
        fn exists(&self, path: &Path) -> bool {
            LocalFileSystem.exists(path)
        }

        fn stat(&self, path: &Path) -> Result<FileMetadata> {
            LocalFileSystem.stat(path)
        }

        fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
            LocalFileSystem.list_directory(path)
        }

        fn remove(&self, path: &Path) -> Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(400));
            LocalFileSystem.remove(path)
        }

        fn read_symlink_target(&self, path: &Path) -> Result<PathBuf> {
            LocalFileSystem.read_symlink_target(path)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn category_timeout_fails_remaining_items_only() {
        let temp = TempDir::new().expect("tempdir");
        let items = (0..8)
            .map(|index| write_item(temp.path(), &format!("{index}.log"), 1, ItemCategory::Logs))
            .collect::<Vec<_>>();
        let engine = DeletionEngine::new(Arc::new(SlowFs));
        let config = CleanConfig {
            workers: 1,
            category_timeout_secs: 1,
            ..live_config()
        };
        let result = engine.clean(items, &config).await.expect("clean");

        assert_eq!(result.deleted_items.len() + result.failed_items.len(), 8);
        assert!(!result.deleted_items.is_empty());
        assert!(result
            .failed_items
            .iter()
            .all(|failed| failed.reason == FailureReason::Timeout));
        assert!(result.failed_items.len() >= 4);
        assert!(result.deleted_items.iter().all(|item| !item.path.exists()));
        assert!(result.failed_items.iter().all(|failed| failed.item.path.exists()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn call_timeout_returns_partial_result() {
        let temp = TempDir::new().expect("tempdir");
        let mut items = (0..4)
            .map(|index| write_item(temp.path(), &format!("{index}.log"), 1, ItemCategory::Logs))
            .collect::<Vec<_>>();
        items.extend((0..4).map(|index| {
            write_item(temp.path(), &format!("{index}.cache"), 1, ItemCategory::Cache)
        }));
        let engine = DeletionEngine::new(Arc::new(SlowFs));
        let config = CleanConfig {
            workers: 1,
            timeout_secs: 1,
            ..live_config()
        };
        let err = engine.clean(items, &config).await.expect_err("call budget");

        assert!(matches!(err, SweepError::CleanTimedOut { .. }));
        let partial = err.partial_clean().expect("partial result");
        assert_eq!(partial.deleted_items.len() + partial.failed_items.len(), 8);
        assert!(!partial.deleted_items.is_empty());
        assert!(partial.deleted_items.iter().all(|item| !item.path.exists()));
        assert!(partial
            .failed_items
            .iter()
            .all(|failed| failed.reason == FailureReason::Timeout && failed.item.path.exists()));
        assert_eq!(partial.freed_space, partial.deleted_items.len() as u64);
    }

    /// Panics while removing anything named `boom.bin`.
    struct PanickingFs;

    impl FileSystem for PanickingFs {
        fn exists(&self, path: &Path) -> bool {
            LocalFileSystem.exists(path)
        }

        fn stat(&self, path: &Path) -> Result<FileMetadata> {
            LocalFileSystem.stat(path)
        }

        fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
            LocalFileSystem.list_directory(path)
        }

        fn remove(&self, path: &Path) -> Result<()> {
            if path.ends_with("boom.bin") {
                panic!("removal exploded");
            }
            LocalFileSystem.remove(path)
        }

        fn read_symlink_target(&self, path: &Path) -> Result<PathBuf> {
            LocalFileSystem.read_symlink_target(path)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_removal_is_recorded_as_failure() {
        let temp = TempDir::new().expect("tempdir");
        let items = vec![
            write_item(temp.path(), "boom.bin", 4, ItemCategory::Cache),
            write_item(temp.path(), "fine.bin", 4, ItemCategory::Cache),
        ];
        let engine = DeletionEngine::new(Arc::new(PanickingFs));
        let result = engine.clean(items, &live_config()).await.expect("clean");

        assert_eq!(result.deleted_items.len(), 1);
        assert_eq!(result.deleted_items[0].name, "fine.bin");
        assert_eq!(result.failed_items.len(), 1);
        assert_eq!(result.failed_items[0].item.name, "boom.bin");
        assert!(matches!(result.failed_items[0].reason, FailureReason::Io(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_clean_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let items = (0..3)
            .map(|index| write_item(temp.path(), &format!("{index}.log"), 1, ItemCategory::Logs))
            .collect::<Vec<_>>();
        let engine = Arc::new(DeletionEngine::new(Arc::new(SlowFs)));
        let config = CleanConfig {
            workers: 1,
            ..live_config()
        };

        let first = {
            let engine = Arc::clone(&engine);
            let config = config.clone();
            tokio::spawn(async move { engine.clean(items, &config).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let second = engine.clean(Vec::new(), &config).await;
        assert!(matches!(
            second,
            Err(SweepError::OperationInProgress { operation: "clean" })
        ));
        let first = first.await.expect("join").expect("first clean");
        assert_eq!(first.deleted_items.len(), 3);
    }
}
