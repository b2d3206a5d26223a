use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use sweepkit_core::{
    get_recommendations, BackupService, BatchRiskAssessment, CategorySet, ChangeEvent, ChangeKind,
    CleanConfig, CleanResult, CleanableItem, DeletionEngine, ExplanationGenerator, FileSystem,
    IncrementalIndex, IncrementalUpdateResult, IndexStatistics, IndexStore, IndexSummary,
    LocalFileSystem, OpenFileSnapshot, PathToolDetector, PhaseBudgets, RecommendationBundle,
    Result, RiskEngine, ScanOrchestrator, ScanResults, ScoreEnhancer, SweepConfig, SweepError,
    TemplateExplainer, ToolDetector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum IndexBacking {
    Store(IndexStore),
    InMemory,
}

/// Collects the collaborators a [`Pipeline`] is assembled from.
pub struct PipelineBuilder {
    config: SweepConfig,
    fs: Arc<dyn FileSystem>,
    index: IndexBacking,
    backup: Option<Arc<dyn BackupService>>,
    enhancer: Option<Arc<dyn ScoreEnhancer>>,
    explainer: Option<Arc<dyn ExplanationGenerator>>,
    tool_detector: Option<Arc<dyn ToolDetector>>,
    open_files: Option<OpenFileSnapshot>,
    budgets: Option<PhaseBudgets>,
}

impl PipelineBuilder {
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn index_store(mut self, store: IndexStore) -> Self {
        self.index = IndexBacking::Store(store);
        self
    }

    pub fn in_memory_index(mut self) -> Self {
        self.index = IndexBacking::InMemory;
        self
    }

    pub fn backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn enhancer(mut self, enhancer: Arc<dyn ScoreEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn explainer(mut self, explainer: Arc<dyn ExplanationGenerator>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn tool_detector(mut self, detector: Arc<dyn ToolDetector>) -> Self {
        self.tool_detector = Some(detector);
        self
    }

    /// Use a fixed open-file snapshot instead of probing processes per scan.
    pub fn open_files(mut self, snapshot: OpenFileSnapshot) -> Self {
        self.open_files = Some(snapshot);
        self
    }

    pub fn budgets(mut self, budgets: PhaseBudgets) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let index = match self.index {
            IndexBacking::Store(store) => {
                IncrementalIndex::open(self.config.index.clone(), Arc::clone(&self.fs), store)?
            }
            IndexBacking::InMemory => {
                IncrementalIndex::in_memory(self.config.index.clone(), Arc::clone(&self.fs))?
            }
        };
        let index = Arc::new(
            index.with_cache_ttl(Duration::from_secs(self.config.scan.cache_ttl_seconds)),
        );

        let mut orchestrator = ScanOrchestrator::new(Arc::clone(&self.fs))
            .with_index(Arc::clone(&index))
            .with_explainer(self.explainer.unwrap_or_else(|| {
                Arc::new(TemplateExplainer) as Arc<dyn ExplanationGenerator>
            }))
            .with_tool_detector(
                self.tool_detector
                    .unwrap_or_else(|| Arc::new(PathToolDetector) as Arc<dyn ToolDetector>),
            );
        if let Some(enhancer) = self.enhancer {
            orchestrator = orchestrator.with_enhancer(enhancer);
        }
        if let Some(budgets) = self.budgets {
            orchestrator = orchestrator.with_budgets(budgets);
        }
        if let Some(snapshot) = self.open_files.clone() {
            orchestrator = orchestrator.with_open_files(snapshot);
        }

        let mut deletion = DeletionEngine::new(Arc::clone(&self.fs));
        if let Some(backup) = self.backup {
            deletion = deletion.with_backup(backup);
        }

        Ok(Pipeline {
            config: self.config,
            fs: self.fs,
            orchestrator,
            deletion,
            index,
            open_files: self.open_files,
        })
    }
}

/// The single entry point for scanning, cleaning and recommending.
///
/// One scan and one clean may each be in flight at a time; a second
/// concurrent call of the same kind fails with `OperationInProgress`.
pub struct Pipeline {
    config: SweepConfig,
    fs: Arc<dyn FileSystem>,
    orchestrator: ScanOrchestrator,
    deletion: DeletionEngine,
    index: Arc<IncrementalIndex>,
    open_files: Option<OpenFileSnapshot>,
}

impl Pipeline {
    /// Defaults: local file system, persistent index under the configured directory.
    pub fn builder(config: SweepConfig) -> PipelineBuilder {
        let store = IndexStore::new(config.index.resolved_directory());
        PipelineBuilder {
            config,
            fs: Arc::new(LocalFileSystem),
            index: IndexBacking::Store(store),
            backup: None,
            enhancer: None,
            explainer: None,
            tool_detector: None,
            open_files: None,
            budgets: None,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<IncrementalIndex> {
        &self.index
    }

    pub async fn scan(&self, categories: &CategorySet) -> Result<ScanResults> {
        self.scan_with_cancel(categories, &CancellationToken::new())
            .await
    }

    pub async fn scan_with_cancel(
        &self,
        categories: &CategorySet,
        cancel: &CancellationToken,
    ) -> Result<ScanResults> {
        self.orchestrator
            .scan_with_cancel(categories, &self.config.scan, cancel)
            .await
    }

    pub async fn clean(&self, items: Vec<CleanableItem>) -> Result<CleanResult> {
        self.clean_with(items, &self.config.clean, &CancellationToken::new())
            .await
    }

    /// Removed paths are queued as deletions for the next index update.
    pub async fn clean_with(
        &self,
        items: Vec<CleanableItem>,
        config: &CleanConfig,
        cancel: &CancellationToken,
    ) -> Result<CleanResult> {
        let outcome = self.deletion.clean_with_cancel(items, config, cancel).await;
        let removed = match &outcome {
            Ok(result) => Some(result),
            Err(err) => err.partial_clean(),
        };
        if let Some(result) = removed.filter(|result| !result.dry_run) {
            self.queue_removals(result);
        }
        outcome
    }

    fn queue_removals(&self, result: &CleanResult) {
        for item in &result.deleted_items {
            self.index
                .enqueue_change(ChangeEvent::new(item.path.clone(), [ChangeKind::Deleted]));
        }
        debug!(
            queued = result.deleted_items.len(),
            "queued removed paths for the next index update"
        );
    }

    pub fn get_recommendations(&self, results: &ScanResults) -> RecommendationBundle {
        get_recommendations(results, &self.config.recommend)
    }

    /// Advisory aggregate over a selection, reported before a real clean.
    pub fn audit_batch(&self, items: &[CleanableItem]) -> BatchRiskAssessment {
        let snapshot = self
            .open_files
            .clone()
            .unwrap_or_else(OpenFileSnapshot::capture);
        RiskEngine::new(Arc::clone(&self.fs), self.config.scan.resolved_home())
            .with_open_files(snapshot)
            .audit_batch(items)
    }

    pub async fn build_index(
        &self,
        roots: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<IndexStatistics> {
        let index = Arc::clone(&self.index);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || index.full_scan(&roots, &cancel))
            .await
            .map_err(|err| SweepError::Internal(format!("index build task failed: {err}")))?
    }

    pub async fn update_index(&self) -> Result<IncrementalUpdateResult> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.perform_incremental_update())
            .await
            .map_err(|err| SweepError::Internal(format!("index update task failed: {err}")))?
    }

    pub fn index_summary(&self) -> IndexSummary {
        self.index.summary()
    }

    pub fn is_path_indexed(&self, path: &Path) -> bool {
        self.index.is_path_indexed(path)
    }
}

pub fn load_results(path: impl AsRef<Path>) -> AnyResult<ScanResults> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read scan results {}", path.display()))?;
    let results: ScanResults = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if results.results_version != sweepkit_core::RESULTS_VERSION {
        warn!(
            found = %results.results_version,
            expected = sweepkit_core::RESULTS_VERSION,
            "scan results were written by a different version"
        );
    }
    Ok(results)
}

pub fn write_results(results: &ScanResults, path: impl AsRef<Path>) -> AnyResult<()> {
    let path = path.as_ref();
    let payload =
        serde_json::to_string_pretty(results).context("failed to serialize scan results")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write scan results to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use sweepkit_core::fs::DirEntry;
    use sweepkit_core::{
        CategorySet, CleanConfig, CleanableItem, FileMetadata, FileSystem, ItemCategory,
        LocalFileSystem, OpenFileSnapshot, PhaseBudgets, Result, SweepConfig, SweepError,
    };
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::{load_results, write_results, Pipeline};

    fn config_for(temp: &TempDir) -> SweepConfig {
        let home = temp.path().join("home");
        let mut config = SweepConfig::default();
        config.scan.home_dir = Some(home);
        config.scan.temp_dir = Some(temp.path().join("no-tmp"));
        config.scan.parallelism = 2;
        config
    }

    fn pipeline(config: SweepConfig) -> Pipeline {
        Pipeline::builder(config)
            .in_memory_index()
            .open_files(OpenFileSnapshot::unavailable())
            .budgets(PhaseBudgets {
                scan: Duration::from_secs(30),
                duplicates: Duration::from_secs(5),
                risk_audit: Duration::from_secs(10),
                explanations: Duration::from_secs(5),
            })
            .build()
            .expect("pipeline")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_recommend_and_dry_run_clean() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_for(&temp);
        let cache_dir = temp.path().join("home/.cache/tool");
        fs::create_dir_all(&cache_dir).expect("mkdir");
        fs::write(cache_dir.join("blob.bin"), vec![1_u8; 4096]).expect("write");

        let pipeline = pipeline(config);
        let categories = [ItemCategory::Cache].into_iter().collect::<CategorySet>();
        let results = pipeline.scan(&categories).await.expect("scan");
        assert_eq!(results.items.len(), 1);
        assert!(results.items[0].explanation.is_some());
        assert!(pipeline.is_path_indexed(&results.items[0].path));

        let bundle = pipeline.get_recommendations(&results);
        let safe = bundle.safe_item_ids();
        assert!(safe.contains(results.items[0].id.as_str()));

        let cleaned = pipeline.clean(results.items.clone()).await.expect("clean");
        assert!(cleaned.dry_run);
        assert_eq!(cleaned.freed_space, 4096);
        assert!(cache_dir.join("blob.bin").exists());
        assert_eq!(pipeline.index().pending_changes(), 0);

        let path = temp.path().join("results.json");
        write_results(&results, &path).expect("write");
        assert_eq!(load_results(&path).expect("load").scan_id, results.scan_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn real_clean_feeds_index_deletions() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_for(&temp);
        let logs = temp.path().join("home/Library/Logs/app");
        fs::create_dir_all(&logs).expect("mkdir");
        let doomed = logs.join("old.log");
        fs::write(&doomed, vec![0_u8; 128]).expect("write");
        fs::write(logs.join("keep.txt"), b"keep").expect("write");

        let pipeline = pipeline(config);
        let stats = pipeline
            .build_index(vec![logs.clone()], &CancellationToken::new())
            .await
            .expect("index build");
        assert_eq!(stats.files, 2);

        let categories = [ItemCategory::Logs].into_iter().collect::<CategorySet>();
        let results = pipeline.scan(&categories).await.expect("scan");
        assert_eq!(results.items.len(), 1);

        let execute = CleanConfig {
            dry_run: false,
            ..CleanConfig::default()
        };
        let cleaned = pipeline
            .clean_with(results.items, &execute, &CancellationToken::new())
            .await
            .expect("clean");
        assert_eq!(cleaned.freed_space, 128);
        assert!(!doomed.exists());
        assert_eq!(pipeline.index().pending_changes(), 1);

        let update = pipeline.update_index().await.expect("update");
        assert_eq!(update.removed, vec![doomed.clone()]);
        assert!(!pipeline.is_path_indexed(&doomed));
        assert!(pipeline.is_path_indexed(&logs.join("keep.txt")));
        assert_eq!(pipeline.index_summary().files, 1);
    }

    /// Removals slow enough that a one second clean budget runs out.
    struct SlowRemovalFs;

    impl FileSystem for SlowRemovalFs {
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
            std::thread::sleep(Duration::from_millis(400));
            LocalFileSystem.remove(path)
        }

        fn read_symlink_target(&self, path: &Path) -> Result<PathBuf> {
            LocalFileSystem.read_symlink_target(path)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timed_out_clean_still_queues_removed_paths() {
        let temp = TempDir::new().expect("tempdir");
        let items = (0..6)
            .map(|index| {
                let path = temp.path().join(format!("{index}.log"));
                fs::write(&path, b"log").expect("write");
                CleanableItem::new(path, ItemCategory::Logs, 3)
            })
            .collect::<Vec<_>>();

        let pipeline = Pipeline::builder(config_for(&temp))
            .file_system(Arc::new(SlowRemovalFs))
            .in_memory_index()
            .open_files(OpenFileSnapshot::unavailable())
            .build()
            .expect("pipeline");
        let execute = CleanConfig {
            dry_run: false,
            workers: 1,
            timeout_secs: 1,
            ..CleanConfig::default()
        };
        let err = pipeline
            .clean_with(items, &execute, &CancellationToken::new())
            .await
            .expect_err("clean budget");

        assert!(matches!(err, SweepError::CleanTimedOut { .. }));
        let partial = err.partial_clean().expect("partial result");
        assert!(!partial.deleted_items.is_empty());
        assert_eq!(partial.deleted_items.len() + partial.failed_items.len(), 6);
        assert_eq!(
            pipeline.index().pending_changes(),
            partial.deleted_items.len()
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = SweepConfig::default();
        config.scan.duplicate_budget_secs = 5;
        assert!(Pipeline::builder(config).in_memory_index().build().is_err());
    }
}
