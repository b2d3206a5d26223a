use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sweepkit_core::fs::DirEntry;
use sweepkit_core::{
    find_duplicates, get_recommendations, CategorySet, CleanConfig, CleanableItem, DeletionEngine,
    FileMetadata, FileSystem, IncrementalIndex, IndexConfig, ItemCategory, LocalFileSystem,
    OpenFileSnapshot, PhaseBudgets, RecommendConfig, RecommendMode, RiskEngine, RiskLevel,
    ScanConfig, ScanOrchestrator, HIGH_RISK_SAFETY_CEILING,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn orchestrator() -> ScanOrchestrator {
    ScanOrchestrator::new(Arc::new(LocalFileSystem))
        .with_open_files(OpenFileSnapshot::unavailable())
        .with_budgets(PhaseBudgets {
            scan: Duration::from_secs(30),
            duplicates: Duration::from_secs(5),
            risk_audit: Duration::from_secs(10),
            explanations: Duration::from_secs(5),
        })
}

fn scan_config(home: &Path, temp: &TempDir) -> ScanConfig {
    ScanConfig {
        home_dir: Some(home.to_path_buf()),
        temp_dir: Some(temp.path().join("no-tmp")),
        parallelism: 2,
        ..ScanConfig::default()
    }
}

fn categories(list: &[ItemCategory]) -> CategorySet {
    list.iter().copied().collect()
}

fn live() -> CleanConfig {
    CleanConfig {
        dry_run: false,
        workers: 2,
        ..CleanConfig::default()
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, vec![7_u8; size])?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_file_is_found_with_baseline_safety() -> Result<()> {
    let temp = TempDir::new()?;
    let home = temp.path().join("home");
    let data = home.join("Library/Caches/app/data.tmp");
    write_file(&data, 10_240)?;

    let results = orchestrator()
        .scan(&categories(&[ItemCategory::Cache]), &scan_config(&home, &temp))
        .await?;

    assert_eq!(results.items.len(), 1);
    let item = &results.items[0];
    assert_eq!(item.path, data);
    assert_eq!(item.category, ItemCategory::Cache);
    assert_eq!(item.size_bytes, 10_240);
    assert!(item.safety_score() >= 70);
    assert!(!item.risk_level.is_some_and(RiskLevel::is_high_or_worse));
    Ok(())
}

#[test]
fn system_path_is_critical_and_never_safe() {
    let engine = RiskEngine::new(Arc::new(LocalFileSystem), Some(PathBuf::from("/Users/u")));
    let path = PathBuf::from("/System/Library/CoreServices/x.plist");
    let assessment = engine.audit(&path);
    assert_eq!(assessment.level, RiskLevel::Critical);
    assert_eq!(assessment.score, 100);

    let mut item = CleanableItem::new(path, ItemCategory::Other, 4_096);
    item.set_safety_score(99);
    item.apply_assessment(&assessment);
    assert!(item.safety_score() <= HIGH_RISK_SAFETY_CEILING);

    let results = sweepkit_core::ScanResults {
        results_version: sweepkit_core::RESULTS_VERSION.to_string(),
        scan_id: "scenario-b".to_string(),
        started_at: chrono::Utc::now(),
        categories: CategorySet::all(),
        items: vec![item.clone()],
        duplicates: Vec::new(),
        tasks_planned: 1,
        tasks_completed: 1,
        total_size_bytes: 4_096,
        elapsed_ms: 1,
        phases: Vec::new(),
        warnings: Vec::new(),
    };
    let bundle = get_recommendations(
        &results,
        &RecommendConfig {
            mode: RecommendMode::Aggressive,
            ..RecommendConfig::default()
        },
    );
    assert!(!bundle.safe_item_ids().contains(item.id.as_str()));
    assert!(bundle
        .recommendations
        .iter()
        .any(|rec| rec.id == "blocked-high-risk" && rec.item_ids.contains(&item.id)));
}

#[tokio::test(flavor = "multi_thread")]
async fn keychain_under_extra_root_is_clamped_by_audit() -> Result<()> {
    let temp = TempDir::new()?;
    let home = temp.path().join("home");
    let keychains = home.join("Library/Keychains");
    write_file(&keychains.join("login.keychain-db"), 64)?;

    let config = ScanConfig {
        extra_roots: vec![keychains],
        ..scan_config(&home, &temp)
    };
    let results = orchestrator()
        .scan(&categories(&[ItemCategory::Other]), &config)
        .await?;

    assert_eq!(results.items.len(), 1);
    assert_eq!(results.items[0].risk_level, Some(RiskLevel::Critical));
    assert!(results.items[0].safety_score() <= HIGH_RISK_SAFETY_CEILING);
    assert!(results.items[0].warning.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_name_and_size_form_one_duplicate_group() -> Result<()> {
    let temp = TempDir::new()?;
    let home = temp.path().join("home");
    write_file(&home.join("Downloads/photo.jpg"), 2_000)?;
    write_file(&home.join("Desktop/photo.jpg"), 2_000)?;

    let results = orchestrator()
        .scan(&categories(&[ItemCategory::Duplicates]), &scan_config(&home, &temp))
        .await?;

    assert_eq!(results.duplicates.len(), 1);
    let group = &results.duplicates[0];
    assert_eq!(group.paths.len(), 2);
    assert_eq!(group.wasted_bytes, 2_000);
    assert_eq!(results.items.len(), 1);

    let direct = find_duplicates(&[
        CleanableItem::new(PathBuf::from("/a/photo.jpg"), ItemCategory::Duplicates, 512),
        CleanableItem::new(PathBuf::from("/b/photo.jpg"), ItemCategory::Duplicates, 512),
    ]);
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].wasted_bytes, 512);
    Ok(())
}

#[test]
fn empty_directory_indexes_nothing() -> Result<()> {
    let temp = TempDir::new()?;
    let index = IncrementalIndex::in_memory(IndexConfig::default(), Arc::new(LocalFileSystem))?;
    let stats = index.full_scan(&[temp.path().to_path_buf()], &CancellationToken::new())?;
    assert_eq!(stats.files, 0);
    assert_eq!(stats.total_bytes, 0);
    assert_eq!(index.summary().entries, 0);
    Ok(())
}

#[test]
fn deleted_file_leaves_index_after_update() -> Result<()> {
    let temp = TempDir::new()?;
    let victim = temp.path().join("victim.dat");
    write_file(&victim, 10)?;
    write_file(&temp.path().join("other.dat"), 10)?;

    let index = IncrementalIndex::in_memory(IndexConfig::default(), Arc::new(LocalFileSystem))?;
    index.full_scan(&[temp.path().to_path_buf()], &CancellationToken::new())?;
    assert!(index.is_path_indexed(&victim));

    fs::remove_file(&victim)?;
    let update = index.perform_incremental_update()?;
    assert!(update.changed_paths().any(|path| path == &victim));
    assert!(!index.is_path_indexed(&victim));
    assert!(index.is_path_indexed(&temp.path().join("other.dat")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_never_touches_paths() -> Result<()> {
    let temp = TempDir::new()?;
    let mut items = Vec::new();
    for (index, size) in [100_u64, 250, 4].into_iter().enumerate() {
        let path = temp.path().join(format!("f{index}.log"));
        write_file(&path, size as usize)?;
        items.push(CleanableItem::new(path, ItemCategory::Logs, size));
    }
    items.push(CleanableItem::new(
        temp.path().join("missing.log"),
        ItemCategory::Logs,
        9,
    ));

    let result = DeletionEngine::new(Arc::new(LocalFileSystem))
        .clean(items.clone(), &CleanConfig::default())
        .await?;
    assert!(result.dry_run);
    assert_eq!(result.freed_space, 363);
    for item in &items[..3] {
        assert!(item.path.exists());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_paths_are_gone_and_absence_is_success() -> Result<()> {
    let temp = TempDir::new()?;
    let present = temp.path().join("present.log");
    let tree = temp.path().join("project/node_modules");
    write_file(&present, 30)?;
    write_file(&tree.join("dep/index.js"), 12)?;

    let items = vec![
        CleanableItem::new(present.clone(), ItemCategory::Logs, 30),
        CleanableItem::new(tree.clone(), ItemCategory::NodeModules, 12),
        CleanableItem::new(temp.path().join("never-existed.log"), ItemCategory::Logs, 5),
    ];
    let result = DeletionEngine::new(Arc::new(LocalFileSystem))
        .clean(items, &live())
        .await?;

    assert_eq!(result.deleted_items.len(), 3);
    assert!(result.failed_items.is_empty());
    assert_eq!(result.freed_space, 42);
    for item in &result.deleted_items {
        assert!(!item.path.exists());
    }
    Ok(())
}

/// Local file system that records how many removals run at once.
#[derive(Default)]
struct CountingFs {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FileSystem for CountingFs {
    fn exists(&self, path: &Path) -> bool {
        LocalFileSystem.exists(path)
    }

    fn stat(&self, path: &Path) -> sweepkit_core::Result<FileMetadata> {
        LocalFileSystem.stat(path)
    }

    fn list_directory(&self, path: &Path) -> sweepkit_core::Result<Vec<DirEntry>> {
        LocalFileSystem.list_directory(path)
    }

    fn remove(&self, path: &Path) -> sweepkit_core::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        let outcome = LocalFileSystem.remove(path);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn read_symlink_target(&self, path: &Path) -> sweepkit_core::Result<PathBuf> {
        LocalFileSystem.read_symlink_target(path)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletions_never_exceed_worker_count() -> Result<()> {
    let temp = TempDir::new()?;
    let mut items = Vec::new();
    for index in 0..16 {
        let path = temp.path().join(format!("{index}.tmp"));
        write_file(&path, 1)?;
        let category = if index % 2 == 0 {
            ItemCategory::Temporary
        } else {
            ItemCategory::Logs
        };
        items.push(CleanableItem::new(path, category, 1));
    }

    let counting = Arc::new(CountingFs::default());
    let engine = DeletionEngine::new(Arc::clone(&counting) as Arc<dyn FileSystem>);
    let config = CleanConfig {
        workers: 3,
        ..live()
    };
    let result = engine.clean(items, &config).await?;

    assert_eq!(result.deleted_items.len(), 16);
    let peak = counting.peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 3, "observed {peak} concurrent removals");
    Ok(())
}
