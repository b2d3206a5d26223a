use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bloom::BloomFilter;
use crate::config::IndexConfig;
use crate::error::{Result, SweepError};
use crate::fs::{FileMetadata, FileSystem};
use crate::index_store::IndexStore;
use crate::scan::{Observation, TreeSizeCache};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
    MetadataChanged,
    SizeChanged,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ChangeFlags(BTreeSet<ChangeKind>);

impl ChangeFlags {
    pub fn insert(&mut self, kind: ChangeKind) -> bool {
        self.0.insert(kind)
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ChangeKind> for ChangeFlags {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A notification from an external change source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub flags: ChangeFlags,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        Self {
            path: path.into(),
            flags: kinds.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub file_type: Option<String>,
    pub inode: Option<u64>,
    pub last_indexed: DateTime<Utc>,
    #[serde(default)]
    pub change_flags: ChangeFlags,
    /// Recursive size, recorded only when a scan sized this directory.
    #[serde(default)]
    pub tree_size: Option<u64>,
}

impl IndexEntry {
    pub fn from_metadata(path: PathBuf, metadata: &FileMetadata, now: DateTime<Utc>) -> Self {
        let file_type = if metadata.is_dir {
            None
        } else {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase())
        };
        Self {
            path,
            size_bytes: metadata.size_bytes,
            modified: metadata.modified,
            created: metadata.created,
            is_dir: metadata.is_dir,
            file_type,
            inode: metadata.inode,
            last_indexed: now,
            change_flags: ChangeFlags::default(),
            tree_size: None,
        }
    }

    /// Flags describing how `fresh` differs from this entry.
    fn diff(&self, fresh: &IndexEntry) -> ChangeFlags {
        let mut flags = ChangeFlags::default();
        if self.size_bytes != fresh.size_bytes {
            flags.insert(ChangeKind::SizeChanged);
            flags.insert(ChangeKind::Modified);
        }
        if self.modified != fresh.modified {
            flags.insert(ChangeKind::Modified);
        }
        if self.is_dir != fresh.is_dir || self.inode != fresh.inode {
            flags.insert(ChangeKind::MetadataChanged);
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Idle,
    Scanning,
    Updating,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStatistics {
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncrementalUpdateResult {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub events_processed: usize,
    pub fallback_checked: usize,
}

impl IncrementalUpdateResult {
    pub fn changed_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSummary {
    pub status: IndexStatus,
    pub entries: usize,
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
    pub pending_changes: usize,
    pub filter_bits: u64,
    pub filter_hashes: usize,
    pub filter_fill_ratio: f64,
    pub evictions_since_rebuild: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct IndexData {
    entries: HashMap<PathBuf, IndexEntry>,
    filter: BloomFilter,
    evictions: u64,
}

impl IndexData {
    fn upsert(&mut self, entry: IndexEntry) {
        if !self.entries.contains_key(&entry.path) {
            self.filter.add(&entry.path);
        }
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Drops the entry but leaves filter bits alone; other members may
    /// share them.
    fn evict(&mut self, path: &Path, rebuild_ratio: f64) -> bool {
        if self.entries.remove(path).is_none() {
            return false;
        }
        self.evictions += 1;
        let threshold = rebuild_ratio * self.entries.len() as f64;
        if self.evictions as f64 > threshold {
            self.rebuild_filter();
        }
        true
    }

    fn rebuild_filter(&mut self) {
        let mut filter = self.filter.empty_like();
        for path in self.entries.keys() {
            filter.add(path);
        }
        debug!(
            entries = self.entries.len(),
            evictions = self.evictions,
            "rebuilt membership filter"
        );
        self.filter = filter;
        self.evictions = 0;
    }

    fn sorted_entries(&self) -> Vec<IndexEntry> {
        let mut entries = self.entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }
}

#[derive(Debug)]
struct Activity {
    status: IndexStatus,
    active_updates: usize,
    last_error: Option<String>,
}

/// Persisted path map plus membership filter.
///
/// Full scans are exclusive: they hold `op_gate` for writing. Incremental
/// updates and queries share it for reading. Entry data sits behind its own
/// lock so concurrent updates only serialize on the actual mutation.
/// Saves to the store are serialized by `persist_lock`.
pub struct IncrementalIndex {
    config: IndexConfig,
    fs: Arc<dyn FileSystem>,
    store: Option<IndexStore>,
    cache_ttl: Duration,
    op_gate: RwLock<()>,
    scanning: AtomicBool,
    data: RwLock<IndexData>,
    persist_lock: Mutex<()>,
    pending: Mutex<VecDeque<ChangeEvent>>,
    activity: Mutex<Activity>,
}

impl std::fmt::Debug for IncrementalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalIndex")
            .field("store", &self.store)
            .field("status", &self.status())
            .finish()
    }
}

impl IncrementalIndex {
    /// An index that is never written to disk.
    pub fn in_memory(config: IndexConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        config.validate()?;
        let filter = BloomFilter::new(config.expected_elements, config.false_positive_rate)?;
        Ok(Self::assemble(config, fs, None, empty_data(filter)))
    }

    /// Load the index from its store; damaged files reset it to empty.
    pub fn open(config: IndexConfig, fs: Arc<dyn FileSystem>, store: IndexStore) -> Result<Self> {
        config.validate()?;
        let fresh = BloomFilter::new(config.expected_elements, config.false_positive_rate)?;

        let data = match store.load() {
            Ok(Some(stored)) => {
                let mut data = IndexData {
                    entries: stored
                        .entries
                        .into_iter()
                        .map(|entry| (entry.path.clone(), entry))
                        .collect(),
                    filter: stored.filter,
                    evictions: 0,
                };
                if data.filter.bit_count() != fresh.bit_count()
                    || data.filter.hash_count() != fresh.hash_count()
                {
                    info!("index filter dimensions changed, rebuilding from entries");
                    data.filter = fresh;
                    data.rebuild_filter();
                }
                info!(entries = data.entries.len(), "index loaded");
                data
            }
            Ok(None) => empty_data(fresh),
            Err(err) => {
                warn!(
                    error = %err,
                    directory = %store.directory().display(),
                    "index store unusable, starting empty"
                );
                if let Err(discard_err) = store.discard() {
                    warn!(error = %discard_err, "failed to discard damaged index files");
                }
                empty_data(fresh)
            }
        };

        Ok(Self::assemble(config, fs, Some(store), data))
    }

    fn assemble(
        config: IndexConfig,
        fs: Arc<dyn FileSystem>,
        store: Option<IndexStore>,
        data: IndexData,
    ) -> Self {
        Self {
            config,
            fs,
            store,
            cache_ttl: Duration::seconds(900),
            op_gate: RwLock::new(()),
            scanning: AtomicBool::new(false),
            data: RwLock::new(data),
            persist_lock: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            activity: Mutex::new(Activity {
                status: IndexStatus::Idle,
                active_updates: 0,
                last_error: None,
            }),
        }
    }

    /// Maximum age of an entry that may still answer tree-size lookups.
    pub fn with_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.cache_ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500));
        self
    }

    pub fn status(&self) -> IndexStatus {
        lock(&self.activity).status
    }

    /// Walk `roots` and replace every entry below them. Roots themselves are
    /// not indexed; directories are recorded with size 0.
    pub fn full_scan(
        &self,
        roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<IndexStatistics> {
        if self.scanning.swap(true, Ordering::AcqRel) {
            return Err(SweepError::OperationInProgress {
                operation: "index full scan",
            });
        }
        let _scanning = ScanFlagGuard(&self.scanning);
        let _gate = self.op_gate.write().unwrap_or_else(PoisonError::into_inner);
        self.set_status(IndexStatus::Scanning);

        let outcome = self.walk_roots(roots, cancel);
        match outcome {
            Ok((fresh, stats)) => {
                {
                    let mut data = write(&self.data);
                    data.entries
                        .retain(|path, _| !roots.iter().any(|root| path.starts_with(root)));
                    for entry in fresh {
                        data.entries.insert(entry.path.clone(), entry);
                    }
                    data.rebuild_filter();
                }
                self.persist_or_reset()?;
                self.set_status(IndexStatus::Idle);
                info!(
                    files = stats.files,
                    directories = stats.directories,
                    total_bytes = stats.total_bytes,
                    elapsed_ms = stats.elapsed_ms,
                    "index full scan complete"
                );
                Ok(stats)
            }
            Err(err) => {
                self.set_status(IndexStatus::Idle);
                Err(err)
            }
        }
    }

    fn walk_roots(
        &self,
        roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(Vec<IndexEntry>, IndexStatistics)> {
        let started = Instant::now();
        let now = Utc::now();
        let mut entries = Vec::new();
        let mut stats = IndexStatistics::default();
        let mut since_yield = 0_usize;

        for root in roots {
            for item in WalkDir::new(root).follow_links(false) {
                since_yield += 1;
                if since_yield >= self.config.yield_interval {
                    since_yield = 0;
                    std::thread::yield_now();
                    if cancel.is_cancelled() {
                        return Err(SweepError::Cancelled);
                    }
                }

                let entry = match item {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!(root = %root.display(), error = %err, "index walk error");
                        continue;
                    }
                };
                if entry.depth() == 0 {
                    continue;
                }
                let metadata = match entry.metadata() {
                    Ok(metadata) => FileMetadata::from_std(&metadata),
                    Err(err) => {
                        debug!(path = %entry.path().display(), error = %err, "index stat failed");
                        continue;
                    }
                };

                if metadata.is_dir {
                    stats.directories += 1;
                } else {
                    stats.files += 1;
                    stats.total_bytes = stats.total_bytes.saturating_add(metadata.size_bytes);
                }
                entries.push(IndexEntry::from_metadata(
                    entry.path().to_path_buf(),
                    &metadata,
                    now,
                ));
            }
        }

        if cancel.is_cancelled() {
            return Err(SweepError::Cancelled);
        }
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok((entries, stats))
    }

    pub fn enqueue_change(&self, event: ChangeEvent) {
        lock(&self.pending).push_back(event);
    }

    pub fn pending_changes(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Apply queued change events, then re-stat the least recently indexed
    /// entries to catch changes nobody reported.
    pub fn perform_incremental_update(&self) -> Result<IncrementalUpdateResult> {
        let _gate = self.op_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.begin_update();

        let events = std::mem::take(&mut *lock(&self.pending));
        let mut result = IncrementalUpdateResult {
            events_processed: events.len(),
            ..IncrementalUpdateResult::default()
        };
        let mut handled = HashSet::new();

        for event in events {
            if !handled.insert(event.path.clone()) {
                continue;
            }
            if event.flags.contains(ChangeKind::Deleted)
                && !event.flags.contains(ChangeKind::Created)
            {
                if write(&self.data).evict(&event.path, self.config.rebuild_threshold_ratio) {
                    result.removed.push(event.path);
                }
                continue;
            }
            self.refresh_path(&event.path, Some(&event.flags), &mut result);
        }

        let sample = self.fallback_sample(&handled);
        result.fallback_checked = sample.len();
        for path in sample {
            self.refresh_path(&path, None, &mut result);
        }

        let changed = !result.is_empty();
        let outcome = if changed { self.persist_or_reset() } else { Ok(()) };
        self.end_update();
        outcome?;

        debug!(
            added = result.added.len(),
            modified = result.modified.len(),
            removed = result.removed.len(),
            fallback_checked = result.fallback_checked,
            "incremental index update"
        );
        Ok(result)
    }

    fn refresh_path(
        &self,
        path: &Path,
        reported: Option<&ChangeFlags>,
        result: &mut IncrementalUpdateResult,
    ) {
        match self.fs.stat(path) {
            Ok(metadata) => {
                let mut fresh =
                    IndexEntry::from_metadata(path.to_path_buf(), &metadata, Utc::now());
                let mut data = write(&self.data);
                let previous = data
                    .entries
                    .get(path)
                    .map(|existing| (existing.diff(&fresh), existing.tree_size));
                match previous {
                    None => {
                        fresh.change_flags.insert(ChangeKind::Created);
                        data.upsert(fresh);
                        result.added.push(path.to_path_buf());
                    }
                    Some((mut flags, tree_size)) => {
                        fresh.tree_size = if flags.is_empty() { tree_size } else { None };
                        if let Some(reported) = reported {
                            if reported.contains(ChangeKind::Renamed) {
                                flags.insert(ChangeKind::Renamed);
                            }
                        }
                        let changed = !flags.is_empty();
                        fresh.change_flags = flags;
                        data.upsert(fresh);
                        if changed {
                            result.modified.push(path.to_path_buf());
                        }
                    }
                }
            }
            Err(err) if err.is_not_found() => {
                if write(&self.data).evict(path, self.config.rebuild_threshold_ratio) {
                    result.removed.push(path.to_path_buf());
                }
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "index refresh skipped");
            }
        }
    }

    fn fallback_sample(&self, exclude: &HashSet<PathBuf>) -> Vec<PathBuf> {
        if self.config.fallback_sample_size == 0 {
            return Vec::new();
        }
        let data = read(&self.data);
        // Refreshed entries move to the back, so repeated updates rotate
        // through the whole map.
        let mut stale = data
            .entries
            .values()
            .filter(|entry| !exclude.contains(&entry.path))
            .map(|entry| (entry.last_indexed, entry.path.clone()))
            .collect::<Vec<_>>();
        stale.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        stale.truncate(self.config.fallback_sample_size);
        stale.into_iter().map(|(_, path)| path).collect()
    }

    /// Fold scan observations into the index. Skipped while a full scan runs.
    pub fn record_observations(&self, observations: &[Observation]) -> Result<usize> {
        if observations.is_empty() {
            return Ok(0);
        }
        let Ok(_gate) = self.op_gate.try_read() else {
            debug!("index busy with a full scan, observations dropped");
            return Ok(0);
        };

        let now = Utc::now();
        {
            let mut data = write(&self.data);
            for observation in observations {
                let mut entry =
                    IndexEntry::from_metadata(observation.path.clone(), &observation.metadata, now);
                entry.tree_size = observation.tree_size;
                if let Some(existing) = data.entries.get(&entry.path) {
                    entry.change_flags = existing.diff(&entry);
                }
                data.upsert(entry);
            }
        }
        self.persist_or_reset()?;
        Ok(observations.len())
    }

    pub fn is_path_indexed(&self, path: &Path) -> bool {
        let _gate = self.op_gate.read().unwrap_or_else(PoisonError::into_inner);
        let data = read(&self.data);
        data.filter.contains(path) && data.entries.contains_key(path)
    }

    pub fn lookup(&self, path: &Path) -> Option<IndexEntry> {
        let _gate = self.op_gate.read().unwrap_or_else(PoisonError::into_inner);
        read(&self.data).entries.get(path).cloned()
    }

    pub fn summary(&self) -> IndexSummary {
        let _gate = self.op_gate.read().unwrap_or_else(PoisonError::into_inner);
        let data = read(&self.data);
        let (files, directories, total_bytes) =
            data.entries
                .values()
                .fold((0_u64, 0_u64, 0_u64), |(files, dirs, bytes), entry| {
                    if entry.is_dir {
                        (files, dirs + 1, bytes)
                    } else {
                        (files + 1, dirs, bytes.saturating_add(entry.size_bytes))
                    }
                });
        let activity = lock(&self.activity);
        IndexSummary {
            status: activity.status,
            entries: data.entries.len(),
            files,
            directories,
            total_bytes,
            pending_changes: self.pending_changes(),
            filter_bits: data.filter.bit_count(),
            filter_hashes: data.filter.hash_count(),
            filter_fill_ratio: data.filter.fill_ratio(),
            evictions_since_rebuild: data.evictions,
            last_error: activity.last_error.clone(),
        }
    }

    /// Rebuild the filter from the entry map, dropping residual bits.
    pub fn rebuild_filter(&self) {
        let _gate = self.op_gate.read().unwrap_or_else(PoisonError::into_inner);
        write(&self.data).rebuild_filter();
    }

    fn persist_or_reset(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _persisting = lock(&self.persist_lock);
        let saved = {
            let data = read(&self.data);
            store.save(&data.sorted_entries(), &data.filter)
        };
        let Err(err) = saved else {
            return Ok(());
        };

        warn!(error = %err, "index persistence failed, resetting to an empty index");
        {
            let mut activity = lock(&self.activity);
            activity.status = IndexStatus::Error;
            activity.last_error = Some(err.to_string());
        }
        {
            let mut data = write(&self.data);
            let filter = data.filter.empty_like();
            *data = empty_data(filter);
        }
        if let Err(discard_err) = store.discard() {
            warn!(error = %discard_err, "failed to discard index files after error");
        }
        lock(&self.activity).status = IndexStatus::Idle;
        Err(err)
    }

    fn set_status(&self, status: IndexStatus) {
        lock(&self.activity).status = status;
    }

    fn begin_update(&self) {
        let mut activity = lock(&self.activity);
        activity.active_updates += 1;
        activity.status = IndexStatus::Updating;
    }

    fn end_update(&self) {
        let mut activity = lock(&self.activity);
        activity.active_updates = activity.active_updates.saturating_sub(1);
        if activity.active_updates == 0 {
            activity.status = IndexStatus::Idle;
        }
    }
}

impl TreeSizeCache for IncrementalIndex {
    fn cached_tree_size(&self, path: &Path, modified: Option<DateTime<Utc>>) -> Option<u64> {
        let modified = modified?;
        let _gate = self.op_gate.try_read().ok()?;
        let data = read(&self.data);
        let entry = data.entries.get(path)?;
        let fresh = Utc::now().signed_duration_since(entry.last_indexed) <= self.cache_ttl;
        if entry.is_dir && entry.modified == Some(modified) && fresh {
            entry.tree_size
        } else {
            None
        }
    }
}

struct ScanFlagGuard<'a>(&'a AtomicBool);

impl Drop for ScanFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn empty_data(filter: BloomFilter) -> IndexData {
    IndexData {
        entries: HashMap::new(),
        filter,
        evictions: 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
