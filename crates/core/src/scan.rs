use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::{DirEntry as WalkEntry, WalkDir};

use crate::error::{Result, SweepError};
use crate::fs::FileMetadata;
use crate::model::{CleanableItem, ItemCategory};
use crate::tasks::{is_package_bundle, PatternMatcher, ScanTask, TaskMode};

/// Source of previously computed directory tree sizes.
pub trait TreeSizeCache: Send + Sync {
    /// Cached size of the tree at `path`, valid only while its mtime matches.
    fn cached_tree_size(&self, path: &Path, modified: Option<DateTime<Utc>>) -> Option<u64>;
}

/// One stat result a task saw, fed back into the index afterwards.
#[derive(Debug, Clone)]
pub struct Observation {
    pub path: PathBuf,
    pub metadata: FileMetadata,
    pub tree_size: Option<u64>,
}

#[derive(Clone)]
pub struct TaskContext {
    pub excludes: Arc<ExcludeMatcher>,
    pub max_depth: Option<usize>,
    pub cancel: CancellationToken,
    pub size_cache: Option<Arc<dyn TreeSizeCache>>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("max_depth", &self.max_depth)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("size_cache", &self.size_cache.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task_id: String,
    pub category: ItemCategory,
    pub items: Vec<CleanableItem>,
    pub observations: Vec<Observation>,
    pub scanned_entries: u64,
    pub cache_hits: u64,
    pub warnings: Vec<String>,
}

impl TaskOutput {
    fn new(task: &ScanTask) -> Self {
        Self {
            task_id: task.id.clone(),
            category: task.category,
            items: Vec::new(),
            observations: Vec::new(),
            scanned_entries: 0,
            cache_hits: 0,
            warnings: Vec::new(),
        }
    }
}

/// Execute one scan task synchronously. Missing roots yield no items.
pub fn run_task(task: &ScanTask, ctx: &TaskContext) -> Result<TaskOutput> {
    let mut output = TaskOutput::new(task);
    let matcher = PatternMatcher::new(&task.patterns, &mut output.warnings);

    for root in &task.roots {
        ensure_active(&ctx.cancel)?;
        if std::fs::symlink_metadata(root).is_err() {
            debug!(task = %task.id, root = %root.display(), "scan root missing, skipping");
            continue;
        }
        match task.mode {
            TaskMode::Walk => walk_root(task, root, &matcher, ctx, &mut output)?,
            TaskMode::TopLevelEntries => list_root(task, root, ctx, &mut output)?,
        }
    }

    debug!(
        task = %task.id,
        items = output.items.len(),
        scanned = output.scanned_entries,
        cache_hits = output.cache_hits,
        "scan task finished"
    );
    Ok(output)
}

fn walk_root(
    task: &ScanTask,
    root: &Path,
    matcher: &PatternMatcher,
    ctx: &TaskContext,
    output: &mut TaskOutput,
) -> Result<()> {
    let mut walker = WalkDir::new(root).follow_links(false);
    if let Some(depth) = ctx.max_depth {
        walker = walker.max_depth(depth);
    }
    let mut iter = walker
        .into_iter()
        .filter_entry(|entry| keep_entry(entry, task, &ctx.excludes));

    while let Some(item) = iter.next() {
        ensure_active(&ctx.cancel)?;
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                output
                    .warnings
                    .push(format!("walk error under {}: {}", root.display(), err));
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        output.scanned_entries += 1;

        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            if matcher.matches_directory(&name) {
                push_directory_item(task.category, entry.path(), ctx, output)?;
                iter.skip_current_dir();
            }
            continue;
        }
        if !entry.file_type().is_file() || !matcher.matches_file(&name) {
            continue;
        }
        push_file_item(task.category, entry.path(), output);
    }
    Ok(())
}

fn list_root(
    task: &ScanTask,
    root: &Path,
    ctx: &TaskContext,
    output: &mut TaskOutput,
) -> Result<()> {
    let reader = std::fs::read_dir(root).map_err(|err| SweepError::io(root, err))?;
    for entry in reader {
        ensure_active(&ctx.cancel)?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                output
                    .warnings
                    .push(format!("listing error under {}: {}", root.display(), err));
                continue;
            }
        };
        let path = entry.path();
        if is_hidden_name(&entry.file_name().to_string_lossy()) || ctx.excludes.is_excluded(&path) {
            continue;
        }
        output.scanned_entries += 1;
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => push_directory_item(task.category, &path, ctx, output)?,
            Ok(_) => push_file_item(task.category, &path, output),
            Err(err) => output
                .warnings
                .push(format!("file type unreadable for {}: {}", path.display(), err)),
        }
    }
    Ok(())
}

fn keep_entry(entry: &WalkEntry, task: &ScanTask, excludes: &ExcludeMatcher) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if is_hidden_name(&name) || excludes.is_excluded(entry.path()) {
        return false;
    }
    if entry.file_type().is_dir() {
        if is_package_bundle(entry.path()) {
            return false;
        }
        if entry.depth() == 1 && task.prune.iter().any(|pruned| pruned.as_str() == name) {
            return false;
        }
    }
    true
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

fn push_file_item(category: ItemCategory, path: &Path, output: &mut TaskOutput) {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => FileMetadata::from_std(&metadata),
        Err(err) => {
            output
                .warnings
                .push(format!("metadata read failed for {}: {}", path.display(), err));
            return;
        }
    };
    output.items.push(
        CleanableItem::new(path.to_path_buf(), category, metadata.size_bytes)
            .with_times(metadata.modified, metadata.accessed),
    );
    output.observations.push(Observation {
        path: path.to_path_buf(),
        metadata,
        tree_size: None,
    });
}

fn push_directory_item(
    category: ItemCategory,
    path: &Path,
    ctx: &TaskContext,
    output: &mut TaskOutput,
) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => FileMetadata::from_std(&metadata),
        Err(err) => {
            output
                .warnings
                .push(format!("metadata read failed for {}: {}", path.display(), err));
            return Ok(());
        }
    };

    let cached = ctx
        .size_cache
        .as_ref()
        .and_then(|cache| cache.cached_tree_size(path, metadata.modified));
    let size = match cached {
        Some(size) => {
            output.cache_hits += 1;
            size
        }
        None => tree_size(path, &ctx.cancel, output)?,
    };

    output.items.push(
        CleanableItem::new(path.to_path_buf(), category, size)
            .with_times(metadata.modified, metadata.accessed),
    );
    output.observations.push(Observation {
        path: path.to_path_buf(),
        metadata,
        tree_size: Some(size),
    });
    Ok(())
}

/// Sum of regular file sizes below `path`, symlinks not followed.
fn tree_size(path: &Path, cancel: &CancellationToken, output: &mut TaskOutput) -> Result<u64> {
    let mut total = 0_u64;
    for item in WalkDir::new(path).follow_links(false) {
        ensure_active(cancel)?;
        let Ok(entry) = item else {
            continue;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        output.scanned_entries += 1;
        if let Ok(metadata) = entry.metadata() {
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SweepError::Cancelled);
    }
    Ok(())
}

/// User supplied exclusions: globs, or plain case-insensitive substrings.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    globset: Option<GlobSet>,
    substrings: Vec<String>,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String], warnings: &mut Vec<String>) -> Self {
        if patterns.is_empty() {
            return Self::default();
        }

        let mut builder = GlobSetBuilder::new();
        let mut substrings = Vec::new();
        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }

            if is_plain_substring_pattern(pattern) {
                substrings.push(pattern.to_lowercase());
                continue;
            }

            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    warnings.push(format!(
                        "invalid exclude glob '{pattern}': {err}; using substring fallback."
                    ));
                    substrings.push(pattern.to_lowercase());
                }
            }
        }

        let globset = match builder.build() {
            Ok(set) => Some(set),
            Err(err) => {
                warnings.push(format!(
                    "failed to compile exclude glob set: {err}; glob excludes disabled."
                ));
                None
            }
        };

        Self {
            globset,
            substrings,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.globset.as_ref().is_some_and(|set| set.is_match(path)) {
            return true;
        }
        if self.substrings.is_empty() {
            return false;
        }
        let lowered = path.to_string_lossy().to_lowercase();
        self.substrings
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }
}

fn is_plain_substring_pattern(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}
