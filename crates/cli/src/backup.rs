use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sweepkit_core::{BackupService, CleanableItem, Result, SnapshotDescriptor, SweepError};
use tracing::info;
use walkdir::WalkDir;

/// Copies items under `<root>/<snapshot id>/` before they are removed.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    root: PathBuf,
}

impl DirectoryBackup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BackupService for DirectoryBackup {
    async fn create_snapshot(
        &self,
        items: &[CleanableItem],
        descriptor: &SnapshotDescriptor,
    ) -> Result<String> {
        let target = self.root.join(&descriptor.id);
        let sources = items.iter().map(|item| item.path.clone()).collect::<Vec<_>>();
        let manifest = serde_json::to_vec_pretty(descriptor)
            .map_err(|err| SweepError::BackupFailed(format!("manifest encoding failed: {err}")))?;

        let copy_target = target.clone();
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            fs::create_dir_all(&copy_target).map_err(|err| SweepError::io(&copy_target, err))?;
            let mut copied = 0_u64;
            for source in &sources {
                if !source.exists() {
                    continue;
                }
                copied = copied.saturating_add(copy_tree(source, &copy_target)?);
            }
            let manifest_path = copy_target.join("manifest.json");
            fs::write(&manifest_path, manifest)
                .map_err(|err| SweepError::io(&manifest_path, err))?;
            Ok(copied)
        })
        .await
        .map_err(|err| SweepError::BackupFailed(format!("backup task failed: {err}")))??;

        info!(
            snapshot = %descriptor.id,
            category = %descriptor.category,
            files = copied,
            target = %target.display(),
            "snapshot written"
        );
        Ok(descriptor.id.clone())
    }
}

/// Copy a file or directory tree, mirroring its absolute path under `target`.
fn copy_tree(source: &Path, target: &Path) -> Result<u64> {
    let mut copied = 0_u64;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|err| {
            SweepError::BackupFailed(format!("cannot read {}: {err}", source.display()))
        })?;
        let destination = target.join(relative_to_root(entry.path()));
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination).map_err(|err| SweepError::io(&destination, err))?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SweepError::io(parent, err))?;
        }
        fs::copy(entry.path(), &destination).map_err(|err| SweepError::io(entry.path(), err))?;
        copied += 1;
    }
    Ok(copied)
}

fn relative_to_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}
