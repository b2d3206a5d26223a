use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tracing::debug;

/// Paths held open by running processes, captured once per audit pass.
///
/// Only Linux exposes open descriptors without elevated tooling; elsewhere
/// the snapshot is unavailable and the active-usage check abstains.
#[derive(Debug, Clone, Default)]
pub struct OpenFileSnapshot {
    paths: HashSet<PathBuf>,
    available: bool,
}

impl OpenFileSnapshot {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            available: true,
        }
    }

    pub fn capture() -> Self {
        if !cfg!(target_os = "linux") {
            return Self::unavailable();
        }

        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        let mut paths = HashSet::new();
        let mut unreadable = 0_u64;
        for pid in system.processes().keys() {
            let fd_dir = PathBuf::from(format!("/proc/{}/fd", pid.as_u32()));
            let Ok(reader) = std::fs::read_dir(&fd_dir) else {
                unreadable += 1;
                continue;
            };
            for entry in reader.flatten() {
                if let Ok(target) = std::fs::read_link(entry.path()) {
                    if target.is_absolute() {
                        paths.insert(target);
                    }
                }
            }
        }
        debug!(
            open_paths = paths.len(),
            unreadable_processes = unreadable,
            "captured open file snapshot"
        );

        Self {
            paths,
            available: true,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// `None` when no snapshot could be taken.
    pub fn is_open(&self, path: &Path) -> Option<bool> {
        if !self.available {
            return None;
        }
        Some(self.paths.contains(path))
    }

    /// Whether `path` itself or anything beneath it is held open.
    pub fn holds_open(&self, path: &Path) -> Option<bool> {
        if !self.available {
            return None;
        }
        Some(self.paths.iter().any(|open| open.starts_with(path)))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
