use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{Result, SweepError};

/// Metadata snapshot for one path, read without following symlinks.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub size_bytes: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub owner_uid: Option<u32>,
    pub mode: Option<u32>,
    pub readonly: bool,
    pub inode: Option<u64>,
}

impl FileMetadata {
    pub fn from_std(metadata: &fs::Metadata) -> Self {
        Self {
            size_bytes: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            modified: metadata.modified().ok().map(to_utc),
            accessed: metadata.accessed().ok().map(to_utc),
            created: metadata.created().ok().map(to_utc),
            owner_uid: owner_uid(metadata),
            mode: mode_bits(metadata),
            readonly: metadata.permissions().readonly(),
            inode: inode(metadata),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: FileMetadata,
}

/// File system primitives the pipeline is built on. Every call may block.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn stat(&self, path: &Path) -> Result<FileMetadata>;

    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Remove a file, a symlink, or a whole directory tree.
    fn remove(&self, path: &Path) -> Result<()>;

    fn read_symlink_target(&self, path: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn stat(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::symlink_metadata(path).map_err(|err| SweepError::io(path, err))?;
        Ok(FileMetadata::from_std(&metadata))
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let reader = fs::read_dir(path).map_err(|err| SweepError::io(path, err))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|err| SweepError::io(path, err))?;
            let entry_path = entry.path();
            match fs::symlink_metadata(&entry_path) {
                Ok(metadata) => entries.push(DirEntry {
                    path: entry_path,
                    metadata: FileMetadata::from_std(&metadata),
                }),
                // Raced with a removal; the entry no longer exists to report.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(SweepError::io(&entry_path, err)),
            }
        }
        Ok(entries)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let metadata = fs::symlink_metadata(path).map_err(|err| SweepError::io(path, err))?;
        let outcome = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        outcome.map_err(|err| SweepError::io(path, err))
    }

    fn read_symlink_target(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).map_err(|err| SweepError::io(path, err))
    }
}

pub fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Effective uid of this process, when the platform has one.
pub fn current_uid() -> Option<u32> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        Some(unsafe { libc::geteuid() })
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(unix)]
fn owner_uid(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.uid())
}

#[cfg(not(unix))]
fn owner_uid(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn mode_bits(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.mode())
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn inode(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode(_metadata: &fs::Metadata) -> Option<u64> {
    None
}
