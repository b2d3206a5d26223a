use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::CleanResult;

pub type Result<T> = std::result::Result<T, SweepError>;

/// Errors surfaced by the scan, score, and clean pipeline.
///
/// Item-level problems (a single path that cannot be removed, a file that
/// vanished mid-scan) are recorded in result structures instead; a value of
/// this type always means the owning call as a whole did not complete.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("{operation} already in progress; retry once it finishes")]
    OperationInProgress { operation: &'static str },

    #[error("{phase} timed out after {}s", .after.as_secs())]
    Timeout { phase: String, after: Duration },

    /// The whole clean call ran out of time; `partial` holds what was
    /// removed and the items left untouched.
    #[error(
        "clean timed out after {}s with {} item(s) already removed",
        .after.as_secs(),
        .partial.deleted_items.len()
    )]
    CleanTimedOut {
        after: Duration,
        partial: Box<CleanResult>,
    },

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SweepError {
    /// Map an io error at `path` onto the per-item taxonomy where one applies.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::PathNotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io { path, source },
        }
    }

    pub fn timeout(phase: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            phase: phase.into(),
            after,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound(_))
    }

    /// Items a timed-out clean managed to process before giving up.
    pub fn partial_clean(&self) -> Option<&CleanResult> {
        match self {
            Self::CleanTimedOut { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;

    use super::SweepError;

    #[test]
    fn io_errors_map_onto_item_taxonomy() {
        let missing = SweepError::io(Path::new("/nope"), io::Error::from(io::ErrorKind::NotFound));
        assert!(missing.is_not_found());

        let denied = SweepError::io(
            Path::new("/root/secret"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(denied, SweepError::PermissionDenied(_)));

        let other = SweepError::io(Path::new("/x"), io::Error::other("disk on fire"));
        assert!(matches!(other, SweepError::Io { .. }));
    }
}
