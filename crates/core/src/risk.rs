use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;

use crate::activity::OpenFileSnapshot;
use crate::error::Result;
use crate::fs::{current_uid, FileMetadata, FileSystem, LocalFileSystem};
use crate::model::{BatchRiskAssessment, CleanableItem, RiskAssessment, RiskLevel};

const CRITICAL_SYSTEM_PREFIXES: &[&str] = &[
    "/System",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/lib",
    "/usr/libexec",
    "/etc",
    "/private/etc",
    "/private/var/db",
    "/Library/Keychains",
    "/Library/LaunchDaemons",
    "/Library/LaunchAgents",
    "/Library/Extensions",
    "/Library/Security",
    "/boot",
    "/proc",
    "/sys",
    "/dev",
];

const CRITICAL_HOME_PREFIXES: &[&str] = &["Library/Keychains", "Library/LaunchAgents"];

const PERSONAL_HOME_PREFIXES: &[&str] = &[
    "Documents",
    "Desktop",
    "Pictures",
    "Movies",
    "Music",
    "Library/Mail",
    "Library/Messages",
    "Library/Mobile Documents",
];

const CREDENTIAL_DIRECTORIES: &[&str] = &[".ssh", ".gnupg", ".aws", ".kube", ".password-store"];

const SENSITIVE_NAME_PATTERNS: &[&str] = &[
    "*.key",
    "*.pem",
    "*.p12",
    "*.pfx",
    "*.keychain",
    "*.keychain-db",
    "*.gpg",
    "*.kdbx",
    "*.ovpn",
    "id_*",
    "credentials",
    ".netrc",
    ".pgpass",
];

const SCORE_CRITICAL_PATH: u8 = 100;
const SCORE_PERSONAL_DATA: u8 = 75;
const SCORE_SENSITIVE_NAME: u8 = 80;
const SCORE_PRIVILEGED_OWNER: u8 = 70;
const SCORE_READ_ONLY: u8 = 40;
const SCORE_OWNERSHIP_UNREADABLE: u8 = 50;
const SCORE_OPEN_FILE: u8 = 85;
const SCORE_SYMLINK_TO_CRITICAL: u8 = 95;
const SCORE_SYMLINK_SUSPICIOUS: u8 = 65;
const SCORE_INTEGRITY_UNREADABLE: u8 = 45;
const SCORE_RECENT: u8 = 20;
const SCORE_STALE: u8 = 10;

const RECENT_DAYS: i64 = 7;
const STALE_DAYS: i64 = 365;

const LARGE_BATCH_ITEMS: usize = 100;
const LARGE_BATCH_PENALTY: u64 = 20;
const SYSTEM_LIBRARY_PENALTY: u64 = 30;

static SENSITIVE_NAMES: Lazy<GlobSet> = Lazy::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in SENSITIVE_NAME_PATTERNS {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
});

#[derive(Debug, Clone)]
struct Finding {
    check: &'static str,
    score: u8,
    message: String,
}

/// Rates how dangerous it would be to delete a path.
///
/// Every check runs independently and either abstains or reports a partial
/// score; the final score is the maximum over the checks that fired. The
/// engine holds no mutable state and can be shared across threads.
#[derive(Clone)]
pub struct RiskEngine {
    fs: Arc<dyn FileSystem>,
    home: Option<PathBuf>,
    open_files: Arc<OpenFileSnapshot>,
    uid: Option<u32>,
    now: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("home", &self.home)
            .field("open_files", &self.open_files.len())
            .field("uid", &self.uid)
            .finish()
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new(Arc::new(LocalFileSystem), dirs::home_dir())
    }
}

impl RiskEngine {
    pub fn new(fs: Arc<dyn FileSystem>, home: Option<PathBuf>) -> Self {
        Self {
            fs,
            home,
            open_files: Arc::new(OpenFileSnapshot::unavailable()),
            uid: current_uid(),
            now: None,
        }
    }

    pub fn with_open_files(mut self, snapshot: OpenFileSnapshot) -> Self {
        self.open_files = Arc::new(snapshot);
        self
    }

    /// Evaluate the age heuristic against a fixed instant instead of the clock.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_uid(mut self, uid: Option<u32>) -> Self {
        self.uid = uid;
        self
    }

    pub fn audit(&self, path: &Path) -> RiskAssessment {
        let metadata = self.fs.stat(path);
        let mut findings = Vec::new();

        findings.extend(self.critical_system_path(path));
        findings.extend(self.important_user_data(path));
        findings.extend(sensitive_filename(path));
        findings.extend(self.ownership(&metadata));
        findings.extend(self.active_usage(path));
        findings.extend(self.integrity(path, &metadata));
        findings.extend(self.age(&metadata));

        let top = findings.iter().max_by_key(|finding| finding.score);
        let score = top.map(|finding| finding.score).unwrap_or(0);
        let message = top.map(|finding| finding.message.clone());
        let details = findings
            .iter()
            .map(|finding| {
                (
                    finding.check.to_string(),
                    format!("{}: {}", finding.score, finding.message),
                )
            })
            .collect::<BTreeMap<_, _>>();

        RiskAssessment {
            path: path.to_path_buf(),
            level: RiskLevel::from_score(score),
            score,
            message,
            details,
        }
    }

    /// Advisory aggregate over a selection; never used to gate single items.
    pub fn audit_batch(&self, items: &[CleanableItem]) -> BatchRiskAssessment {
        let mut aggregate = 0_u64;
        let mut highest = RiskLevel::Minimal;
        let mut touches_system_library = false;

        for item in items {
            let assessment = self.audit(&item.path);
            aggregate = aggregate.saturating_add(u64::from(assessment.score));
            highest = highest.max(assessment.level);
            touches_system_library |= is_system_library(&item.path);
        }

        let mut penalties = Vec::new();
        if items.len() > LARGE_BATCH_ITEMS {
            aggregate = aggregate.saturating_add(LARGE_BATCH_PENALTY);
            penalties.push(format!(
                "batch of {} items exceeds {LARGE_BATCH_ITEMS}",
                items.len()
            ));
        }
        if touches_system_library {
            aggregate = aggregate.saturating_add(SYSTEM_LIBRARY_PENALTY);
            penalties.push("batch touches System or Library locations".to_string());
        }

        BatchRiskAssessment {
            item_count: items.len(),
            aggregate_score: aggregate,
            level: RiskLevel::from_score(aggregate.min(100) as u8),
            highest_item_level: highest,
            penalties,
        }
    }

    /// The deny-listed prefix containing `path`, if any.
    pub fn critical_prefix(&self, path: &Path) -> Option<PathBuf> {
        let system = CRITICAL_SYSTEM_PREFIXES
            .iter()
            .map(PathBuf::from)
            .find(|prefix| path.starts_with(prefix));
        if system.is_some() {
            return system;
        }
        let home = self.home.as_ref()?;
        CRITICAL_HOME_PREFIXES
            .iter()
            .map(|relative| home.join(relative))
            .find(|prefix| path.starts_with(prefix))
    }

    fn critical_system_path(&self, path: &Path) -> Option<Finding> {
        let prefix = self.critical_prefix(path)?;
        Some(Finding {
            check: "critical_system_path",
            score: SCORE_CRITICAL_PATH,
            message: format!("inside protected system location {}", prefix.display()),
        })
    }

    fn important_user_data(&self, path: &Path) -> Option<Finding> {
        if let Some(home) = &self.home {
            if let Some(prefix) = PERSONAL_HOME_PREFIXES
                .iter()
                .map(|relative| home.join(relative))
                .find(|prefix| path.starts_with(prefix))
            {
                return Some(Finding {
                    check: "important_user_data",
                    score: SCORE_PERSONAL_DATA,
                    message: format!("inside personal data folder {}", prefix.display()),
                });
            }
        }

        let credential_dir = path.components().find_map(|component| match component {
            Component::Normal(name) => CREDENTIAL_DIRECTORIES
                .iter()
                .find(|dir| name == std::ffi::OsStr::new(dir)),
            _ => None,
        })?;
        Some(Finding {
            check: "important_user_data",
            score: SCORE_PERSONAL_DATA,
            message: format!("inside credential directory {credential_dir}"),
        })
    }

    fn ownership(&self, metadata: &Result<FileMetadata>) -> Option<Finding> {
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(err) => {
                return Some(Finding {
                    check: "ownership",
                    score: SCORE_OWNERSHIP_UNREADABLE,
                    message: format!("attributes unreadable: {err}"),
                })
            }
        };

        let running_as_root = self.uid == Some(0);
        if metadata.owner_uid == Some(0) && !running_as_root {
            return Some(Finding {
                check: "ownership",
                score: SCORE_PRIVILEGED_OWNER,
                message: "owned by a privileged account".to_string(),
            });
        }

        if !running_as_root && self.is_read_only_for_user(metadata) {
            return Some(Finding {
                check: "ownership",
                score: SCORE_READ_ONLY,
                message: "read-only for the current user".to_string(),
            });
        }
        None
    }

    fn is_read_only_for_user(&self, metadata: &FileMetadata) -> bool {
        match (metadata.mode, metadata.owner_uid, self.uid) {
            (Some(mode), Some(owner), Some(uid)) if owner == uid => mode & 0o200 == 0,
            (Some(mode), Some(_), Some(_)) => mode & 0o002 == 0,
            _ => metadata.readonly,
        }
    }

    fn active_usage(&self, path: &Path) -> Option<Finding> {
        let open = match self.open_files.holds_open(path)? {
            true => true,
            false => path
                .canonicalize()
                .ok()
                .and_then(|canonical| self.open_files.holds_open(&canonical))
                .unwrap_or(false),
        };
        open.then(|| Finding {
            check: "active_usage",
            score: SCORE_OPEN_FILE,
            message: "currently held open by another process".to_string(),
        })
    }

    fn integrity(&self, path: &Path, metadata: &Result<FileMetadata>) -> Option<Finding> {
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(_) => {
                return Some(Finding {
                    check: "integrity",
                    score: SCORE_INTEGRITY_UNREADABLE,
                    message: "attributes unreadable; cannot verify link safety".to_string(),
                })
            }
        };
        if !metadata.is_symlink {
            return None;
        }

        let target = match self.fs.read_symlink_target(path) {
            Ok(target) => target,
            Err(_) => {
                return Some(Finding {
                    check: "integrity",
                    score: SCORE_INTEGRITY_UNREADABLE,
                    message: "symlink target unreadable".to_string(),
                })
            }
        };

        let resolved = if target.is_absolute() {
            target.clone()
        } else {
            path.parent()
                .map(|parent| parent.join(&target))
                .unwrap_or_else(|| target.clone())
        };
        let resolved = normalize_lexically(&resolved);

        if let Some(prefix) = self.critical_prefix(&resolved) {
            return Some(Finding {
                check: "integrity",
                score: SCORE_SYMLINK_TO_CRITICAL,
                message: format!(
                    "symlink resolves into protected location {}",
                    prefix.display()
                ),
            });
        }

        if is_suspicious_target(&target) {
            return Some(Finding {
                check: "integrity",
                score: SCORE_SYMLINK_SUSPICIOUS,
                message: format!("symlink target looks suspicious: {}", target.display()),
            });
        }
        None
    }

    fn age(&self, metadata: &Result<FileMetadata>) -> Option<Finding> {
        let modified = metadata.as_ref().ok()?.modified?;
        let now = self.now.unwrap_or_else(Utc::now);
        if modified >= now - Duration::days(RECENT_DAYS) {
            return Some(Finding {
                check: "age",
                score: SCORE_RECENT,
                message: format!("modified within the last {RECENT_DAYS} days"),
            });
        }
        if modified < now - Duration::days(STALE_DAYS) {
            return Some(Finding {
                check: "age",
                score: SCORE_STALE,
                message: format!("untouched for more than {STALE_DAYS} days"),
            });
        }
        None
    }
}

fn sensitive_filename(path: &Path) -> Option<Finding> {
    let name = path.file_name()?;
    if !SENSITIVE_NAMES.is_match(Path::new(name)) {
        return None;
    }
    Some(Finding {
        check: "sensitive_filename",
        score: SCORE_SENSITIVE_NAME,
        message: format!(
            "filename {} matches a key or credential pattern",
            name.to_string_lossy()
        ),
    })
}

fn is_system_library(path: &Path) -> bool {
    path.starts_with("/System") || path.starts_with("/Library")
}

fn is_suspicious_target(target: &Path) -> bool {
    let mut components = target.components();
    if target
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return true;
    }
    if target.starts_with("/private") || target.starts_with("/var/root") {
        return true;
    }
    // A hidden entry directly under the root, such as /.vol or /.fseventsd.
    matches!(
        (components.next(), components.next()),
        (Some(Component::RootDir), Some(Component::Normal(name)))
            if name.to_string_lossy().starts_with('.')
    )
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
