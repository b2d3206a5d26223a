use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::ScanConfig;
use crate::model::{CategorySet, ItemCategory};

/// Directory extensions treated as opaque bundles: never descended into.
const PACKAGE_BUNDLE_EXTENSIONS: &[&str] = &[
    "app",
    "bundle",
    "framework",
    "photoslibrary",
    "musiclibrary",
    "plugin",
    "kext",
    "xpc",
    "appex",
];

/// One inclusion rule of a scan task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPattern {
    /// Every regular file.
    AnyFile,
    /// File name equals the value exactly.
    Exact(String),
    /// `*.ext` style suffix, stored with its leading dot.
    Suffix(String),
    /// A directory with this name becomes a single item.
    DirectoryName(String),
    /// Generic glob matched against the file name.
    Glob(String),
}

impl ScanPattern {
    /// `name/` is a directory match, `*.ext` a suffix, anything else with
    /// glob metacharacters a glob, and the rest an exact name.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return ScanPattern::AnyFile;
        }
        if let Some(directory) = raw.strip_suffix('/') {
            return ScanPattern::DirectoryName(directory.to_string());
        }
        if let Some(suffix) = raw.strip_prefix("*.") {
            if !has_glob_metachar(suffix) {
                return ScanPattern::Suffix(format!(".{suffix}"));
            }
        }
        if has_glob_metachar(raw) {
            return ScanPattern::Glob(raw.to_string());
        }
        ScanPattern::Exact(raw.to_string())
    }
}

fn has_glob_metachar(value: &str) -> bool {
    value
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Walk the whole tree and emit every matching file or directory.
    Walk,
    /// Emit each direct child of the root as one item.
    TopLevelEntries,
}

#[derive(Debug, Clone)]
pub struct ScanTask {
    pub id: String,
    pub category: ItemCategory,
    pub roots: Vec<PathBuf>,
    pub patterns: Vec<ScanPattern>,
    pub mode: TaskMode,
    /// Directory names directly under a root that the walk never enters.
    pub prune: Vec<String>,
}

/// Compiled form of a task's patterns.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    any_file: bool,
    exact: HashSet<String>,
    suffixes: Vec<String>,
    directories: HashSet<String>,
    globs: Option<GlobSet>,
}

impl PatternMatcher {
    pub fn new(patterns: &[ScanPattern], warnings: &mut Vec<String>) -> Self {
        let mut matcher = PatternMatcher {
            any_file: false,
            exact: HashSet::new(),
            suffixes: Vec::new(),
            directories: HashSet::new(),
            globs: None,
        };
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0_usize;

        for pattern in patterns {
            match pattern {
                ScanPattern::AnyFile => matcher.any_file = true,
                ScanPattern::Exact(name) => {
                    matcher.exact.insert(name.to_lowercase());
                }
                ScanPattern::Suffix(suffix) => matcher.suffixes.push(suffix.to_lowercase()),
                ScanPattern::DirectoryName(name) => {
                    matcher.directories.insert(name.to_lowercase());
                }
                ScanPattern::Glob(raw) => match Glob::new(&raw.to_lowercase()) {
                    Ok(glob) => {
                        builder.add(glob);
                        glob_count += 1;
                    }
                    Err(err) => warnings.push(format!("invalid scan glob '{raw}': {err}")),
                },
            }
        }

        if glob_count > 0 {
            match builder.build() {
                Ok(set) => matcher.globs = Some(set),
                Err(err) => warnings.push(format!("failed to compile scan globs: {err}")),
            }
        }
        matcher
    }

    pub fn matches_file(&self, name: &str) -> bool {
        if self.any_file {
            return true;
        }
        let lowered = name.to_lowercase();
        if self.exact.contains(&lowered) {
            return true;
        }
        if self
            .suffixes
            .iter()
            .any(|suffix| lowered.ends_with(suffix.as_str()) && lowered.len() > suffix.len())
        {
            return true;
        }
        self.globs
            .as_ref()
            .is_some_and(|globs| globs.is_match(Path::new(&lowered)))
    }

    pub fn matches_directory(&self, name: &str) -> bool {
        self.directories.contains(&name.to_lowercase())
    }
}

pub fn is_package_bundle(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .is_some_and(|ext| PACKAGE_BUNDLE_EXTENSIONS.contains(&ext.as_str()))
}

struct CategoryRule {
    category: ItemCategory,
    home_roots: &'static [&'static str],
    patterns: &'static [&'static str],
    mode: TaskMode,
    prune: &'static [&'static str],
}

const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: ItemCategory::Cache,
        home_roots: &["Library/Caches", ".cache"],
        patterns: &["*"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Logs,
        home_roots: &["Library/Logs", ".local/state"],
        patterns: &["*.log", "*.log.*", "*.out"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Temporary,
        home_roots: &["Library/Caches/TemporaryItems"],
        patterns: &["*.tmp", "*.temp", "*.swp", "~*"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::NodeModules,
        home_roots: &[""],
        patterns: &["node_modules/"],
        mode: TaskMode::Walk,
        prune: &["Library", "Applications", "Pictures", "Music", "Movies"],
    },
    CategoryRule {
        category: ItemCategory::Xcode,
        home_roots: &[
            "Library/Developer/Xcode/DerivedData",
            "Library/Developer/Xcode/Archives",
            "Library/Developer/CoreSimulator/Caches",
        ],
        patterns: &["*"],
        mode: TaskMode::TopLevelEntries,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Brew,
        home_roots: &["Library/Caches/Homebrew", ".cache/Homebrew"],
        patterns: &["*"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Pip,
        home_roots: &["Library/Caches/pip", ".cache/pip"],
        patterns: &["*"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Trash,
        home_roots: &[".Trash", ".local/share/Trash/files"],
        patterns: &["*"],
        mode: TaskMode::TopLevelEntries,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Downloads,
        home_roots: &["Downloads"],
        patterns: &["*.dmg", "*.pkg", "*.zip", "*.tar.gz", "*.iso"],
        mode: TaskMode::Walk,
        prune: &[],
    },
    CategoryRule {
        category: ItemCategory::Duplicates,
        home_roots: &["Downloads", "Desktop", "Documents"],
        patterns: &["*"],
        mode: TaskMode::Walk,
        prune: &[],
    },
];

/// Expand a category request into independent scan tasks, one per root.
pub fn plan_tasks(categories: &CategorySet, config: &ScanConfig) -> Vec<ScanTask> {
    let home = config.resolved_home();
    let mut tasks = Vec::new();

    for category in categories.iter() {
        if category == ItemCategory::Other {
            for root in &config.extra_roots {
                push_task(&mut tasks, category, root.clone(), &["*"], TaskMode::Walk, &[]);
            }
            continue;
        }

        let Some(rule) = CATEGORY_RULES.iter().find(|rule| rule.category == category) else {
            continue;
        };

        let mut roots = Vec::new();
        if category == ItemCategory::Temporary {
            roots.push(config.resolved_temp());
        }
        if let Some(home) = &home {
            for relative in rule.home_roots {
                roots.push(if relative.is_empty() {
                    home.clone()
                } else {
                    home.join(relative)
                });
            }
        }

        let mut seen = HashSet::new();
        for root in roots {
            if seen.insert(root.clone()) {
                push_task(&mut tasks, category, root, rule.patterns, rule.mode, rule.prune);
            }
        }
    }
    tasks
}

fn push_task(
    tasks: &mut Vec<ScanTask>,
    category: ItemCategory,
    root: PathBuf,
    patterns: &[&str],
    mode: TaskMode,
    prune: &[&str],
) {
    tasks.push(ScanTask {
        id: format!("{}:{}", category.as_str(), tasks.len()),
        category,
        roots: vec![root],
        patterns: patterns.iter().map(|raw| ScanPattern::parse(raw)).collect(),
        mode,
        prune: prune.iter().map(|name| name.to_string()).collect(),
    });
}
