use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};

pub const DUPLICATE_PHASE_BUDGET_RANGE: (u64, u64) = (20, 40);
pub const RISK_AUDIT_BUDGET_RANGE: (u64, u64) = (40, 90);
pub const EXPLANATION_BUDGET_RANGE: (u64, u64) = (20, 40);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub clean: CleanConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
}

impl SweepConfig {
    /// Read a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: SweepConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        self.clean.validate()?;
        self.index.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    #[serde(default = "default_workers")]
    pub parallelism: usize,
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_duplicate_budget_secs")]
    pub duplicate_budget_secs: u64,
    #[serde(default = "default_risk_audit_budget_secs")]
    pub risk_audit_budget_secs: u64,
    #[serde(default = "default_explanation_budget_secs")]
    pub explanation_budget_secs: u64,
    /// Overrides the home directory that category roots are resolved against.
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
    /// Overrides the system temp directory used by the temporary category.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Roots scanned by the `other` category.
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_true")]
    pub use_index_cache: bool,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            parallelism: default_workers(),
            timeout_secs: default_scan_timeout_secs(),
            duplicate_budget_secs: default_duplicate_budget_secs(),
            risk_audit_budget_secs: default_risk_audit_budget_secs(),
            explanation_budget_secs: default_explanation_budget_secs(),
            home_dir: None,
            temp_dir: None,
            extra_roots: Vec::new(),
            excludes: Vec::new(),
            max_depth: None,
            use_index_cache: true,
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(SweepError::InvalidConfig(
                "scan.parallelism must be greater than zero".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(SweepError::InvalidConfig(
                "scan.timeout_secs must be greater than zero".to_string(),
            ));
        }
        check_budget(
            "scan.duplicate_budget_secs",
            self.duplicate_budget_secs,
            DUPLICATE_PHASE_BUDGET_RANGE,
        )?;
        check_budget(
            "scan.risk_audit_budget_secs",
            self.risk_audit_budget_secs,
            RISK_AUDIT_BUDGET_RANGE,
        )?;
        check_budget(
            "scan.explanation_budget_secs",
            self.explanation_budget_secs,
            EXPLANATION_BUDGET_RANGE,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resolved_home(&self) -> Option<PathBuf> {
        self.home_dir.clone().or_else(dirs::home_dir)
    }

    pub fn resolved_temp(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn check_budget(field: &str, value: u64, (low, high): (u64, u64)) -> Result<()> {
    if (low..=high).contains(&value) {
        return Ok(());
    }
    Err(SweepError::InvalidConfig(format!(
        "{field} must be between {low} and {high} seconds (got {value})"
    )))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanConfig {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub auto_backup: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_category_timeout_secs")]
    pub category_timeout_secs: u64,
    #[serde(default = "default_clean_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            auto_backup: false,
            workers: default_workers(),
            category_timeout_secs: default_category_timeout_secs(),
            timeout_secs: default_clean_timeout_secs(),
            backup_timeout_secs: default_backup_timeout_secs(),
        }
    }
}

impl CleanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SweepError::InvalidConfig(
                "clean.workers must be greater than zero".to_string(),
            ));
        }
        if self.category_timeout_secs == 0 || self.timeout_secs == 0 {
            return Err(SweepError::InvalidConfig(
                "clean timeouts must be greater than zero".to_string(),
            ));
        }
        if self.auto_backup && self.backup_timeout_secs == 0 {
            return Err(SweepError::InvalidConfig(
                "clean.backup_timeout_secs must be greater than zero when auto_backup is on"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_expected_elements")]
    pub expected_elements: usize,
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
    #[serde(default = "default_yield_interval")]
    pub yield_interval: usize,
    #[serde(default = "default_fallback_sample_size")]
    pub fallback_sample_size: usize,
    #[serde(default = "default_rebuild_threshold_ratio")]
    pub rebuild_threshold_ratio: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: None,
            expected_elements: default_expected_elements(),
            false_positive_rate: default_false_positive_rate(),
            yield_interval: default_yield_interval(),
            fallback_sample_size: default_fallback_sample_size(),
            rebuild_threshold_ratio: default_rebuild_threshold_ratio(),
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expected_elements == 0 {
            return Err(SweepError::InvalidConfig(
                "index.expected_elements must be greater than zero".to_string(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(SweepError::InvalidConfig(
                "index.false_positive_rate must be within (0, 1)".to_string(),
            ));
        }
        if self.yield_interval == 0 {
            return Err(SweepError::InvalidConfig(
                "index.yield_interval must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rebuild_threshold_ratio) {
            return Err(SweepError::InvalidConfig(
                "index.rebuild_threshold_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Index directory, falling back to the per-user data directory.
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sweepkit")
                .join("index")
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecommendMode {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl RecommendMode {
    /// Minimum safety score for an item to land in the safe bucket.
    pub fn safe_threshold(self) -> u8 {
        match self {
            RecommendMode::Conservative => 85,
            RecommendMode::Balanced => 75,
            RecommendMode::Aggressive => 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendConfig {
    #[serde(default)]
    pub mode: RecommendMode,
    #[serde(default = "default_large_item_bytes")]
    pub large_item_bytes: u64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            mode: RecommendMode::default(),
            large_item_bytes: default_large_item_bytes(),
        }
    }
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_true() -> bool {
    true
}

fn default_scan_timeout_secs() -> u64 {
    600
}

fn default_duplicate_budget_secs() -> u64 {
    30
}

fn default_risk_audit_budget_secs() -> u64 {
    60
}

fn default_explanation_budget_secs() -> u64 {
    30
}

fn default_cache_ttl_seconds() -> u64 {
    900
}

fn default_category_timeout_secs() -> u64 {
    600
}

fn default_clean_timeout_secs() -> u64 {
    1800
}

fn default_backup_timeout_secs() -> u64 {
    120
}

fn default_expected_elements() -> usize {
    100_000
}

fn default_false_positive_rate() -> f64 {
    0.01
}

fn default_yield_interval() -> usize {
    1_000
}

fn default_fallback_sample_size() -> usize {
    64
}

fn default_rebuild_threshold_ratio() -> f64 {
    0.10
}

fn default_large_item_bytes() -> u64 {
    500 * 1024 * 1024
}
