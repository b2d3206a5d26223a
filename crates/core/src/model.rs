use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RESULTS_VERSION: &str = "1.0.0";

/// Safety score ceiling applied to anything the risk audit rates high or critical.
pub const HIGH_RISK_SAFETY_CEILING: u8 = 25;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Cache,
    Logs,
    Temporary,
    NodeModules,
    Xcode,
    Brew,
    Pip,
    Trash,
    Downloads,
    Duplicates,
    Other,
}

impl ItemCategory {
    pub const ALL: [ItemCategory; 11] = [
        ItemCategory::Cache,
        ItemCategory::Logs,
        ItemCategory::Temporary,
        ItemCategory::NodeModules,
        ItemCategory::Xcode,
        ItemCategory::Brew,
        ItemCategory::Pip,
        ItemCategory::Trash,
        ItemCategory::Downloads,
        ItemCategory::Duplicates,
        ItemCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemCategory::Cache => "cache",
            ItemCategory::Logs => "logs",
            ItemCategory::Temporary => "temporary",
            ItemCategory::NodeModules => "node_modules",
            ItemCategory::Xcode => "xcode",
            ItemCategory::Brew => "brew",
            ItemCategory::Pip => "pip",
            ItemCategory::Trash => "trash",
            ItemCategory::Downloads => "downloads",
            ItemCategory::Duplicates => "duplicates",
            ItemCategory::Other => "other",
        }
    }

    /// Starting safety score before any enrichment or audit.
    pub fn baseline_safety(self) -> u8 {
        match self {
            ItemCategory::Trash => 95,
            ItemCategory::Temporary => 90,
            ItemCategory::Logs | ItemCategory::Brew | ItemCategory::Pip => 85,
            ItemCategory::Cache | ItemCategory::Xcode => 80,
            ItemCategory::NodeModules => 75,
            ItemCategory::Downloads | ItemCategory::Other => 50,
            ItemCategory::Duplicates => 40,
        }
    }
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        ItemCategory::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| format!("unknown category '{value}'"))
    }
}

/// A set of requested categories. Membership is an explicit set lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CategorySet(BTreeSet<ItemCategory>);

impl CategorySet {
    pub fn all() -> Self {
        ItemCategory::ALL.iter().copied().collect()
    }

    pub fn insert(&mut self, category: ItemCategory) -> bool {
        self.0.insert(category)
    }

    pub fn contains(&self, category: ItemCategory) -> bool {
        self.0.contains(&category)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ItemCategory> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ItemCategory> for CategorySet {
    fn from_iter<I: IntoIterator<Item = ItemCategory>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One scan-discovered candidate for deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanableItem {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub category: ItemCategory,
    pub size_bytes: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accessed: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "clamped_safety_score")]
    safety_score: u8,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    /// Third-party tool that owns this path, when one was recognized.
    #[serde(default)]
    pub detected_tool: Option<String>,
}

impl CleanableItem {
    pub fn new(path: PathBuf, category: ItemCategory, size_bytes: u64) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            path,
            name,
            category,
            size_bytes,
            modified: None,
            accessed: None,
            safety_score: category.baseline_safety(),
            risk_level: None,
            warning: None,
            explanation: None,
            detected_tool: None,
        }
    }

    pub fn with_times(
        mut self,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> Self {
        self.modified = modified;
        self.accessed = accessed;
        self
    }

    pub fn safety_score(&self) -> u8 {
        self.safety_score
    }

    pub fn set_safety_score(&mut self, score: u8) {
        self.safety_score = score.min(100);
    }

    /// Lower the safety score to at most `ceiling`; never raises it.
    pub fn cap_safety_score(&mut self, ceiling: u8) {
        self.safety_score = self.safety_score.min(ceiling);
    }

    /// Record an audit outcome: high and critical findings cap the safety
    /// score and attach the audit message as a warning.
    pub fn apply_assessment(&mut self, assessment: &RiskAssessment) {
        self.risk_level = Some(assessment.level);
        if assessment.level.is_high_or_worse() {
            self.cap_safety_score(HIGH_RISK_SAFETY_CEILING);
            let message = assessment
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?} risk detected", assessment.level));
            self.warning = Some(message);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn clamped_safety_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = u64::deserialize(deserializer)?;
    Ok(raw.min(100) as u8)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => RiskLevel::Critical,
            70..=89 => RiskLevel::High,
            40..=69 => RiskLevel::Medium,
            20..=39 => RiskLevel::Low,
            _ => RiskLevel::Minimal,
        }
    }

    pub fn weight(self) -> u8 {
        match self {
            RiskLevel::Critical => 100,
            RiskLevel::High => 75,
            RiskLevel::Medium => 50,
            RiskLevel::Low => 25,
            RiskLevel::Minimal => 0,
        }
    }

    pub fn is_high_or_worse(self) -> bool {
        self >= RiskLevel::High
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub path: PathBuf,
    pub level: RiskLevel,
    pub score: u8,
    pub message: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRiskAssessment {
    pub item_count: usize,
    pub aggregate_score: u64,
    pub level: RiskLevel,
    pub highest_item_level: RiskLevel,
    pub penalties: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    pub name: String,
    pub size_bytes: u64,
    pub paths: Vec<PathBuf>,
    pub wasted_bytes: u64,
    /// Paths carry backup or snapshot markers; the copies may be deliberate.
    #[serde(default)]
    pub likely_intentional: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Planning,
    Walking,
    Duplicates,
    RiskAudit,
    Explanations,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    Degraded,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseReport {
    pub phase: ScanPhase,
    pub outcome: PhaseOutcome,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanResults {
    pub results_version: String,
    pub scan_id: String,
    pub started_at: DateTime<Utc>,
    pub categories: CategorySet,
    pub items: Vec<CleanableItem>,
    #[serde(default)]
    pub duplicates: Vec<DuplicateGroup>,
    pub tasks_planned: u64,
    pub tasks_completed: u64,
    pub total_size_bytes: u64,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub phases: Vec<PhaseReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ScanResults {
    pub fn item(&self, id: &str) -> Option<&CleanableItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    PermissionDenied,
    VerificationFailed,
    Timeout,
    Cancelled,
    Io(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PermissionDenied => f.write_str("permission denied"),
            FailureReason::VerificationFailed => f.write_str("path still present after removal"),
            FailureReason::Timeout => f.write_str("category deletion timed out"),
            FailureReason::Cancelled => f.write_str("cancelled before removal"),
            FailureReason::Io(detail) => write!(f, "io error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub item: CleanableItem,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanResult {
    pub deleted_items: Vec<CleanableItem>,
    pub failed_items: Vec<FailedItem>,
    pub freed_space: u64,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(default)]
    pub snapshot_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub rationale: String,
    #[serde(default = "default_recommendation_confidence")]
    pub confidence: f32,
    pub item_ids: Vec<String>,
    #[serde(default = "default_policy_safe")]
    pub policy_safe: bool,
    #[serde(default)]
    pub policy_rules_applied: Vec<String>,
    #[serde(default)]
    pub policy_rules_blocked: Vec<String>,
    pub estimated_impact: EstimatedImpact,
    pub risk_level: RiskLevel,
}

fn default_recommendation_confidence() -> f32 {
    0.5
}

fn default_policy_safe() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimatedImpact {
    pub space_saving_bytes: u64,
    pub item_count: u64,
    pub risk_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecision {
    pub policy_id: String,
    pub recommendation_id: String,
    pub action: PolicyAction,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    #[default]
    Allowed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTrace {
    pub rule_id: String,
    pub status: RuleTraceStatus,
    pub detail: String,
    pub recommendation_id: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleTraceStatus {
    Emitted,
    #[default]
    Skipped,
    Rejected,
}
