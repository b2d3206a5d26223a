use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CleanableItem, DuplicateGroup, ItemCategory, RiskLevel};

/// A refined safety score for one item, keyed by item id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreAdjustment {
    pub item_id: String,
    pub safety_score: u8,
}

/// Refines heuristic safety scores once duplicate groups are known.
#[async_trait]
pub trait ScoreEnhancer: Send + Sync {
    async fn enhance(
        &self,
        items: &[CleanableItem],
        duplicates: &[DuplicateGroup],
    ) -> Result<Vec<ScoreAdjustment>>;
}

/// Produces a human readable explanation per item id.
#[async_trait]
pub trait ExplanationGenerator: Send + Sync {
    async fn explain(&self, items: &[CleanableItem]) -> Result<HashMap<String, String>>;
}

/// Recognizes paths owned by third-party tools, returning a tool name per item id.
#[async_trait]
pub trait ToolDetector: Send + Sync {
    async fn detect(&self, items: &[CleanableItem]) -> Result<HashMap<String, String>>;
}

const TOOL_MARKERS: &[(&str, &str)] = &[
    ("homebrew", "Homebrew"),
    ("/pip/", "pip"),
    ("node_modules", "npm"),
    ("/.npm/", "npm"),
    ("/yarn/", "Yarn"),
    ("deriveddata", "Xcode"),
    ("coresimulator", "Xcode"),
    ("/docker/", "Docker"),
    ("/.gradle/", "Gradle"),
    ("/.cargo/registry", "Cargo"),
];

/// Matches well-known tool directories by path fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathToolDetector;

#[async_trait]
impl ToolDetector for PathToolDetector {
    async fn detect(&self, items: &[CleanableItem]) -> Result<HashMap<String, String>> {
        let mut detected = HashMap::new();
        for item in items {
            let lowered = item.path.to_string_lossy().to_lowercase();
            if let Some((_, tool)) = TOOL_MARKERS
                .iter()
                .find(|(marker, _)| lowered.contains(marker))
            {
                detected.insert(item.id.clone(), (*tool).to_string());
            }
        }
        Ok(detected)
    }
}

/// Template explanations built from category, size, age and audit outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExplainer;

#[async_trait]
impl ExplanationGenerator for TemplateExplainer {
    async fn explain(&self, items: &[CleanableItem]) -> Result<HashMap<String, String>> {
        Ok(items
            .iter()
            .map(|item| (item.id.clone(), explain_item(item)))
            .collect())
    }
}

fn explain_item(item: &CleanableItem) -> String {
    let what = match item.category {
        ItemCategory::Cache => "Application cache data is rebuilt on demand",
        ItemCategory::Logs => "Log output is only needed for past troubleshooting",
        ItemCategory::Temporary => "Temporary files are not meant to outlive the program that made them",
        ItemCategory::NodeModules => "Installed npm dependencies can be restored with a package install",
        ItemCategory::Xcode => "Xcode build products and archives are regenerated by the next build",
        ItemCategory::Brew => "Homebrew keeps downloaded bottles it no longer needs",
        ItemCategory::Pip => "pip keeps downloaded wheels it can fetch again",
        ItemCategory::Trash => "Items in the trash were already discarded",
        ItemCategory::Downloads => "Installers and archives in Downloads are often kept after use",
        ItemCategory::Duplicates => "Another file with the same name and size exists",
        ItemCategory::Other => "File found under a configured extra root",
    };

    let mut text = format!("{what}. Reclaims {}.", human_bytes(item.size_bytes));
    if let Some(tool) = &item.detected_tool {
        text.push_str(&format!(" Managed by {tool}."));
    }
    match item.risk_level {
        Some(level) if level.is_high_or_worse() => {
            text.push_str(" Audit flagged this path; review before deleting.");
        }
        Some(RiskLevel::Medium) => text.push_str(" Audit found minor concerns."),
        _ => {}
    }
    text
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
