use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{RecommendConfig, RecommendMode};
use crate::enrich::human_bytes;
use crate::model::{
    CleanableItem, EstimatedImpact, ItemCategory, PolicyDecision, Recommendation, RiskLevel,
    RuleTrace, RuleTraceStatus, ScanResults, HIGH_RISK_SAFETY_CEILING,
};
use crate::policy::enforce_recommendation_policies;

/// Items at or below this score are never offered for review either.
const REVIEW_FLOOR: u8 = HIGH_RISK_SAFETY_CEILING;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecommendationBundle {
    pub recommendations: Vec<Recommendation>,
    pub rule_traces: Vec<RuleTrace>,
    pub policy_decisions: Vec<PolicyDecision>,
    pub contradiction_count: u64,
}

impl RecommendationBundle {
    pub fn safe(&self) -> impl Iterator<Item = &Recommendation> {
        self.recommendations.iter().filter(|rec| rec.policy_safe)
    }

    /// Ids of every item offered in a recommendation marked safe.
    pub fn safe_item_ids(&self) -> HashSet<&str> {
        self.safe()
            .flat_map(|rec| rec.item_ids.iter().map(String::as_str))
            .collect()
    }
}

pub fn get_recommendations(
    results: &ScanResults,
    config: &RecommendConfig,
) -> RecommendationBundle {
    let mut candidates = Vec::new();
    let mut traces = Vec::new();

    emit_many(
        "safe_cleanup",
        safe_cleanup_rule(results, config.mode),
        &mut candidates,
        &mut traces,
    );
    emit_optional(
        "review_bucket",
        review_bucket_rule(results, config.mode),
        &mut candidates,
        &mut traces,
    );
    emit_optional(
        "duplicate_cleanup",
        duplicate_cleanup_rule(results),
        &mut candidates,
        &mut traces,
    );
    emit_optional(
        "large_items",
        large_items_rule(results, config.large_item_bytes),
        &mut candidates,
        &mut traces,
    );
    emit_optional(
        "blocked_high_risk",
        blocked_high_risk_rule(results),
        &mut candidates,
        &mut traces,
    );

    let policy_outcome = enforce_recommendation_policies(results, candidates);
    traces.extend(policy_outcome.rejection_traces);

    RecommendationBundle {
        recommendations: policy_outcome.recommendations,
        rule_traces: traces,
        policy_decisions: policy_outcome.decisions,
        contradiction_count: policy_outcome.contradiction_count,
    }
}

fn emit_optional(
    rule_id: &str,
    recommendation: Option<Recommendation>,
    out: &mut Vec<Recommendation>,
    traces: &mut Vec<RuleTrace>,
) {
    if let Some(rec) = recommendation {
        traces.push(RuleTrace {
            rule_id: rule_id.to_string(),
            status: RuleTraceStatus::Emitted,
            detail: format!(
                "Rule produced one recommendation over {} item(s).",
                rec.item_ids.len()
            ),
            recommendation_id: Some(rec.id.clone()),
            confidence: Some(rec.confidence),
        });
        out.push(rec);
    } else {
        traces.push(skipped(rule_id));
    }
}

fn emit_many(
    rule_id: &str,
    recommendations: Vec<Recommendation>,
    out: &mut Vec<Recommendation>,
    traces: &mut Vec<RuleTrace>,
) {
    if recommendations.is_empty() {
        traces.push(skipped(rule_id));
        return;
    }

    let ids = recommendations
        .iter()
        .map(|r| r.id.clone())
        .collect::<Vec<_>>()
        .join(", ");
    let avg_confidence =
        recommendations.iter().map(|r| r.confidence).sum::<f32>() / recommendations.len() as f32;
    traces.push(RuleTrace {
        rule_id: rule_id.to_string(),
        status: RuleTraceStatus::Emitted,
        detail: format!(
            "Rule produced {} recommendation(s): {}",
            recommendations.len(),
            ids
        ),
        recommendation_id: None,
        confidence: Some(avg_confidence),
    });
    out.extend(recommendations);
}

fn skipped(rule_id: &str) -> RuleTrace {
    RuleTrace {
        rule_id: rule_id.to_string(),
        status: RuleTraceStatus::Skipped,
        detail: "Rule conditions were not met.".to_string(),
        recommendation_id: None,
        confidence: None,
    }
}

/// One recommendation per category for items at or above the mode threshold.
fn safe_cleanup_rule(results: &ScanResults, mode: RecommendMode) -> Vec<Recommendation> {
    let threshold = mode.safe_threshold();
    let mut by_category: BTreeMap<ItemCategory, Vec<&CleanableItem>> = BTreeMap::new();
    for item in results
        .items
        .iter()
        .filter(|item| item.safety_score() >= threshold)
    {
        by_category.entry(item.category).or_default().push(item);
    }

    by_category
        .into_iter()
        .map(|(category, items)| {
            let total = total_bytes(&items);
            Recommendation {
                id: format!("safe-cleanup-{}", category.as_str().replace('_', "-")),
                title: format!("Clean {} ({})", category, human_bytes(total)),
                rationale: format!(
                    "{} {} item(s) scored at least {} for safety in {:?} mode.",
                    items.len(),
                    category,
                    threshold,
                    mode
                ),
                confidence: mode_confidence(mode),
                item_ids: ids_of(&items),
                policy_safe: true,
                policy_rules_applied: Vec::new(),
                policy_rules_blocked: Vec::new(),
                estimated_impact: EstimatedImpact {
                    space_saving_bytes: total,
                    item_count: items.len() as u64,
                    risk_notes: None,
                },
                risk_level: highest_level(&items),
            }
        })
        .collect()
}

fn review_bucket_rule(results: &ScanResults, mode: RecommendMode) -> Option<Recommendation> {
    let threshold = mode.safe_threshold();
    let items = results
        .items
        .iter()
        .filter(|item| {
            let score = item.safety_score();
            score > REVIEW_FLOOR
                && score < threshold
                && !item.risk_level.is_some_and(RiskLevel::is_high_or_worse)
        })
        .collect::<Vec<_>>();
    if items.is_empty() {
        return None;
    }

    let total = total_bytes(&items);
    Some(Recommendation {
        id: "review-before-cleaning".to_string(),
        title: format!("Review {} item(s) before cleaning", items.len()),
        rationale: format!(
            "These items scored between {} and {} for safety; confirm each one before removal.",
            REVIEW_FLOOR + 1,
            threshold - 1
        ),
        confidence: 0.5,
        item_ids: ids_of(&items),
        policy_safe: false,
        policy_rules_applied: Vec::new(),
        policy_rules_blocked: Vec::new(),
        estimated_impact: EstimatedImpact {
            space_saving_bytes: total,
            item_count: items.len() as u64,
            risk_notes: Some("Manual review required.".to_string()),
        },
        risk_level: highest_level(&items).max(RiskLevel::Medium),
    })
}

fn duplicate_cleanup_rule(results: &ScanResults) -> Option<Recommendation> {
    let redundant_groups = results
        .duplicates
        .iter()
        .filter(|group| !group.likely_intentional && group.wasted_bytes > 0)
        .collect::<Vec<_>>();
    if redundant_groups.is_empty() {
        return None;
    }

    let redundant_paths = redundant_groups
        .iter()
        .flat_map(|group| group.paths.iter().skip(1))
        .collect::<HashSet<_>>();
    let items = results
        .items
        .iter()
        .filter(|item| {
            item.category == ItemCategory::Duplicates && redundant_paths.contains(&item.path)
        })
        .collect::<Vec<_>>();
    if items.is_empty() {
        return None;
    }

    let total_wasted = redundant_groups
        .iter()
        .map(|group| group.wasted_bytes)
        .sum::<u64>();

    Some(Recommendation {
        id: "duplicate-cleanup-candidate".to_string(),
        title: "Remove redundant duplicate copies".to_string(),
        rationale: format!(
            "{} duplicate group(s) account for about {} of reclaimable space. The oldest copy of each is kept.",
            redundant_groups.len(),
            human_bytes(total_wasted)
        ),
        confidence: 0.7,
        item_ids: ids_of(&items),
        policy_safe: true,
        policy_rules_applied: Vec::new(),
        policy_rules_blocked: Vec::new(),
        estimated_impact: EstimatedImpact {
            space_saving_bytes: total_bytes(&items),
            item_count: items.len() as u64,
            risk_notes: Some("Matching is by name and size, not content.".to_string()),
        },
        risk_level: highest_level(&items).max(RiskLevel::Low),
    })
}

fn large_items_rule(results: &ScanResults, large_item_bytes: u64) -> Option<Recommendation> {
    let mut items = results
        .items
        .iter()
        .filter(|item| item.size_bytes >= large_item_bytes)
        .collect::<Vec<_>>();
    if items.is_empty() {
        return None;
    }
    items.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

    let total = total_bytes(&items);
    Some(Recommendation {
        id: "large-items".to_string(),
        title: format!("{} large item(s) hold {}", items.len(), human_bytes(total)),
        rationale: format!(
            "Each of these items is at least {}. The largest is {}.",
            human_bytes(large_item_bytes),
            items[0].path.display()
        ),
        confidence: 0.6,
        item_ids: ids_of(&items),
        policy_safe: false,
        policy_rules_applied: Vec::new(),
        policy_rules_blocked: Vec::new(),
        estimated_impact: EstimatedImpact {
            space_saving_bytes: total,
            item_count: items.len() as u64,
            risk_notes: Some("Size alone does not make an item safe to delete.".to_string()),
        },
        risk_level: highest_level(&items),
    })
}

fn blocked_high_risk_rule(results: &ScanResults) -> Option<Recommendation> {
    let items = results
        .items
        .iter()
        .filter(|item| is_policy_blocked(item))
        .collect::<Vec<_>>();
    if items.is_empty() {
        return None;
    }

    let warnings = items
        .iter()
        .filter_map(|item| item.warning.as_deref())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    Some(Recommendation {
        id: "blocked-high-risk".to_string(),
        title: format!("{} item(s) should not be deleted", items.len()),
        rationale: "The risk audit flagged these paths as high or critical risk.".to_string(),
        confidence: 0.9,
        item_ids: ids_of(&items),
        policy_safe: false,
        policy_rules_applied: Vec::new(),
        policy_rules_blocked: Vec::new(),
        estimated_impact: EstimatedImpact {
            space_saving_bytes: 0,
            item_count: items.len() as u64,
            risk_notes: (!warnings.is_empty()).then(|| {
                let mut sorted = warnings;
                sorted.sort_unstable();
                sorted.join(" | ")
            }),
        },
        risk_level: highest_level(&items).max(RiskLevel::High),
    })
}

/// Whether the safety policy forbids offering `item` as safe.
pub(crate) fn is_policy_blocked(item: &CleanableItem) -> bool {
    item.risk_level.is_some_and(RiskLevel::is_high_or_worse)
        || item.safety_score() <= HIGH_RISK_SAFETY_CEILING
}

fn mode_confidence(mode: RecommendMode) -> f32 {
    match mode {
        RecommendMode::Conservative => 0.95,
        RecommendMode::Balanced => 0.85,
        RecommendMode::Aggressive => 0.7,
    }
}

fn total_bytes(items: &[&CleanableItem]) -> u64 {
    items
        .iter()
        .fold(0_u64, |acc, item| acc.saturating_add(item.size_bytes))
}

fn ids_of(items: &[&CleanableItem]) -> Vec<String> {
    items.iter().map(|item| item.id.clone()).collect()
}

fn highest_level(items: &[&CleanableItem]) -> RiskLevel {
    items
        .iter()
        .filter_map(|item| item.risk_level)
        .max()
        .unwrap_or(RiskLevel::Minimal)
}
