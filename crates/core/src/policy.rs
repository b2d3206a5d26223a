use std::collections::{HashMap, HashSet};

use crate::model::{
    CleanableItem, PolicyAction, PolicyDecision, Recommendation, RuleTrace, RuleTraceStatus,
    ScanResults,
};
use crate::recommend::is_policy_blocked;

const SAFE_ITEM_POLICY: &str = "safe_item_policy";
const CONTRADICTION_DETECTOR: &str = "contradiction_detector";

pub struct PolicyOutcome {
    pub recommendations: Vec<Recommendation>,
    pub decisions: Vec<PolicyDecision>,
    pub contradiction_count: u64,
    pub rejection_traces: Vec<RuleTrace>,
}

/// Strip risky items from every recommendation marked safe, drop safe
/// recommendations left empty, then drop repeated ids.
pub fn enforce_recommendation_policies(
    results: &ScanResults,
    candidates: Vec<Recommendation>,
) -> PolicyOutcome {
    let items_by_id = results
        .items
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect::<HashMap<_, _>>();

    let mut recommendations = Vec::new();
    let mut decisions = Vec::new();
    let mut rejection_traces = Vec::new();

    for mut recommendation in candidates {
        if !recommendation.policy_safe {
            recommendation
                .policy_rules_applied
                .push(SAFE_ITEM_POLICY.to_string());
            decisions.push(PolicyDecision {
                policy_id: SAFE_ITEM_POLICY.to_string(),
                recommendation_id: recommendation.id.clone(),
                action: PolicyAction::Allowed,
                rationale: "Recommendation is advisory and is not offered as safe.".to_string(),
            });
            recommendations.push(recommendation);
            continue;
        }

        let mut kept = Vec::new();
        let mut stripped = Vec::new();
        for id in recommendation.item_ids.drain(..) {
            match items_by_id.get(id.as_str()) {
                Some(item) if !is_policy_blocked(item) => kept.push(*item),
                Some(item) => stripped.push(format!(
                    "{} ({})",
                    item.path.display(),
                    block_reason(item)
                )),
                None => stripped.push(format!("{id} (not present in scan results)")),
            }
        }
        recommendation.item_ids = kept.iter().map(|item| item.id.clone()).collect();

        if stripped.is_empty() {
            recommendation
                .policy_rules_applied
                .push(SAFE_ITEM_POLICY.to_string());
            decisions.push(PolicyDecision {
                policy_id: SAFE_ITEM_POLICY.to_string(),
                recommendation_id: recommendation.id.clone(),
                action: PolicyAction::Allowed,
                rationale: "Every item passed the safe item checks.".to_string(),
            });
            recommendations.push(recommendation);
            continue;
        }

        recommendation
            .policy_rules_blocked
            .push(SAFE_ITEM_POLICY.to_string());
        let rationale = format!(
            "Removed {} item(s) from a safe recommendation: {}",
            stripped.len(),
            stripped.join(" | ")
        );
        decisions.push(PolicyDecision {
            policy_id: SAFE_ITEM_POLICY.to_string(),
            recommendation_id: recommendation.id.clone(),
            action: PolicyAction::Blocked,
            rationale: rationale.clone(),
        });

        if kept.is_empty() {
            recommendation.policy_safe = false;
            rejection_traces.push(RuleTrace {
                rule_id: SAFE_ITEM_POLICY.to_string(),
                status: RuleTraceStatus::Rejected,
                detail: rationale,
                recommendation_id: Some(recommendation.id),
                confidence: None,
            });
            continue;
        }

        recommendation.estimated_impact.space_saving_bytes = kept
            .iter()
            .fold(0_u64, |acc, item| acc.saturating_add(item.size_bytes));
        recommendation.estimated_impact.item_count = kept.len() as u64;
        recommendations.push(recommendation);
    }

    let mut deduped = Vec::new();
    let mut seen = HashSet::new();
    let mut contradiction_count = 0_u64;
    for mut recommendation in recommendations {
        if seen.insert(recommendation.id.clone()) {
            deduped.push(recommendation);
            continue;
        }
        recommendation
            .policy_rules_blocked
            .push(CONTRADICTION_DETECTOR.to_string());
        contradiction_count = contradiction_count.saturating_add(1);
        decisions.push(PolicyDecision {
            policy_id: CONTRADICTION_DETECTOR.to_string(),
            recommendation_id: recommendation.id.clone(),
            action: PolicyAction::Blocked,
            rationale: "Duplicate recommendation id detected; later instance removed.".to_string(),
        });
        rejection_traces.push(RuleTrace {
            rule_id: CONTRADICTION_DETECTOR.to_string(),
            status: RuleTraceStatus::Rejected,
            detail: "Duplicate recommendation id detected; later instance removed.".to_string(),
            recommendation_id: Some(recommendation.id),
            confidence: None,
        });
    }

    PolicyOutcome {
        recommendations: deduped,
        decisions,
        contradiction_count,
        rejection_traces,
    }
}

fn block_reason(item: &CleanableItem) -> String {
    match item.risk_level {
        Some(level) if level.is_high_or_worse() => format!("{level:?} risk"),
        _ => format!("safety score {}", item.safety_score()),
    }
}
