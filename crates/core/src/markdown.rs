use std::collections::BTreeMap;

use crate::enrich::human_bytes;
use crate::model::{ItemCategory, PhaseOutcome, ScanResults};
use crate::recommend::RecommendationBundle;

const LARGEST_ITEMS_SHOWN: usize = 15;
const DUPLICATE_GROUPS_SHOWN: usize = 20;

pub fn render_markdown_summary(results: &ScanResults, bundle: &RecommendationBundle) -> String {
    let mut out = String::new();
    out.push_str("# Sweepkit Scan Summary\n\n");
    out.push_str(&format!(
        "- Results version: `{}`\n- Scan id: `{}`\n- Started at: `{}`\n- Categories: `{}`\n- Tasks: `{}/{}` completed\n- Scan elapsed: `{} ms`\n- Reclaimable total: {}\n\n",
        results.results_version,
        results.scan_id,
        results.started_at.to_rfc3339(),
        results
            .categories
            .iter()
            .map(ItemCategory::as_str)
            .collect::<Vec<_>>()
            .join("`, `"),
        results.tasks_completed,
        results.tasks_planned,
        results.elapsed_ms,
        human_bytes(results.total_size_bytes)
    ));

    out.push_str("## Phases\n\n");
    if results.phases.is_empty() {
        out.push_str("No phase reports recorded.\n\n");
    } else {
        for phase in &results.phases {
            let marker = match phase.outcome {
                PhaseOutcome::Completed => "completed",
                PhaseOutcome::Degraded => "degraded",
                PhaseOutcome::Skipped => "skipped",
            };
            out.push_str(&format!(
                "- `{:?}`: {} in {} ms",
                phase.phase, marker, phase.elapsed_ms
            ));
            if let Some(detail) = &phase.detail {
                out.push_str(&format!(" ({detail})"));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    out.push_str("## Categories\n\n");
    let mut by_category: BTreeMap<ItemCategory, (u64, u64)> = BTreeMap::new();
    for item in &results.items {
        let entry = by_category.entry(item.category).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.saturating_add(item.size_bytes);
    }
    if by_category.is_empty() {
        out.push_str("No cleanable items found.\n\n");
    } else {
        for (category, (count, bytes)) in &by_category {
            out.push_str(&format!(
                "- `{}`: {} item(s), {}\n",
                category,
                count,
                human_bytes(*bytes)
            ));
        }
        out.push('\n');
    }

    let mut largest = results.items.iter().collect::<Vec<_>>();
    largest.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
    if !largest.is_empty() {
        out.push_str("## Largest Items\n\n");
        for item in largest.into_iter().take(LARGEST_ITEMS_SHOWN) {
            out.push_str(&format!(
                "- `{}` ({}), safety {}",
                item.path.display(),
                human_bytes(item.size_bytes),
                item.safety_score()
            ));
            if let Some(level) = item.risk_level {
                out.push_str(&format!(", risk `{level:?}`"));
            }
            out.push('\n');
            if let Some(warning) = &item.warning {
                out.push_str(&format!("  - warning: {warning}\n"));
            }
        }
        out.push('\n');
    }

    out.push_str("## Duplicate Highlights\n\n");
    if results.duplicates.is_empty() {
        out.push_str("No duplicate groups were detected.\n\n");
    } else {
        for group in results.duplicates.iter().take(DUPLICATE_GROUPS_SHOWN) {
            out.push_str(&format!(
                "- `{}`: {} copies, {} each, wasted ~{}{}\n",
                group.name,
                group.paths.len(),
                human_bytes(group.size_bytes),
                human_bytes(group.wasted_bytes),
                if group.likely_intentional {
                    ", likely intentional"
                } else {
                    ""
                }
            ));
        }
        out.push('\n');
    }

    out.push_str("## Recommendations\n\n");
    if bundle.recommendations.is_empty() {
        out.push_str("No recommendations generated.\n");
    } else {
        for recommendation in &bundle.recommendations {
            out.push_str(&format!(
                "### {}\n\n- Risk: `{:?}`\n- Confidence: `{:.2}`\n- Policy safe: `{}`\n- Items: {}\n- Estimated space impact: {}\n- Rationale: {}\n",
                recommendation.title,
                recommendation.risk_level,
                recommendation.confidence,
                recommendation.policy_safe,
                recommendation.estimated_impact.item_count,
                human_bytes(recommendation.estimated_impact.space_saving_bytes),
                recommendation.rationale
            ));
            if let Some(notes) = &recommendation.estimated_impact.risk_notes {
                out.push_str(&format!("- Risk notes: {}\n", notes));
            }
            out.push('\n');
        }
    }

    if !bundle.policy_decisions.is_empty() {
        out.push_str("## Policy Decisions\n\n");
        for decision in &bundle.policy_decisions {
            out.push_str(&format!(
                "- `{}` on `{}`: `{:?}` ({})\n",
                decision.policy_id, decision.recommendation_id, decision.action, decision.rationale
            ));
        }
        out.push('\n');
    }

    if !bundle.rule_traces.is_empty() {
        out.push_str("## Rule Traces\n\n");
        for trace in &bundle.rule_traces {
            out.push_str(&format!(
                "- `{}`: `{:?}` ({})\n",
                trace.rule_id, trace.status, trace.detail
            ));
        }
        out.push('\n');
    }

    if !results.warnings.is_empty() {
        out.push_str("## Warnings\n\n");
        for warning in &results.warnings {
            out.push_str(&format!("- {}\n", warning));
        }
    }

    out
}
