use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::OpenFileSnapshot;
use crate::config::ScanConfig;
use crate::dedupe::{find_duplicates, retain_redundant_copies};
use crate::enrich::{ExplanationGenerator, ScoreAdjustment, ScoreEnhancer, ToolDetector};
use crate::error::{Result, SweepError};
use crate::flight::SingleFlight;
use crate::fs::FileSystem;
use crate::index::IncrementalIndex;
use crate::model::{
    CategorySet, CleanableItem, DuplicateGroup, ItemCategory, PhaseOutcome, PhaseReport,
    RiskAssessment, RiskLevel, ScanPhase, ScanResults, HIGH_RISK_SAFETY_CEILING, RESULTS_VERSION,
};
use crate::risk::RiskEngine;
use crate::scan::{run_task, ExcludeMatcher, TaskContext, TaskOutput, TreeSizeCache};
use crate::tasks::{plan_tasks, ScanTask};

/// Time limits for the walk and each enrichment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBudgets {
    pub scan: Duration,
    pub duplicates: Duration,
    pub risk_audit: Duration,
    pub explanations: Duration,
}

impl PhaseBudgets {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            scan: config.timeout(),
            duplicates: Duration::from_secs(config.duplicate_budget_secs),
            risk_audit: Duration::from_secs(config.risk_audit_budget_secs),
            explanations: Duration::from_secs(config.explanation_budget_secs),
        }
    }
}

#[derive(Debug, Clone)]
enum OpenFileSource {
    Capture,
    Fixed(OpenFileSnapshot),
}

pub struct ScanOrchestrator {
    fs: Arc<dyn FileSystem>,
    index: Option<Arc<IncrementalIndex>>,
    enhancer: Option<Arc<dyn ScoreEnhancer>>,
    explainer: Option<Arc<dyn ExplanationGenerator>>,
    detector: Option<Arc<dyn ToolDetector>>,
    budgets: Option<PhaseBudgets>,
    open_files: OpenFileSource,
    flight: SingleFlight,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("index", &self.index.is_some())
            .field("enhancer", &self.enhancer.is_some())
            .field("explainer", &self.explainer.is_some())
            .field("detector", &self.detector.is_some())
            .field("budgets", &self.budgets)
            .field("busy", &self.flight.is_busy())
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            index: None,
            enhancer: None,
            explainer: None,
            detector: None,
            budgets: None,
            open_files: OpenFileSource::Capture,
            flight: SingleFlight::new("scan"),
        }
    }

    pub fn with_index(mut self, index: Arc<IncrementalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn ScoreEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn with_explainer(mut self, explainer: Arc<dyn ExplanationGenerator>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn with_tool_detector(mut self, detector: Arc<dyn ToolDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Replace the configured time limits.
    pub fn with_budgets(mut self, budgets: PhaseBudgets) -> Self {
        self.budgets = Some(budgets);
        self
    }

    /// Use a fixed open-file snapshot instead of capturing one per audit.
    pub fn with_open_files(mut self, snapshot: OpenFileSnapshot) -> Self {
        self.open_files = OpenFileSource::Fixed(snapshot);
        self
    }

    pub async fn scan(&self, categories: &CategorySet, config: &ScanConfig) -> Result<ScanResults> {
        self.scan_with_cancel(categories, config, &CancellationToken::new())
            .await
    }

    pub async fn scan_with_cancel(
        &self,
        categories: &CategorySet,
        config: &ScanConfig,
        cancel: &CancellationToken,
    ) -> Result<ScanResults> {
        let _flight = self.flight.try_begin()?;
        config.validate()?;
        let budgets = self
            .budgets
            .unwrap_or_else(|| PhaseBudgets::from_config(config));
        let started_at = Utc::now();
        let started = Instant::now();
        let mut phases = Vec::new();
        let mut warnings = Vec::new();

        let phase_started = Instant::now();
        let tasks = plan_tasks(categories, config);
        let tasks_planned = tasks.len() as u64;
        phases.push(report(ScanPhase::Planning, PhaseOutcome::Completed, phase_started, None));
        info!(tasks = tasks_planned, categories = categories.len(), "scan planned");

        let excludes = Arc::new(ExcludeMatcher::new(&config.excludes, &mut warnings));
        let walk_cancel = cancel.child_token();
        let ctx = TaskContext {
            excludes,
            max_depth: config.max_depth,
            cancel: walk_cancel.clone(),
            size_cache: if config.use_index_cache {
                self.index
                    .as_ref()
                    .map(|index| Arc::clone(index) as Arc<dyn TreeSizeCache>)
            } else {
                None
            },
        };

        let phase_started = Instant::now();
        let (outputs, task_failures) = match tokio::time::timeout(
            budgets.scan,
            run_tasks(tasks, ctx, config.parallelism, &walk_cancel),
        )
        .await
        {
            Ok(outputs) => outputs?,
            Err(_) => {
                walk_cancel.cancel();
                warn!(timeout_secs = budgets.scan.as_secs(), "scan timed out");
                return Err(SweepError::timeout("scan", budgets.scan));
            }
        };
        let tasks_completed = outputs.len() as u64;

        let mut items = Vec::new();
        let mut observations = Vec::new();
        for output in outputs {
            warnings.extend(output.warnings);
            items.extend(output.items);
            observations.extend(output.observations);
        }
        let originals = retain_redundant_copies(&mut items);
        let walk_outcome = if task_failures.is_empty() {
            PhaseOutcome::Completed
        } else {
            PhaseOutcome::Degraded
        };
        phases.push(report(
            ScanPhase::Walking,
            walk_outcome,
            phase_started,
            Some(format!(
                "{} items from {tasks_completed} tasks, {} failed",
                items.len(),
                task_failures.len()
            )),
        ));
        warnings.extend(task_failures);
        self.record_observations(observations).await;
        ensure_active(cancel)?;

        let duplicates = self
            .duplicate_phase(&mut items, &originals, budgets.duplicates, &mut phases)
            .await;
        ensure_active(cancel)?;

        self.risk_phase(&mut items, config, budgets.risk_audit, cancel, &mut phases)
            .await;
        ensure_active(cancel)?;

        self.explanation_phase(&mut items, budgets.explanations, &mut phases)
            .await;
        ensure_active(cancel)?;

        let total_size_bytes = items.iter().map(|item| item.size_bytes).sum();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            items = items.len(),
            total_size_bytes,
            duplicate_groups = duplicates.len(),
            elapsed_ms,
            "scan complete"
        );

        Ok(ScanResults {
            results_version: RESULTS_VERSION.to_string(),
            scan_id: Uuid::new_v4().to_string(),
            started_at,
            categories: categories.clone(),
            items,
            duplicates,
            tasks_planned,
            tasks_completed,
            total_size_bytes,
            elapsed_ms,
            phases,
            warnings,
        })
    }

    async fn record_observations(&self, observations: Vec<crate::scan::Observation>) {
        let Some(index) = &self.index else {
            return;
        };
        let index = Arc::clone(index);
        match tokio::task::spawn_blocking(move || index.record_observations(&observations)).await {
            Ok(Ok(recorded)) => debug!(recorded, "scan observations stored in index"),
            Ok(Err(err)) => warn!(error = %err, "failed to store scan observations"),
            Err(err) => warn!(error = %err, "observation task aborted"),
        }
    }

    async fn duplicate_phase(
        &self,
        items: &mut [CleanableItem],
        originals: &[CleanableItem],
        budget: Duration,
        phases: &mut Vec<PhaseReport>,
    ) -> Vec<DuplicateGroup> {
        let enhancer = self.enhancer.clone();
        let snapshot: &[CleanableItem] = items;
        let outcome = run_phase(ScanPhase::Duplicates, budget, phases, async move {
            // Originals kept out of the item list still anchor their groups.
            let candidates = snapshot
                .iter()
                .chain(originals)
                .filter(|item| item.category == ItemCategory::Duplicates)
                .cloned()
                .collect::<Vec<_>>();
            let groups = find_duplicates(&candidates);
            let adjustments = match &enhancer {
                Some(enhancer) => enhancer.enhance(snapshot, &groups).await?,
                None => Vec::new(),
            };
            Ok((groups, adjustments))
        })
        .await;

        let Some((groups, adjustments)) = outcome else {
            return Vec::new();
        };
        apply_adjustments(items, &adjustments);
        groups
    }

    async fn risk_phase(
        &self,
        items: &mut [CleanableItem],
        config: &ScanConfig,
        budget: Duration,
        cancel: &CancellationToken,
        phases: &mut Vec<PhaseReport>,
    ) {
        let engine = RiskEngine::new(Arc::clone(&self.fs), config.resolved_home());
        let open_files = self.open_files.clone();
        let paths = items
            .iter()
            .map(|item| (item.id.clone(), item.path.clone()))
            .collect::<Vec<_>>();
        let audit_cancel = cancel.child_token();
        let worker_cancel = audit_cancel.clone();
        let worker_engine = engine.clone();

        let outcome = run_phase(ScanPhase::RiskAudit, budget, phases, async move {
            tokio::task::spawn_blocking(move || {
                let snapshot = match open_files {
                    OpenFileSource::Capture => OpenFileSnapshot::capture(),
                    OpenFileSource::Fixed(snapshot) => snapshot,
                };
                let engine = worker_engine.with_open_files(snapshot);
                let mut audits = HashMap::with_capacity(paths.len());
                for (id, path) in paths {
                    if worker_cancel.is_cancelled() {
                        return Err(SweepError::Cancelled);
                    }
                    audits.insert(id, engine.audit(&path));
                }
                Ok(audits)
            })
            .await
            .map_err(|err| SweepError::Internal(format!("risk audit task failed: {err}")))?
        })
        .await;
        audit_cancel.cancel();

        match outcome {
            Some(audits) => apply_audits(items, &audits),
            None => apply_critical_fallback(items, &engine),
        }
    }

    async fn explanation_phase(
        &self,
        items: &mut [CleanableItem],
        budget: Duration,
        phases: &mut Vec<PhaseReport>,
    ) {
        if self.detector.is_none() && self.explainer.is_none() {
            phases.push(PhaseReport {
                phase: ScanPhase::Explanations,
                outcome: PhaseOutcome::Skipped,
                elapsed_ms: 0,
                detail: Some("no explanation collaborators configured".to_string()),
            });
            return;
        }

        let detector = self.detector.clone();
        let explainer = self.explainer.clone();
        let snapshot = items.to_vec();
        let outcome = run_phase(ScanPhase::Explanations, budget, phases, async move {
            let mut annotated = snapshot;
            if let Some(detector) = &detector {
                let tools = detector.detect(&annotated).await?;
                for item in &mut annotated {
                    if let Some(tool) = tools.get(&item.id) {
                        item.detected_tool = Some(tool.clone());
                    }
                }
            }
            let explanations = match &explainer {
                Some(explainer) => explainer.explain(&annotated).await?,
                None => HashMap::new(),
            };
            Ok((annotated, explanations))
        })
        .await;

        let Some((annotated, explanations)) = outcome else {
            return;
        };
        let tools = annotated
            .into_iter()
            .filter_map(|item| item.detected_tool.map(|tool| (item.id, tool)))
            .collect::<HashMap<_, _>>();
        for item in items.iter_mut() {
            if let Some(tool) = tools.get(&item.id) {
                item.detected_tool = Some(tool.clone());
            }
            if let Some(text) = explanations.get(&item.id) {
                item.explanation = Some(text.clone());
            }
        }
    }
}

/// Run every task with at most `parallelism` in flight. A permit is taken
/// before a task is spawned, so cancellation stops new work immediately.
///
/// Returns the outputs of the tasks that finished plus one warning per task
/// that failed.
async fn run_tasks(
    tasks: Vec<ScanTask>,
    ctx: TaskContext,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<TaskOutput>, Vec<String>)> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();
    let mut outputs = Vec::new();
    let mut failures = Vec::new();
    let mut running = HashMap::new();

    for (slot, task) in tasks.into_iter().enumerate() {
        ensure_active(cancel)?;
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => permit
                .map_err(|_| SweepError::Internal("scan semaphore closed".to_string()))?,
            _ = cancel.cancelled() => return Err(SweepError::Cancelled),
        };
        let ctx = ctx.clone();
        running.insert(slot, task.id.clone());
        set.spawn_blocking(move || {
            let _permit = permit;
            (slot, run_task(&task, &ctx))
        });
    }

    while let Some(joined) = set.join_next().await {
        ensure_active(cancel)?;
        match joined {
            Ok((slot, outcome)) => {
                let task_id = running.remove(&slot).unwrap_or_default();
                match outcome {
                    Ok(output) => outputs.push(output),
                    Err(SweepError::Cancelled) => return Err(SweepError::Cancelled),
                    Err(err) => {
                        warn!(task = %task_id, error = %err, "scan task failed");
                        failures.push(format!("scan task {task_id} failed: {err}"));
                    }
                }
            }
            Err(err) => warn!(error = %err, "scan task aborted"),
        }
    }
    // Whatever is still registered died without reporting back.
    failures.extend(
        running
            .into_values()
            .map(|task_id| format!("scan task {task_id} aborted")),
    );
    Ok((outputs, failures))
}

/// Race `work` against `budget`. Errors and timeouts degrade the phase and
/// yield `None`, leaving items as they were.
async fn run_phase<T, F>(
    phase: ScanPhase,
    budget: Duration,
    phases: &mut Vec<PhaseReport>,
    work: F,
) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let (value, outcome, detail) = match tokio::time::timeout(budget, work).await {
        Ok(Ok(value)) => (Some(value), PhaseOutcome::Completed, None),
        Ok(Err(err)) => {
            warn!(phase = ?phase, error = %err, "enrichment phase failed, keeping prior scores");
            (None, PhaseOutcome::Degraded, Some(err.to_string()))
        }
        Err(_) => {
            warn!(
                phase = ?phase,
                budget_ms = budget.as_millis() as u64,
                "enrichment phase timed out, keeping prior scores"
            );
            (
                None,
                PhaseOutcome::Degraded,
                Some(format!("timed out after {}ms", budget.as_millis())),
            )
        }
    };
    phases.push(report(phase, outcome, started, detail));
    value
}

fn report(
    phase: ScanPhase,
    outcome: PhaseOutcome,
    started: Instant,
    detail: Option<String>,
) -> PhaseReport {
    PhaseReport {
        phase,
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
        detail,
    }
}

fn apply_adjustments(items: &mut [CleanableItem], adjustments: &[ScoreAdjustment]) {
    let by_id = adjustments
        .iter()
        .map(|adjustment| (adjustment.item_id.as_str(), adjustment.safety_score))
        .collect::<HashMap<_, _>>();
    for item in items.iter_mut() {
        if let Some(score) = by_id.get(item.id.as_str()) {
            item.set_safety_score(*score);
        }
    }
}

fn apply_audits(items: &mut [CleanableItem], audits: &HashMap<String, RiskAssessment>) {
    let mut clamped = 0_usize;
    for item in items.iter_mut() {
        if let Some(assessment) = audits.get(&item.id) {
            item.apply_assessment(assessment);
            if assessment.level.is_high_or_worse() {
                clamped += 1;
            }
        }
    }
    debug!(audited = audits.len(), clamped, "risk audit applied");
}

/// Without audit results, deny-listed paths are still clamped from the
/// prefix table alone.
pub fn apply_critical_fallback(items: &mut [CleanableItem], engine: &RiskEngine) {
    for item in items.iter_mut() {
        if let Some(prefix) = engine.critical_prefix(&item.path) {
            item.risk_level = Some(RiskLevel::Critical);
            item.cap_safety_score(HIGH_RISK_SAFETY_CEILING);
            item.warning = Some(format!(
                "inside protected system location {}",
                prefix.display()
            ));
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SweepError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::{apply_critical_fallback, PhaseBudgets, ScanOrchestrator};
    use crate::activity::OpenFileSnapshot;
    use crate::config::ScanConfig;
    use crate::enrich::{ExplanationGenerator, ScoreAdjustment, ScoreEnhancer, TemplateExplainer};
    use crate::error::{Result, SweepError};
    use crate::fs::LocalFileSystem;
    use crate::model::{
        CategorySet, CleanableItem, DuplicateGroup, ItemCategory, PhaseOutcome, RiskLevel,
        ScanPhase,
    };
    use crate::risk::RiskEngine;

    fn budgets(enrichment: Duration) -> PhaseBudgets {
        PhaseBudgets {
            scan: Duration::from_secs(30),
            duplicates: enrichment,
            risk_audit: Duration::from_secs(10),
            explanations: enrichment,
        }
    }

    fn orchestrator() -> ScanOrchestrator {
        ScanOrchestrator::new(Arc::new(LocalFileSystem))
            .with_open_files(OpenFileSnapshot::unavailable())
            .with_budgets(budgets(Duration::from_secs(5)))
    }

    fn home_with_logs(temp: &TempDir) -> ScanConfig {
        let home = temp.path().join("home");
        fs::create_dir_all(home.join("Library/Logs/app")).expect("mkdir");
        fs::write(home.join("Library/Logs/app/run.log"), vec![0_u8; 300]).expect("write");
        fs::write(home.join("Library/Logs/app/notes.txt"), b"skip").expect("write");
        ScanConfig {
            home_dir: Some(home),
            temp_dir: Some(temp.path().join("tmp-missing")),
            parallelism: 2,
            ..ScanConfig::default()
        }
    }

    fn logs() -> CategorySet {
        [ItemCategory::Logs].into_iter().collect()
    }

    struct SlowEnhancer;

    #[async_trait]
    impl ScoreEnhancer for SlowEnhancer {
        async fn enhance(
            &self,
            _items: &[CleanableItem],
            _duplicates: &[DuplicateGroup],
        ) -> Result<Vec<ScoreAdjustment>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct BoostEnhancer;

    #[async_trait]
    impl ScoreEnhancer for BoostEnhancer {
        async fn enhance(
            &self,
            items: &[CleanableItem],
            _duplicates: &[DuplicateGroup],
        ) -> Result<Vec<ScoreAdjustment>> {
            Ok(items
                .iter()
                .map(|item| ScoreAdjustment {
                    item_id: item.id.clone(),
                    safety_score: 99,
                })
                .collect())
        }
    }

    struct BrokenExplainer;

    #[async_trait]
    impl ExplanationGenerator for BrokenExplainer {
        async fn explain(&self, _items: &[CleanableItem]) -> Result<HashMap<String, String>> {
            Err(SweepError::Internal("model unavailable".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_collects_matching_items_and_reports_phases() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let results = orchestrator()
            .with_explainer(Arc::new(TemplateExplainer))
            .scan(&logs(), &config)
            .await
            .expect("scan");

        assert_eq!(results.items.len(), 1);
        let item = &results.items[0];
        assert_eq!(item.name, "run.log");
        assert_eq!(item.size_bytes, 300);
        assert_eq!(item.safety_score(), 85);
        assert!(item.explanation.is_some());
        assert_eq!(results.total_size_bytes, 300);
        assert_eq!(results.tasks_planned, 2);
        assert_eq!(results.tasks_completed, 2);

        let outcomes = results
            .phases
            .iter()
            .map(|phase| (phase.phase, phase.outcome))
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                (ScanPhase::Planning, PhaseOutcome::Completed),
                (ScanPhase::Walking, PhaseOutcome::Completed),
                (ScanPhase::Duplicates, PhaseOutcome::Completed),
                (ScanPhase::RiskAudit, PhaseOutcome::Completed),
                (ScanPhase::Explanations, PhaseOutcome::Completed),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_enhancer_degrades_without_failing_scan() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let results = ScanOrchestrator::new(Arc::new(LocalFileSystem))
            .with_open_files(OpenFileSnapshot::unavailable())
            .with_budgets(budgets(Duration::from_millis(100)))
            .with_enhancer(Arc::new(SlowEnhancer))
            .with_explainer(Arc::new(BrokenExplainer))
            .scan(&logs(), &config)
            .await
            .expect("scan");

        assert_eq!(results.items.len(), 1);
        assert_eq!(results.items[0].safety_score(), 85);
        assert!(results.items[0].explanation.is_none());
        let degraded = results
            .phases
            .iter()
            .filter(|phase| phase.outcome == PhaseOutcome::Degraded)
            .map(|phase| phase.phase)
            .collect::<Vec<_>>();
        assert_eq!(degraded, vec![ScanPhase::Duplicates, ScanPhase::Explanations]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn audit_clamps_scores_raised_by_enhancer() {
        let temp = TempDir::new().expect("tempdir");
        let home = temp.path().join("home");
        let keychains = home.join("Library/Keychains");
        fs::create_dir_all(&keychains).expect("mkdir");
        fs::write(keychains.join("login.keychain-db"), b"secret").expect("write");
        let config = ScanConfig {
            home_dir: Some(home.clone()),
            extra_roots: vec![keychains.clone()],
            ..ScanConfig::default()
        };

        let results = orchestrator()
            .with_enhancer(Arc::new(BoostEnhancer))
            .scan(&[ItemCategory::Other].into_iter().collect(), &config)
            .await
            .expect("scan");
        assert_eq!(results.items.len(), 1);
        let item = &results.items[0];
        assert_eq!(item.risk_level, Some(RiskLevel::Critical));
        assert!(item.safety_score() <= 25);
        assert!(item.warning.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_concurrent_scan_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let orchestrator = Arc::new(
            ScanOrchestrator::new(Arc::new(LocalFileSystem))
                .with_open_files(OpenFileSnapshot::unavailable())
                .with_budgets(budgets(Duration::from_secs(2)))
                .with_enhancer(Arc::new(SlowEnhancer)),
        );

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let config = config.clone();
            tokio::spawn(async move { orchestrator.scan(&logs(), &config).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = orchestrator.scan(&logs(), &config).await;
        assert!(matches!(
            second,
            Err(SweepError::OperationInProgress { operation: "scan" })
        ));
        assert!(first.await.expect("join").is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_scan_surfaces_cancellation() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator()
            .scan_with_cancel(&logs(), &config, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SweepError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn walk_over_budget_is_a_timeout() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let logs_dir = temp.path().join("home/Library/Logs");
        for dir in 0..20 {
            let nested = logs_dir.join(format!("svc-{dir}"));
            fs::create_dir_all(&nested).expect("mkdir");
            for file in 0..100 {
                fs::write(nested.join(format!("{file}.log")), b"x").expect("write");
            }
        }

        let err = ScanOrchestrator::new(Arc::new(LocalFileSystem))
            .with_open_files(OpenFileSnapshot::unavailable())
            .with_budgets(PhaseBudgets {
                scan: Duration::from_millis(1),
                ..budgets(Duration::from_secs(5))
            })
            .scan(&logs(), &config)
            .await
            .expect_err("walk budget");
        assert!(matches!(err, SweepError::Timeout { ref phase, .. } if phase == "scan"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_a_running_scan_stops_after_the_current_phase() {
        let temp = TempDir::new().expect("tempdir");
        let config = home_with_logs(&temp);
        let orchestrator = ScanOrchestrator::new(Arc::new(LocalFileSystem))
            .with_open_files(OpenFileSnapshot::unavailable())
            .with_budgets(budgets(Duration::from_millis(500)))
            .with_enhancer(Arc::new(SlowEnhancer));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = orchestrator
            .scan_with_cancel(&logs(), &config, &cancel)
            .await
            .expect_err("cancelled mid-scan");

        assert!(matches!(err, SweepError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_task_is_reported_as_warning() {
        let temp = TempDir::new().expect("tempdir");
        let home = temp.path().join("home");
        fs::create_dir_all(home.join(".local/share/Trash/files")).expect("mkdir");
        fs::write(home.join(".local/share/Trash/files/old.txt"), b"old").expect("write");
        fs::write(home.join(".Trash"), b"not a directory").expect("write");
        let config = ScanConfig {
            home_dir: Some(home),
            temp_dir: Some(temp.path().join("tmp-missing")),
            ..ScanConfig::default()
        };

        let results = orchestrator()
            .scan(&[ItemCategory::Trash].into_iter().collect(), &config)
            .await
            .expect("scan");
        assert_eq!(results.items.len(), 1);
        assert_eq!(results.tasks_completed + 1, results.tasks_planned);
        assert!(results
            .warnings
            .iter()
            .any(|warning| warning.starts_with("scan task") && warning.contains("failed")));
        let walking = results
            .phases
            .iter()
            .find(|phase| phase.phase == ScanPhase::Walking)
            .expect("walking phase");
        assert_eq!(walking.outcome, PhaseOutcome::Degraded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicates_are_grouped_only_within_their_category() {
        let temp = TempDir::new().expect("tempdir");
        let home = temp.path().join("home");
        fs::create_dir_all(home.join("Library/Caches/a")).expect("mkdir");
        fs::create_dir_all(home.join("Library/Caches/b")).expect("mkdir");
        fs::write(home.join("Library/Caches/a/blob.bin"), vec![0_u8; 64]).expect("write");
        fs::write(home.join("Library/Caches/b/blob.bin"), vec![0_u8; 64]).expect("write");
        let config = ScanConfig {
            home_dir: Some(home),
            temp_dir: Some(temp.path().join("tmp-missing")),
            ..ScanConfig::default()
        };

        let results = orchestrator()
            .scan(&[ItemCategory::Cache].into_iter().collect(), &config)
            .await
            .expect("scan");
        assert_eq!(results.items.len(), 2);
        assert!(results.duplicates.is_empty());
    }

    #[test]
    fn fallback_clamps_only_deny_listed_paths() {
        let engine = RiskEngine::new(Arc::new(LocalFileSystem), Some(PathBuf::from("/Users/a")));
        let mut items = vec![
            CleanableItem::new(
                PathBuf::from("/System/Library/CoreServices/x.plist"),
                ItemCategory::Other,
                1,
            ),
            CleanableItem::new(
                PathBuf::from("/Users/a/Library/Caches/app/data.tmp"),
                ItemCategory::Cache,
                1,
            ),
        ];
        apply_critical_fallback(&mut items, &engine);
        assert_eq!(items[0].risk_level, Some(RiskLevel::Critical));
        assert_eq!(items[0].safety_score(), 25);
        assert_eq!(items[1].risk_level, None);
        assert_eq!(items[1].safety_score(), 80);
    }
}
