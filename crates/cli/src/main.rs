mod backup;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use sweepkit_core::enrich::human_bytes;
use sweepkit_core::{
    render_markdown_summary, CategorySet, CleanConfig, CleanResult, CleanableItem, ItemCategory,
    RecommendationBundle, RiskLevel, ScanResults, SweepConfig,
};
use sweepkit_service::{load_results, write_results, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::backup::DirectoryBackup;

#[derive(Debug, Parser)]
#[command(
    name = "sweepkit",
    version,
    about = "Find reclaimable disk space, score it for deletion safety, and clean it."
)]
struct Cli {
    /// JSON configuration file; missing fields use defaults.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan categories and write scored results as JSON.
    Scan(ScanArgs),
    /// Delete items from an existing results file (dry run unless --execute).
    Clean(CleanArgs),
    /// Re-run recommendation rules over an existing results file.
    Recommend(RecommendArgs),
    /// Maintain the incremental file index.
    #[command(subcommand)]
    Index(IndexCommands),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Category to scan (repeatable). All categories when omitted.
    #[arg(
        long = "category",
        value_name = "NAME",
        action = ArgAction::Append,
        value_parser = parse_category
    )]
    categories: Vec<ItemCategory>,

    /// Output results path.
    #[arg(long, default_value = "sweepkit-results.json", value_name = "FILE")]
    output: PathBuf,

    /// Optional markdown summary output file.
    #[arg(long, value_name = "FILE")]
    md: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Input results file.
    #[arg(long, value_name = "FILE")]
    report: PathBuf,

    /// Select items by safety score instead of the safe recommendations.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(26..=100))]
    min_safety: Option<u8>,

    /// Actually delete. Without this flag the run is a dry run.
    #[arg(long)]
    execute: bool,

    /// Copy items here before deleting them.
    #[arg(long, value_name = "DIR")]
    backup_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    /// Input results file.
    #[arg(long, value_name = "FILE")]
    report: PathBuf,

    /// Optional markdown summary output file.
    #[arg(long, value_name = "FILE")]
    md: Option<PathBuf>,

    /// Optional JSON output file for the recommendation bundle.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum IndexCommands {
    /// Full scan of the given roots, replacing their previous entries.
    Build(IndexBuildArgs),
    /// Re-check a sample of indexed entries and apply the differences.
    Update,
    /// Print the index summary as JSON.
    Status,
}

#[derive(Debug, Args)]
struct IndexBuildArgs {
    /// Root paths to index.
    #[arg(
        long = "paths",
        value_name = "PATH",
        num_args = 1..,
        action = ArgAction::Append,
        required = true
    )]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SweepConfig::load(path)?,
        None => SweepConfig::default(),
    };

    match cli.command {
        Commands::Scan(args) => run_scan_command(config, args).await,
        Commands::Clean(args) => run_clean_command(config, args).await,
        Commands::Recommend(args) => run_recommend_command(config, args),
        Commands::Index(command) => run_index_command(config, command).await,
    }
}

async fn run_scan_command(config: SweepConfig, args: ScanArgs) -> Result<()> {
    let categories = if args.categories.is_empty() {
        CategorySet::all()
    } else {
        args.categories.into_iter().collect()
    };

    let pipeline = Pipeline::builder(config)
        .build()
        .context("failed to assemble pipeline")?;
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling scan");
            ctrl_c.cancel();
        }
    });

    let results = pipeline
        .scan_with_cancel(&categories, &cancel)
        .await
        .context("scan failed")?;
    write_results(&results, &args.output)?;

    println!("Results written to {}", args.output.display());
    println!(
        "Found {} item(s) totalling {} across {}/{} task(s) in {} ms, {} warning(s).",
        results.items.len(),
        human_bytes(results.total_size_bytes),
        results.tasks_completed,
        results.tasks_planned,
        results.elapsed_ms,
        results.warnings.len()
    );
    for phase in &results.phases {
        println!(
            "- {:?}: {:?}{}",
            phase.phase,
            phase.outcome,
            phase
                .detail
                .as_deref()
                .map(|detail| format!(" ({detail})"))
                .unwrap_or_default()
        );
    }

    if let Some(md_path) = args.md {
        let bundle = pipeline.get_recommendations(&results);
        write_markdown(&results, &bundle, &md_path)?;
    }

    Ok(())
}

async fn run_clean_command(config: SweepConfig, args: CleanArgs) -> Result<()> {
    let results = load_results(&args.report)?;
    let mut clean_config = config.clean.clone();
    clean_config.dry_run = !args.execute;

    let mut builder = Pipeline::builder(config);
    if let Some(dir) = &args.backup_dir {
        builder = builder.backup(Arc::new(DirectoryBackup::new(dir)));
        clean_config.auto_backup = true;
    }
    let pipeline = builder.build().context("failed to assemble pipeline")?;

    let selected = select_items(&pipeline, &results, args.min_safety);
    if selected.is_empty() {
        println!("Nothing selected for cleaning from {}", args.report.display());
        return Ok(());
    }

    if !clean_config.dry_run {
        let batch = pipeline.audit_batch(&selected);
        println!(
            "Batch audit: {} item(s), aggregate score {}, level {:?}, highest item level {:?}",
            batch.item_count, batch.aggregate_score, batch.level, batch.highest_item_level
        );
        for penalty in &batch.penalties {
            println!("  penalty: {penalty}");
        }
    }

    run_clean(&pipeline, selected, &clean_config).await
}

async fn run_clean(
    pipeline: &Pipeline,
    items: Vec<CleanableItem>,
    config: &CleanConfig,
) -> Result<()> {
    let result = match pipeline
        .clean_with(items, config, &CancellationToken::new())
        .await
    {
        Ok(result) => result,
        Err(err) => {
            if let Some(partial) = err.partial_clean() {
                report_clean(partial);
                apply_removals(pipeline).await?;
            }
            return Err(anyhow::Error::new(err).context("clean failed"));
        }
    };

    report_clean(&result);
    if result.dry_run {
        println!("Dry run; pass --execute to delete.");
    } else {
        apply_removals(pipeline).await?;
    }
    Ok(())
}

fn report_clean(result: &CleanResult) {
    println!(
        "{} {} item(s), freed {}.",
        if result.dry_run { "Would delete" } else { "Deleted" },
        result.deleted_items.len(),
        human_bytes(result.freed_space)
    );
    for snapshot in &result.snapshot_ids {
        println!("- backup snapshot {snapshot}");
    }
    for failed in &result.failed_items {
        println!("- failed {}: {}", failed.item.path.display(), failed.reason);
    }
}

async fn apply_removals(pipeline: &Pipeline) -> Result<()> {
    let update = pipeline
        .update_index()
        .await
        .context("failed to apply deletions to the index")?;
    println!("Index updated: {} path(s) removed.", update.removed.len());
    Ok(())
}

/// Safe recommendations by default; `min_safety` switches to a score cut
/// that still never admits high or critical risk items.
fn select_items(
    pipeline: &Pipeline,
    results: &ScanResults,
    min_safety: Option<u8>,
) -> Vec<CleanableItem> {
    match min_safety {
        Some(min_safety) => results
            .items
            .iter()
            .filter(|item| {
                item.safety_score() >= min_safety
                    && !item.risk_level.is_some_and(RiskLevel::is_high_or_worse)
            })
            .cloned()
            .collect(),
        None => {
            let bundle = pipeline.get_recommendations(results);
            let safe = bundle
                .safe_item_ids()
                .into_iter()
                .map(str::to_string)
                .collect::<HashSet<_>>();
            results
                .items
                .iter()
                .filter(|item| safe.contains(&item.id))
                .cloned()
                .collect()
        }
    }
}

fn run_recommend_command(config: SweepConfig, args: RecommendArgs) -> Result<()> {
    let results = load_results(&args.report)?;
    let bundle = sweepkit_core::get_recommendations(&results, &config.recommend);

    if bundle.recommendations.is_empty() {
        println!("No recommendations generated from {}", args.report.display());
    } else {
        println!(
            "Generated {} recommendation(s) from {}:",
            bundle.recommendations.len(),
            args.report.display()
        );
        for item in &bundle.recommendations {
            println!(
                "- [{:?} | conf {:.2} | safe {}] {}: {}",
                item.risk_level, item.confidence, item.policy_safe, item.title, item.rationale
            );
        }
    }

    if let Some(output) = args.output {
        let payload =
            serde_json::to_string_pretty(&bundle).context("failed to serialize recommendations")?;
        fs::write(&output, payload)
            .with_context(|| format!("failed to write recommendations to {}", output.display()))?;
        println!("Recommendations written to {}", output.display());
    }

    if let Some(md_path) = args.md {
        write_markdown(&results, &bundle, &md_path)?;
    }

    Ok(())
}

async fn run_index_command(config: SweepConfig, command: IndexCommands) -> Result<()> {
    let pipeline = Pipeline::builder(config)
        .build()
        .context("failed to open index")?;

    match command {
        IndexCommands::Build(args) => {
            let stats = pipeline
                .build_index(args.paths, &CancellationToken::new())
                .await
                .context("index build failed")?;
            println!(
                "Indexed {} file(s) and {} director(ies), {} in {} ms.",
                stats.files,
                stats.directories,
                human_bytes(stats.total_bytes),
                stats.elapsed_ms
            );
        }
        IndexCommands::Update => {
            let update = pipeline.update_index().await.context("index update failed")?;
            println!(
                "Checked {} entr(ies): {} added, {} modified, {} removed.",
                update.fallback_checked + update.events_processed,
                update.added.len(),
                update.modified.len(),
                update.removed.len()
            );
        }
        IndexCommands::Status => {
            let summary = pipeline.index_summary();
            let payload = serde_json::to_string_pretty(&summary)
                .context("failed to serialize index summary")?;
            println!("{payload}");
        }
    }
    Ok(())
}

fn write_markdown(
    results: &ScanResults,
    bundle: &RecommendationBundle,
    md_path: &Path,
) -> Result<()> {
    let markdown = render_markdown_summary(results, bundle);
    fs::write(md_path, markdown)
        .with_context(|| format!("failed to write markdown summary to {}", md_path.display()))?;
    println!("Markdown summary written to {}", md_path.display());
    Ok(())
}

fn parse_category(value: &str) -> std::result::Result<ItemCategory, String> {
    value.parse()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
