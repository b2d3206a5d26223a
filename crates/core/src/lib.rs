pub mod activity;
pub mod bloom;
pub mod clean;
pub mod config;
pub mod dedupe;
pub mod enrich;
pub mod error;
pub mod flight;
pub mod fs;
pub mod index;
pub mod index_store;
pub mod markdown;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod recommend;
pub mod risk;
pub mod scan;
pub mod tasks;

pub use activity::OpenFileSnapshot;
pub use bloom::BloomFilter;
pub use clean::{BackupService, DeletionEngine, SnapshotDescriptor};
pub use config::{
    CleanConfig, IndexConfig, RecommendConfig, RecommendMode, ScanConfig, SweepConfig,
};
pub use dedupe::find_duplicates;
pub use enrich::{
    ExplanationGenerator, PathToolDetector, ScoreAdjustment, ScoreEnhancer, TemplateExplainer,
    ToolDetector,
};
pub use error::{Result, SweepError};
pub use fs::{FileMetadata, FileSystem, LocalFileSystem};
pub use index::{
    ChangeEvent, ChangeKind, IncrementalIndex, IncrementalUpdateResult, IndexEntry,
    IndexStatistics, IndexStatus, IndexSummary,
};
pub use index_store::IndexStore;
pub use markdown::render_markdown_summary;
pub use model::{
    BatchRiskAssessment, CategorySet, CleanResult, CleanableItem, DuplicateGroup, EstimatedImpact,
    FailedItem, FailureReason, ItemCategory, PhaseOutcome, PhaseReport, PolicyAction,
    PolicyDecision, Recommendation, RiskAssessment, RiskLevel, RuleTrace, RuleTraceStatus,
    ScanPhase, ScanResults, HIGH_RISK_SAFETY_CEILING, RESULTS_VERSION,
};
pub use orchestrator::{PhaseBudgets, ScanOrchestrator};
pub use recommend::{get_recommendations, RecommendationBundle};
pub use risk::RiskEngine;
