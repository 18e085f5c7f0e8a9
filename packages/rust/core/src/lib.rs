//! Incremental ingestion orchestration for reposcrape.
//!
//! Ties the change-marker cache, the artifact generator and the upload client
//! together into a single batch run (`Orchestrator::run`) with per-item
//! failure isolation and consistent run statistics.

pub mod generator;
pub mod orchestrator;
pub mod stats;

pub use generator::{ArtifactGenerator, CommandGenerator};
pub use orchestrator::{
    ItemFailure, ItemOutcome, Orchestrator, ProgressReporter, RunPlan, SilentProgress,
};
pub use stats::RunStatistics;
