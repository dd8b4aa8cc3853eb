//! Staged sync pipeline: merge sink, external steps, orchestration and reports.

use std::fmt;

use serde::{Deserialize, Serialize};

mod config;
mod merge;
mod pipeline;
mod report;
mod retry;
mod steps;

pub use config::{
    GateStepKind, LoadStepKind, PipelineFile, PipelineSteps, ScrapeStepKind, StepSpec, SyncConfig,
};
pub use merge::StagingMerger;
pub use pipeline::{PipelineOrchestrator, RunOutcome, RunStatus, ScrapeSummary, StepReport};
pub use report::{recent_runs_markdown, render_brief, write_run_reports};
pub use retry::{run_with_retry, Attempted, RetryDisposition, StepError, StepPolicy};
pub use steps::{
    manifest_counts, BulkLoader, CommandGate, CommandLoader, CommandSpec, GateTarget, ParquetLoader,
    ParquetManifest, ParquetManifestFile, ValidationGate,
};

pub const CRATE_NAME: &str = "scorebook-sync";

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Prepare,
    Scrape,
    Load,
    ValidateDev,
    ValidateProd,
    Promote,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Prepare,
        Step::Scrape,
        Step::Load,
        Step::ValidateDev,
        Step::ValidateProd,
        Step::Promote,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::Scrape => "scrape",
            Step::Load => "load",
            Step::ValidateDev => "validate_dev",
            Step::ValidateProd => "validate_prod",
            Step::Promote => "promote",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
