use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use scorebook_adapters::{IncrementalWindow, ScrapeReport, ScrapeRequest, UnitFailure};
use scorebook_core::{MatchRow, Table};
use scorebook_storage::{
    row_counts, BackupHandle, CompletionTracker, PromotionReport, RecordStore, StagingCoordinator,
    StorageError, TableCounts, UpsertStats,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineFile, PipelineSteps, SyncConfig};
use crate::merge::StagingMerger;
use crate::report::write_run_reports;
use crate::retry::{run_with_retry, StepError};
use crate::steps::GateTarget;
use crate::Step;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed { step: Step, error: StepError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub attempts: usize,
    pub ok: bool,
    pub error: Option<StepError>,
    pub elapsed_ms: u64,
    pub counts_before: TableCounts,
    pub counts_after: TableCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeSummary {
    pub scraper: String,
    pub units_completed: usize,
    pub units_skipped: usize,
    pub records_rejected: usize,
    pub failures: Vec<UnitFailure>,
    pub merged: BTreeMap<Table, UpsertStats>,
    /// Series merged into staging; their refresh dates are recorded on promotion.
    pub series_refreshed: BTreeSet<String>,
}

impl ScrapeSummary {
    fn new(scraper: &str, attempt: ScrapeAttempt) -> Self {
        Self {
            scraper: scraper.to_string(),
            units_completed: attempt.report.completed.len(),
            units_skipped: attempt.report.skipped.len(),
            records_rejected: attempt.report.rejected.len(),
            failures: attempt.report.failed,
            merged: attempt.merged,
            series_refreshed: attempt.series_refreshed,
        }
    }
}

/// What one successful scrape attempt left in staging.
struct ScrapeAttempt {
    report: ScrapeReport,
    merged: BTreeMap<Table, UpsertStats>,
    series_refreshed: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub window: Option<IncrementalWindow>,
    pub full_refresh: bool,
    pub steps: Vec<StepReport>,
    pub scrape: Option<ScrapeSummary>,
    pub backup: Option<BackupHandle>,
    pub promotion: Option<PromotionReport>,
    /// Production row counts when the run ended.
    pub final_counts: TableCounts,
    pub reports_dir: Option<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// What one run has produced so far.
#[derive(Debug, Default)]
struct RunProgress {
    steps: Vec<StepReport>,
    window: Option<IncrementalWindow>,
    scrape: Option<ScrapeSummary>,
    backup: Option<BackupHandle>,
    promotion: Option<PromotionReport>,
}

type StepResult<T> = std::result::Result<T, (Step, StepError)>;

impl RunProgress {
    /// Record the step and log a checkpoint; a failure ends the run.
    fn finish<T>(
        &mut self,
        step: Step,
        attempts: usize,
        started: Instant,
        result: std::result::Result<T, StepError>,
        counts_before: TableCounts,
        counts_after: TableCounts,
    ) -> StepResult<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(%step, attempts, elapsed_ms, counts = ?counts_after, "checkpoint"),
            Err(err) => error!(%step, attempts, elapsed_ms, error = %err, "step failed"),
        }
        self.steps.push(StepReport {
            step,
            attempts,
            ok: result.is_ok(),
            error: result.as_ref().err().cloned(),
            elapsed_ms,
            counts_before,
            counts_after,
        });
        result.map_err(|err| (step, err))
    }
}

async fn snapshot(dir: &Path) -> TableCounts {
    match row_counts(dir).await {
        Ok(counts) => counts,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not count rows for checkpoint");
            TableCounts::new()
        }
    }
}

/// Sequences backup, scrape, load, gates and promotion for one run at a time.
///
/// Production is written only by the final promote; any failure before it
/// leaves production exactly as it was and the staged copy on disk for
/// inspection.
pub struct PipelineOrchestrator {
    config: SyncConfig,
    steps: PipelineSteps,
    today: Option<NaiveDate>,
}

impl PipelineOrchestrator {
    pub fn new(config: SyncConfig, steps: PipelineSteps) -> Self {
        Self {
            config,
            steps,
            today: None,
        }
    }

    /// Build from `config.pipeline_file`.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let file = PipelineFile::load(&config.pipeline_file)?;
        let base = config
            .pipeline_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let steps = file.into_steps(&base);
        Ok(Self::new(config, steps))
    }

    /// Pin the calendar date used for refresh decisions.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Everything from the latest `scraped_at` date in production matches, or
    /// the full season when forced or when production has no matches yet.
    pub fn incremental_window(&self) -> std::result::Result<IncrementalWindow, StorageError> {
        if self.config.full_refresh {
            return Ok(IncrementalWindow::Full);
        }
        let path = self.config.layout().production_file(Table::Matches);
        let production = RecordStore::<MatchRow>::load(path)?;
        Ok(production
            .max_scraped_date()
            .map(IncrementalWindow::Since)
            .unwrap_or(IncrementalWindow::Full))
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let full_refresh =
            self.config.full_refresh || self.config.cadence.is_full_refresh_day(self.today());

        let mut coordinator = StagingCoordinator::new(self.config.layout());
        let mut progress = RunProgress::default();
        let span = info_span!("pipeline_run", %run_id, full_refresh);
        let result = self
            .execute(&mut coordinator, &mut progress, full_refresh)
            .instrument(span)
            .await;

        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err((step, error)) => {
                let state = coordinator.fail();
                warn!(%run_id, %step, ?state, "run failed; production left untouched");
                RunStatus::Failed { step, error }
            }
        };

        let mut outcome = RunOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            window: progress.window,
            full_refresh,
            steps: progress.steps,
            scrape: progress.scrape,
            backup: progress.backup,
            promotion: progress.promotion,
            final_counts: snapshot(&self.config.layout().production).await,
            reports_dir: None,
        };
        let reports_dir = write_run_reports(&self.config.reports_dir, &outcome)
            .await
            .context("writing run reports")?;
        outcome.reports_dir = Some(reports_dir);

        info!(
            %run_id,
            success = outcome.is_success(),
            counts = ?outcome.final_counts,
            "run finished"
        );
        Ok(outcome)
    }

    async fn execute(
        &self,
        coordinator: &mut StagingCoordinator,
        progress: &mut RunProgress,
        full_refresh: bool,
    ) -> StepResult<()> {
        let layout = self.config.layout();
        let staging = layout.staging.as_path();

        // Prepare
        let started = Instant::now();
        let before = snapshot(&layout.production).await;
        let prepared = prepare(coordinator).await;
        let after = snapshot(staging).await;
        let backup = progress.finish(Step::Prepare, 1, started, prepared, before, after)?;
        progress.backup = Some(backup);

        // Scrape
        let started = Instant::now();
        let before = snapshot(staging).await;
        let window = match self.incremental_window() {
            Ok(window) => window,
            Err(err) => {
                let after = before.clone();
                return progress.finish(Step::Scrape, 1, started, Err(err.into()), before, after);
            }
        };
        progress.window = Some(window);
        info!(%window, full_refresh, "scrape window");
        let request = ScrapeRequest {
            window,
            full_refresh,
            output_dir: layout.staging.clone(),
        };
        let this = self;
        let request_ref = &request;
        let attempted = run_with_retry(Step::Scrape, &self.steps.scrape_policy, move || {
            this.scrape_attempt(request_ref)
        })
        .await;
        let scraped = attempted.result.and_then(|scraped| {
            coordinator.mark_mutated()?;
            Ok(scraped)
        });
        let after = snapshot(staging).await;
        let scraped =
            progress.finish(Step::Scrape, attempted.attempts, started, scraped, before, after)?;
        progress.scrape = Some(ScrapeSummary::new(self.steps.scraper.name(), scraped));

        // Load
        let started = Instant::now();
        let staged = snapshot(staging).await;
        let loader = self.steps.loader.as_ref();
        let attempted =
            run_with_retry(Step::Load, &self.steps.load_policy, move || loader.load(staging)).await;
        let loaded = attempted
            .result
            .and_then(|loaded| verify_loaded(&staged, &loaded).map(|_| loaded));
        let counts_after = loaded.clone().unwrap_or_default();
        progress.finish(Step::Load, attempted.attempts, started, loaded, staged, counts_after)?;

        // Gates
        for (step, target, gate, policy) in [
            (
                Step::ValidateDev,
                GateTarget::Dev,
                self.steps.dev_gate.as_ref(),
                &self.steps.dev_gate_policy,
            ),
            (
                Step::ValidateProd,
                GateTarget::Prod,
                self.steps.prod_gate.as_ref(),
                &self.steps.prod_gate_policy,
            ),
        ] {
            let started = Instant::now();
            let counts = snapshot(staging).await;
            let attempted =
                run_with_retry(step, policy, move || gate.validate(target, staging)).await;
            let result = attempted.result;
            progress.finish(step, attempted.attempts, started, result, counts.clone(), counts)?;
        }

        // Promote
        let started = Instant::now();
        let before = snapshot(&layout.production).await;
        let promoted = promote(coordinator).await;
        let after = snapshot(&layout.production).await;
        let promotion = progress.finish(Step::Promote, 1, started, promoted, before, after)?;
        progress.promotion = Some(promotion);

        if let Some(scrape) = &progress.scrape {
            self.record_refreshed_series(&scrape.series_refreshed);
        }
        Ok(())
    }

    /// Production now holds these series, so later runs today may skip them.
    /// A failed write only costs a redundant refresh, so it is logged.
    fn record_refreshed_series(&self, series: &BTreeSet<String>) {
        if series.is_empty() {
            return;
        }
        let recorded = CompletionTracker::load(&self.config.state_file, self.config.cadence)
            .and_then(|mut tracker| {
                series
                    .iter()
                    .try_for_each(|name| tracker.mark_refreshed_on(name, self.today()))
            });
        match recorded {
            Ok(()) => info!(series = series.len(), "series refresh dates recorded"),
            Err(err) => warn!(error = %err, "could not record series refresh dates"),
        }
    }

    async fn scrape_attempt(
        &self,
        request: &ScrapeRequest,
    ) -> std::result::Result<ScrapeAttempt, StepError> {
        // Reopened per attempt so a retry resumes from whatever earlier
        // attempts already saved.
        let tracker = CompletionTracker::load(&self.config.state_file, self.config.cadence)?;
        let layout = self.config.layout();
        let mut merger = StagingMerger::open(&layout, tracker, self.config.full_refresh)?
            .with_today(self.today());
        let report = self.steps.scraper.scrape(request, &mut merger).await?;
        Ok(ScrapeAttempt {
            report,
            merged: merger.merged().clone(),
            series_refreshed: merger.refreshed_series().clone(),
        })
    }

    /// Scheduled runs of `run_once`, when enabled. Overlapping triggers are
    /// skipped while a run is in progress.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let running = Arc::new(tokio::sync::Mutex::new(()));
        let orchestrator = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            let running = Arc::clone(&running);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous scheduled run still in progress; skipping trigger");
                    return;
                };
                match orchestrator.run_once().await {
                    Ok(outcome) => info!(
                        run_id = %outcome.run_id,
                        success = outcome.is_success(),
                        "scheduled run finished"
                    ),
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "scheduled run could not complete")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "pipeline scheduled");
        Ok(Some(sched))
    }
}

async fn prepare(
    coordinator: &mut StagingCoordinator,
) -> std::result::Result<BackupHandle, StepError> {
    let backup = coordinator.backup_production().await?;
    coordinator.reset_staging().await?;
    coordinator.seed_staging_from_production().await?;
    Ok(backup)
}

async fn promote(
    coordinator: &mut StagingCoordinator,
) -> std::result::Result<PromotionReport, StepError> {
    coordinator.mark_validated()?;
    Ok(coordinator.promote().await?)
}

fn verify_loaded(staged: &TableCounts, loaded: &TableCounts) -> std::result::Result<(), StepError> {
    for table in Table::ALL {
        let expected = staged.get(&table).copied().unwrap_or(0);
        let found = loaded.get(&table).copied().unwrap_or(0);
        if expected != found {
            return Err(StepError::DataQuality(format!(
                "loader reported {found} {table} rows, staging holds {expected}"
            )));
        }
    }
    Ok(())
}
