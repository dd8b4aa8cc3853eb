use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scorebook_adapters::{
    AdapterError, BatchSink, IncrementalWindow, ScrapeReport, ScrapeRequest, Scraper, UnitOutcome,
};
use scorebook_core::{MatchRow, ScrapedBatch, Table};
use scorebook_storage::{
    fingerprint, row_counts, BackupHandle, CompletionTracker, RecordStore, RefreshCadence,
    TableCounts,
};
use scorebook_sync::{
    BulkLoader, GateTarget, PipelineOrchestrator, PipelineSteps, RunStatus, Step, StepError,
    StepPolicy, SyncConfig, ValidationGate,
};
use tempfile::{tempdir, TempDir};

fn mk_match(url: &str, home: Option<u32>, away: Option<u32>, scraped_at: &str) -> MatchRow {
    MatchRow {
        season: "2025-2026".into(),
        phase: "Phase 1".into(),
        competition_group: "Womens".into(),
        competition: "Premier Division".into(),
        match_date: "2025-10-04".into(),
        match_time: "12:00".into(),
        home_team: "Surbiton".into(),
        away_team: "Hampstead".into(),
        home_score: home,
        away_score: away,
        venue: "Sugden Road".into(),
        match_url: url.into(),
        scraped_at: scraped_at.into(),
    }
}

/// Shares a fake with the test body after it is boxed into the pipeline.
struct Shared<T>(Arc<T>);

/// Merges one unit per entry of `units`; the first `fail_attempts` attempts
/// die after their first unit.
struct FakeScraper {
    units: Vec<Vec<MatchRow>>,
    fail_attempts: usize,
    /// Sleep this long before merging anything.
    stall: Option<Duration>,
    /// Series the units belong to, checked and marked like a league table.
    series: Option<&'static str>,
    attempts: AtomicUsize,
    seen_windows: Mutex<Vec<IncrementalWindow>>,
    refinement_of_m1: Mutex<Vec<bool>>,
    series_due: Mutex<Vec<bool>>,
}

impl FakeScraper {
    fn new(units: Vec<Vec<MatchRow>>) -> Self {
        Self {
            units,
            fail_attempts: 0,
            stall: None,
            series: None,
            attempts: AtomicUsize::new(0),
            seen_windows: Mutex::new(Vec::new()),
            refinement_of_m1: Mutex::new(Vec::new()),
            series_due: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Scraper for Shared<FakeScraper> {
    fn name(&self) -> &str {
        "fake"
    }

    async fn scrape(
        &self,
        request: &ScrapeRequest,
        sink: &mut dyn BatchSink,
    ) -> Result<ScrapeReport, AdapterError> {
        let this = &self.0;
        let attempt = this.attempts.fetch_add(1, Ordering::SeqCst);
        this.seen_windows.lock().unwrap().push(request.window);
        this.refinement_of_m1
            .lock()
            .unwrap()
            .push(sink.needs_refinement("M1"));
        if let Some(stall) = this.stall {
            tokio::time::sleep(stall).await;
        }

        let mut report = ScrapeReport::default();
        if let Some(series) = this.series {
            let due = sink.should_refresh_series(series);
            this.series_due.lock().unwrap().push(due);
            if !due {
                report.skipped.push(series.to_string());
                return Ok(report);
            }
        }
        for (index, rows) in this.units.iter().enumerate() {
            let unit = format!("unit-{index}");
            let stats = sink.on_batch_merged(&unit, ScrapedBatch::Matches(rows.clone()))?;
            report.completed.push(UnitOutcome {
                unit,
                table: Table::Matches,
                inserted: stats.inserted,
                updated: stats.updated,
            });
            if attempt < this.fail_attempts {
                return Err(AdapterError::Message("upstream reset the connection".into()));
            }
        }
        if let Some(series) = this.series {
            sink.mark_series_refreshed(series)?;
        }
        Ok(report)
    }
}

#[derive(Default)]
struct FakeLoader {
    calls: AtomicUsize,
    always_fail: bool,
}

#[async_trait]
impl BulkLoader for Shared<FakeLoader> {
    fn name(&self) -> &str {
        "fake-loader"
    }

    async fn load(&self, staging: &Path) -> Result<TableCounts, StepError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if self.0.always_fail {
            return Err(StepError::Transient("warehouse unavailable".into()));
        }
        Ok(row_counts(staging).await?)
    }
}

struct FakeGate {
    calls: AtomicUsize,
    passes: AtomicBool,
}

impl FakeGate {
    fn new(passes: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            passes: AtomicBool::new(passes),
        })
    }

    fn set_passes(&self, passes: bool) {
        self.passes.store(passes, Ordering::SeqCst);
    }
}

#[async_trait]
impl ValidationGate for Shared<FakeGate> {
    fn name(&self) -> &str {
        "fake-gate"
    }

    async fn validate(&self, target: GateTarget, _staging: &Path) -> Result<(), StepError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if self.0.passes.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StepError::DataQuality(format!(
                "{target}: not_null_matches_home_team failed"
            )))
        }
    }
}

struct Harness {
    dir: TempDir,
    scraper: Arc<FakeScraper>,
    loader: Arc<FakeLoader>,
    dev_gate: Arc<FakeGate>,
    prod_gate: Arc<FakeGate>,
    scrape_timeout: Duration,
}

impl Harness {
    fn new(scraper: FakeScraper) -> Self {
        Self {
            dir: tempdir().expect("tempdir"),
            scraper: Arc::new(scraper),
            loader: Arc::new(FakeLoader::default()),
            dev_gate: FakeGate::new(true),
            prod_gate: FakeGate::new(true),
            scrape_timeout: Duration::from_secs(10),
        }
    }

    fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn production(&self) -> PathBuf {
        self.data().join("production")
    }

    fn state_file(&self) -> PathBuf {
        self.data().join("scrape_state.json")
    }

    fn config(&self) -> SyncConfig {
        let data = self.data().display().to_string();
        let reports = self.dir.path().join("reports").display().to_string();
        SyncConfig::from_lookup(|key| match key {
            "SCOREBOOK_DATA_DIR" => Some(data.clone()),
            "SCOREBOOK_REPORTS_DIR" => Some(reports.clone()),
            "SCOREBOOK_REFRESH_CADENCE" => Some("daily".to_string()),
            _ => None,
        })
        .expect("config")
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        self.orchestrator_with(self.config())
    }

    fn orchestrator_with(&self, config: SyncConfig) -> PipelineOrchestrator {
        let quick = |timeout, retries| StepPolicy::retrying(timeout, retries, Duration::ZERO);
        let gate_policy = StepPolicy::once(Duration::from_secs(10));
        let steps = PipelineSteps {
            scraper: Box::new(Shared(Arc::clone(&self.scraper))),
            loader: Box::new(Shared(Arc::clone(&self.loader))),
            dev_gate: Box::new(Shared(Arc::clone(&self.dev_gate))),
            prod_gate: Box::new(Shared(Arc::clone(&self.prod_gate))),
            scrape_policy: quick(self.scrape_timeout, 2),
            load_policy: quick(Duration::from_secs(10), 1),
            dev_gate_policy: gate_policy,
            prod_gate_policy: gate_policy,
        };
        PipelineOrchestrator::new(config, steps)
            .with_today(NaiveDate::from_ymd_opt(2025, 10, 7).expect("date"))
    }

    fn seed_production(&self, rows: Vec<MatchRow>) {
        let path = self.production().join(Table::Matches.file_name());
        let mut store = RecordStore::<MatchRow>::empty(path);
        store.upsert_batch(rows);
        store.save().expect("seed production");
    }

    fn production_matches(&self) -> RecordStore<MatchRow> {
        RecordStore::load(self.production().join(Table::Matches.file_name()))
            .expect("load production")
    }

    fn production_score(&self, url: &str) -> Option<u32> {
        self.production_matches()
            .get(&url.to_string())
            .and_then(|m| m.home_score)
    }
}

fn steps_run(outcome: &scorebook_sync::RunOutcome) -> Vec<Step> {
    outcome.steps.iter().map(|s| s.step).collect()
}

#[tokio::test]
async fn successful_run_promotes_merged_data() {
    let harness = Harness::new(FakeScraper::new(vec![vec![
        mk_match("M1", Some(2), Some(1), "2025-10-05T09:00:00"),
        mk_match("M2", None, None, "2025-10-05T09:00:00"),
    ]]));
    harness.seed_production(vec![mk_match("M1", None, None, "2025-10-01T09:00:00")]);

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(steps_run(&outcome), Step::ALL.to_vec());
    assert_eq!(
        outcome.window,
        Some(IncrementalWindow::Since(
            NaiveDate::from_ymd_opt(2025, 10, 1).expect("date")
        ))
    );

    let production = harness.production_matches();
    assert_eq!(production.size(), 2);
    assert_eq!(harness.production_score("M1"), Some(2));
    assert_eq!(outcome.final_counts.get(&Table::Matches), Some(&2));
    assert_eq!(
        outcome.promotion.as_ref().map(|p| p.delta(Table::Matches)),
        Some(1)
    );

    let Some(BackupHandle::Created { dir, counts }) = &outcome.backup else {
        panic!("expected a backup, got {:?}", outcome.backup);
    };
    assert_eq!(counts.get(&Table::Matches), Some(&1));
    assert!(dir.join("matches.csv").exists());

    let tracker =
        CompletionTracker::load(harness.state_file(), RefreshCadence::Daily).expect("tracker");
    assert!(tracker.is_terminal("M1"));
    assert!(!tracker.is_terminal("M2"));

    let reports = outcome.reports_dir.as_ref().expect("reports dir");
    assert!(reports.join("run_summary.json").exists());
    assert!(reports.join("daily_brief.md").exists());
}

#[tokio::test]
async fn failed_gate_leaves_production_byte_identical() {
    let mut harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        Some(2),
        Some(1),
        "2025-10-05T09:00:00",
    )]]));
    harness.dev_gate = FakeGate::new(false);
    harness.seed_production(vec![mk_match("M1", None, None, "2025-10-01T09:00:00")]);
    let before = fingerprint(&harness.production()).await.expect("fingerprint");

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert!(matches!(
        outcome.status,
        RunStatus::Failed { step: Step::ValidateDev, error: StepError::DataQuality(_) }
    ));
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
    assert!(outcome.promotion.is_none());
    assert_eq!(harness.dev_gate.calls.load(Ordering::SeqCst), 1, "gates are never retried");
    assert_eq!(harness.prod_gate.calls.load(Ordering::SeqCst), 0);

    // The rejected staging copy stays on disk for inspection.
    let staged = RecordStore::<MatchRow>::load(harness.data().join("staging").join("matches.csv"))
        .expect("staging");
    assert_eq!(staged.get(&"M1".to_string()).and_then(|m| m.home_score), Some(2));
    assert!(outcome
        .reports_dir
        .as_ref()
        .is_some_and(|dir| dir.join("daily_brief.md").exists()));
}

#[tokio::test]
async fn failed_prod_gate_stops_before_promote() {
    let mut harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        Some(2),
        Some(1),
        "2025-10-05T09:00:00",
    )]]));
    harness.prod_gate = FakeGate::new(false);
    harness.seed_production(vec![mk_match("M1", None, None, "2025-10-01T09:00:00")]);
    let before = fingerprint(&harness.production()).await.expect("fingerprint");

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert!(matches!(
        outcome.status,
        RunStatus::Failed { step: Step::ValidateProd, error: StepError::DataQuality(_) }
    ));
    assert_eq!(
        steps_run(&outcome),
        vec![Step::Prepare, Step::Scrape, Step::Load, Step::ValidateDev, Step::ValidateProd]
    );
    assert_eq!(harness.dev_gate.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.prod_gate.calls.load(Ordering::SeqCst), 1);
    assert!(outcome.promotion.is_none());
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
}

#[tokio::test]
async fn result_from_a_rejected_run_is_merged_again_by_the_next_run() {
    let harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        Some(2),
        Some(1),
        "2025-10-05T09:00:00",
    )]]));
    harness.seed_production(vec![mk_match("M1", None, None, "2025-10-01T09:00:00")]);

    harness.dev_gate.set_passes(false);
    let rejected = harness.orchestrator().run_once().await.expect("first run");
    assert!(!rejected.is_success());
    assert_eq!(harness.production_score("M1"), None);

    harness.dev_gate.set_passes(true);
    let accepted = harness.orchestrator().run_once().await.expect("second run");

    assert_eq!(accepted.status, RunStatus::Completed);
    // M1 is terminal in the tracker, but staging was rebuilt without its score.
    assert_eq!(*harness.scraper.refinement_of_m1.lock().unwrap(), vec![true, true]);
    assert_eq!(harness.production_score("M1"), Some(2));
}

#[tokio::test]
async fn series_refresh_counts_only_once_promoted() {
    let mut scraper = FakeScraper::new(vec![vec![mk_match(
        "M1",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]);
    scraper.series = Some("womens-premier");
    let harness = Harness::new(scraper);

    harness.dev_gate.set_passes(false);
    let rejected = harness.orchestrator().run_once().await.expect("first run");
    assert!(!rejected.is_success());
    let tracker =
        CompletionTracker::load(harness.state_file(), RefreshCadence::Daily).expect("tracker");
    assert_eq!(tracker.last_refresh_date("womens-premier"), None);

    harness.dev_gate.set_passes(true);
    let accepted = harness.orchestrator().run_once().await.expect("second run");
    assert!(accepted.is_success());
    assert_eq!(harness.production_matches().size(), 1);

    let repeat = harness.orchestrator().run_once().await.expect("third run");
    assert!(repeat.is_success());
    assert_eq!(*harness.scraper.series_due.lock().unwrap(), vec![true, true, false]);
    let tracker =
        CompletionTracker::load(harness.state_file(), RefreshCadence::Daily).expect("tracker");
    assert_eq!(
        tracker.last_refresh_date("womens-premier"),
        NaiveDate::from_ymd_opt(2025, 10, 7)
    );
}

#[tokio::test]
async fn staging_pointed_at_production_is_refused() {
    let harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M2",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]));
    harness.seed_production(vec![mk_match("M1", Some(1), Some(0), "2025-10-01T09:00:00")]);
    let before = fingerprint(&harness.production()).await.expect("fingerprint");
    let mut config = harness.config();
    config.staging_dir = Some(harness.production());

    let outcome = harness.orchestrator_with(config).run_once().await.expect("run");

    assert!(matches!(
        outcome.status,
        RunStatus::Failed { step: Step::Prepare, error: StepError::Integrity(_) }
    ));
    assert_eq!(harness.scraper.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
    assert_eq!(harness.production_score("M1"), Some(1));
}

#[tokio::test]
async fn corrupt_completion_state_halts_the_scrape() {
    let harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]));
    harness.seed_production(vec![mk_match("M1", None, None, "2025-10-01T09:00:00")]);
    let corrupt = b"{\"terminal\": [\"M1\"".to_vec();
    std::fs::write(harness.state_file(), &corrupt).expect("write state");
    let before = fingerprint(&harness.production()).await.expect("fingerprint");

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert!(matches!(
        outcome.status,
        RunStatus::Failed { step: Step::Scrape, error: StepError::Integrity(_) }
    ));
    let scrape = outcome
        .steps
        .iter()
        .find(|s| s.step == Step::Scrape)
        .expect("scrape step");
    assert_eq!(scrape.attempts, 1, "integrity failures are not retried");
    assert_eq!(harness.scraper.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(harness.state_file()).expect("read state"), corrupt);
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
}

#[tokio::test]
async fn stalled_scrape_times_out_and_is_retried_before_failing() {
    let mut scraper = FakeScraper::new(vec![vec![mk_match(
        "M1",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]);
    scraper.stall = Some(Duration::from_secs(30));
    let mut harness = Harness::new(scraper);
    harness.scrape_timeout = Duration::from_millis(50);
    harness.seed_production(vec![mk_match("M1", Some(1), Some(0), "2025-10-01T09:00:00")]);
    let before = fingerprint(&harness.production()).await.expect("fingerprint");

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert!(matches!(
        outcome.status,
        RunStatus::Failed { step: Step::Scrape, error: StepError::Timeout(_) }
    ));
    assert_eq!(harness.scraper.attempts.load(Ordering::SeqCst), 3, "two retries");
    assert_eq!(harness.loader.calls.load(Ordering::SeqCst), 0);
    assert!(outcome.promotion.is_none());
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
}

#[tokio::test]
async fn transient_scrape_failure_is_retried_and_earlier_units_survive() {
    let mut scraper = FakeScraper::new(vec![
        vec![mk_match("M1", Some(1), Some(1), "2025-10-05T09:00:00")],
        vec![mk_match("M2", None, None, "2025-10-05T10:00:00")],
    ]);
    scraper.fail_attempts = 1;
    let harness = Harness::new(scraper);

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    let scrape = outcome
        .steps
        .iter()
        .find(|s| s.step == Step::Scrape)
        .expect("scrape step");
    assert_eq!(scrape.attempts, 2);
    assert_eq!(harness.production_matches().size(), 2);
    // The second attempt saw M1's result already saved in staging.
    assert_eq!(*harness.scraper.refinement_of_m1.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn exhausted_load_retries_fail_the_run_without_promotion() {
    let mut harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M9",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]));
    harness.loader = Arc::new(FakeLoader {
        calls: AtomicUsize::new(0),
        always_fail: true,
    });
    harness.seed_production(vec![mk_match("M1", Some(3), Some(0), "2025-10-01T09:00:00")]);
    let before = fingerprint(&harness.production()).await.expect("fingerprint");

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert!(matches!(outcome.status, RunStatus::Failed { step: Step::Load, .. }));
    assert_eq!(harness.loader.calls.load(Ordering::SeqCst), 2, "one retry");
    assert_eq!(harness.dev_gate.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fingerprint(&harness.production()).await.expect("fingerprint"), before);
}

#[tokio::test]
async fn first_run_scrapes_full_window_and_skips_backup() {
    let harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        None,
        None,
        "2025-10-05T09:00:00",
    )]]));

    let outcome = harness.orchestrator().run_once().await.expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.window, Some(IncrementalWindow::Full));
    assert_eq!(outcome.backup, Some(BackupHandle::Skipped));
    assert_eq!(harness.production_matches().size(), 1);
    let counts = row_counts(&harness.production()).await.expect("counts");
    assert_eq!(counts.get(&Table::Standings), Some(&0));
}

#[tokio::test]
async fn terminal_matches_are_not_refined_on_the_next_run() {
    let harness = Harness::new(FakeScraper::new(vec![vec![mk_match(
        "M1",
        Some(4),
        Some(2),
        "2025-10-05T09:00:00",
    )]]));

    harness.orchestrator().run_once().await.expect("first run");
    let second = harness.orchestrator().run_once().await.expect("second run");

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(*harness.scraper.refinement_of_m1.lock().unwrap(), vec![true, false]);
    assert_eq!(
        harness.scraper.seen_windows.lock().unwrap().last().copied(),
        Some(IncrementalWindow::Since(
            NaiveDate::from_ymd_opt(2025, 10, 5).expect("date")
        ))
    );
}
