use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use scorebook_adapters::{CommandScraper, FixtureScraper, Scraper, OUTPUT_DIR_ENV};
use scorebook_storage::{PacingPolicy, RefreshCadence, StagingLayout};
use serde::Deserialize;
use tracing::warn;

use crate::retry::StepPolicy;
use crate::steps::{
    BulkLoader, CommandGate, CommandLoader, CommandSpec, ParquetLoader, ValidationGate,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/staging` when set.
    pub staging_dir: Option<PathBuf>,
    pub state_file: PathBuf,
    pub full_refresh: bool,
    pub pipeline_file: PathBuf,
    pub reports_dir: PathBuf,
    pub cadence: RefreshCadence,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("SCOREBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let cadence = match lookup("SCOREBOOK_REFRESH_CADENCE") {
            Some(raw) => raw
                .parse::<RefreshCadence>()
                .map_err(|e| anyhow!(e))
                .context("parsing SCOREBOOK_REFRESH_CADENCE")?,
            None => RefreshCadence::default(),
        };
        let config = Self {
            staging_dir: lookup(OUTPUT_DIR_ENV).filter(|v| !v.is_empty()).map(PathBuf::from),
            state_file: lookup("SCOREBOOK_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("scrape_state.json")),
            full_refresh: lookup("SCOREBOOK_FULL_REFRESH").map(|v| truthy(&v)).unwrap_or(false),
            pipeline_file: lookup("SCOREBOOK_PIPELINE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./pipeline.yaml")),
            reports_dir: lookup("SCOREBOOK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            cadence,
            scheduler_enabled: lookup("SCOREBOOK_SCHEDULER_ENABLED")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            sync_cron: lookup("SCOREBOOK_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * Mon".to_string()),
            data_dir,
        };
        config
            .layout()
            .check_disjoint()
            .with_context(|| format!("checking {OUTPUT_DIR_ENV}"))?;
        Ok(config)
    }

    pub fn layout(&self) -> StagingLayout {
        let layout = StagingLayout::under(&self.data_dir);
        match &self.staging_dir {
            Some(dir) => layout.with_staging(dir),
            None => layout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapeStepKind {
    Command(CommandSpec),
    Fixtures {
        paths: Vec<PathBuf>,
        #[serde(default)]
        pacing_min_ms: u64,
        #[serde(default)]
        pacing_max_ms: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadStepKind {
    Command(CommandSpec),
    Parquet { warehouse_dir: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateStepKind {
    Command(CommandSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec<K> {
    #[serde(flatten)]
    pub kind: K,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
}

impl<K> StepSpec<K> {
    fn policy(
        &self,
        default_timeout: u64,
        default_retries: usize,
        default_delay: u64,
    ) -> StepPolicy {
        StepPolicy::retrying(
            Duration::from_secs(self.timeout_secs.unwrap_or(default_timeout)),
            self.retries.unwrap_or(default_retries),
            Duration::from_secs(self.retry_delay_secs.unwrap_or(default_delay)),
        )
    }

    fn gate_policy(&self, step: &str) -> StepPolicy {
        if self.retries.is_some_and(|n| n > 0) {
            warn!(step, "validation gates are never retried; ignoring `retries`");
        }
        StepPolicy::once(Duration::from_secs(self.timeout_secs.unwrap_or(1800)))
    }
}

/// External step definitions, read from `pipeline.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    pub scrape: StepSpec<ScrapeStepKind>,
    pub load: StepSpec<LoadStepKind>,
    pub validate_dev: StepSpec<GateStepKind>,
    pub validate_prod: StepSpec<GateStepKind>,
}

/// Collaborators and their policies, ready for the orchestrator.
pub struct PipelineSteps {
    pub scraper: Box<dyn Scraper>,
    pub loader: Box<dyn BulkLoader>,
    pub dev_gate: Box<dyn ValidationGate>,
    pub prod_gate: Box<dyn ValidationGate>,
    pub scrape_policy: StepPolicy,
    pub load_policy: StepPolicy,
    pub dev_gate_policy: StepPolicy,
    pub prod_gate_policy: StepPolicy,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Relative paths in the file resolve against `base` (the file's directory).
    pub fn into_steps(self, base: &Path) -> PipelineSteps {
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

        let scrape_policy = self.scrape.policy(3600, 2, 60);
        let scraper: Box<dyn Scraper> = match self.scrape.kind {
            ScrapeStepKind::Command(spec) => {
                let mut scraper = CommandScraper::new(spec.program).args(spec.args);
                if let Some(dir) = spec.working_dir {
                    scraper = scraper.current_dir(resolve(&dir));
                }
                Box::new(scraper)
            }
            ScrapeStepKind::Fixtures {
                paths,
                pacing_min_ms,
                pacing_max_ms,
            } => Box::new(
                FixtureScraper::new(paths.iter().map(|p| resolve(p))).with_pacing(PacingPolicy {
                    min: Duration::from_millis(pacing_min_ms),
                    max: Duration::from_millis(pacing_max_ms),
                    jitter: Duration::ZERO,
                }),
            ),
        };

        let load_policy = self.load.policy(1800, 1, 30);
        let loader: Box<dyn BulkLoader> = match self.load.kind {
            LoadStepKind::Command(spec) => Box::new(CommandLoader::new(spec.resolved(&resolve))),
            LoadStepKind::Parquet { warehouse_dir } => {
                Box::new(ParquetLoader::new(resolve(&warehouse_dir)))
            }
        };

        let dev_gate_policy = self.validate_dev.gate_policy("validate_dev");
        let prod_gate_policy = self.validate_prod.gate_policy("validate_prod");
        let GateStepKind::Command(dev) = self.validate_dev.kind;
        let GateStepKind::Command(prod) = self.validate_prod.kind;

        PipelineSteps {
            scraper,
            loader,
            dev_gate: Box::new(CommandGate::new("validate_dev", dev.resolved(&resolve))),
            prod_gate: Box::new(CommandGate::new("validate_prod", prod.resolved(&resolve))),
            scrape_policy,
            load_policy,
            dev_gate_policy,
            prod_gate_policy,
        }
    }
}
