//! Scraper collaborator contracts + fixture-first and subprocess scrapers.
//!
//! Scrapers never touch table files. They hand each discrete unit of data
//! (a date, a match, a league table) to a [`BatchSink`], which merges and
//! persists it before the scraper moves on.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use scorebook_core::{MatchEventRow, MatchRow, Record, ScrapedBatch, StandingsRow, Table};
use scorebook_storage::UpsertStats;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

mod command;
mod fixture;

pub use command::CommandScraper;
pub use fixture::{load_bundle, FixtureBundle, FixtureScraper};

pub const CRATE_NAME: &str = "scorebook-adapters";

/// Env var through which a scraper is told where staging lives.
pub const OUTPUT_DIR_ENV: &str = "SCOREBOOK_OUTPUT_DIR";

/// How much upstream data a run asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "since", rename_all = "snake_case")]
pub enum IncrementalWindow {
    Full,
    Since(NaiveDate),
}

impl IncrementalWindow {
    pub fn includes(&self, date: NaiveDate) -> bool {
        match self {
            IncrementalWindow::Full => true,
            IncrementalWindow::Since(since) => date >= *since,
        }
    }
}

impl fmt::Display for IncrementalWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncrementalWindow::Full => f.write_str("full season"),
            IncrementalWindow::Since(since) => write!(f, "since {since}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub window: IncrementalWindow,
    pub full_refresh: bool,
    pub output_dir: PathBuf,
}

/// Merge target for scraped units.
///
/// `on_batch_merged` must leave the merged unit durable before returning.
/// An error from it aborts the scrape: it means persistence is broken.
pub trait BatchSink: Send {
    fn on_batch_merged(&mut self, unit: &str, batch: ScrapedBatch) -> anyhow::Result<UpsertStats>;

    /// False when `id` is terminal and no full refresh is in effect.
    fn needs_refinement(&self, id: &str) -> bool;

    fn should_refresh_series(&self, series: &str) -> bool;

    fn mark_series_refreshed(&mut self, series: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding batch envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("scraper `{program}` exited with {status}")]
    Exit { program: String, status: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One unit of scraper output, as recorded in fixture bundles and as emitted
/// line-by-line by subprocess scrapers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub unit: String,
    pub table: Table,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub unit: String,
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub table: Table,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeReport {
    pub completed: Vec<UnitOutcome>,
    pub failed: Vec<UnitFailure>,
    pub skipped: Vec<String>,
    pub rejected: Vec<RejectedRecord>,
}

impl ScrapeReport {
    pub fn totals(&self) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for unit in &self.completed {
            stats += UpsertStats {
                inserted: unit.inserted,
                updated: unit.updated,
            };
        }
        stats
    }

    pub fn record_failure(&mut self, unit: impl Into<String>, error: impl fmt::Display) {
        let unit = unit.into();
        warn!(%unit, %error, "scrape unit failed");
        self.failed.push(UnitFailure {
            unit,
            error: error.to_string(),
        });
    }
}

#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &str;

    async fn scrape(
        &self,
        request: &ScrapeRequest,
        sink: &mut dyn BatchSink,
    ) -> Result<ScrapeReport, AdapterError>;
}

fn decode_rows<R: Record>(
    unit: &str,
    values: Vec<JsonValue>,
    rejected: &mut Vec<RejectedRecord>,
) -> Vec<R> {
    let mut rows = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let error = match serde_json::from_value::<R>(value) {
            Ok(row) => match row.validate() {
                Ok(()) => {
                    rows.push(row);
                    continue;
                }
                Err(err) => {
                    let key = row.key_label();
                    warn!(
                        table = %R::TABLE,
                        %unit,
                        index,
                        %key,
                        error = %err,
                        "skipping invalid record"
                    );
                    err.to_string()
                }
            },
            Err(err) => {
                warn!(table = %R::TABLE, %unit, index, error = %err, "skipping unparsable record");
                err.to_string()
            }
        };
        rejected.push(RejectedRecord {
            unit: unit.to_string(),
            index,
            error,
        });
    }
    rows
}

/// Decode each record independently; bad records are returned as rejects and
/// never block the rest of the batch.
pub fn decode_envelope(envelope: BatchEnvelope) -> (ScrapedBatch, Vec<RejectedRecord>) {
    let mut rejected = Vec::new();
    let unit = envelope.unit;
    let batch = match envelope.table {
        Table::Standings => ScrapedBatch::Standings(decode_rows::<StandingsRow>(
            &unit,
            envelope.records,
            &mut rejected,
        )),
        Table::Matches => {
            ScrapedBatch::Matches(decode_rows::<MatchRow>(&unit, envelope.records, &mut rejected))
        }
        Table::MatchEvents => ScrapedBatch::MatchEvents(decode_rows::<MatchEventRow>(
            &unit,
            envelope.records,
            &mut rejected,
        )),
    };
    (batch, rejected)
}

pub(crate) fn parse_envelope<T: DeserializeOwned>(text: &str) -> Result<T, AdapterError> {
    serde_json::from_str(text).map_err(AdapterError::Envelope)
}

/// Apply window, series and terminal filters to one envelope, then merge it.
pub(crate) fn deliver(
    envelope: BatchEnvelope,
    request: &ScrapeRequest,
    sink: &mut dyn BatchSink,
    report: &mut ScrapeReport,
) -> Result<(), AdapterError> {
    let unit = envelope.unit.clone();

    if let Some(date) = envelope.date {
        if !request.window.includes(date) {
            info!(%unit, %date, window = %request.window, "unit outside scrape window");
            report.skipped.push(unit);
            return Ok(());
        }
    }
    if let Some(series) = envelope.series.as_deref() {
        if !sink.should_refresh_series(series) {
            info!(%unit, series, "series already refreshed; skipping");
            report.skipped.push(unit);
            return Ok(());
        }
    }

    let series = envelope.series.clone();
    let table = envelope.table;
    let (batch, rejected) = decode_envelope(envelope);
    let all_rejected = batch.is_empty() && !rejected.is_empty();
    report.rejected.extend(rejected);

    let batch = match batch {
        ScrapedBatch::Matches(rows) => {
            let before = rows.len();
            let rows: Vec<MatchRow> = rows
                .into_iter()
                .filter(|row| sink.needs_refinement(&row.match_url))
                .collect();
            if rows.len() < before {
                info!(%unit, skipped = before - rows.len(), "terminal matches not reprocessed");
            }
            ScrapedBatch::Matches(rows)
        }
        other => other,
    };

    let stats = if batch.is_empty() {
        UpsertStats::default()
    } else {
        sink.on_batch_merged(&unit, batch)?
    };
    if let Some(series) = series.as_deref() {
        if all_rejected {
            warn!(%unit, series, "every record rejected; series left due for refresh");
        } else {
            sink.mark_series_refreshed(series)?;
        }
    }
    report.completed.push(UnitOutcome {
        unit,
        table,
        inserted: stats.inserted,
        updated: stats.updated,
    });
    Ok(())
}
