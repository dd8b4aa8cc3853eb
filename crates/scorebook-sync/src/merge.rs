use std::collections::{BTreeMap, BTreeSet};

use chrono::{Local, NaiveDate};
use scorebook_adapters::BatchSink;
use scorebook_core::{MatchEventRow, MatchRow, ScrapedBatch, StandingsRow, Table};
use scorebook_storage::{CompletionTracker, RecordStore, StagingLayout, StorageError, UpsertStats};
use tracing::info;

/// The sink scrapers merge into: one store per staging table plus the
/// completion tracker.
///
/// Each batch is upserted and its table saved before `on_batch_merged`
/// returns; finished matches are marked terminal only after their rows are on
/// disk.
///
/// A terminal match is skipped only while the staged copy already holds its
/// result, and series refreshes are held in `refreshed_series` until the run
/// promotes. Staging is rebuilt from production each run, so a failed run
/// must not leave marks for data that never reached production.
pub struct StagingMerger {
    standings: RecordStore<StandingsRow>,
    matches: RecordStore<MatchRow>,
    events: RecordStore<MatchEventRow>,
    tracker: CompletionTracker,
    force_full: bool,
    today: NaiveDate,
    merged: BTreeMap<Table, UpsertStats>,
    refreshed_series: BTreeSet<String>,
}

impl StagingMerger {
    pub fn open(
        layout: &StagingLayout,
        tracker: CompletionTracker,
        force_full: bool,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            standings: RecordStore::load(layout.staging_file(Table::Standings))?,
            matches: RecordStore::load(layout.staging_file(Table::Matches))?,
            events: RecordStore::load(layout.staging_file(Table::MatchEvents))?,
            tracker,
            force_full,
            today: Local::now().date_naive(),
            merged: BTreeMap::new(),
            refreshed_series: BTreeSet::new(),
        })
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Upsert totals per table since the merger was opened.
    pub fn merged(&self) -> &BTreeMap<Table, UpsertStats> {
        &self.merged
    }

    pub fn matches(&self) -> &RecordStore<MatchRow> {
        &self.matches
    }

    /// Series merged by this attempt, to be recorded once the run promotes.
    pub fn refreshed_series(&self) -> &BTreeSet<String> {
        &self.refreshed_series
    }

    fn merge(&mut self, batch: ScrapedBatch) -> Result<UpsertStats, StorageError> {
        match batch {
            ScrapedBatch::Standings(rows) => {
                let stats = self.standings.upsert_batch(rows);
                self.standings.save()?;
                Ok(stats)
            }
            ScrapedBatch::MatchEvents(rows) => {
                let stats = self.events.upsert_batch(rows);
                self.events.save()?;
                Ok(stats)
            }
            ScrapedBatch::Matches(rows) => {
                let finished: Vec<String> = rows
                    .iter()
                    .filter(|row| row.has_result())
                    .map(|row| row.match_url.clone())
                    .collect();
                let stats = self.matches.upsert_batch(rows);
                self.matches.save()?;
                let newly_terminal =
                    self.tracker.mark_terminal_all(finished.iter().map(String::as_str))?;
                if newly_terminal > 0 {
                    info!(newly_terminal, "matches with final results marked terminal");
                }
                Ok(stats)
            }
        }
    }
}

impl BatchSink for StagingMerger {
    fn on_batch_merged(&mut self, unit: &str, batch: ScrapedBatch) -> anyhow::Result<UpsertStats> {
        let table = batch.table();
        let stats = self.merge(batch)?;
        *self.merged.entry(table).or_default() += stats;
        let size = match table {
            Table::Standings => self.standings.size(),
            Table::Matches => self.matches.size(),
            Table::MatchEvents => self.events.size(),
        };
        info!(
            %table,
            unit,
            inserted = stats.inserted,
            updated = stats.updated,
            size,
            "batch merged and saved"
        );
        Ok(stats)
    }

    fn needs_refinement(&self, id: &str) -> bool {
        let staged_final = self
            .matches
            .get(&id.to_string())
            .is_some_and(MatchRow::has_result);
        !staged_final || self.tracker.needs_refinement_on(id, self.force_full, self.today)
    }

    fn should_refresh_series(&self, series: &str) -> bool {
        !self.refreshed_series.contains(series)
            && self.tracker.should_reprocess_on(series, self.force_full, self.today)
    }

    fn mark_series_refreshed(&mut self, series: &str) -> anyhow::Result<()> {
        self.refreshed_series.insert(series.to_string());
        Ok(())
    }
}
