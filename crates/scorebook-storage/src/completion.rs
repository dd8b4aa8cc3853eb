use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, Result, StorageError};
use crate::write_atomic;

/// When a series counts as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCadence {
    /// Reprocess each series once per calendar day.
    Daily,
    /// As `Daily`, and on `full_refresh_on` every series and terminal id is
    /// reprocessed (the upstream site publishes weekend results on that day).
    Weekly { full_refresh_on: Weekday },
}

impl Default for RefreshCadence {
    fn default() -> Self {
        RefreshCadence::Weekly {
            full_refresh_on: Weekday::Mon,
        }
    }
}

impl RefreshCadence {
    pub fn is_full_refresh_day(&self, today: NaiveDate) -> bool {
        match self {
            RefreshCadence::Daily => false,
            RefreshCadence::Weekly { full_refresh_on } => today.weekday() == *full_refresh_on,
        }
    }
}

impl FromStr for RefreshCadence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "daily" {
            return Ok(RefreshCadence::Daily);
        }
        match s.split_once(':') {
            Some(("weekly", day)) => day
                .parse::<Weekday>()
                .map(|full_refresh_on| RefreshCadence::Weekly { full_refresh_on })
                .map_err(|_| format!("unknown weekday `{day}`")),
            _ => Err(format!("unknown refresh cadence `{s}` (daily | weekly:<weekday>)")),
        }
    }
}

impl fmt::Display for RefreshCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshCadence::Daily => f.write_str("daily"),
            RefreshCadence::Weekly { full_refresh_on } => write!(f, "weekly:{full_refresh_on}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CompletionState {
    #[serde(default, alias = "standings")]
    series: BTreeMap<String, NaiveDate>,
    #[serde(default, alias = "completed_matches")]
    terminal: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionStats {
    pub series_tracked: usize,
    pub terminal_ids: usize,
}

/// Persisted record of finished work: terminal ids plus per-series refresh dates.
///
/// Every mutation is written to disk before the call returns. Terminal ids are
/// only ever added; `reset` is the one path that discards them.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    path: PathBuf,
    cadence: RefreshCadence,
    state: CompletionState,
}

impl CompletionTracker {
    /// Read the state document. A missing file yields an empty state; an
    /// unreadable or corrupt one is an error and is never reset implicitly.
    pub fn load(path: impl Into<PathBuf>, cadence: RefreshCadence) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StorageError::CorruptState {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CompletionState::default(),
            Err(err) => return Err(io_err("reading completion state", &path)(err)),
        };
        Ok(Self {
            path,
            cadence,
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cadence(&self) -> RefreshCadence {
        self.cadence
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.state.terminal.contains(id)
    }

    /// Whether an item must be fetched again: not terminal, or a full refresh
    /// (forced or scheduled) is in effect.
    pub fn needs_refinement(&self, id: &str, force_full: bool) -> bool {
        self.needs_refinement_on(id, force_full, today())
    }

    pub fn needs_refinement_on(&self, id: &str, force_full: bool, today: NaiveDate) -> bool {
        force_full || self.cadence.is_full_refresh_day(today) || !self.is_terminal(id)
    }

    pub fn mark_terminal(&mut self, id: &str) -> Result<()> {
        self.mark_terminal_all([id]).map(|_| ())
    }

    /// Add several ids with a single write. Returns how many were new.
    pub fn mark_terminal_all<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize> {
        let mut next = self.state.clone();
        let added = ids
            .into_iter()
            .filter(|id| next.terminal.insert((*id).to_string()))
            .count();
        if added > 0 {
            self.commit(next)?;
        }
        Ok(added)
    }

    pub fn should_reprocess(&self, series: &str, force_full: bool) -> bool {
        self.should_reprocess_on(series, force_full, today())
    }

    pub fn should_reprocess_on(&self, series: &str, force_full: bool, today: NaiveDate) -> bool {
        if force_full || self.cadence.is_full_refresh_day(today) {
            return true;
        }
        self.last_refresh_date(series) != Some(today)
    }

    pub fn last_refresh_date(&self, series: &str) -> Option<NaiveDate> {
        self.state.series.get(series).copied()
    }

    pub fn mark_refreshed(&mut self, series: &str) -> Result<()> {
        self.mark_refreshed_on(series, today())
    }

    pub fn mark_refreshed_on(&mut self, series: &str, date: NaiveDate) -> Result<()> {
        let mut next = self.state.clone();
        next.series.insert(series.to_string(), date);
        self.commit(next)
    }

    /// Discard all history. Reserved for deliberate full refreshes.
    pub fn reset(&mut self) -> Result<()> {
        tracing::warn!(
            path = %self.path.display(),
            terminal_ids = self.state.terminal.len(),
            series = self.state.series.len(),
            "resetting completion state"
        );
        self.commit(CompletionState::default())
    }

    pub fn stats(&self) -> CompletionStats {
        CompletionStats {
            series_tracked: self.state.series.len(),
            terminal_ids: self.state.terminal.len(),
        }
    }

    /// Write `next` to disk, then adopt it. On error the in-memory state
    /// still matches the last durable write.
    fn commit(&mut self, next: CompletionState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&next).map_err(StorageError::EncodeState)?;
        write_atomic(&self.path, &bytes)?;
        self.state = next;
        Ok(())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
