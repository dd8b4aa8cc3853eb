//! Core record schemas and natural-key contracts for scorebook.

use std::fmt;

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "scorebook-core";

/// The three tables that move through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Standings,
    Matches,
    MatchEvents,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Standings, Table::Matches, Table::MatchEvents];

    pub fn name(self) -> &'static str {
        match self {
            Table::Standings => "standings",
            Table::Matches => "matches",
            Table::MatchEvents => "match_events",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.name())
    }

    /// Column order of the persisted file, header included.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Standings => &[
                "season",
                "phase",
                "competition_group",
                "competition",
                "position",
                "team",
                "played",
                "won",
                "drawn",
                "lost",
                "goals_for",
                "goals_against",
                "goal_difference",
                "points",
                "source_url",
                "scraped_at",
            ],
            Table::Matches => &[
                "season",
                "phase",
                "competition_group",
                "competition",
                "match_date",
                "match_time",
                "home_team",
                "away_team",
                "home_score",
                "away_score",
                "venue",
                "match_url",
                "scraped_at",
            ],
            Table::MatchEvents => &[
                "season",
                "match_url",
                "match_date",
                "home_team",
                "away_team",
                "home_logo",
                "away_logo",
                "event_type",
                "event_subtype",
                "team",
                "player_name",
                "minute",
                "scraped_at",
            ],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{table}: key field `{field}` is empty")]
    EmptyKeyField { table: Table, field: &'static str },
    #[error("{table}: field `{field}` has invalid date `{value}`")]
    InvalidDate {
        table: Table,
        field: &'static str,
        value: String,
    },
    #[error("match_events: unknown event_type `{0}` (expected goal or card)")]
    InvalidEventType(String),
}

/// A flat row with a natural identity.
///
/// Two records with equal `natural_key` are the same entity; a later upsert
/// replaces the earlier row in full.
pub trait Record:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    const TABLE: Table;
    type Key: Ord + Clone + fmt::Debug + Send + Sync;

    fn natural_key(&self) -> Self::Key;

    fn scraped_at(&self) -> &str;

    /// Human-readable key for log lines.
    fn key_label(&self) -> String;

    fn validate(&self) -> Result<(), RecordError>;

    fn scraped_date(&self) -> Option<NaiveDate> {
        date_prefix(self.scraped_at())
    }
}

/// Date portion of an ISO timestamp: `2026-02-03T14:30:00` -> `2026-02-03`.
pub fn date_prefix(timestamp: &str) -> Option<NaiveDate> {
    let head = timestamp.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn require(table: Table, field: &'static str, value: &str) -> Result<(), RecordError> {
    if value.trim().is_empty() {
        Err(RecordError::EmptyKeyField { table, field })
    } else {
        Ok(())
    }
}

fn require_scraped_at(table: Table, value: &str) -> Result<(), RecordError> {
    date_prefix(value).map(|_| ()).ok_or_else(|| RecordError::InvalidDate {
        table,
        field: "scraped_at",
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingsRow {
    pub season: String,
    pub phase: String,
    pub competition_group: String,
    pub competition: String,
    pub position: u32,
    pub team: String,
    pub played: u32,
    pub won: u32,
    pub drawn: u32,
    pub lost: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub goal_difference: i32,
    pub points: i32,
    pub source_url: String,
    pub scraped_at: String,
}

impl Record for StandingsRow {
    const TABLE: Table = Table::Standings;
    type Key = (String, String, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.season.clone(),
            self.competition.clone(),
            self.team.clone(),
        )
    }

    fn scraped_at(&self) -> &str {
        &self.scraped_at
    }

    fn key_label(&self) -> String {
        format!("{}/{}/{}", self.season, self.competition, self.team)
    }

    fn validate(&self) -> Result<(), RecordError> {
        require(Self::TABLE, "season", &self.season)?;
        require(Self::TABLE, "competition", &self.competition)?;
        require(Self::TABLE, "team", &self.team)?;
        require_scraped_at(Self::TABLE, &self.scraped_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRow {
    pub season: String,
    pub phase: String,
    pub competition_group: String,
    pub competition: String,
    pub match_date: String,
    pub match_time: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub venue: String,
    pub match_url: String,
    pub scraped_at: String,
}

impl MatchRow {
    /// Both scores known. A 0-0 draw is a result.
    pub fn has_result(&self) -> bool {
        self.home_score.is_some() && self.away_score.is_some()
    }
}

impl Record for MatchRow {
    const TABLE: Table = Table::Matches;
    type Key = String;

    fn natural_key(&self) -> Self::Key {
        self.match_url.clone()
    }

    fn scraped_at(&self) -> &str {
        &self.scraped_at
    }

    fn key_label(&self) -> String {
        self.match_url.clone()
    }

    fn validate(&self) -> Result<(), RecordError> {
        require(Self::TABLE, "match_url", &self.match_url)?;
        if !self.match_date.is_empty()
            && NaiveDate::parse_from_str(&self.match_date, "%Y-%m-%d").is_err()
        {
            return Err(RecordError::InvalidDate {
                table: Self::TABLE,
                field: "match_date",
                value: self.match_date.clone(),
            });
        }
        require_scraped_at(Self::TABLE, &self.scraped_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEventRow {
    pub season: String,
    pub match_url: String,
    pub match_date: String,
    pub home_team: String,
    pub away_team: String,
    pub home_logo: String,
    pub away_logo: String,
    pub event_type: String,
    pub event_subtype: String,
    pub team: String,
    pub player_name: String,
    pub minute: u32,
    pub scraped_at: String,
}

impl Record for MatchEventRow {
    const TABLE: Table = Table::MatchEvents;
    type Key = (String, String, u32, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.match_url.clone(),
            self.player_name.clone(),
            self.minute,
            self.event_type.clone(),
        )
    }

    fn scraped_at(&self) -> &str {
        &self.scraped_at
    }

    fn key_label(&self) -> String {
        format!(
            "{} {} {}' {}",
            self.match_url, self.player_name, self.minute, self.event_type
        )
    }

    fn validate(&self) -> Result<(), RecordError> {
        require(Self::TABLE, "match_url", &self.match_url)?;
        require(Self::TABLE, "player_name", &self.player_name)?;
        require(Self::TABLE, "event_type", &self.event_type)?;
        if !matches!(self.event_type.as_str(), "goal" | "card") {
            return Err(RecordError::InvalidEventType(self.event_type.clone()));
        }
        require_scraped_at(Self::TABLE, &self.scraped_at)
    }
}

/// One discrete unit of newly scraped data, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapedBatch {
    Standings(Vec<StandingsRow>),
    Matches(Vec<MatchRow>),
    MatchEvents(Vec<MatchEventRow>),
}

impl ScrapedBatch {
    pub fn table(&self) -> Table {
        match self {
            ScrapedBatch::Standings(_) => Table::Standings,
            ScrapedBatch::Matches(_) => Table::Matches,
            ScrapedBatch::MatchEvents(_) => Table::MatchEvents,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScrapedBatch::Standings(rows) => rows.len(),
            ScrapedBatch::Matches(rows) => rows.len(),
            ScrapedBatch::MatchEvents(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
