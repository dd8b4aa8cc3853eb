//! External pipeline steps: bulk load and validation gates.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use scorebook_adapters::OUTPUT_DIR_ENV;
use scorebook_core::{MatchEventRow, MatchRow, Record, StandingsRow, Table};
use scorebook_storage::{row_counts, sha256_hex, RecordStore, TableCounts};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::retry::StepError;

/// Which warehouse target a gate checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTarget {
    Dev,
    Prod,
}

impl fmt::Display for GateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateTarget::Dev => "dev",
            GateTarget::Prod => "prod",
        })
    }
}

#[async_trait]
pub trait BulkLoader: Send + Sync {
    fn name(&self) -> &str;

    /// Load every staged table into the downstream store; returns rows loaded
    /// per table.
    async fn load(&self, staging: &Path) -> Result<TableCounts, StepError>;
}

#[async_trait]
pub trait ValidationGate: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, target: GateTarget, staging: &Path) -> Result<(), StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub(crate) fn resolved(mut self, resolve: &dyn Fn(&Path) -> PathBuf) -> Self {
        self.working_dir = self.working_dir.as_deref().map(resolve);
        self
    }
}

const OUTPUT_TAIL_BYTES: usize = 2000;

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    match text.char_indices().rev().nth(OUTPUT_TAIL_BYTES - 1) {
        Some((idx, _)) => format!("...{}", &text[idx..]),
        None => text.to_string(),
    }
}

/// Run `spec` to completion. A non-zero exit becomes the error produced by
/// `on_exit` with the tail of stdout and stderr attached.
async fn run_command(
    spec: &CommandSpec,
    envs: &[(&str, String)],
    on_exit: fn(String) -> StepError,
) -> Result<(), StepError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    debug!(program = %spec.program, args = ?spec.args, "running step command");
    let output = command
        .output()
        .await
        .map_err(|e| StepError::Integrity(format!("spawning `{}`: {e}", spec.program)))?;
    if output.status.success() {
        return Ok(());
    }
    Err(on_exit(format!(
        "`{}` exited with {}\nstdout: {}\nstderr: {}",
        spec.program,
        output.status,
        tail(&output.stdout),
        tail(&output.stderr)
    )))
}

/// Bulk load through an external command (a warehouse CLI, a loader script).
/// Rows loaded are the staged row counts once the command succeeds.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    spec: CommandSpec,
}

impl CommandLoader {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl BulkLoader for CommandLoader {
    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn load(&self, staging: &Path) -> Result<TableCounts, StepError> {
        let envs = [(OUTPUT_DIR_ENV, staging.display().to_string())];
        run_command(&self.spec, &envs, StepError::Transient).await?;
        Ok(row_counts(staging).await?)
    }
}

/// Quality gate that passes when the command exits 0.
#[derive(Debug, Clone)]
pub struct CommandGate {
    name: String,
    spec: CommandSpec,
}

impl CommandGate {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl ValidationGate for CommandGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, target: GateTarget, staging: &Path) -> Result<(), StepError> {
        let envs = [
            (OUTPUT_DIR_ENV, staging.display().to_string()),
            ("SCOREBOOK_GATE_TARGET", target.to_string()),
        ];
        run_command(&self.spec, &envs, StepError::DataQuality).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub table: Table,
    pub path: String,
    pub rows: u64,
    pub sha256: String,
    pub bytes: u64,
}

/// Loads staged tables into a local parquet warehouse: one
/// `<table>.parquet` per table plus `manifest.json` with checksums.
#[derive(Debug, Clone)]
pub struct ParquetLoader {
    warehouse_dir: PathBuf,
}

impl ParquetLoader {
    pub fn new(warehouse_dir: impl Into<PathBuf>) -> Self {
        Self {
            warehouse_dir: warehouse_dir.into(),
        }
    }

    pub fn warehouse_dir(&self) -> &Path {
        &self.warehouse_dir
    }
}

#[async_trait]
impl BulkLoader for ParquetLoader {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn load(&self, staging: &Path) -> Result<TableCounts, StepError> {
        let staging = staging.to_path_buf();
        let warehouse = self.warehouse_dir.clone();
        let manifest = tokio::task::spawn_blocking(move || export_warehouse(&staging, &warehouse))
            .await
            .map_err(|e| StepError::Integrity(format!("parquet export task: {e}")))?
            .map_err(|e| StepError::Integrity(format!("{e:#}")))?;

        let counts = manifest_counts(&manifest);
        info!(warehouse = %self.warehouse_dir.display(), ?counts, "parquet warehouse loaded");
        Ok(counts)
    }
}

fn export_warehouse(staging: &Path, warehouse: &Path) -> anyhow::Result<ParquetManifest> {
    std::fs::create_dir_all(warehouse)
        .with_context(|| format!("creating {}", warehouse.display()))?;

    let mut files = Vec::new();
    for table in Table::ALL {
        let source = staging.join(table.file_name());
        let rows = match table {
            Table::Standings => table_rows::<StandingsRow>(&source)?,
            Table::Matches => table_rows::<MatchRow>(&source)?,
            Table::MatchEvents => table_rows::<MatchEventRow>(&source)?,
        };
        let batch = record_batch(table, &rows)?;
        let path = warehouse.join(format!("{}.parquet", table.name()));
        write_parquet(&path, batch)?;

        let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        files.push(ParquetManifestFile {
            table,
            path: format!("{}.parquet", table.name()),
            rows: rows.len() as u64,
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        });
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    let manifest_path = warehouse.join("manifest.json");
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

/// Rows as JSON objects, in store (key) order.
fn table_rows<R: Record>(path: &Path) -> anyhow::Result<Vec<serde_json::Map<String, JsonValue>>> {
    let store = RecordStore::<R>::load(path)?;
    store
        .iter()
        .map(|row| match serde_json::to_value(row)? {
            JsonValue::Object(map) => Ok(map),
            other => anyhow::bail!("{} row serialized as {other}", R::TABLE),
        })
        .collect()
}

/// Every column as nullable UTF-8; typing happens in the warehouse models.
fn record_batch(
    table: Table,
    rows: &[serde_json::Map<String, JsonValue>],
) -> anyhow::Result<RecordBatch> {
    let columns = table.columns();
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|name| ArrowField::new(*name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrays = columns
        .iter()
        .map(|name| {
            let values = rows
                .iter()
                .map(|row| match row.get(*name) {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                })
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema, arrays).with_context(|| format!("building {table} record batch"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> anyhow::Result<()> {
    let temp = path.with_extension(format!("parquet.{}.tmp", Uuid::new_v4()));
    let file = File::create(&temp).with_context(|| format!("creating {}", temp.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", temp.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing parquet batch {}", temp.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", temp.display()))?;
    std::fs::rename(&temp, path).with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}

pub fn manifest_counts(manifest: &ParquetManifest) -> TableCounts {
    manifest.files.iter().map(|f| (f.table, f.rows)).collect()
}
