use std::io;
use std::path::PathBuf;

use scorebook_core::Table;
use thiserror::Error;

use crate::staging::StageState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed table file {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{}: header {found:?} does not match {table} columns {expected:?}", .path.display())]
    HeaderMismatch {
        path: PathBuf,
        table: Table,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("completion state {} is corrupt: {source}", .path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing completion state: {0}")]
    EncodeState(#[source] serde_json::Error),
    #[error("backup {} holds {found} {table} rows, production had {expected}", .dir.display())]
    BackupMismatch {
        dir: PathBuf,
        table: Table,
        expected: u64,
        found: u64,
    },
    #[error("staging dir {} overlaps the {role} dir {}", .staging.display(), .other.display())]
    OverlappingStaging {
        staging: PathBuf,
        role: &'static str,
        other: PathBuf,
    },
    #[error("cannot {op} while staging is {state:?}")]
    InvalidTransition { op: &'static str, state: StageState },
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

pub(crate) fn io_err(
    action: &'static str,
    path: impl Into<PathBuf>,
) -> impl FnOnce(io::Error) -> StorageError {
    let path = path.into();
    move |source| StorageError::Io {
        action,
        path,
        source,
    }
}
