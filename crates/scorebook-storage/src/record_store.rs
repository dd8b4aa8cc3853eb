use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use scorebook_core::Record;
use serde::Serialize;

use crate::error::{io_err, Result, StorageError};
use crate::write_atomic;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// In-memory keyed table backed by one CSV file.
///
/// `load` + `upsert_batch` + `save` is the unit of durability: once `save`
/// returns, every merge applied so far survives a crash.
#[derive(Debug, Clone)]
pub struct RecordStore<R: Record> {
    path: PathBuf,
    rows: BTreeMap<R::Key, R>,
}

impl<R: Record> RecordStore<R> {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: BTreeMap::new(),
        }
    }

    /// Parse `path` into a keyed map. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty(path));
            }
            Err(err) => return Err(io_err("reading table file", &path)(err)),
        };
        let rows = parse_rows::<R>(&path, &bytes)?;
        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert-or-replace each record by natural key, in input order.
    pub fn upsert_batch(&mut self, records: impl IntoIterator<Item = R>) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for record in records {
            match self.rows.insert(record.natural_key(), record) {
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }
        }
        stats
    }

    /// Write the whole map back to the file this store was loaded from.
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.path)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv_bytes(path)?;
        write_atomic(path, &bytes)?;
        tracing::debug!(
            table = %R::TABLE,
            rows = self.rows.len(),
            path = %path.display(),
            "table saved"
        );
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Latest `scraped_at` date across all rows.
    pub fn max_scraped_date(&self) -> Option<NaiveDate> {
        self.rows.values().filter_map(|row| row.scraped_date()).max()
    }

    fn to_csv_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let csv_err = |source| StorageError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(R::TABLE.columns())
            .map_err(csv_err)?;
        for row in self.rows.values() {
            writer.serialize(row).map_err(csv_err)?;
        }
        writer
            .into_inner()
            .map_err(|err| io_err("buffering table file", path)(err.into_error()))
    }
}

fn parse_rows<R: Record>(path: &Path, bytes: &[u8]) -> Result<BTreeMap<R::Key, R>> {
    let csv_err = |source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader.headers().map_err(csv_err)?.clone();
    let mut rows = BTreeMap::new();
    if headers.is_empty() {
        return Ok(rows);
    }
    let expected = R::TABLE.columns();
    if headers.iter().ne(expected.iter().copied()) {
        return Err(StorageError::HeaderMismatch {
            path: path.to_path_buf(),
            table: R::TABLE,
            expected: expected.iter().map(|c| c.to_string()).collect(),
            found: headers.iter().map(str::to_string).collect(),
        });
    }

    for row in reader.deserialize::<R>() {
        let row = row.map_err(csv_err)?;
        rows.insert(row.natural_key(), row);
    }
    Ok(rows)
}
