use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use scorebook_core::Table;
use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::error::{io_err, Result, StorageError};
use crate::{sha256_hex, write_atomic_async};

pub type TableCounts = BTreeMap<Table, u64>;

/// Directory roles of the blue-green layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagingLayout {
    pub production: PathBuf,
    pub staging: PathBuf,
    pub backups: PathBuf,
}

impl StagingLayout {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            production: root.join("production"),
            staging: root.join("staging"),
            backups: root.join("backups"),
        }
    }

    pub fn with_staging(mut self, staging: impl Into<PathBuf>) -> Self {
        self.staging = staging.into();
        self
    }

    pub fn production_file(&self, table: Table) -> PathBuf {
        self.production.join(table.file_name())
    }

    pub fn staging_file(&self, table: Table) -> PathBuf {
        self.staging.join(table.file_name())
    }

    /// Staging is wiped every run, so it must share no directory with
    /// production or the backups: not equal, not nested either way.
    pub fn check_disjoint(&self) -> Result<()> {
        let staging = normalize(&self.staging);
        for (role, other) in [("production", &self.production), ("backups", &self.backups)] {
            let other_norm = normalize(other);
            if staging.starts_with(&other_norm) || other_norm.starts_with(&staging) {
                return Err(StorageError::OverlappingStaging {
                    staging: self.staging.clone(),
                    role,
                    other: other.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Absolute, lexically cleaned form of `path` (`.` and `..` folded).
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }
    clean
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Idle,
    BackedUp,
    Staged,
    Mutated,
    Validated,
    Promoted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupHandle {
    Created { dir: PathBuf, counts: TableCounts },
    /// Production held no rows (first run); nothing was copied.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    pub before: TableCounts,
    pub after: TableCounts,
}

impl PromotionReport {
    pub fn delta(&self, table: Table) -> i64 {
        let before = self.before.get(&table).copied().unwrap_or(0) as i64;
        let after = self.after.get(&table).copied().unwrap_or(0) as i64;
        after - before
    }
}

/// Drives backup -> reset -> seed -> (merge) -> validate -> promote for one run.
///
/// Production is read by `backup_production` and `seed_staging_from_production`
/// and written only by `promote`, which refuses to run before
/// `mark_validated`.
#[derive(Debug)]
pub struct StagingCoordinator {
    layout: StagingLayout,
    state: StageState,
    backup: Option<BackupHandle>,
}

impl StagingCoordinator {
    pub fn new(layout: StagingLayout) -> Self {
        Self {
            layout,
            state: StageState::Idle,
            backup: None,
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn backup(&self) -> Option<&BackupHandle> {
        self.backup.as_ref()
    }

    fn expect_state(&self, op: &'static str, allowed: &[StageState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StorageError::InvalidTransition {
                op,
                state: self.state,
            })
        }
    }

    /// Copy every production table into `backups/<timestamp>/`, or record a
    /// skip when production holds no rows.
    pub async fn backup_production(&mut self) -> Result<BackupHandle> {
        self.expect_state("back up production", &[StageState::Idle])?;
        self.layout.check_disjoint()?;

        let counts = row_counts(&self.layout.production).await?;
        let handle = if counts.values().all(|&n| n == 0) {
            info!(
                production = %self.layout.production.display(),
                "production empty; backup skipped"
            );
            BackupHandle::Skipped
        } else {
            let dir = self.fresh_backup_dir().await?;
            for table in Table::ALL {
                let src = self.layout.production_file(table);
                if fs::try_exists(&src)
                    .await
                    .map_err(io_err("checking production file", &src))?
                {
                    let dst = dir.join(table.file_name());
                    fs::copy(&src, &dst)
                        .await
                        .map_err(io_err("copying production file into backup", &dst))?;
                }
            }

            let copied = row_counts(&dir).await?;
            for table in Table::ALL {
                let expected = counts.get(&table).copied().unwrap_or(0);
                let found = copied.get(&table).copied().unwrap_or(0);
                if expected != found {
                    return Err(StorageError::BackupMismatch {
                        dir,
                        table,
                        expected,
                        found,
                    });
                }
            }
            info!(backup = %dir.display(), ?counts, "production backed up");
            BackupHandle::Created { dir, counts }
        };

        self.backup = Some(handle.clone());
        self.state = StageState::BackedUp;
        Ok(handle)
    }

    async fn fresh_backup_dir(&self) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let mut dir = self.layout.backups.join(&stamp);
        let mut suffix = 1;
        while fs::try_exists(&dir)
            .await
            .map_err(io_err("checking backup directory", &dir))?
        {
            dir = self.layout.backups.join(format!("{stamp}-{suffix}"));
            suffix += 1;
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(io_err("creating backup directory", &dir))?;
        Ok(dir)
    }

    /// Delete any previous staging directory and recreate it empty.
    pub async fn reset_staging(&mut self) -> Result<()> {
        self.expect_state("reset staging", &[StageState::BackedUp])?;
        self.layout.check_disjoint()?;
        let staging = &self.layout.staging;
        if fs::try_exists(staging)
            .await
            .map_err(io_err("checking staging directory", staging))?
        {
            fs::remove_dir_all(staging)
                .await
                .map_err(io_err("removing staging directory", staging))?;
        }
        fs::create_dir_all(staging)
            .await
            .map_err(io_err("creating staging directory", staging))?;
        Ok(())
    }

    /// Copy production tables into staging; tables without a production file
    /// start as header-only files.
    pub async fn seed_staging_from_production(&mut self) -> Result<TableCounts> {
        self.expect_state("seed staging", &[StageState::BackedUp])?;
        for table in Table::ALL {
            let src = self.layout.production_file(table);
            let dst = self.layout.staging_file(table);
            if fs::try_exists(&src)
                .await
                .map_err(io_err("checking production file", &src))?
            {
                fs::copy(&src, &dst)
                    .await
                    .map_err(io_err("copying production file into staging", &dst))?;
            } else {
                let header = format!("{}\n", table.columns().join(","));
                write_atomic_async(&dst, header.as_bytes()).await?;
            }
        }
        let counts = row_counts(&self.layout.staging).await?;
        info!(?counts, "working copy prepared from production");
        self.state = StageState::Staged;
        Ok(counts)
    }

    pub fn mark_mutated(&mut self) -> Result<()> {
        self.expect_state("mark staging mutated", &[StageState::Staged, StageState::Mutated])?;
        self.state = StageState::Mutated;
        Ok(())
    }

    pub fn mark_validated(&mut self) -> Result<()> {
        self.expect_state("mark staging validated", &[StageState::Mutated])?;
        self.state = StageState::Validated;
        Ok(())
    }

    /// Record that the run failed. Production is left untouched; the backup
    /// stays on disk for manual recovery.
    pub fn fail(&mut self) -> StageState {
        if !matches!(self.state, StageState::Idle | StageState::Promoted) {
            self.state = StageState::Failed;
        }
        self.state
    }

    /// Replace each production table with its staging counterpart. Each file
    /// is swapped in with a rename, so readers never see a partial table.
    pub async fn promote(&mut self) -> Result<PromotionReport> {
        self.expect_state("promote", &[StageState::Validated])?;
        let before = row_counts(&self.layout.production).await?;

        for table in Table::ALL {
            let src = self.layout.staging_file(table);
            let bytes = match fs::read(&src).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err("reading staging file", &src)(err)),
            };
            write_atomic_async(&self.layout.production_file(table), &bytes).await?;
        }

        let after = row_counts(&self.layout.production).await?;
        info!(?before, ?after, "staging promoted to production");
        self.state = StageState::Promoted;
        Ok(PromotionReport { before, after })
    }

    /// Backup directories, newest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let backups = &self.layout.backups;
        let mut entries = match fs::read_dir(backups).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err("listing backups", backups)(err)),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err("listing backups", backups))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|ft| ft.is_dir())
                .unwrap_or(false);
            if is_dir {
                dirs.push(entry.path());
            }
        }
        // Timestamp names sort chronologically.
        dirs.sort();
        dirs.reverse();
        Ok(dirs)
    }
}

/// Data rows in one table file, header excluded. A missing file has zero rows.
pub async fn count_rows(path: &Path) -> Result<u64> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(io_err("reading table file", path)(err)),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_slice());
    let mut rows = 0u64;
    for record in reader.records() {
        record.map_err(|source| StorageError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        rows += 1;
    }
    Ok(rows)
}

pub async fn row_counts(dir: &Path) -> Result<TableCounts> {
    let mut counts = TableCounts::new();
    for table in Table::ALL {
        counts.insert(table, count_rows(&dir.join(table.file_name())).await?);
    }
    Ok(counts)
}

/// sha256 of every table file present in `dir`.
pub async fn fingerprint(dir: &Path) -> Result<BTreeMap<Table, String>> {
    let mut digests = BTreeMap::new();
    for table in Table::ALL {
        let path = dir.join(table.file_name());
        match fs::read(&path).await {
            Ok(bytes) => {
                digests.insert(table, sha256_hex(&bytes));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err("reading table file", &path)(err)),
        }
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MATCHES_HEADER: &str = "season,phase,competition_group,competition,match_date,match_time,home_team,away_team,home_score,away_score,venue,match_url,scraped_at\n";

    fn matches_csv(rows: usize) -> String {
        let mut text = MATCHES_HEADER.to_string();
        for i in 0..rows {
            text.push_str(&format!(
                "2025-2026,Phase 1,Womens,Premier,2025-10-04,12:00,A,B,1,0,Ground,M{i},2025-10-05T09:00:00\n"
            ));
        }
        text
    }

    async fn staged(root: &Path) -> StagingCoordinator {
        let mut coordinator = StagingCoordinator::new(StagingLayout::under(root));
        coordinator.backup_production().await.expect("backup");
        coordinator.reset_staging().await.expect("reset");
        coordinator.seed_staging_from_production().await.expect("seed");
        coordinator
    }

    #[tokio::test]
    async fn backup_of_empty_production_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let mut coordinator = StagingCoordinator::new(StagingLayout::under(dir.path()));

        let handle = coordinator.backup_production().await.expect("backup");
        assert_eq!(handle, BackupHandle::Skipped);
        assert_eq!(coordinator.state(), StageState::BackedUp);
        assert!(coordinator.list_backups().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn backup_row_counts_match_production() {
        let dir = tempdir().expect("tempdir");
        let layout = StagingLayout::under(dir.path());
        std::fs::create_dir_all(&layout.production).expect("mkdir");
        std::fs::write(layout.production_file(Table::Matches), matches_csv(4)).expect("write");

        let mut coordinator = StagingCoordinator::new(layout);
        let handle = coordinator.backup_production().await.expect("backup");
        let BackupHandle::Created { dir: backup_dir, counts } = handle else {
            panic!("expected a backup to be created");
        };

        assert_eq!(counts.get(&Table::Matches), Some(&4));
        assert_eq!(row_counts(&backup_dir).await.expect("counts"), counts);
        assert_eq!(
            coordinator.list_backups().await.expect("list"),
            vec![backup_dir]
        );
    }

    #[tokio::test]
    async fn reset_wipes_stale_staging_and_seed_copies_production() {
        let dir = tempdir().expect("tempdir");
        let layout = StagingLayout::under(dir.path());
        std::fs::create_dir_all(&layout.production).expect("mkdir");
        std::fs::create_dir_all(&layout.staging).expect("mkdir");
        std::fs::write(layout.production_file(Table::Matches), matches_csv(2)).expect("write");
        std::fs::write(layout.staging.join("leftover.csv"), "stale").expect("write");
        std::fs::write(layout.staging_file(Table::Matches), matches_csv(9)).expect("write");

        let coordinator = staged(dir.path()).await;
        let layout = coordinator.layout();

        assert!(!layout.staging.join("leftover.csv").exists());
        assert_eq!(
            std::fs::read(layout.staging_file(Table::Matches)).expect("read"),
            std::fs::read(layout.production_file(Table::Matches)).expect("read")
        );
        let standings =
            std::fs::read_to_string(layout.staging_file(Table::Standings)).expect("read");
        assert!(standings.starts_with("season,phase,competition_group,competition,position"));
        assert_eq!(count_rows(&layout.staging_file(Table::Standings)).await.expect("count"), 0);
        assert_eq!(coordinator.state(), StageState::Staged);
    }

    #[tokio::test]
    async fn promote_refuses_unvalidated_staging() {
        let dir = tempdir().expect("tempdir");
        let mut coordinator = staged(dir.path()).await;
        coordinator.mark_mutated().expect("mutated");

        let err = coordinator.promote().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                state: StageState::Mutated,
                ..
            }
        ));
        assert!(!coordinator.layout().production_file(Table::Matches).exists());
    }

    #[tokio::test]
    async fn promote_replaces_production_and_reports_counts() {
        let dir = tempdir().expect("tempdir");
        let layout = StagingLayout::under(dir.path());
        std::fs::create_dir_all(&layout.production).expect("mkdir");
        std::fs::write(layout.production_file(Table::Matches), matches_csv(1)).expect("write");

        let mut coordinator = staged(dir.path()).await;
        let staged = coordinator.layout().staging_file(Table::Matches);
        std::fs::write(staged, matches_csv(3)).expect("write");
        coordinator.mark_mutated().expect("mutated");
        coordinator.mark_validated().expect("validated");

        let report = coordinator.promote().await.expect("promote");
        assert_eq!(report.before.get(&Table::Matches), Some(&1));
        assert_eq!(report.after.get(&Table::Matches), Some(&3));
        assert_eq!(report.delta(Table::Matches), 2);
        assert_eq!(report.after.get(&Table::Standings), Some(&0));
        assert_eq!(coordinator.state(), StageState::Promoted);
        assert_eq!(coordinator.fail(), StageState::Promoted);
    }

    #[tokio::test]
    async fn failing_leaves_production_fingerprint_unchanged() {
        let dir = tempdir().expect("tempdir");
        let layout = StagingLayout::under(dir.path());
        std::fs::create_dir_all(&layout.production).expect("mkdir");
        std::fs::write(layout.production_file(Table::Matches), matches_csv(2)).expect("write");
        let before = fingerprint(&layout.production).await.expect("fingerprint");

        let mut coordinator = staged(dir.path()).await;
        let staged = coordinator.layout().staging_file(Table::Matches);
        std::fs::write(staged, matches_csv(5)).expect("write");
        coordinator.mark_mutated().expect("mutated");
        assert_eq!(coordinator.fail(), StageState::Failed);

        assert_eq!(fingerprint(&layout.production).await.expect("fingerprint"), before);
        assert!(coordinator.promote().await.is_err());
    }

    #[test]
    fn staging_may_not_overlap_production_or_backups() {
        let layout = StagingLayout::under("/srv/scorebook");
        assert!(layout.check_disjoint().is_ok());
        assert!(layout
            .clone()
            .with_staging("/srv/scorebook/pre_production")
            .check_disjoint()
            .is_ok());

        for staging in [
            "/srv/scorebook/production",
            "/srv/scorebook/production/./",
            "/srv/scorebook/production/tmp",
            "/srv/scorebook",
            "/srv",
            "/srv/scorebook/backups",
            "/srv/scorebook/staging/../production",
        ] {
            let err = layout.clone().with_staging(staging).check_disjoint().unwrap_err();
            assert!(matches!(err, StorageError::OverlappingStaging { .. }), "{staging}: {err}");
        }
    }

    #[tokio::test]
    async fn overlapping_staging_is_refused_before_touching_production() {
        let dir = tempdir().expect("tempdir");
        let layout = StagingLayout::under(dir.path());
        std::fs::create_dir_all(&layout.production).expect("mkdir");
        std::fs::write(layout.production_file(Table::Matches), matches_csv(2)).expect("write");
        let before = fingerprint(&layout.production).await.expect("fingerprint");

        let production = layout.production.clone();
        let mut coordinator = StagingCoordinator::new(layout.with_staging(&production));
        let err = coordinator.backup_production().await.unwrap_err();

        assert!(
            matches!(err, StorageError::OverlappingStaging { role: "production", .. }),
            "{err}"
        );
        assert_eq!(coordinator.state(), StageState::Idle);
        assert_eq!(fingerprint(&production).await.expect("fingerprint"), before);
    }

    #[tokio::test]
    async fn operations_out_of_order_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut coordinator = StagingCoordinator::new(StagingLayout::under(dir.path()));
        assert!(coordinator.reset_staging().await.is_err());
        assert!(coordinator.seed_staging_from_production().await.is_err());
        assert!(coordinator.mark_validated().is_err());
        assert_eq!(coordinator.fail(), StageState::Idle);
    }
}
