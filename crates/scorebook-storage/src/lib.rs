//! Durable table storage, completion tracking and staged promotion for scorebook.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod completion;
mod error;
mod record_store;
mod staging;

pub use completion::{CompletionStats, CompletionTracker, RefreshCadence};
pub use error::{Result, StorageError};
pub use record_store::{RecordStore, UpsertStats};
pub use staging::{
    count_rows, fingerprint, row_counts, BackupHandle, PromotionReport, StageState,
    StagingCoordinator, StagingLayout, TableCounts,
};

use error::io_err;

pub const CRATE_NAME: &str = "scorebook-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn temp_sibling(target: &Path) -> std::path::PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

/// Replace `target` with `bytes` via a temp file in the same directory + rename.
///
/// Readers see either the previous content or the new content, never a prefix.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err("creating directory", parent))?;
    }
    let temp_path = temp_sibling(target);

    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    })();
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err("writing temp file", &temp_path)(err));
    }

    std::fs::rename(&temp_path, target).map_err(|err| {
        let _ = std::fs::remove_file(&temp_path);
        io_err("renaming temp file onto", target)(err)
    })
}

pub(crate) async fn write_atomic_async(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err("creating directory", parent))?;
    }
    let temp_path = temp_sibling(target);

    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err("writing temp file", &temp_path)(err));
    }

    match tokio::fs::rename(&temp_path, target).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(io_err("renaming temp file onto", target)(err))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay added to each wait.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        self.delay_for_attempt(attempt_index) + random_up_to(self.jitter)
    }
}

fn random_up_to(bound: Duration) -> Duration {
    let millis = bound.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Courtesy delay between requests to an upstream source.
///
/// Each pause is drawn uniformly from `[min, max]` plus up to `jitter`, so the
/// cadence is never fixed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacingPolicy {
    pub min: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl PacingPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = (self.max.as_millis() as u64).max(min);
        let base = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(base) + random_up_to(self.jitter)
    }

    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "pacing delay");
            tokio::time::sleep(delay).await;
        }
    }
}
