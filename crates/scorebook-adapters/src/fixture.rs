use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use scorebook_storage::PacingPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{deliver, AdapterError, BatchEnvelope, BatchSink, ScrapeReport, ScrapeRequest, Scraper};

/// A captured scrape, replayable without network access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source: String,
    #[serde(default)]
    pub captured_at: Option<NaiveDateTime>,
    /// Raw envelopes; each is decoded on its own so one bad unit does not
    /// poison the bundle.
    pub units: Vec<JsonValue>,
}

pub fn load_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Replays fixture bundles through the same filtering and merge path a live
/// scraper uses.
#[derive(Debug, Clone)]
pub struct FixtureScraper {
    bundles: Vec<PathBuf>,
    pacing: PacingPolicy,
}

impl FixtureScraper {
    pub fn new(bundles: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            bundles: bundles.into_iter().map(Into::into).collect(),
            pacing: PacingPolicy::disabled(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = pacing;
        self
    }

    /// Bundle files in replay order; directories contribute their `*.json`
    /// files sorted by name.
    fn bundle_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in &self.bundles {
            if !path.is_dir() {
                files.push(path.clone());
                continue;
            }
            let mut found = fs::read_dir(path)
                .with_context(|| format!("listing {}", path.display()))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>();
            found.sort();
            files.extend(found);
        }
        Ok(files)
    }
}

#[async_trait]
impl Scraper for FixtureScraper {
    fn name(&self) -> &str {
        "fixtures"
    }

    async fn scrape(
        &self,
        request: &ScrapeRequest,
        sink: &mut dyn BatchSink,
    ) -> Result<ScrapeReport, AdapterError> {
        let mut report = ScrapeReport::default();

        for path in self.bundle_files()? {
            let bundle = load_bundle(&path)?;
            info!(
                fixture_id = %bundle.fixture_id,
                source = %bundle.source,
                units = bundle.units.len(),
                window = %request.window,
                "replaying fixture bundle"
            );

            let mut first = true;
            for (index, raw) in bundle.units.into_iter().enumerate() {
                if !first {
                    self.pacing.pause().await;
                }
                first = false;

                let envelope: BatchEnvelope = match serde_json::from_value(raw) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        report.record_failure(format!("{}#{index}", bundle.fixture_id), err);
                        continue;
                    }
                };
                deliver(envelope, request, sink, &mut report)?;
            }
        }

        Ok(report)
    }
}
