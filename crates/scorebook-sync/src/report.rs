use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scorebook_core::Table;
use tokio::fs;

use crate::pipeline::{RunOutcome, RunStatus};

/// Write `run_summary.json` and `daily_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_reports(reports_dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    let dir = reports_dir.join(outcome.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary = serde_json::to_vec_pretty(outcome).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), summary)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("daily_brief.md"), render_brief(outcome))
        .await
        .context("writing daily_brief.md")?;
    Ok(dir)
}

pub fn render_brief(outcome: &RunOutcome) -> String {
    let status = match &outcome.status {
        RunStatus::Completed => "completed".to_string(),
        RunStatus::Failed { step, error } => format!("FAILED at `{step}`: {error}"),
    };
    let window = outcome
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "not computed".to_string());

    let mut lines = vec![
        "# Scorebook Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", outcome.run_id),
        format!("- Started: {}", outcome.started_at),
        format!("- Finished: {}", outcome.finished_at),
        format!("- Status: {status}"),
        format!("- Window: {window}"),
        format!("- Full refresh: {}", outcome.full_refresh),
        String::new(),
        "## Steps".to_string(),
    ];
    for step in &outcome.steps {
        let mark = if step.ok { "ok" } else { "failed" };
        lines.push(format!(
            "- {}: {mark} ({} attempt{}, {} ms)",
            step.step,
            step.attempts,
            if step.attempts == 1 { "" } else { "s" },
            step.elapsed_ms
        ));
    }

    if let Some(scrape) = &outcome.scrape {
        lines.push(String::new());
        lines.push("## Scrape".to_string());
        lines.push(format!("- Scraper: {}", scrape.scraper));
        lines.push(format!(
            "- Units: {} merged, {} skipped, {} failed",
            scrape.units_completed,
            scrape.units_skipped,
            scrape.failures.len()
        ));
        lines.push(format!("- Rejected records: {}", scrape.records_rejected));
        for (table, stats) in &scrape.merged {
            lines.push(format!(
                "- {table}: {} inserted, {} updated",
                stats.inserted, stats.updated
            ));
        }
    }

    lines.push(String::new());
    lines.push("## Production Row Counts".to_string());
    for table in Table::ALL {
        let count = outcome.final_counts.get(&table).copied().unwrap_or(0);
        match &outcome.promotion {
            Some(promotion) => {
                lines.push(format!("- {table}: {count} ({:+})", promotion.delta(table)))
            }
            None => lines.push(format!("- {table}: {count}")),
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the latest `runs` run summaries, newest first.
pub fn recent_runs_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = match std::fs::read_dir(reports_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("reading {}", reports_dir.display())),
    };
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        let Ok(text) = std::fs::read_to_string(&summary_path) else {
            continue;
        };
        let summary: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        let status = summary.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
        let finished = summary.get("finished_at").and_then(|v| v.as_str()).unwrap_or("?");

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- status: {status}"));
        if let Some(step) = summary.get("step").and_then(|v| v.as_str()) {
            lines.push(format!("- failed step: {step}"));
        }
        lines.push(format!("- finished: {finished}"));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
