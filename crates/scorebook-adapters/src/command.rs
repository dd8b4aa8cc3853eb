use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    deliver, parse_envelope, AdapterError, BatchEnvelope, BatchSink, IncrementalWindow,
    ScrapeReport, ScrapeRequest, Scraper, OUTPUT_DIR_ENV,
};

/// Runs an external scraper and merges each envelope it prints.
///
/// The child receives the staging directory via `SCOREBOOK_OUTPUT_DIR`, plus
/// `--since <date>` for incremental windows and `--full-refresh` when forced.
/// It writes one JSON [`BatchEnvelope`] per stdout line; stderr is passed
/// through. Units printed before a crash stay merged.
#[derive(Debug, Clone)]
pub struct CommandScraper {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandScraper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn invocation_args(&self, request: &ScrapeRequest) -> Vec<String> {
        let mut args = self.args.clone();
        if let IncrementalWindow::Since(since) = request.window {
            args.push("--since".to_string());
            args.push(since.format("%Y-%m-%d").to_string());
        }
        if request.full_refresh {
            args.push("--full-refresh".to_string());
        }
        args
    }
}

#[async_trait]
impl Scraper for CommandScraper {
    fn name(&self) -> &str {
        &self.program
    }

    async fn scrape(
        &self,
        request: &ScrapeRequest,
        sink: &mut dyn BatchSink,
    ) -> Result<ScrapeReport, AdapterError> {
        let args = self.invocation_args(request);
        info!(
            program = %self.program,
            ?args,
            output_dir = %request.output_dir.display(),
            "starting scraper"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .env(OUTPUT_DIR_ENV, &request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| AdapterError::Io {
            action: "spawning scraper",
            path: PathBuf::from(&self.program),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Message("scraper stdout was not captured".to_string()))?;

        let mut report = ScrapeReport::default();
        let mut lines = BufReader::new(stdout).lines();
        let mut line_no = 0usize;
        loop {
            let line = lines.next_line().await.map_err(|source| AdapterError::Io {
                action: "reading scraper output",
                path: PathBuf::from(&self.program),
                source,
            })?;
            let Some(line) = line else { break };
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_envelope::<BatchEnvelope>(line) {
                Ok(envelope) => {
                    debug!(unit = %envelope.unit, table = %envelope.table, "scraper emitted unit");
                    deliver(envelope, request, sink, &mut report)?;
                }
                Err(err) => report.record_failure(format!("line {line_no}"), err),
            }
        }

        let status = child.wait().await.map_err(|source| AdapterError::Io {
            action: "waiting for scraper",
            path: PathBuf::from(&self.program),
            source,
        })?;
        if !status.success() {
            return Err(AdapterError::Exit {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }

        info!(
            program = %self.program,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "scraper finished"
        );
        Ok(report)
    }
}
