use std::future::Future;
use std::time::Duration;

use scorebook_adapters::AdapterError;
use scorebook_storage::{BackoffPolicy, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Why one attempt of a pipeline step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepError {
    /// Flaky collaborator (network, subprocess crash); worth another try.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The data itself was rejected by a load or gate.
    #[error("data quality failure: {0}")]
    DataQuality(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(#[serde(with = "duration_secs")] Duration),
    /// Local storage or state is broken; retrying cannot help.
    #[error("integrity failure: {0}")]
    Integrity(String),
}

impl StepError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StepError::Transient(_) | StepError::Timeout(_) => RetryDisposition::Retryable,
            StepError::DataQuality(_) | StepError::Integrity(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<StorageError> for StepError {
    fn from(err: StorageError) -> Self {
        StepError::Integrity(err.to_string())
    }
}

impl From<AdapterError> for StepError {
    fn from(err: AdapterError) -> Self {
        match err {
            // Sink and bundle errors come from our own storage/config.
            AdapterError::Anyhow(err) => StepError::Integrity(format!("{err:#}")),
            other => StepError::Transient(other.to_string()),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// Timeout + retry budget for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepPolicy {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl StepPolicy {
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: BackoffPolicy::none(),
        }
    }

    pub fn retrying(timeout: Duration, retries: usize, base_delay: Duration) -> Self {
        Self {
            timeout,
            backoff: BackoffPolicy {
                max_retries: retries,
                base_delay,
                max_delay: base_delay.saturating_mul(8),
                jitter: base_delay / 4,
            },
        }
    }
}

#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StepError>,
    pub attempts: usize,
}

/// Run `op` under the step's timeout, retrying retryable failures with
/// backoff until the budget is spent.
pub async fn run_with_retry<T, F, Fut>(step: Step, policy: &StepPolicy, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        let span = info_span!("pipeline_step", %step, attempt = attempts);
        let result = match tokio::time::timeout(policy.timeout, op()).instrument(span).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout(policy.timeout)),
        };

        let err = match result {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(err) => err,
        };

        let retries_used = attempts - 1;
        let retryable = err.disposition() == RetryDisposition::Retryable;
        if retryable && retries_used < policy.backoff.max_retries {
            let delay = policy.backoff.jittered_delay(retries_used);
            warn!(
                %step,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Attempted {
            result: Err(err),
            attempts,
        };
    }
}
