//! Readiness polling with repeated-observation semantics.
//!
//! Velero's cluster objects are eventually consistent: a Deployment can report
//! `Available` for one observation and flap back while pods restart. The poller
//! therefore requires several successful observations before declaring a
//! resource ready. Retryable failures cost an attempt but do not discard
//! earlier successes. The poller distinguishes retryable failures (keep polling) from
//! fatal ones (stop immediately).
//!
//! # Example
//!
//! ```ignore
//! use velero_common::retry::{poll_until_ready, PollConfig};
//!
//! poll_until_ready(&PollConfig::default(), "deployment/velero", || async {
//!     check_deployment_once(&gateway, "velero").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::ErrorKind;
use crate::Error;

/// Default number of checks before giving up
pub const DEFAULT_ATTEMPTS: u32 = 30;
/// Default delay between checks
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);
/// Default number of extra clean observations required after the first one
pub const DEFAULT_MIN_CONSECUTIVE_SUCCESSES: u32 = 5;

/// Configuration for a readiness poll
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Maximum number of check invocations
    pub attempts: u32,
    /// Delay between invocations
    pub delay: Duration,
    /// Successful observations required after the first success (0 = first success wins)
    pub min_consecutive_successes: u32,
    /// Error kinds that are retried; anything else aborts the poll
    pub retry_on: Vec<ErrorKind>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
            min_consecutive_successes: DEFAULT_MIN_CONSECUTIVE_SUCCESSES,
            retry_on: vec![ErrorKind::NotReady, ErrorKind::ClusterApi],
        }
    }
}

impl PollConfig {
    /// Whether an error of this kind should be retried
    pub fn is_retryable(&self, err: &Error) -> bool {
        self.retry_on.contains(&err.kind())
    }
}

/// Progress of one poll invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadinessCheckState {
    /// Checks run so far
    pub attempts: u32,
    /// Successful checks so far; retryable failures do not reset it
    pub consecutive_successes: u32,
}

impl ReadinessCheckState {
    fn record_success(&mut self) {
        self.attempts += 1;
        self.consecutive_successes += 1;
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
    }

    fn is_ready(&self, config: &PollConfig) -> bool {
        self.consecutive_successes > config.min_consecutive_successes
    }
}

/// Run `check` until it has succeeded `min_consecutive_successes + 1` times.
///
/// A retryable failure only consumes an attempt; a
/// non-retryable one is returned unchanged. When the attempt budget runs out
/// the last failure is surfaced as [`Error::NotReady`] (or, if every failure
/// was already a `NotReady`, that error itself).
pub async fn poll_until_ready<F, Fut>(
    config: &PollConfig,
    operation_name: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let mut state = ReadinessCheckState::default();
    let mut last_error: Option<Error> = None;

    while state.attempts < config.attempts {
        match check().await {
            Ok(()) => {
                state.record_success();
                if state.is_ready(config) {
                    debug!(
                        operation = %operation_name,
                        attempts = state.attempts,
                        "ready"
                    );
                    return Ok(());
                }
            }
            Err(e) if config.is_retryable(&e) => {
                state.record_failure();
                warn!(
                    operation = %operation_name,
                    attempt = state.attempts,
                    error = %e,
                    "not ready yet"
                );
                last_error = Some(e);
            }
            Err(e) => {
                error!(operation = %operation_name, error = %e, "readiness check failed");
                return Err(e);
            }
        }

        if state.attempts < config.attempts {
            tokio::time::sleep(config.delay).await;
        }
    }

    error!(
        operation = %operation_name,
        attempts = state.attempts,
        "gave up waiting for readiness"
    );
    Err(match last_error {
        Some(e @ Error::NotReady { .. }) => e,
        Some(e) => Error::not_ready(operation_name, e.to_string()),
        None => Error::not_ready(
            operation_name,
            format!(
                "only {} successful observations in {} attempts",
                state.consecutive_successes, state.attempts
            ),
        ),
    })
}
