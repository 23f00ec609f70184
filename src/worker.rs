//! Per-term worker: the acquire / call / decide / release loop.
//!
//! ```text
//! Idle -> Requesting -> Evaluating -+-> Succeeded
//!            ^                      +-> Retrying --+
//!            +------------------------------------+
//!                                   +-> Failed
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::client::{Outcome, SerpTransport};
use crate::credentials::Credentials;
use crate::proxy::ProxyPool;
use crate::retry::{self, Decision, RetryPolicy};
use crate::sink::{ResultSink, TermResult};
use crate::Result;

/// Where a worker is in processing its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Requesting,
    Evaluating,
    Succeeded,
    Retrying,
    Failed,
}

/// How a term ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermStatus {
    Succeeded,
    /// Retry budget exhausted.
    Failed,
    /// The API rejected the credentials; no retry was attempted.
    CredentialsRejected,
}

impl TermStatus {
    pub fn is_success(self) -> bool {
        self == TermStatus::Succeeded
    }
}

/// One attempt of one term. Kept for reporting only.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// `host:port` of the proxy used.
    pub proxy: String,
    /// Human-readable outcome.
    pub outcome: String,
    pub elapsed: Duration,
}

/// Summary of how one term was processed.
#[derive(Debug, Clone)]
pub struct TermReport {
    pub term: String,
    pub status: TermStatus,
    pub attempts: Vec<AttemptRecord>,
}

impl TermReport {
    /// Number of attempts made.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Drives a single term to success or terminal failure.
///
/// Cheap to clone; every clone shares the same pool, transport and sink.
#[derive(Clone)]
pub struct Worker {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn SerpTransport>,
    sink: Arc<dyn ResultSink>,
    credentials: Arc<Credentials>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl Worker {
    pub fn new(
        pool: Arc<ProxyPool>,
        transport: Arc<dyn SerpTransport>,
        sink: Arc<dyn ResultSink>,
        credentials: Arc<Credentials>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            transport,
            sink,
            credentials,
            policy,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Caps how long a single call may take before it counts as a transport error.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// The shared proxy pool.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Processes `term` until it succeeds or fails, writing its result.
    ///
    /// Per-term failures are reported through [`TermReport::status`]. An
    /// `Err` means the run itself cannot continue: the proxy pool is
    /// exhausted or the sink could not be written.
    pub async fn process(&self, term: &str) -> Result<TermReport> {
        let mut state = WorkerState::Idle;
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt = 0u32;

        loop {
            enter(&mut state, WorkerState::Requesting, term);
            let lease = self.pool.acquire().await?;
            attempt += 1;

            let proxy = lease.proxy().label();
            let started = Instant::now();
            let outcome = match timeout(
                self.request_timeout,
                self.transport.call(term, &self.credentials, lease.proxy()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Outcome::TransportError("request timed out".to_string()),
            };

            enter(&mut state, WorkerState::Evaluating, term);
            let decision = self.policy.decide(&outcome, attempt);
            self.pool.release(lease, retry::proxy_healthy(&outcome));
            attempts.push(AttemptRecord {
                attempt,
                proxy: proxy.clone(),
                outcome: outcome.to_string(),
                elapsed: started.elapsed(),
            });

            match (decision, outcome) {
                (Decision::Accept, Outcome::Success(payload)) => {
                    enter(&mut state, WorkerState::Succeeded, term);
                    self.sink
                        .write(term, &TermResult::Succeeded { payload })
                        .await?;
                    info!(term, attempts = attempt, proxy = %proxy, "Term succeeded");
                    return Ok(TermReport {
                        term: term.to_string(),
                        status: TermStatus::Succeeded,
                        attempts,
                    });
                }
                (Decision::RetryWithNewProxy, outcome) => {
                    enter(&mut state, WorkerState::Retrying, term);
                    warn!(
                        term,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        proxy = %proxy,
                        %outcome,
                        "Attempt failed, retrying with another proxy"
                    );
                }
                (_, outcome) => {
                    enter(&mut state, WorkerState::Failed, term);
                    let status = match outcome {
                        Outcome::AuthError { .. } => TermStatus::CredentialsRejected,
                        _ => TermStatus::Failed,
                    };
                    log_failure_history(term, &attempts);
                    self.sink
                        .write(
                            term,
                            &TermResult::Failed {
                                reason: outcome.to_string(),
                                attempts: attempt,
                            },
                        )
                        .await?;
                    return Ok(TermReport {
                        term: term.to_string(),
                        status,
                        attempts,
                    });
                }
            }
        }
    }
}

fn enter(state: &mut WorkerState, next: WorkerState, term: &str) {
    debug!(term, from = ?*state, to = ?next, "Worker state change");
    *state = next;
}

fn log_failure_history(term: &str, attempts: &[AttemptRecord]) {
    error!(term, attempts = attempts.len(), "All attempts failed");
    for record in attempts {
        error!(
            term,
            attempt = record.attempt,
            proxy = %record.proxy,
            outcome = %record.outcome,
            elapsed_ms = record.elapsed.as_millis() as u64,
            "Failure history"
        );
    }
}
