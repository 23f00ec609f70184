//! Bounded worker pool over a batch of search terms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::HttpSerpClient;
use crate::config::HarvestConfig;
use crate::credentials::CredentialProvider;
use crate::proxy::{ProxyConfig, ProxyPool};
use crate::sink::FileSink;
use crate::worker::{TermReport, TermStatus, Worker};
use crate::{HarvestError, Result};

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Terms whose payload was written.
    pub succeeded: usize,
    /// Terms that ended with a failure marker, credential rejections included.
    pub failed: usize,
    /// Terms that failed because the API rejected the credentials.
    pub auth_failures: usize,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Per-term reports, in the order the terms finished.
    pub reports: Vec<TermReport>,
}

impl Summary {
    /// Number of terms processed.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// True when at least one term ran and none succeeded.
    pub fn all_failed(&self) -> bool {
        self.total() > 0 && self.succeeded == 0
    }

    fn record(&mut self, report: TermReport) {
        match report.status {
            TermStatus::Succeeded => self.succeeded += 1,
            TermStatus::Failed => self.failed += 1,
            TermStatus::CredentialsRejected => {
                self.failed += 1;
                self.auth_failures += 1;
            }
        }
        self.reports.push(report);
    }
}

/// Runs a batch of terms through at most `concurrency` parallel workers.
pub struct Dispatcher {
    worker: Worker,
    concurrency: usize,
}

impl Dispatcher {
    /// Creates a dispatcher. `concurrency` must be at least 1.
    pub fn new(worker: Worker, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(HarvestError::Config("concurrency must be at least 1".into()));
        }
        Ok(Self {
            worker,
            concurrency,
        })
    }

    /// Processes every term and returns the aggregate summary.
    ///
    /// Terms are pulled from a shared queue, so each is handled by exactly
    /// one worker. A run-level error, or a worker task that panics, stops
    /// workers from taking new terms; terms already in flight finish before
    /// the error is returned.
    pub async fn run(&self, terms: Vec<String>) -> Result<Summary> {
        let start = Instant::now();
        let total = terms.len();
        let workers = self.concurrency.min(total);
        info!(terms = total, workers, "Dispatching search terms");

        let queue = Arc::new(Mutex::new(terms.into_iter().collect::<VecDeque<_>>()));
        let halted = Arc::new(AtomicBool::new(false));
        let auth_warned = Arc::new(AtomicBool::new(false));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<TermReport>();

        let mut tasks: FuturesUnordered<_> = (0..workers)
            .map(|id| {
                let worker = self.worker.clone();
                let queue = Arc::clone(&queue);
                let halted = Arc::clone(&halted);
                let auth_warned = Arc::clone(&auth_warned);
                let reports = report_tx.clone();

                tokio::spawn(async move {
                    while !halted.load(Ordering::SeqCst) {
                        let Some(term) = next_term(&queue) else {
                            break;
                        };
                        debug!(worker = id, term = %term, "Picked up term");

                        match worker.process(&term).await {
                            Ok(report) => {
                                if report.status == TermStatus::CredentialsRejected
                                    && !auth_warned.swap(true, Ordering::SeqCst)
                                {
                                    warn!(
                                        term = %term,
                                        "API credentials rejected; other terms are likely affected"
                                    );
                                }
                                // The receiver outlives every worker task.
                                let _ = reports.send(report);
                            }
                            Err(e) => {
                                halted.store(true, Ordering::SeqCst);
                                error!(worker = id, term = %term, error = %e, "Run halted");
                                return Err(e);
                            }
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        drop(report_tx);

        let mut run_error = None;
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    run_error.get_or_insert(e);
                }
                Err(e) => {
                    halted.store(true, Ordering::SeqCst);
                    error!(error = %e, "Worker task failed, run halted");
                    run_error.get_or_insert(HarvestError::Other(format!(
                        "worker task failed: {}",
                        e
                    )));
                }
            }
        }

        let mut summary = Summary::default();
        while let Ok(report) = report_rx.try_recv() {
            summary.record(report);
        }

        if let Some(e) = run_error {
            return Err(e);
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            auth_failures = summary.auth_failures,
            duration_ms = summary.duration_ms,
            "Run complete"
        );
        Ok(summary)
    }
}

fn next_term(queue: &Mutex<VecDeque<String>>) -> Option<String> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

/// Runs one batch end to end over HTTP, writing results under
/// `config.output_dir`.
///
/// Configuration problems (invalid config, empty proxy list, unavailable
/// credentials) are reported before any request is made.
pub async fn harvest(
    config: &HarvestConfig,
    proxies: Vec<ProxyConfig>,
    credentials: &dyn CredentialProvider,
    terms: Vec<String>,
) -> Result<Summary> {
    config.validate()?;
    let policy = config.retry_policy()?;
    let pool = Arc::new(ProxyPool::new(proxies, config.pool_options())?);
    let credentials = Arc::new(credentials.provide().await?);

    let transport = HttpSerpClient::new()
        .with_endpoint(config.endpoint.clone())
        .with_params(config.search.clone())
        .with_timeout(config.request_timeout());
    let sink = FileSink::create(&config.output_dir).await?;

    let worker = Worker::new(
        pool,
        Arc::new(transport),
        Arc::new(sink),
        credentials,
        policy,
    )
    .with_request_timeout(config.request_timeout());

    Dispatcher::new(worker, config.concurrency)?.run(terms).await
}
