//! Run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{SearchParams, DEFAULT_ENDPOINT};
use crate::proxy::{PoolOptions, ProxyStrategy};
use crate::retry::RetryPolicy;
use crate::{HarvestError, Result};

/// Configuration for one harvesting run.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Number of concurrently active workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per term before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Ban duration for a proxy implicated in a block or CAPTCHA, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Proxy selection strategy.
    #[serde(default)]
    pub proxy_strategy: ProxyStrategy,
    /// Consecutive bans before a proxy is retired; unlimited when absent.
    #[serde(default)]
    pub max_strikes: Option<u32>,
    /// Longest a worker waits for a proxy, in seconds; unbounded when absent.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
    /// Search API endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Directory receiving one JSON file per term.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Parameters sent with every search.
    #[serde(default)]
    pub search: SearchParams,
}

/// Worker count scaled to the machine: `max(10, cpus * 5 / 2)`.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 5 / 2).max(10)
}

fn default_max_attempts() -> u32 {
    11
}

fn default_cooldown_secs() -> u64 {
    180
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy_strategy: ProxyStrategy::default(),
            max_strikes: None,
            acquire_timeout_secs: None,
            endpoint: default_endpoint(),
            output_dir: default_output_dir(),
            search: SearchParams::default(),
        }
    }
}

impl HarvestConfig {
    /// Loads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(HarvestError::Config("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(HarvestError::Config("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(HarvestError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.max_strikes == Some(0) {
            return Err(HarvestError::Config("max_strikes must be at least 1".into()));
        }
        url::Url::parse(&self.endpoint)?;
        Ok(())
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Proxy pool options derived from this config.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            cooldown: Duration::from_secs(self.cooldown_secs),
            strategy: self.proxy_strategy,
            max_strikes: self.max_strikes,
            acquire_timeout: self.acquire_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Retry policy derived from this config.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.max_attempts)
    }
}
