//! # serp-harvest
//!
//! Concurrent harvester for a SERP scraping API, routed through a rotating
//! pool of upstream proxies.
//!
//! - Bounded pool of parallel workers over a batch of search terms
//! - Shared proxy pool with exclusive leases, bans and cool-downs
//! - Block/CAPTCHA detection with a bounded per-term retry budget
//! - One durable JSON artifact per term
//!
//! ## Example
//!
//! ```rust,no_run
//! use serp_harvest::{harvest, EnvCredentials, HarvestConfig, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig::default();
//!     let proxies = vec![ProxyConfig::new("10.0.0.1", 8080).with_auth("user", "pass")];
//!     let terms = vec!["rust programming".to_string()];
//!
//!     let summary = harvest(&config, proxies, &EnvCredentials, terms).await?;
//!     println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//!     Ok(())
//! }
//! ```

mod error;

pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod input;
pub mod proxy;
pub mod retry;
pub mod sink;
pub mod worker;

pub use client::{classify, HttpSerpClient, Outcome, SearchParams, SerpTransport};
pub use config::HarvestConfig;
pub use credentials::{
    CredentialProvider, Credentials, EnvCredentials, ScriptAssetCredentials, StaticCredentials,
};
pub use dispatcher::{harvest, Dispatcher, Summary};
pub use error::{HarvestError, Result};
pub use proxy::{PoolOptions, ProxyConfig, ProxyLease, ProxyPool, ProxyProtocol, ProxyStatus, ProxyStrategy};
pub use retry::{Decision, RetryPolicy};
pub use sink::{FileSink, MemorySink, ResultSink, TermResult};
pub use worker::{AttemptRecord, TermReport, TermStatus, Worker, WorkerState};
