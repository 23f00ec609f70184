//! Shared upstream proxy pool with ban/cool-down tracking.
//!
//! Workers borrow a proxy for exactly one attempt through a [`ProxyLease`]
//! and hand it back with [`ProxyPool::release`], reporting whether the proxy
//! behaved. Proxies implicated in a block or CAPTCHA are benched for a
//! cool-down period and come back on their own once it expires.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::{Client, Proxy as ReqwestProxy};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::{HarvestError, Result};

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProxyProtocol {
    /// HTTP proxy
    #[default]
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyProtocol {
    fn scheme(self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Identity of a single upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyConfig {
    /// Proxy host (IP or domain)
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Proxy protocol
    pub protocol: ProxyProtocol,
    /// Optional username for authentication
    pub username: Option<String>,
    /// Optional password for authentication
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Creates a new proxy configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
        }
    }

    /// Sets the proxy protocol.
    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets authentication credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Returns the proxy URL string, credentials included.
    pub fn url(&self) -> String {
        let scheme = self.protocol.scheme();
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                scheme,
                urlencoding::encode(user),
                urlencoding::encode(pass),
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", scheme, self.host, self.port),
        }
    }

    /// Returns a `host:port` label that is safe to log.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds a reqwest client that routes every request through this proxy.
    pub fn build_client(&self, user_agent: &str, timeout: Duration) -> Result<Client> {
        let proxy = ReqwestProxy::all(self.url())
            .map_err(|e| HarvestError::InvalidProxy(self.label(), e.to_string()))?;

        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| HarvestError::Other(format!("Failed to create HTTP client: {}", e)))
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Proxy selection strategy among the currently available proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStrategy {
    /// Round-robin selection
    #[default]
    RoundRobin,
    /// The proxy whose last use is oldest; never-used proxies first
    LeastRecentlyUsed,
    /// Random selection
    Random,
}

/// Lifecycle state of a pooled proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Free to be acquired.
    Available,
    /// Leased to exactly one worker.
    InUse,
    /// Cooling down after a block or CAPTCHA.
    Banned {
        /// When the proxy becomes available again.
        until: Instant,
    },
    /// Permanently removed after too many consecutive bans.
    Retired,
}

/// Tuning knobs for a [`ProxyPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// How long an unhealthy proxy stays banned.
    pub cooldown: Duration,
    /// Selection strategy among available proxies.
    pub strategy: ProxyStrategy,
    /// Consecutive bans after which a proxy is retired for the rest of the run.
    pub max_strikes: Option<u32>,
    /// Upper bound on how long `acquire` may wait.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(180),
            strategy: ProxyStrategy::RoundRobin,
            max_strikes: None,
            acquire_timeout: None,
        }
    }
}

/// Exclusive, single-attempt claim on a pooled proxy.
///
/// Leases are not `Clone`; [`ProxyPool::release`] consumes them, so a worker
/// can neither hold the same proxy twice nor return it twice. A lease dropped
/// without being released (a panicked or cancelled attempt) hands its proxy
/// back as healthy.
pub struct ProxyLease {
    id: usize,
    proxy: Arc<ProxyConfig>,
    pool: Arc<Shared>,
    released: bool,
}

impl ProxyLease {
    /// The leased proxy.
    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    /// Position of the proxy in the pool.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyLease")
            .field("id", &self.id)
            .field("proxy", &self.proxy.label())
            .finish()
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.reclaim(self.id);
        }
    }
}

/// Point-in-time view of one pooled proxy.
#[derive(Debug, Clone)]
pub struct ProxySnapshot {
    pub proxy: Arc<ProxyConfig>,
    pub status: ProxyStatus,
    pub strikes: u32,
}

struct Slot {
    proxy: Arc<ProxyConfig>,
    status: ProxyStatus,
    last_used: Option<Instant>,
    strikes: u32,
}

struct PoolState {
    slots: Vec<Slot>,
    cursor: usize,
}

impl PoolState {
    fn lift_expired_bans(&mut self, now: Instant) {
        for slot in &mut self.slots {
            if let ProxyStatus::Banned { until } = slot.status {
                if until <= now {
                    debug!(proxy = %slot.proxy, "Proxy cool-down expired");
                    slot.status = ProxyStatus::Available;
                }
            }
        }
    }

    fn pick(&self, strategy: ProxyStrategy) -> Option<usize> {
        let len = self.slots.len();
        let available = |idx: &usize| {
            self.slots
                .get(*idx)
                .is_some_and(|slot| slot.status == ProxyStatus::Available)
        };

        match strategy {
            ProxyStrategy::RoundRobin => (0..len)
                .map(|offset| (self.cursor + offset) % len)
                .find(available),
            ProxyStrategy::Random => {
                use std::time::{SystemTime, UNIX_EPOCH};
                let seed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as usize;
                (0..len).map(|offset| (seed + offset) % len).find(available)
            }
            ProxyStrategy::LeastRecentlyUsed => (0..len)
                .filter(available)
                .min_by_key(|idx| self.slots.get(*idx).and_then(|slot| slot.last_used)),
        }
    }

    fn claim(&mut self, strategy: ProxyStrategy, now: Instant) -> Option<(usize, Arc<ProxyConfig>)> {
        let id = self.pick(strategy)?;
        let len = self.slots.len();
        let slot = self.slots.get_mut(id)?;
        slot.status = ProxyStatus::InUse;
        slot.last_used = Some(now);
        self.cursor = (id + 1) % len;
        Some((id, Arc::clone(&slot.proxy)))
    }

    fn earliest_unban(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.status {
                ProxyStatus::Banned { until } => Some(until),
                _ => None,
            })
            .min()
    }

    fn all_retired(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.status == ProxyStatus::Retired)
    }
}

/// Pool state shared between the pool and its outstanding leases.
struct Shared {
    state: Mutex<PoolState>,
    released: Notify,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a dropped lease's proxy to the pool as healthy.
    fn reclaim(&self, id: usize) {
        {
            let mut state = self.lock_state();
            let Some(slot) = state.slots.get_mut(id) else {
                return;
            };
            if slot.status != ProxyStatus::InUse {
                return;
            }
            slot.status = ProxyStatus::Available;
            warn!(proxy = %slot.proxy, "Lease dropped without release, proxy returned");
        }
        self.released.notify_waiters();
    }
}

/// A pool of upstream proxies shared by every worker of a run.
///
/// All state lives behind one mutex, so `acquire` and `release` are atomic
/// with respect to each other. Callers that find nothing available park on a
/// [`Notify`] and are woken by the next release or by the earliest ban expiry.
pub struct ProxyPool {
    shared: Arc<Shared>,
    options: PoolOptions,
}

impl ProxyPool {
    /// Creates a pool over `proxies`. An empty list is a configuration error.
    pub fn new(proxies: Vec<ProxyConfig>, options: PoolOptions) -> Result<Self> {
        if proxies.is_empty() {
            return Err(HarvestError::NoProxies);
        }

        let slots = proxies
            .into_iter()
            .map(|proxy| Slot {
                proxy: Arc::new(proxy),
                status: ProxyStatus::Available,
                last_used: None,
                strikes: 0,
            })
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState { slots, cursor: 0 }),
                released: Notify::new(),
            }),
            options,
        })
    }

    /// Creates a pool with default options.
    pub fn with_proxies(proxies: Vec<ProxyConfig>) -> Result<Self> {
        Self::new(proxies, PoolOptions::default())
    }

    /// Sets the proxy selection strategy.
    pub fn with_strategy(mut self, strategy: ProxyStrategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    /// Sets the ban cool-down duration.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.options.cooldown = cooldown;
        self
    }

    /// Returns the pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Returns the number of proxies in the pool, whatever their state.
    pub fn len(&self) -> usize {
        self.lock_state().slots.len()
    }

    /// Always false: construction rejects an empty list.
    pub fn is_empty(&self) -> bool {
        self.lock_state().slots.is_empty()
    }

    /// Number of proxies that could be acquired right now.
    pub fn available_count(&self) -> usize {
        let mut state = self.lock_state();
        state.lift_expired_bans(Instant::now());
        state
            .slots
            .iter()
            .filter(|slot| slot.status == ProxyStatus::Available)
            .count()
    }

    /// Returns the status of every proxy, in pool order.
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let mut state = self.lock_state();
        state.lift_expired_bans(Instant::now());
        state
            .slots
            .iter()
            .map(|slot| ProxySnapshot {
                proxy: Arc::clone(&slot.proxy),
                status: slot.status,
                strikes: slot.strikes,
            })
            .collect()
    }

    /// Leases an available proxy, waiting until one frees up if necessary.
    ///
    /// Fails with [`HarvestError::PoolExhausted`] only when every proxy has
    /// been retired or the configured acquire timeout elapses.
    pub async fn acquire(&self) -> Result<ProxyLease> {
        let deadline = self.options.acquire_timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before inspecting state so a release that
            // lands between the check and the wait is not lost.
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock_state();
                let now = Instant::now();
                state.lift_expired_bans(now);

                if let Some((id, proxy)) = state.claim(self.options.strategy, now) {
                    debug!(proxy = %proxy, "Acquired proxy");
                    return Ok(ProxyLease {
                        id,
                        proxy,
                        pool: Arc::clone(&self.shared),
                        released: false,
                    });
                }

                if state.all_retired() {
                    return Err(HarvestError::PoolExhausted(format!(
                        "all {} proxies retired",
                        state.slots.len()
                    )));
                }

                if deadline.is_some_and(|deadline| now >= deadline) {
                    return Err(HarvestError::PoolExhausted(format!(
                        "no proxy became available within {:?}",
                        self.options.acquire_timeout.unwrap_or_default()
                    )));
                }

                match (state.earliest_unban(), deadline) {
                    (Some(unban), Some(deadline)) => Some(unban.min(deadline)),
                    (unban, deadline) => unban.or(deadline),
                }
            };

            match wake_at {
                Some(at) => {
                    debug!("No proxy available, waiting for release or cool-down");
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Returns a leased proxy to the pool.
    ///
    /// A healthy proxy becomes available immediately. An unhealthy one is
    /// banned for the cool-down period, or retired once it has collected
    /// `max_strikes` consecutive bans.
    pub fn release(&self, mut lease: ProxyLease, healthy: bool) {
        if !Arc::ptr_eq(&lease.pool, &self.shared) {
            warn!(proxy = %lease.proxy, "Released a lease the pool does not own");
            return;
        }
        lease.released = true;

        {
            let mut state = self.lock_state();
            let now = Instant::now();
            let Some(slot) = state.slots.get_mut(lease.id) else {
                return;
            };

            slot.last_used = Some(now);
            if healthy {
                slot.strikes = 0;
                slot.status = ProxyStatus::Available;
                debug!(proxy = %slot.proxy, "Released proxy");
            } else {
                slot.strikes += 1;
                if self
                    .options
                    .max_strikes
                    .is_some_and(|max| slot.strikes >= max)
                {
                    slot.status = ProxyStatus::Retired;
                    warn!(proxy = %slot.proxy, strikes = slot.strikes, "Proxy retired");
                } else {
                    slot.status = ProxyStatus::Banned {
                        until: now + self.options.cooldown,
                    };
                    warn!(
                        proxy = %slot.proxy,
                        cooldown_secs = self.options.cooldown.as_secs(),
                        "Proxy banned"
                    );
                }
            }
        }

        self.shared.released.notify_waiters();
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.shared.lock_state()
    }
}
