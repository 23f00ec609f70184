//! SERP API client and response classification.
//!
//! One call is one authenticated POST to the search endpoint, routed through
//! one proxy. The raw status and body are mapped onto an [`Outcome`] by
//! [`classify`], a pure function, so the same bytes always yield the same
//! outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::credentials::Credentials;
use crate::proxy::ProxyConfig;

/// Default search endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://netnut-api.netnut.io/api/v1/playground/search";

const ORIGIN: &str = "https://playground.netnut.io";
const REFERER: &str = "https://playground.netnut.io/";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// Desktop user-agent string for the `n`th request.
pub(crate) fn user_agent_for(n: usize) -> &'static str {
    USER_AGENTS[n % USER_AGENTS.len()]
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Well-formed result payload.
    Success(Value),
    /// The upstream refused this proxy's IP.
    Blocked { status: u16 },
    /// The upstream answered with an anti-automation challenge.
    CaptchaChallenge,
    /// Network failure, timeout or an unexpected upstream status.
    TransportError(String),
    /// Credentials were rejected.
    AuthError { status: u16 },
}

impl Outcome {
    /// Returns true for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Returns true when the proxy is implicated and should cool down.
    pub fn implicates_proxy(&self) -> bool {
        matches!(self, Outcome::Blocked { .. } | Outcome::CaptchaChallenge)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(_) => write!(f, "success"),
            Outcome::Blocked { status } => write!(f, "blocked (HTTP {})", status),
            Outcome::CaptchaChallenge => write!(f, "captcha challenge"),
            Outcome::TransportError(msg) => write!(f, "transport error: {}", msg),
            Outcome::AuthError { status } => write!(f, "credentials rejected (HTTP {})", status),
        }
    }
}

/// Maps a raw HTTP response onto an [`Outcome`].
pub fn classify(status: u16, body: &[u8]) -> Outcome {
    if (200..300).contains(&status) {
        return match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) if captcha_flagged(&map) => Outcome::CaptchaChallenge,
            Ok(payload @ Value::Object(_)) => Outcome::Success(payload),
            // Interstitial pages come back as 200 HTML instead of JSON.
            _ => Outcome::CaptchaChallenge,
        };
    }

    // A rejected key is never the proxy's fault, even when the error body
    // echoes the captcha token field back.
    if status == 401 {
        return Outcome::AuthError { status };
    }

    if mentions_captcha(body) {
        return Outcome::CaptchaChallenge;
    }

    match status {
        403 | 407 | 429 => Outcome::Blocked { status },
        _ => Outcome::TransportError(format!("unexpected HTTP status {}", status)),
    }
}

fn captcha_flagged(map: &Map<String, Value>) -> bool {
    ["captcha", "captchaRequired"]
        .iter()
        .any(|key| map.get(*key) == Some(&Value::Bool(true)))
}

fn mentions_captcha(body: &[u8]) -> bool {
    String::from_utf8_lossy(body)
        .to_ascii_lowercase()
        .contains("captcha")
}

/// Search parameters sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Google domain to query.
    pub google_domain: String,
    /// Country code.
    pub gl: String,
    /// Interface language.
    pub hl: String,
    /// Encoded location; empty for none.
    pub uule: String,
    /// Result offset.
    pub start: u32,
    /// Results per page.
    pub num: u32,
    pub safe: bool,
    pub filter: bool,
    pub nfpr: bool,
    /// `desktop` or `mobile`.
    pub device: String,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            google_domain: "www.google.com".to_string(),
            gl: "us".to_string(),
            hl: "en".to_string(),
            uule: String::new(),
            start: 0,
            num: 10,
            safe: true,
            filter: false,
            nfpr: false,
            device: "desktop".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    google_domain: &'a str,
    gl: &'a str,
    hl: &'a str,
    uule: &'a str,
    q: &'a str,
    start: u32,
    #[serde(rename = "sum")]
    num: u32,
    safe: bool,
    filter: bool,
    nfpr: bool,
    captcha_token: &'a str,
    device: &'a str,
}

impl<'a> SearchRequest<'a> {
    fn new(term: &'a str, params: &'a SearchParams) -> Self {
        Self {
            google_domain: &params.google_domain,
            gl: &params.gl,
            hl: &params.hl,
            uule: &params.uule,
            q: term,
            start: params.start,
            num: params.num,
            safe: params.safe,
            filter: params.filter,
            nfpr: params.nfpr,
            captcha_token: "",
            device: &params.device,
        }
    }
}

/// One search attempt through one proxy.
///
/// Implementations must not fail: every problem is an [`Outcome`].
#[async_trait]
pub trait SerpTransport: Send + Sync {
    async fn call(&self, term: &str, credentials: &Credentials, proxy: &ProxyConfig) -> Outcome;
}

/// [`SerpTransport`] backed by reqwest.
///
/// Keeps one reqwest client per proxy so repeated attempts through the same
/// proxy reuse its connection pool.
pub struct HttpSerpClient {
    endpoint: String,
    params: SearchParams,
    timeout: Duration,
    next_agent: AtomicUsize,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpSerpClient {
    /// Creates a client for the default endpoint.
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            params: SearchParams::default(),
            timeout: Duration::from_secs(5),
            next_agent: AtomicUsize::new(0),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the API endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the search parameters.
    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the cached client for `proxy`, building it on first use.
    fn client_for(&self, proxy: &ProxyConfig) -> crate::Result<reqwest::Client> {
        let key = proxy.url();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = proxy.build_client(user_agent_for(0), self.timeout)?;
        debug!(proxy = %proxy, "Built HTTP client for proxy");
        clients.insert(key, client.clone());
        Ok(client)
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for HttpSerpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerpTransport for HttpSerpClient {
    async fn call(&self, term: &str, credentials: &Credentials, proxy: &ProxyConfig) -> Outcome {
        let user_agent = user_agent_for(self.next_agent.fetch_add(1, Ordering::Relaxed));
        let client = match self.client_for(proxy) {
            Ok(client) => client,
            Err(e) => return Outcome::TransportError(e.to_string()),
        };

        let response = client
            .post(&self.endpoint)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .header("cf-access-client-id", &credentials.client_id)
            .header("cf-access-client-secret", &credentials.client_secret)
            .header(reqwest::header::ORIGIN, ORIGIN)
            .header(reqwest::header::REFERER, REFERER)
            .json(&SearchRequest::new(term, &self.params))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return Outcome::TransportError(describe(&e)),
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => {
                debug!(term, proxy = %proxy, status, bytes = body.len(), "Received response");
                classify(status, &body)
            }
            Err(e) => Outcome::TransportError(describe(&e)),
        }
    }
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else {
        error.to_string()
    }
}
