//! API access credentials and the providers that produce them.
//!
//! Credentials are resolved once, before any worker starts, and are then
//! shared read-only for the whole run.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::proxy::ProxyConfig;
use crate::{HarvestError, Result};

/// Environment variable holding the client id.
pub const CLIENT_ID_ENV: &str = "SERP_CLIENT_ID";
/// Environment variable holding the client secret.
pub const CLIENT_SECRET_ENV: &str = "SERP_CLIENT_SECRET";

/// Static JS chunk of the playground that embeds the access keys.
pub const DEFAULT_SCRIPT_URL: &str =
    "https://playground.netnut.io/_next/static/chunks/5396-fb805b9d40b0a4c9.js";

const PLAYGROUND_REFERER: &str = "https://playground.netnut.io/playground/";

/// The `(client_id, client_secret)` pair sent with every API call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Source of API credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produces credentials, or a configuration error if none are available.
    async fn provide(&self) -> Result<Credentials>;
}

/// Credentials known up front (command line, config file).
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(client_id, client_secret),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn provide(&self) -> Result<Credentials> {
        if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
            return Err(HarvestError::MissingCredentials(
                "client id and secret must not be empty".into(),
            ));
        }
        Ok(self.credentials.clone())
    }
}

/// Reads credentials from `SERP_CLIENT_ID` / `SERP_CLIENT_SECRET`.
#[derive(Debug, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn provide(&self) -> Result<Credentials> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| HarvestError::MissingCredentials(format!("{} not set", name)))
        };
        Ok(Credentials::new(read(CLIENT_ID_ENV)?, read(CLIENT_SECRET_ENV)?))
    }
}

/// Scrapes the access keys out of the playground's client-side script bundle.
///
/// The bundle is fetched through each configured proxy in turn (or directly
/// when none is given) until one response contains both keys.
pub struct ScriptAssetCredentials {
    url: String,
    proxies: Vec<ProxyConfig>,
    timeout: Duration,
}

impl ScriptAssetCredentials {
    /// Creates a provider for the given script URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            proxies: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Routes the fetch through these proxies, trying each once.
    pub fn with_proxies(mut self, proxies: Vec<ProxyConfig>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Sets the per-fetch timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_via(&self, proxy: Option<&ProxyConfig>) -> Result<Credentials> {
        let user_agent = crate::client::user_agent_for(0);
        let client = match proxy {
            Some(proxy) => proxy.build_client(user_agent, self.timeout)?,
            None => reqwest::Client::builder()
                .user_agent(user_agent)
                .timeout(self.timeout)
                .build()?,
        };

        let body = client
            .get(&self.url)
            .header(reqwest::header::REFERER, PLAYGROUND_REFERER)
            .send()
            .await?
            .text()
            .await?;

        extract_credentials(&body).ok_or_else(|| {
            HarvestError::MissingCredentials(format!("access keys not found in {}", self.url))
        })
    }
}

impl Default for ScriptAssetCredentials {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_URL)
    }
}

#[async_trait]
impl CredentialProvider for ScriptAssetCredentials {
    async fn provide(&self) -> Result<Credentials> {
        if self.proxies.is_empty() {
            let credentials = self.fetch_via(None).await?;
            info!(url = %self.url, "Extracted API credentials");
            return Ok(credentials);
        }

        let mut last_error = None;
        for proxy in &self.proxies {
            match self.fetch_via(Some(proxy)).await {
                Ok(credentials) => {
                    info!(url = %self.url, proxy = %proxy, "Extracted API credentials");
                    return Ok(credentials);
                }
                Err(e) => {
                    warn!(proxy = %proxy, error = %e, "Credential fetch failed, trying next proxy");
                    last_error = Some(e);
                }
            }
        }

        debug!("Credential fetch failed through every proxy");
        Err(HarvestError::MissingCredentials(match last_error {
            Some(e) => e.to_string(),
            None => "no proxy attempted".to_string(),
        }))
    }
}

/// Pulls `CF_ACCESS_CLIENT_ID` and `CF_ACCESS_CLIENT_SECRET` out of a script body.
pub fn extract_credentials(script: &str) -> Option<Credentials> {
    static ID: OnceLock<Option<Regex>> = OnceLock::new();
    static SECRET: OnceLock<Option<Regex>> = OnceLock::new();

    let id_re = ID
        .get_or_init(|| Regex::new(r#"CF_ACCESS_CLIENT_ID:\s*"([^"]+)""#).ok())
        .as_ref()?;
    let secret_re = SECRET
        .get_or_init(|| Regex::new(r#"CF_ACCESS_CLIENT_SECRET:\s*"([^"]+)""#).ok())
        .as_ref()?;

    let client_id = id_re.captures(script)?.get(1)?.as_str();
    let client_secret = secret_re.captures(script)?.get(1)?.as_str();
    Some(Credentials::new(client_id, client_secret))
}
