//! OAuth2 bearer-token source.
//!
//! One provider per process: the broker connection asks it for the current
//! token whenever librdkafka needs a refresh. In dynamic mode tokens come
//! from a client-credentials endpoint and are cached until shortly before
//! expiry; the refresh runs under a single lock so concurrent callers share
//! one outstanding fetch instead of stampeding the endpoint.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::debug;

/// Refresh this long before the cached token actually expires.
const REFRESH_BUFFER: Duration = Duration::from_secs(20);
/// Bound on the bootstrap fetch at construction.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Nominal lifetime reported for static tokens.
const STATIC_LIFETIME: Duration = Duration::from_secs(3600);

static SHARED: OnceCell<Arc<TokenProvider>> = OnceCell::const_new();

/// Token endpoint configuration.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Client-credentials token endpoint URL
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// When set, no endpoint is contacted; this exact string is always returned.
    pub static_token: Option<String>,
}

/// Standard client-credentials response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: String,
    expires_in: u64,
}

/// A freshly fetched token with its advertised lifetime.
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub bearer: String,
    pub lifetime: Duration,
}

/// Token-fetching seam; tests substitute a fake without touching the
/// process-wide provider.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchedToken>;
}

struct HttpTokenFetcher {
    client: reqwest::Client,
    config: TokenConfig,
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self) -> Result<FetchedToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Token request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "Token endpoint returned status {status}"
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Malformed token response: {e}")))?;
        if body.access_token.is_empty() {
            return Err(Error::Auth("Token endpoint returned empty token".to_string()));
        }
        Ok(FetchedToken {
            bearer: body.access_token,
            lifetime: Duration::from_secs(body.expires_in),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: Instant,
}

enum Mode {
    /// Fixed token, no network activity ever.
    Static(String),
    /// Endpoint-backed with refresh-ahead caching.
    Dynamic {
        fetcher: Arc<dyn TokenFetcher>,
        state: Mutex<CachedToken>,
    },
}

/// Cached bearer-token source. See the module docs for the refresh discipline.
pub struct TokenProvider {
    mode: Mode,
}

impl TokenProvider {
    /// Build a provider from configuration. In dynamic mode the bootstrap
    /// fetch happens here; failure is unrecoverable and fails construction.
    pub async fn new(config: TokenConfig) -> Result<Self> {
        if let Some(token) = &config.static_token {
            if token.is_empty() {
                return Err(Error::Auth("Static token must not be empty".to_string()));
            }
            return Ok(Self {
                mode: Mode::Static(token.clone()),
            });
        }
        let fetcher = Arc::new(HttpTokenFetcher {
            client: reqwest::Client::new(),
            config,
        });
        Self::with_fetcher(fetcher).await
    }

    /// Construction seam for injecting a fetcher (used by tests and embedders
    /// with their own token plumbing). Performs the bootstrap fetch.
    pub async fn with_fetcher(fetcher: Arc<dyn TokenFetcher>) -> Result<Self> {
        let fetched = tokio::time::timeout(BOOTSTRAP_TIMEOUT, fetcher.fetch())
            .await
            .map_err(|_| Error::Auth("Bootstrap token fetch timed out".to_string()))?
            .map_err(|e| Error::Auth(format!("Bootstrap token fetch failed: {e}")))?;
        let state = Mutex::new(CachedToken {
            bearer: fetched.bearer,
            expires_at: Instant::now() + fetched.lifetime,
        });
        Ok(Self {
            mode: Mode::Dynamic { fetcher, state },
        })
    }

    /// The process-wide provider, created on first use. The configuration of
    /// the first caller wins; later configs are ignored.
    pub async fn shared(config: TokenConfig) -> Result<Arc<TokenProvider>> {
        SHARED
            .get_or_try_init(|| async { Ok(Arc::new(Self::new(config).await?)) })
            .await
            .map(Arc::clone)
    }

    /// Return the current bearer token, refreshing it first when it is within
    /// [`REFRESH_BUFFER`] of expiry.
    ///
    /// Refresh failure keeps the stale token in place and returns the error
    /// to this caller only; the next caller triggers its own attempt.
    pub async fn token(&self) -> Result<String> {
        match &self.mode {
            Mode::Static(token) => Ok(token.clone()),
            Mode::Dynamic { fetcher, state } => {
                let mut cached = state.lock().await;
                // Re-evaluated under the lock: callers that queued behind an
                // in-flight refresh see the fresh expiry and return directly.
                if Instant::now() + REFRESH_BUFFER >= cached.expires_at {
                    debug!("Bearer token within refresh buffer, fetching a new one");
                    let fetched = fetcher.fetch().await?;
                    cached.bearer = fetched.bearer;
                    cached.expires_at = Instant::now() + fetched.lifetime;
                }
                Ok(cached.bearer.clone())
            }
        }
    }

    /// Wall-clock expiry of the current token in milliseconds since epoch,
    /// as librdkafka's token callback expects. Best effort: a contended lock
    /// reports a short lifetime rather than blocking.
    pub fn expires_at_epoch_ms(&self) -> i64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        match &self.mode {
            Mode::Static(_) => now_ms + STATIC_LIFETIME.as_millis() as i64,
            Mode::Dynamic { state, .. } => {
                let remaining = state
                    .try_lock()
                    .map(|cached| cached.expires_at.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_secs(60));
                now_ms + remaining.as_millis() as i64
            }
        }
    }
}
