//! Credential Manager
//!
//! Obtains and renews the OAuth bearer token for the bank API. The token lives
//! in memory only. Expiry is not tracked; callers discover it reactively from an
//! authorization failure and call [`TokenProvider::renew`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::{OAuthConfig, OAUTH_SCOPE};

/// Errors that can occur while obtaining a token
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Missing configuration: {0} is not set")]
    MissingConfig(&'static str),

    #[error("Token endpoint rejected the request with status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Network error contacting token endpoint: {0}")]
    Network(String),

    #[error("Token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// An opaque bearer token. Replaced wholesale on renewal, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    obtained_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            obtained_at: Utc::now(),
        }
    }

    /// The raw token for the `Authorization` header
    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Source of bearer tokens for upstream calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return the cached token, renewing only when none is held
    async fn obtain_token(&self) -> Result<Arc<AccessToken>, CredentialError>;

    /// Discard the cached token and perform a fresh client-credentials exchange
    async fn renew(&self) -> Result<Arc<AccessToken>, CredentialError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth client-credentials manager with an in-memory token slot
pub struct CredentialManager {
    config: OAuthConfig,
    http: reqwest::Client,
    cached: RwLock<Option<Arc<AccessToken>>>,
    /// Serializes renewals so concurrent callers never race two exchanges
    renew_lock: Mutex<()>,
    renewals: AtomicU64,
}

impl CredentialManager {
    /// Create a manager, seeding the cache with the configured token if any
    pub fn new(config: OAuthConfig) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CredentialError::Network(e.to_string()))?;
        Ok(Self::with_client(config, http))
    }

    /// Create a manager around an existing HTTP client
    pub fn with_client(config: OAuthConfig, http: reqwest::Client) -> Self {
        let cached = config
            .seed_token
            .as_ref()
            .map(|token| Arc::new(AccessToken::new(token.clone())));
        Self {
            config,
            http,
            cached: RwLock::new(cached),
            renew_lock: Mutex::new(()),
            renewals: AtomicU64::new(0),
        }
    }

    /// Number of successful client-credentials exchanges so far
    pub fn renewal_count(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    /// Whether a token is currently cached
    pub async fn has_token(&self) -> bool {
        self.cached.read().await.is_some()
    }

    async fn exchange(&self) -> Result<AccessToken, CredentialError> {
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or(CredentialError::MissingConfig("BB_CLIENT_ID"))?;
        let client_secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or(CredentialError::MissingConfig("BB_CLIENT_SECRET"))?;

        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", OAUTH_SCOPE)])
            .send()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::UpstreamRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        if token.access_token.trim().is_empty() {
            return Err(CredentialError::InvalidResponse("empty access_token".to_string()));
        }

        Ok(AccessToken::new(token.access_token))
    }
}

#[async_trait]
impl TokenProvider for CredentialManager {
    async fn obtain_token(&self) -> Result<Arc<AccessToken>, CredentialError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            return Ok(Arc::clone(token));
        }
        self.renew_after(None).await
    }

    async fn renew(&self) -> Result<Arc<AccessToken>, CredentialError> {
        let seen = self.cached.read().await.clone();
        self.renew_after(seen).await
    }
}

impl CredentialManager {
    /// Exchange credentials unless another caller already replaced `seen`
    /// while this one waited for the renewal lock
    async fn renew_after(
        &self,
        seen: Option<Arc<AccessToken>>,
    ) -> Result<Arc<AccessToken>, CredentialError> {
        let _guard = self.renew_lock.lock().await;

        if let Some(current) = self.cached.read().await.as_ref() {
            let replaced = seen.as_ref().map_or(true, |seen| !Arc::ptr_eq(seen, current));
            if replaced {
                debug!("Token already renewed by a concurrent caller");
                return Ok(Arc::clone(current));
            }
        }

        match self.exchange().await {
            Ok(token) => {
                let token = Arc::new(token);
                *self.cached.write().await = Some(Arc::clone(&token));
                self.renewals.fetch_add(1, Ordering::Relaxed);
                info!("Bank API token renewed");
                Ok(token)
            }
            Err(e) => {
                // The caller renews because the held token was rejected
                *self.cached.write().await = None;
                error!("Token renewal failed: {}", e);
                Err(e)
            }
        }
    }
}
