//! Bank PIX API Client
//!
//! Queries the upstream "received transactions" endpoint over a bounded time
//! window, and looks up single transactions by end-to-end id. Raw items are
//! returned as JSON values; shaping them is the normalizer's job.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::BankApiConfig;
use crate::credentials::AccessToken;
use crate::transaction::format_timestamp;

/// Only settled transactions are listed
pub const SETTLED_STATUS: &str = "LIQUIDADO";

/// Errors that can occur while querying the bank API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamQueryError {
    #[error("Bank API denied authorization (status {0})")]
    Unauthorized(u16),

    #[error("Bank API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error contacting bank API: {0}")]
    Network(String),

    #[error("Bank API response could not be decoded: {0}")]
    Decode(String),

    #[error("Missing configuration: {0} is not set")]
    MissingConfig(&'static str),

    #[error("Invalid end-to-end id: {0:?}")]
    InvalidIdentifier(String),
}

impl UpstreamQueryError {
    /// Whether a token renewal might fix this failure
    pub fn is_authorization_denied(&self) -> bool {
        matches!(self, UpstreamQueryError::Unauthorized(_))
    }

    /// Whether the upstream reported the resource as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamQueryError::Status { status: 404, .. })
    }
}

/// Rejects end-to-end ids that are not plain ASCII alphanumerics
///
/// Ids issued by the PIX network are 32 alphanumeric characters; anything
/// else never reaches the bank.
pub fn validate_end_to_end_id(end_to_end_id: &str) -> Result<(), UpstreamQueryError> {
    if end_to_end_id.is_empty()
        || end_to_end_id.len() > 64
        || !end_to_end_id.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(UpstreamQueryError::InvalidIdentifier(end_to_end_id.to_string()));
    }
    Ok(())
}

/// A closed time range for the received-transactions query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of length `span` ending at `now`, clamped at the earliest
    /// representable instant
    pub fn trailing(now: DateTime<Utc>, span: ChronoDuration) -> Self {
        Self {
            start: now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: now,
        }
    }
}

/// Upstream source of raw PIX items
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PixSource: Send + Sync {
    /// List settled transactions received inside `window`
    async fn list_received(
        &self,
        token: &AccessToken,
        window: &TimeWindow,
    ) -> Result<Vec<Value>, UpstreamQueryError>;

    /// Fetch one transaction by its end-to-end id
    async fn fetch_by_end_to_end_id(
        &self,
        token: &AccessToken,
        end_to_end_id: &str,
    ) -> Result<Value, UpstreamQueryError>;
}

/// HTTP client for the bank PIX API
pub struct BankClient {
    config: BankApiConfig,
    http: reqwest::Client,
}

impl BankClient {
    pub fn new(config: BankApiConfig) -> Result<Self, UpstreamQueryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| UpstreamQueryError::Network(e.to_string()))?;
        Ok(Self::with_client(config, http))
    }

    pub fn with_client(config: BankApiConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    async fn get_json(
        &self,
        request: reqwest::RequestBuilder,
        token: &AccessToken,
    ) -> Result<Value, UpstreamQueryError> {
        let response = request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| UpstreamQueryError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UpstreamQueryError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamQueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamQueryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PixSource for BankClient {
    async fn list_received(
        &self,
        token: &AccessToken,
        window: &TimeWindow,
    ) -> Result<Vec<Value>, UpstreamQueryError> {
        let pix_key = self
            .config
            .pix_key
            .as_deref()
            .ok_or(UpstreamQueryError::MissingConfig("CHAVE_PIX"))?;

        let url = format!("{}/recebidos", self.base_url());
        let start = format_timestamp(window.start);
        let end = format_timestamp(window.end);
        debug!("Querying received PIX between {} and {}", start, end);

        let request = self.http.get(&url).query(&[
            ("chave", pix_key),
            ("status", SETTLED_STATUS),
            ("inicio", start.as_str()),
            ("fim", end.as_str()),
        ]);
        let body = self.get_json(request, token).await?;
        extract_items(body)
    }

    async fn fetch_by_end_to_end_id(
        &self,
        token: &AccessToken,
        end_to_end_id: &str,
    ) -> Result<Value, UpstreamQueryError> {
        validate_end_to_end_id(end_to_end_id)?;

        let mut url = reqwest::Url::parse(self.base_url())
            .map_err(|e| UpstreamQueryError::Decode(format!("bad base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamQueryError::Decode("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push("pix")
            .push(end_to_end_id);
        let request = self.http.get(url);
        self.get_json(request, token).await
    }
}

/// Accept either a bare array or an object carrying a `pix` array
pub fn extract_items(body: Value) -> Result<Vec<Value>, UpstreamQueryError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("pix") {
            Some(Value::Array(items)) => Ok(items),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Err(UpstreamQueryError::Decode(format!(
                "expected `pix` to be an array, got {other}"
            ))),
        },
        other => Err(UpstreamQueryError::Decode(format!(
            "expected an array of transactions, got {other}"
        ))),
    }
}
