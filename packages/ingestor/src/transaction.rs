//! Canonical PIX Transaction
//!
//! The single record shape every ingestion path converges on. Upstream payloads
//! are mapped into a [`NewTransaction`] by the normalizer; the store stamps it
//! with `received_at` and hands back a [`Transaction`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Payer name used when the upstream payload carries none
pub const UNKNOWN_PAYER: &str = "Desconhecido";

/// Ingestion path a record arrived through.
///
/// Recorded for diagnostics only; it never takes part in identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Pushed by the bank to the inbound webhook
    Webhook,
    /// Pulled by a scheduled poll cycle
    Poll,
    /// Fetched one-by-one through the reconciliation lookup
    Proxy,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Webhook => "webhook",
            Source::Poll => "poll",
            Source::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Source::Webhook),
            "poll" => Ok(Source::Poll),
            "proxy" => Ok(Source::Proxy),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// A normalized transaction that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTransaction {
    /// Upstream txid, end-to-end id, or a generated UUID. Never empty.
    pub transaction_id: String,
    /// Non-negative amount; unparsable input degrades to zero
    pub amount: Decimal,
    pub payer_name: String,
    pub payer_info: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub source: Source,
}

/// A transaction as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub amount: Decimal,
    pub payer_name: String,
    pub payer_info: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// Set once by the store at insert time
    pub received_at: DateTime<Utc>,
}

impl Transaction {
    /// Stamp a normalized record with its insert time
    pub fn from_new(new: &NewTransaction, received_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id: new.transaction_id.clone(),
            amount: new.amount,
            payer_name: new.payer_name.clone(),
            payer_info: new.payer_info.clone(),
            occurred_at: new.occurred_at,
            received_at,
        }
    }
}

/// Format a timestamp as fixed-width RFC3339 UTC text.
///
/// Every value has the same width, so lexicographic order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 timestamp into UTC
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
