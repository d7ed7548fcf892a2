//! Transaction Normalizer
//!
//! Maps the upstream payload shapes (webhook body item, poll response item,
//! single-transaction lookup) into one [`NewTransaction`]. Each logical field is
//! resolved through a fallback chain of JSON pointers; the first usable value
//! wins. Normalization never fails: malformed input degrades to sentinel values
//! so a payment notification is never dropped on a parse error.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::transaction::{parse_timestamp, NewTransaction, Source, UNKNOWN_PAYER};

/// Placeholder identifiers some upstream variants send instead of a real id.
/// Compared case-insensitively; they are never accepted as identity.
pub const PLACEHOLDER_IDS: &[&str] = &["no-id", "sem-txid"];

/// Explicit transaction id, then the end-to-end id
pub const ID_FIELDS: &[&str] = &["/txid", "/endToEndId"];

/// Plain amount, then the nested charge amount some responses carry
pub const AMOUNT_FIELDS: &[&str] = &["/valor", "/valor/original"];

/// Nested payer objects first, then the flat alias
pub const PAYER_NAME_FIELDS: &[&str] = &["/pagador/nome", "/devedor/nome", "/nomePagador"];

pub const PAYER_INFO_FIELDS: &[&str] = &["/infoPagador"];

pub const OCCURRED_AT_FIELDS: &[&str] = &["/horario"];

/// Normalize one raw upstream item using the current clock and a random UUID
/// for items without a usable identifier.
pub fn normalize(raw: &Value, source: Source) -> NewTransaction {
    normalize_at(raw, source, Utc::now(), || Uuid::new_v4().to_string())
}

/// Normalize one raw upstream item with an explicit clock and id factory.
///
/// # Arguments
/// * `raw` - The upstream item, any JSON shape
/// * `source` - Ingestion path, kept for diagnostics
/// * `now` - Fallback occurrence time
/// * `fresh_id` - Called only when no upstream identifier is usable
///
/// # Returns
/// A fully populated `NewTransaction`; identical inputs give identical output
pub fn normalize_at(
    raw: &Value,
    source: Source,
    now: DateTime<Utc>,
    fresh_id: impl FnOnce() -> String,
) -> NewTransaction {
    let transaction_id = resolve_id(raw).unwrap_or_else(|| {
        let generated = fresh_id();
        debug!(%source, transaction_id = %generated, "no upstream id, generated one");
        generated
    });

    let amount = resolve_amount(raw).unwrap_or_else(|| {
        debug!(%source, %transaction_id, "amount missing or unparsable, using 0");
        Decimal::ZERO
    });

    let payer_name = first_text(raw, PAYER_NAME_FIELDS).unwrap_or_else(|| UNKNOWN_PAYER.to_string());
    let payer_info = first_text(raw, PAYER_INFO_FIELDS);
    let occurred_at = first_text(raw, OCCURRED_AT_FIELDS)
        .and_then(|text| parse_occurred_at(&text))
        .unwrap_or(now);

    NewTransaction {
        transaction_id,
        amount,
        payer_name,
        payer_info,
        occurred_at,
        source,
    }
}

/// Check whether an upstream identifier is one of the known placeholders
pub fn is_placeholder_id(id: &str) -> bool {
    PLACEHOLDER_IDS
        .iter()
        .any(|placeholder| placeholder.eq_ignore_ascii_case(id))
}

fn resolve_id(raw: &Value) -> Option<String> {
    ID_FIELDS
        .iter()
        .filter_map(|pointer| text_at(raw, pointer))
        .find(|id| !is_placeholder_id(id))
}

fn resolve_amount(raw: &Value) -> Option<Decimal> {
    AMOUNT_FIELDS
        .iter()
        .filter_map(|pointer| raw.pointer(pointer))
        .find_map(parse_amount)
}

/// Parse an amount from a JSON string or number.
///
/// Accepts `"150.50"`, `150.5`, `"1e2"` and a decimal comma (`"150,50"`).
/// Negative values are treated as unusable.
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }

    let text = if text.contains(',') && !text.contains('.') {
        text.replace(',', ".")
    } else {
        text
    };

    let amount = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;

    (!amount.is_sign_negative()).then_some(amount)
}

/// Parse an occurrence timestamp; offset-less values are taken as UTC
pub fn parse_occurred_at(text: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(text).or_else(|| {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    })
}

fn first_text(raw: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|pointer| text_at(raw, pointer))
}

/// Non-blank string (or number rendered as text) at a JSON pointer
fn text_at(raw: &Value, pointer: &str) -> Option<String> {
    match raw.pointer(pointer)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
