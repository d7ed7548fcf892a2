//! Idempotent Transaction Store
//!
//! Persists canonical transactions in SQLite behind a primary key on
//! `transaction_id`. The key is the single dedup boundary for both ingestion
//! paths: a conflicting insert is classified as [`InsertOutcome::Duplicate`],
//! not as an error.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::transaction::{format_timestamp, parse_timestamp, NewTransaction, Transaction};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pix_transactions (
    transaction_id TEXT PRIMARY KEY CHECK (length(transaction_id) > 0),
    amount TEXT NOT NULL,
    payer_name TEXT NOT NULL,
    payer_info TEXT,
    occurred_at TEXT NOT NULL,
    received_at TEXT NOT NULL,
    source TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pix_transactions_received_at
    ON pix_transactions (received_at);
";

/// Errors that can occur in the store, other than duplicates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("Store worker failed: {0}")]
    Worker(String),
}

/// Result of an insert attempt that reached the database
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record is new and now durably stored
    Inserted(Transaction),
    /// A record with this `transaction_id` already exists
    Duplicate,
}

/// Persistence seam used by the pipeline and the read API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a normalized record, stamping `received_at`
    async fn insert(&self, transaction: &NewTransaction) -> Result<InsertOutcome, StoreError>;

    /// Records received at or after `since`, newest first
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError>;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open(e.to_string()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection =
            Connection::open_with_flags(path, flags).map_err(|e| StoreError::Open(e.to_string()))?;
        connection
            .execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::initialize(connection)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Self, StoreError> {
        connection
            .busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| StoreError::Open(e.to_string()))?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM pix_transactions", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
    }

    /// Run blocking SQLite work off the async executor
    async fn with_connection<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            work(&guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn insert(&self, transaction: &NewTransaction) -> Result<InsertOutcome, StoreError> {
        let new = transaction.clone();
        self.with_connection(move |conn| {
            let received_at = Utc::now();
            let result = conn.execute(
                "INSERT INTO pix_transactions
                    (transaction_id, amount, payer_name, payer_info, occurred_at, received_at, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.transaction_id,
                    new.amount.to_string(),
                    new.payer_name,
                    new.payer_info,
                    format_timestamp(new.occurred_at),
                    format_timestamp(received_at),
                    new.source.as_str(),
                ],
            );
            match result {
                Ok(_) => Ok(InsertOutcome::Inserted(Transaction::from_new(&new, received_at))),
                Err(err) => classify_insert_error(err),
            }
        })
        .await
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError> {
        let since = format_timestamp(since);
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT transaction_id, amount, payer_name, payer_info, occurred_at, received_at
                     FROM pix_transactions
                     WHERE received_at >= ?1
                     ORDER BY received_at DESC, occurred_at DESC",
                )
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let rows = stmt
                .query_map(params![since], |row| {
                    Ok(RawRow {
                        transaction_id: row.get(0)?,
                        amount: row.get(1)?,
                        payer_name: row.get(2)?,
                        payer_info: row.get(3)?,
                        occurred_at: row.get(4)?,
                        received_at: row.get(5)?,
                    })
                })
                .map_err(|e| StoreError::Query(e.to_string()))?;

            let transactions = rows
                .map(|row| row.map_err(|e| StoreError::Query(e.to_string()))?.into_transaction())
                .collect::<Result<Vec<_>, _>>();
            transactions
        })
        .await
    }
}

/// Primary-key and unique violations mean "already stored"; anything else is a failure
fn classify_insert_error(err: rusqlite::Error) -> Result<InsertOutcome, StoreError> {
    match err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            match failure.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                    Ok(InsertOutcome::Duplicate)
                }
                _ => Err(StoreError::Constraint(
                    message.unwrap_or_else(|| failure.to_string()),
                )),
            }
        }
        other => Err(StoreError::Query(other.to_string())),
    }
}

struct RawRow {
    transaction_id: String,
    amount: String,
    payer_name: String,
    payer_info: Option<String>,
    occurred_at: String,
    received_at: String,
}

impl RawRow {
    fn into_transaction(self) -> Result<Transaction, StoreError> {
        let corrupt = |field: &str, value: &str| {
            StoreError::Corrupt(format!("{} has unreadable {}: {:?}", self.transaction_id, field, value))
        };
        let amount = Decimal::from_str(&self.amount).map_err(|_| corrupt("amount", &self.amount))?;
        let occurred_at =
            parse_timestamp(&self.occurred_at).ok_or_else(|| corrupt("occurred_at", &self.occurred_at))?;
        let received_at =
            parse_timestamp(&self.received_at).ok_or_else(|| corrupt("received_at", &self.received_at))?;

        Ok(Transaction {
            transaction_id: self.transaction_id,
            amount,
            payer_name: self.payer_name,
            payer_info: self.payer_info,
            occurred_at,
            received_at,
        })
    }
}
