//! Ingestion Pipeline
//!
//! Drives both ingestion protocols into the store and the fan-out:
//!
//! - push: a webhook payload carrying one or more raw items
//! - pull: one poll cycle over a trailing window of the bank API
//!
//! A poll cycle moves `Start → TokenReady → Querying → [Retrying → Querying] →
//! Processing → Done | Failed`. An authorization failure triggers exactly one
//! renewal and one retry; everything else about retrying belongs to the next
//! scheduled cycle. Per-item failures never abort a batch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_POLL_WINDOW_MINUTES;
use crate::credentials::{AccessToken, CredentialError, TokenProvider};
use crate::fanout::FanOut;
use crate::normalizer::normalize;
use crate::store::{InsertOutcome, TransactionStore};
use crate::transaction::{Source, Transaction};
use crate::upstream::{validate_end_to_end_id, PixSource, TimeWindow, UpstreamQueryError};

/// Errors that reject a webhook payload before any item is processed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PushError {
    #[error("invalid payload: expected a `pix` array")]
    MissingPixArray,

    #[error("no pix in payload")]
    EmptyBatch,
}

/// Errors that fail a whole poll cycle or reconciliation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("upstream query failed: {0}")]
    Query(UpstreamQueryError),

    #[error("bank API denied authorization after token renewal")]
    AuthorizationDenied,

    #[error("a poll cycle is already running")]
    AlreadyRunning,
}

/// Per-item outcome classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemStatus {
    #[serde(rename = "salvo")]
    Saved,
    #[serde(rename = "duplicado")]
    Duplicate,
    #[serde(rename = "erro")]
    Error,
}

/// Outcome of ingesting one raw item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    #[serde(rename = "txid")]
    pub transaction_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemReport {
    fn saved(transaction: Transaction) -> Self {
        Self {
            transaction_id: transaction.transaction_id.clone(),
            status: ItemStatus::Saved,
            data: Some(transaction),
            message: None,
        }
    }

    fn duplicate(transaction_id: String) -> Self {
        Self {
            transaction_id,
            status: ItemStatus::Duplicate,
            data: None,
            message: None,
        }
    }

    fn error(transaction_id: String, message: String) -> Self {
        Self {
            transaction_id,
            status: ItemStatus::Error,
            data: None,
            message: Some(message),
        }
    }
}

/// Outcome of one webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct PushReport {
    pub results: Vec<ItemReport>,
}

impl PushReport {
    pub fn saved(&self) -> usize {
        count_status(&self.results, ItemStatus::Saved)
    }

    pub fn duplicates(&self) -> usize {
        count_status(&self.results, ItemStatus::Duplicate)
    }

    pub fn errors(&self) -> usize {
        count_status(&self.results, ItemStatus::Error)
    }

    /// Every item failed in the store
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.errors() == self.results.len()
    }

    /// Every item was already stored
    pub fn all_duplicates(&self) -> bool {
        !self.results.is_empty() && self.duplicates() == self.results.len()
    }

    /// The records newly stored by this delivery
    pub fn stored(&self) -> Vec<&Transaction> {
        self.results.iter().filter_map(|r| r.data.as_ref()).collect()
    }
}

/// Summary of one successful poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollSummary {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub pix_consultados: usize,
    pub pix_novos: usize,
    pub pix_duplicados: usize,
    pub pix_erros: usize,
    pub token_renovado: bool,
    pub results: Vec<ItemReport>,
}

/// Poll cycle states, logged as the cycle advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Start,
    TokenReady,
    Querying,
    Retrying,
    Processing,
    Done,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Cycle {
    label: &'static str,
    state: CycleState,
}

impl Cycle {
    fn start(label: &'static str) -> Self {
        debug!("{} cycle: {}", label, CycleState::Start);
        Self {
            label,
            state: CycleState::Start,
        }
    }

    fn advance(&mut self, next: CycleState) {
        debug!("{} cycle: {} -> {}", self.label, self.state, next);
        self.state = next;
    }
}

/// Orchestrates credential, upstream, normalizer, store and fan-out
pub struct IngestionPipeline {
    tokens: Arc<dyn TokenProvider>,
    source: Arc<dyn PixSource>,
    store: Arc<dyn TransactionStore>,
    fanout: Arc<FanOut>,
    poll_window: ChronoDuration,
    poll_guard: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        source: Arc<dyn PixSource>,
        store: Arc<dyn TransactionStore>,
        fanout: Arc<FanOut>,
        poll_window: Duration,
    ) -> Self {
        let poll_window = ChronoDuration::from_std(poll_window)
            .unwrap_or_else(|_| ChronoDuration::minutes(DEFAULT_POLL_WINDOW_MINUTES as i64));
        Self {
            tokens,
            source,
            store,
            fanout,
            poll_window,
            poll_guard: Mutex::new(()),
        }
    }

    pub fn fanout(&self) -> &Arc<FanOut> {
        &self.fanout
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Push protocol: ingest every item of a webhook payload `{pix: [...]}`.
    ///
    /// # Returns
    /// Per-item outcomes; individual failures are reported, never propagated
    pub async fn ingest_push(&self, payload: &Value) -> Result<PushReport, PushError> {
        let items = payload
            .get("pix")
            .and_then(Value::as_array)
            .ok_or(PushError::MissingPixArray)?;
        if items.is_empty() {
            return Err(PushError::EmptyBatch);
        }

        let mut results = Vec::with_capacity(items.len());
        for raw in items {
            results.push(self.ingest_item(raw, Source::Webhook).await);
        }

        let report = PushReport { results };
        info!(
            "Webhook processed: {} saved, {} duplicate, {} failed",
            report.saved(),
            report.duplicates(),
            report.errors()
        );
        Ok(report)
    }

    /// Pull protocol: one poll cycle over the trailing window.
    ///
    /// Refuses to run while another cycle holds the guard.
    pub async fn run_poll_cycle(&self) -> Result<PollSummary, PollError> {
        let _guard = self
            .poll_guard
            .try_lock()
            .map_err(|_| PollError::AlreadyRunning)?;

        let mut cycle = Cycle::start("poll");
        let window = TimeWindow::trailing(Utc::now(), self.poll_window);
        let source = Arc::clone(&self.source);

        let fetched = self
            .query_with_renewal(&mut cycle, |token| {
                let source = Arc::clone(&source);
                async move { source.list_received(&token, &window).await }
            })
            .await;
        let (items, token_renewed) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                cycle.advance(CycleState::Failed);
                error!("Poll cycle failed: {}", e);
                return Err(e);
            }
        };

        cycle.advance(CycleState::Processing);
        let mut results = Vec::with_capacity(items.len());
        for raw in &items {
            results.push(self.ingest_item(raw, Source::Poll).await);
        }
        cycle.advance(CycleState::Done);

        let summary = PollSummary {
            success: true,
            timestamp: Utc::now(),
            pix_consultados: items.len(),
            pix_novos: count_status(&results, ItemStatus::Saved),
            pix_duplicados: count_status(&results, ItemStatus::Duplicate),
            pix_erros: count_status(&results, ItemStatus::Error),
            token_renovado: token_renewed,
            results,
        };
        info!(
            "Poll cycle done: {} queried, {} new, {} duplicate, {} failed",
            summary.pix_consultados, summary.pix_novos, summary.pix_duplicados, summary.pix_erros
        );
        Ok(summary)
    }

    /// Proxy path: fetch one transaction by end-to-end id and ingest it
    pub async fn reconcile(&self, end_to_end_id: &str) -> Result<ItemReport, PollError> {
        let mut cycle = Cycle::start("reconcile");
        if let Err(e) = validate_end_to_end_id(end_to_end_id) {
            cycle.advance(CycleState::Failed);
            warn!("Reconciliation refused: {}", e);
            return Err(PollError::Query(e));
        }
        let source = Arc::clone(&self.source);
        let id = end_to_end_id.to_string();

        let fetched = self
            .query_with_renewal(&mut cycle, |token| {
                let source = Arc::clone(&source);
                let id = id.clone();
                async move { source.fetch_by_end_to_end_id(&token, &id).await }
            })
            .await;
        let (raw, _) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                cycle.advance(CycleState::Failed);
                warn!("Reconciliation of {} failed: {}", end_to_end_id, e);
                return Err(e);
            }
        };

        cycle.advance(CycleState::Processing);
        let report = self.ingest_item(&raw, Source::Proxy).await;
        cycle.advance(CycleState::Done);
        Ok(report)
    }

    /// Obtain a token and run `query`; on authorization denial renew once and
    /// retry once. A second denial is terminal.
    ///
    /// # Returns
    /// The query result and whether the token was renewed on the way
    async fn query_with_renewal<T, F, Fut>(
        &self,
        cycle: &mut Cycle,
        mut query: F,
    ) -> Result<(T, bool), PollError>
    where
        F: FnMut(Arc<AccessToken>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamQueryError>>,
    {
        let token = self.tokens.obtain_token().await?;
        cycle.advance(CycleState::TokenReady);

        cycle.advance(CycleState::Querying);
        match query(token).await {
            Ok(value) => Ok((value, false)),
            Err(e) if e.is_authorization_denied() => {
                cycle.advance(CycleState::Retrying);
                warn!("Bank API rejected the token ({}), renewing", e);
                let token = self.tokens.renew().await?;

                cycle.advance(CycleState::Querying);
                match query(token).await {
                    Ok(value) => Ok((value, true)),
                    Err(e) if e.is_authorization_denied() => Err(PollError::AuthorizationDenied),
                    Err(e) => Err(PollError::Query(e)),
                }
            }
            Err(e) => Err(PollError::Query(e)),
        }
    }

    /// Normalize, insert, and broadcast only when the store reports a new record
    async fn ingest_item(&self, raw: &Value, source: Source) -> ItemReport {
        let transaction = normalize(raw, source);

        match self.store.insert(&transaction).await {
            Ok(InsertOutcome::Inserted(stored)) => {
                info!(
                    transaction_id = %stored.transaction_id,
                    %source,
                    amount = %stored.amount,
                    "PIX stored"
                );
                self.fanout.broadcast(&stored).await;
                ItemReport::saved(stored)
            }
            Ok(InsertOutcome::Duplicate) => {
                info!(
                    transaction_id = %transaction.transaction_id,
                    %source,
                    "Duplicate PIX ignored"
                );
                ItemReport::duplicate(transaction.transaction_id)
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction.transaction_id,
                    %source,
                    "Failed to store PIX: {}", e
                );
                ItemReport::error(transaction.transaction_id, e.to_string())
            }
        }
    }
}

fn count_status(results: &[ItemReport], status: ItemStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}
