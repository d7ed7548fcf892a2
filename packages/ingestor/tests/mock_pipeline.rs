//! Mock Pipeline Integration Tests
//!
//! Tests the full pipeline with a scripted bank and token source (no external
//! dependencies) over an in-memory SQLite store and a live fan-out.
//! Verifies normalize → store → broadcast for both push and poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use pixwatch_ingestor::credentials::{AccessToken, CredentialError, TokenProvider};
use pixwatch_ingestor::pipeline::{IngestionPipeline, ItemStatus, PollError};
use pixwatch_ingestor::publisher::RealtimeMessage;
use pixwatch_ingestor::store::{SqliteStore, TransactionStore};
use pixwatch_ingestor::transaction::{Transaction, UNKNOWN_PAYER};
use pixwatch_ingestor::upstream::{PixSource, TimeWindow, UpstreamQueryError};
use pixwatch_ingestor::FanOut;

/// Token source that hands out "token-N", bumping N on every renewal
struct ScriptedTokens {
    current: Mutex<Arc<AccessToken>>,
    renewals: AtomicUsize,
}

impl ScriptedTokens {
    fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(AccessToken::new("token-0"))),
            renewals: AtomicUsize::new(0),
        }
    }

    fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for ScriptedTokens {
    async fn obtain_token(&self) -> Result<Arc<AccessToken>, CredentialError> {
        Ok(Arc::clone(&self.current.lock().unwrap()))
    }

    async fn renew(&self) -> Result<Arc<AccessToken>, CredentialError> {
        let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Arc::new(AccessToken::new(format!("token-{n}")));
        *self.current.lock().unwrap() = Arc::clone(&token);
        Ok(token)
    }
}

/// Bank that replays queued responses and records the tokens it saw
#[derive(Default)]
struct ScriptedBank {
    responses: Mutex<VecDeque<Result<Vec<Value>, UpstreamQueryError>>>,
    tokens_seen: Mutex<Vec<String>>,
}

impl ScriptedBank {
    fn push_response(&self, response: Result<Vec<Value>, UpstreamQueryError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PixSource for ScriptedBank {
    async fn list_received(
        &self,
        token: &AccessToken,
        _window: &TimeWindow,
    ) -> Result<Vec<Value>, UpstreamQueryError> {
        self.tokens_seen.lock().unwrap().push(token.secret().to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_by_end_to_end_id(
        &self,
        token: &AccessToken,
        end_to_end_id: &str,
    ) -> Result<Value, UpstreamQueryError> {
        self.tokens_seen.lock().unwrap().push(token.secret().to_string());
        Ok(json!({"endToEndId": end_to_end_id, "valor": "1.00"}))
    }
}

struct Harness {
    pipeline: Arc<IngestionPipeline>,
    tokens: Arc<ScriptedTokens>,
    bank: Arc<ScriptedBank>,
    store: SqliteStore,
}

impl Harness {
    fn new() -> Self {
        let tokens = Arc::new(ScriptedTokens::new());
        let bank = Arc::new(ScriptedBank::default());
        let store = SqliteStore::open_in_memory().unwrap();
        let pipeline = Arc::new(IngestionPipeline::new(
            tokens.clone(),
            bank.clone(),
            Arc::new(store.clone()),
            Arc::new(FanOut::new()),
            Duration::from_secs(2 * 60 * 60),
        ));
        Self {
            pipeline,
            tokens,
            bank,
            store,
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.pipeline.fanout().subscribe().1
    }
}

fn webhook_item(txid: &str, amount: &str) -> Value {
    json!({
        "txid": txid,
        "endToEndId": format!("E2E-{txid}"),
        "valor": amount,
        "pagador": {"nome": "Fulano de Tal"},
        "horario": "2024-05-01T12:00:00-03:00",
        "infoPagador": "pedido 42"
    })
}

fn decode(payload: &str) -> Transaction {
    let RealtimeMessage::NewPix(transaction) = RealtimeMessage::from_json(payload).unwrap();
    transaction
}

// ==================== Push Protocol Tests ====================

#[tokio::test]
async fn test_webhook_item_stored_and_broadcast() {
    let harness = Harness::new();
    let mut rx = harness.subscribe();

    let report = harness
        .pipeline
        .ingest_push(&json!({"pix": [webhook_item("TX1", "150.50")]}))
        .await
        .unwrap();

    assert_eq!(report.saved(), 1);
    let broadcast = decode(&rx.recv().await.unwrap());
    assert_eq!(broadcast.transaction_id, "TX1");
    assert_eq!(broadcast.amount, Decimal::new(15050, 2));
    assert_eq!(broadcast.payer_name, "Fulano de Tal");
    assert_eq!(broadcast.payer_info.as_deref(), Some("pedido 42"));
    assert_eq!(harness.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_webhook_redelivery_is_duplicate_without_broadcast() {
    let harness = Harness::new();
    let payload = json!({"pix": [webhook_item("TX1", "10.00")]});
    harness.pipeline.ingest_push(&payload).await.unwrap();

    let mut rx = harness.subscribe();
    let report = harness.pipeline.ingest_push(&payload).await.unwrap();

    assert_eq!(report.results[0].status, ItemStatus::Duplicate);
    assert!(report.all_duplicates());
    assert!(rx.try_recv().is_err());
    assert_eq!(harness.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_webhook_processes_every_item_in_batch() {
    let harness = Harness::new();
    let payload = json!({"pix": [
        webhook_item("A", "1.00"),
        webhook_item("B", "2.00"),
        webhook_item("A", "1.00"),
    ]});

    let report = harness.pipeline.ingest_push(&payload).await.unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ItemStatus::Saved, ItemStatus::Saved, ItemStatus::Duplicate]
    );
}

#[tokio::test]
async fn test_placeholder_txid_falls_back_to_end_to_end_id() {
    let harness = Harness::new();
    let item = json!({"txid": "sem-txid", "endToEndId": "E9999", "valor": "3.00"});

    let report = harness.pipeline.ingest_push(&json!({"pix": [item]})).await.unwrap();

    assert_eq!(report.results[0].transaction_id, "E9999");
}

#[tokio::test]
async fn test_item_without_any_id_gets_unique_id() {
    let harness = Harness::new();
    let item = json!({"valor": "3.00"});

    let first = harness.pipeline.ingest_push(&json!({"pix": [item.clone()]})).await.unwrap();
    let second = harness.pipeline.ingest_push(&json!({"pix": [item]})).await.unwrap();

    assert_eq!(first.saved(), 1);
    assert_eq!(second.saved(), 1);
    assert_ne!(first.results[0].transaction_id, second.results[0].transaction_id);
    assert!(!first.results[0].transaction_id.is_empty());
}

#[tokio::test]
async fn test_malformed_fields_degrade_to_defaults() {
    let harness = Harness::new();
    let item = json!({"txid": "BAD1", "valor": "not-a-number", "pagador": 7, "horario": "yesterday"});

    let report = harness.pipeline.ingest_push(&json!({"pix": [item]})).await.unwrap();

    let stored = report.results[0].data.as_ref().unwrap();
    assert_eq!(stored.amount, Decimal::ZERO);
    assert_eq!(stored.payer_name, UNKNOWN_PAYER);
}

// ==================== Poll Protocol Tests ====================

#[tokio::test]
async fn test_poll_after_webhook_sees_duplicate() {
    let harness = Harness::new();
    harness
        .pipeline
        .ingest_push(&json!({"pix": [webhook_item("SAME", "20.00")]}))
        .await
        .unwrap();
    harness.bank.push_response(Ok(vec![
        json!({"endToEndId": "SAME", "valor": "20.00"}),
        json!({"endToEndId": "OTHER", "valor": "5.00"}),
    ]));
    let mut rx = harness.subscribe();

    let summary = harness.pipeline.run_poll_cycle().await.unwrap();

    assert_eq!(summary.pix_consultados, 2);
    assert_eq!(summary.pix_novos, 1);
    assert_eq!(summary.pix_duplicados, 1);
    assert_eq!(decode(&rx.recv().await.unwrap()).transaction_id, "OTHER");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_poll_renews_once_after_rejection() {
    let harness = Harness::new();
    harness.bank.push_response(Err(UpstreamQueryError::Unauthorized(401)));
    harness.bank.push_response(Ok(vec![json!({"txid": "P1", "valor": "9.90"})]));

    let summary = harness.pipeline.run_poll_cycle().await.unwrap();

    assert!(summary.token_renovado);
    assert_eq!(summary.pix_novos, 1);
    assert_eq!(harness.tokens.renewals(), 1);
    assert_eq!(harness.bank.tokens_seen(), vec!["token-0", "token-1"]);
}

#[tokio::test]
async fn test_poll_double_rejection_fails_cycle() {
    let harness = Harness::new();
    harness.bank.push_response(Err(UpstreamQueryError::Unauthorized(401)));
    harness.bank.push_response(Err(UpstreamQueryError::Unauthorized(401)));
    harness.bank.push_response(Ok(vec![json!({"txid": "NEVER"})]));

    let err = assert_err!(harness.pipeline.run_poll_cycle().await);

    assert_eq!(err, PollError::AuthorizationDenied);
    assert_eq!(harness.tokens.renewals(), 1);
    assert_eq!(harness.bank.tokens_seen().len(), 2);
    assert_eq!(harness.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_next_cycle_starts_from_scratch_after_failure() {
    let harness = Harness::new();
    harness.bank.push_response(Err(UpstreamQueryError::Status {
        status: 500,
        body: "erro interno".to_string(),
    }));
    harness.bank.push_response(Ok(vec![json!({"txid": "LATE"})]));

    assert!(matches!(
        harness.pipeline.run_poll_cycle().await,
        Err(PollError::Query(UpstreamQueryError::Status { status: 500, .. }))
    ));
    let summary = assert_ok!(harness.pipeline.run_poll_cycle().await);

    assert_eq!(summary.pix_novos, 1);
    assert!(!summary.token_renovado);
    assert_eq!(harness.tokens.renewals(), 0);
}

#[tokio::test]
async fn test_renewed_token_reused_by_next_cycle() {
    let harness = Harness::new();
    harness.bank.push_response(Err(UpstreamQueryError::Unauthorized(403)));

    assert_ok!(harness.pipeline.run_poll_cycle().await);
    assert_ok!(harness.pipeline.run_poll_cycle().await);

    assert_eq!(harness.bank.tokens_seen(), vec!["token-0", "token-1", "token-1"]);
}

#[tokio::test]
async fn test_reconcile_after_poll_is_duplicate() {
    let harness = Harness::new();
    harness.bank.push_response(Ok(vec![json!({"endToEndId": "E1", "valor": "1.00"})]));
    harness.pipeline.run_poll_cycle().await.unwrap();

    let report = harness.pipeline.reconcile("E1").await.unwrap();

    assert_eq!(report.status, ItemStatus::Duplicate);
}

// ==================== Concurrency Tests ====================

#[tokio::test]
async fn test_concurrent_deliveries_store_once() {
    let harness = Harness::new();
    let mut rx = harness.subscribe();
    let payload = json!({"pix": [webhook_item("RACE", "50.00")]});

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&harness.pipeline);
        let payload = payload.clone();
        handles.push(tokio::spawn(async move { pipeline.ingest_push(&payload).await }));
    }

    let mut saved = 0;
    for handle in handles {
        saved += handle.await.unwrap().unwrap().saved();
    }

    assert_eq!(saved, 1);
    assert_eq!(harness.store.count().await.unwrap(), 1);
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

// ==================== Burst Handling Tests ====================

#[tokio::test]
async fn test_pipeline_handles_burst_through_both_paths() {
    let harness = Harness::new();
    let mut rx = harness.subscribe();
    let items: Vec<Value> = (0..50).map(|i| webhook_item(&format!("B{i:03}"), "1.00")).collect();
    harness.bank.push_response(Ok(items.clone()));

    let start = Instant::now();
    let pushed = harness.pipeline.ingest_push(&json!({"pix": items})).await.unwrap();
    let polled = harness.pipeline.run_poll_cycle().await.unwrap();
    let duration = start.elapsed();

    assert_eq!(pushed.saved(), 50);
    assert_eq!(polled.pix_duplicados, 50);
    assert!(duration < Duration::from_secs(5), "Burst processing took too long: {:?}", duration);

    // Broadcasts follow insert order within a batch
    for i in 0..50 {
        assert_eq!(decode(&rx.recv().await.unwrap()).transaction_id, format!("B{i:03}"));
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_subscriber_does_not_block_others() {
    let harness = Harness::new();
    let dead = harness.subscribe();
    let mut live = harness.subscribe();
    drop(dead);

    harness
        .pipeline
        .ingest_push(&json!({"pix": [webhook_item("T1", "1.00")]}))
        .await
        .unwrap();

    assert_eq!(decode(&live.recv().await.unwrap()).transaction_id, "T1");
    assert_eq!(harness.pipeline.fanout().subscriber_count(), 1);
}

#[tokio::test]
async fn test_read_api_sees_stored_records_newest_first() {
    let harness = Harness::new();
    let since = chrono::Utc::now() - chrono::Duration::seconds(1);
    for txid in ["OLD", "NEW"] {
        harness
            .pipeline
            .ingest_push(&json!({"pix": [webhook_item(txid, "1.00")]}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let rows = harness.store.fetch_since(since).await.unwrap();

    let ids: Vec<_> = rows.iter().map(|t| t.transaction_id.as_str()).collect();
    assert_eq!(ids, vec!["NEW", "OLD"]);
}
