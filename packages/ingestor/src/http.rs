//! HTTP Surface
//!
//! axum router exposing the push protocol (webhook), a manual poll trigger,
//! single-transaction reconciliation, the dashboard read API, the websocket
//! subscription and a health check.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::fanout::FanOut;
use crate::pipeline::{IngestionPipeline, PollError, PushError};
use crate::transaction::parse_timestamp;
use crate::upstream::UpstreamQueryError;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<IngestionPipeline>,
    webhook_secret: Option<Arc<str>>,
}

impl AppState {
    /// # Arguments
    /// * `pipeline` - The ingestion pipeline all routes drive
    /// * `webhook_secret` - Shared secret for the webhook bearer check; `None` disables it
    pub fn new(pipeline: Arc<IngestionPipeline>, webhook_secret: Option<String>) -> Self {
        Self {
            pipeline,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }

    fn fanout(&self) -> &Arc<FanOut> {
        self.pipeline.fanout()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/poll", post(poll))
        .route("/pix/:e2eid/reconcile", post(reconcile))
        .route("/transactions", get(transactions))
        .route("/ws", get(subscribe))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"success": false, "error": message.into()}))).into_response()
}

fn is_authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(secret.as_bytes())))
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_authorized(&headers, state.webhook_secret.as_deref()) {
        warn!("Webhook rejected: bearer token mismatch");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Webhook rejected: body is not JSON: {}", e);
            return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}"));
        }
    };

    let report = match state.pipeline.ingest_push(&payload).await {
        Ok(report) => report,
        Err(PushError::EmptyBatch) => {
            return (
                StatusCode::OK,
                Json(json!({"success": false, "message": PushError::EmptyBatch.to_string()})),
            )
                .into_response();
        }
        Err(e @ PushError::MissingPixArray) => {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    if report.all_failed() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "failed to store pix",
                "results": report.results,
            })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "duplicated": report.all_duplicates(),
            "data": report.stored(),
            "results": report.results,
        })),
    )
        .into_response()
}

async fn poll(State(state): State<AppState>) -> Response {
    match state.pipeline.run_poll_cycle().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => error_response(poll_error_status(&e), e.to_string()),
    }
}

async fn reconcile(State(state): State<AppState>, Path(e2eid): Path<String>) -> Response {
    match state.pipeline.reconcile(&e2eid).await {
        Ok(report) => (StatusCode::OK, Json(json!({"success": true, "result": report}))).into_response(),
        Err(e) => error_response(poll_error_status(&e), e.to_string()),
    }
}

fn poll_error_status(error: &PollError) -> StatusCode {
    match error {
        PollError::AlreadyRunning => StatusCode::CONFLICT,
        PollError::Credential(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PollError::Query(UpstreamQueryError::InvalidIdentifier(_)) => StatusCode::BAD_REQUEST,
        PollError::Query(e) if e.is_not_found() => StatusCode::NOT_FOUND,
        PollError::Query(_) | PollError::AuthorizationDenied => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    since: Option<String>,
}

fn start_of_today() -> DateTime<Utc> {
    Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
}

async fn transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let since = match query.since.as_deref() {
        None => start_of_today(),
        Some(text) => match parse_timestamp(text) {
            Some(since) => since,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("`since` is not an RFC3339 timestamp: {text}"),
                )
            }
        },
    };

    match state.pipeline.store().fetch_since(since).await {
        Ok(transactions) => (
            StatusCode::OK,
            Json(json!({"since": since, "transactions": transactions})),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "subscribers": state.fanout().subscriber_count()}))
}

async fn subscribe(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let fanout = Arc::clone(state.fanout());
    ws.on_upgrade(move |socket| stream_to_subscriber(socket, fanout))
}

async fn stream_to_subscriber(socket: WebSocket, fanout: Arc<FanOut>) {
    let (id, mut messages) = fanout.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outgoing = messages.recv() => match outgoing {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload)).await {
                        debug!("Write to subscriber {} failed: {}", id, e);
                        break;
                    }
                }
                // Evicted by the fan-out
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Subscriber {} socket error: {}", id, e);
                    break;
                }
            },
        }
    }

    fanout.unsubscribe(id);
}
