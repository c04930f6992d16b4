//! Pub/Sub push ingress and the watch-renewal endpoint.
//!
//! Gmail publishes `{ "emailAddress": ..., "historyId": ... }` base64-encoded
//! inside a Pub/Sub push envelope. The handler decodes it, pulls out the
//! checkpoint, and hands it to the sync engine; the engine's outcome maps to
//! the response body. Malformed envelopes are rejected with 400; a missing
//! or zero history id is acknowledged with 200 so Pub/Sub stops redelivering
//! it.

use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{ApiError, ApiResult};
use crate::gmail::{GmailClient, WatchStarted};
use crate::sync::SyncEngine;

/// Pub/Sub push envelope.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded JSON notification.
    pub data: Option<String>,
}

/// The decoded notification payload. Gmail documents `historyId` as a
/// number but some transports deliver it as a string, so accept both.
#[derive(Debug, Deserialize)]
struct HistoryNotification {
    #[serde(rename = "historyId")]
    history_id: Option<serde_json::Value>,
}

/// Extract the checkpoint from a push envelope.
///
/// Structural problems (no message, no data, undecodable payload) are
/// errors; a payload that simply lacks a usable history id yields 0, which
/// the engine treats as a no-op.
pub fn decode_checkpoint(envelope: &PushEnvelope) -> ApiResult<u64> {
    let data = envelope
        .message
        .as_ref()
        .and_then(|m| m.data.as_ref())
        .ok_or_else(|| ApiError::bad_request("Invalid Pub/Sub message format"))?;

    let decoded = BASE64
        .decode(data)
        .map_err(|_| ApiError::bad_request("Pub/Sub data is not valid base64"))?;

    let notification: HistoryNotification = serde_json::from_slice(&decoded)
        .map_err(|_| ApiError::bad_request("Pub/Sub data is not valid JSON"))?;

    Ok(notification
        .history_id
        .as_ref()
        .map(coerce_checkpoint)
        .unwrap_or(0))
}

fn coerce_checkpoint(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<SyncEngine<GmailClient>>>,
    pub gmail: Arc<GmailClient>,
    pub watch_topic: String,
}

/// `POST /gmail-webhook`
pub async fn gmail_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> ApiResult<String> {
    tracing::debug!("incoming Gmail webhook");

    let checkpoint = decode_checkpoint(&envelope)?;

    // Serializes overlapping deliveries; dispatch is at-most-once only while
    // a single pass runs at a time.
    let mut engine = state.engine.lock().await;
    let outcome = engine.reconcile(checkpoint).await?;

    Ok(outcome.status().to_string())
}

/// `GET /start-watch`
pub async fn start_watch(State(state): State<AppState>) -> ApiResult<Json<WatchStarted>> {
    if state.watch_topic.is_empty() {
        return Err(ApiError::Config(
            "GCP_PROJECT_ID and GMAIL_TOPIC_NAME must be set to start a watch".to_string(),
        ));
    }

    let started = state.gmail.start_watch(&state.watch_topic).await?;

    if let Some(history_id) = started.history_id {
        state.engine.lock().await.set_checkpoint(history_id);
    }

    Ok(Json(started))
}

/// `GET /health`
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}
