//! Chrome DevTools Protocol connection.
//!
//! Speaks the CDP JSON-RPC dialect over a WebSocket: commands go out with
//! auto-incrementing ids, responses are correlated back to the waiting
//! caller, and unsolicited messages (page events) are forwarded to an event
//! channel the session layer drains while waiting for loads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::BrowserError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// An unsolicited CDP event, e.g. `Page.loadEventFired`.
#[derive(Debug, Clone)]
pub struct PageEvent {
    pub method: String,
    pub params: Value,
}

/// Error object carried inside a CDP command response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CdpErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug)]
struct CommandReply {
    result: Option<Value>,
    error: Option<CdpErrorBody>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandReply>>>>;

/// A live CDP connection to one page target.
///
/// Commands may be issued from `&self`; event consumption needs `&mut self`
/// since the event stream has a single consumer.
pub struct CdpConnection {
    next_id: AtomicU64,
    pending: PendingMap,
    sink: Arc<Mutex<WsSink>>,
    events: mpsc::UnboundedReceiver<PageEvent>,
    reader: tokio::task::JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a page target WebSocket
    /// (`ws://host:port/devtools/page/{target}`).
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
            BrowserError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            }
        })?;
        tracing::debug!(url = ws_url, "CDP connection established");

        let (sink, source) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::unbounded_channel();

        let reader = tokio::spawn(Self::pump(source, Arc::clone(&pending), event_tx));

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            sink: Arc::new(Mutex::new(sink)),
            events,
            reader,
        })
    }

    /// Issue a command and wait for its response with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.call_with_timeout(method, params, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Issue a command and wait for its response.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::json!({ "id": id, "method": method, "params": params });

        // Register the waiter before sending so a fast reply cannot race us.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        tracing::trace!(id, method, "sending CDP command");
        {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(frame.to_string().into()))
                .await
                .map_err(|e| BrowserError::Protocol {
                    detail: format!("WebSocket send failed: {e}"),
                })?;
        }

        let reply = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| BrowserError::CommandTimeout {
                method: method.to_string(),
                duration: timeout,
            })?
            .map_err(|_| BrowserError::Protocol {
                detail: "reply channel closed before a response arrived".to_string(),
            })?;

        if let Some(err) = reply.error {
            return Err(BrowserError::Cdp {
                code: err.code,
                message: err.message,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// Wait for the next page event. `None` means the connection dropped.
    pub async fn next_event(&mut self) -> Option<PageEvent> {
        self.events.recv().await
    }

    /// Enable a CDP domain so it starts emitting events.
    pub async fn enable(&self, domain: &str) -> Result<(), BrowserError> {
        self.call(&format!("{domain}.enable"), serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn pump(
        mut source: WsSource,
        pending: PendingMap,
        event_tx: mpsc::UnboundedSender<PageEvent>,
    ) {
        while let Some(incoming) = source.next().await {
            let text = match incoming {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket read failed, closing CDP connection");
                    break;
                }
            };

            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unparseable CDP frame");
                    continue;
                }
            };

            if let Some(id) = reply_id(&frame) {
                let reply = CommandReply {
                    result: frame.get("result").cloned(),
                    error: frame
                        .get("error")
                        .and_then(|e| serde_json::from_value(e.clone()).ok()),
                };
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(reply);
                } else {
                    tracing::trace!(id, "reply for unknown command id");
                }
            } else if let Some(event) = parse_event(&frame) {
                // Dropped if nobody is listening.
                let _ = event_tx.send(event);
            }
        }

        // Fail anything still waiting so callers do not hang.
        for (_, tx) in pending.lock().await.drain() {
            let _ = tx.send(CommandReply {
                result: None,
                error: Some(CdpErrorBody {
                    code: -1,
                    message: "connection closed".to_string(),
                }),
            });
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The command id of a response frame, if this frame is one.
fn reply_id(frame: &Value) -> Option<u64> {
    frame.get("id").and_then(Value::as_u64)
}

/// Interpret a frame as an event. Frames carrying an `id` are responses.
fn parse_event(frame: &Value) -> Option<PageEvent> {
    if frame.get("id").is_some() {
        return None;
    }
    Some(PageEvent {
        method: frame.get("method")?.as_str()?.to_string(),
        params: frame.get("params").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_id_of_response_frame() {
        let frame = serde_json::json!({ "id": 7, "result": { "frameId": "f" } });
        assert_eq!(reply_id(&frame), Some(7));
    }

    #[test]
    fn reply_id_ignores_events() {
        let frame = serde_json::json!({ "method": "Page.loadEventFired", "params": {} });
        assert_eq!(reply_id(&frame), None);
    }

    #[test]
    fn parse_event_extracts_method_and_params() {
        let frame = serde_json::json!({
            "method": "Page.loadEventFired",
            "params": { "timestamp": 1.5 }
        });
        let event = parse_event(&frame).unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
        assert_eq!(event.params["timestamp"], 1.5);
    }

    #[test]
    fn parse_event_defaults_missing_params_to_null() {
        let frame = serde_json::json!({ "method": "Page.domContentEventFired" });
        let event = parse_event(&frame).unwrap();
        assert_eq!(event.params, Value::Null);
    }

    #[test]
    fn parse_event_rejects_responses() {
        let frame = serde_json::json!({ "id": 3, "method": "Page.navigate", "result": {} });
        assert!(parse_event(&frame).is_none());
    }

    #[test]
    fn cdp_error_body_deserializes() {
        let err: CdpErrorBody =
            serde_json::from_str(r#"{"code": -32601, "message": "Method not found"}"#).unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }
}
