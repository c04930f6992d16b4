//! Page sessions over DevTools targets.
//!
//! [`PageSession`] is the capability surface consumers drive: navigate with a
//! timeout, settle, click a control found by visible-text keywords or a CSS
//! selector, enumerate outbound links, close. [`ChromeSessions`] implements
//! it against a locally running Chrome started with
//! `--remote-debugging-port`, opening one fresh tab per session so no state
//! leaks between visits.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cdp::CdpConnection;
use crate::error::BrowserError;

/// One isolated browser page.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate and wait for the page load event, bounded by `timeout`.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Give dynamic content a fixed amount of time to render.
    async fn settle(&mut self, delay: Duration);

    /// Click the first anchor or button whose visible text contains one of
    /// `keywords` (already lowercased). Returns whether anything was clicked.
    async fn click_by_text(&mut self, keywords: &[&str]) -> Result<bool, BrowserError>;

    /// Click the element matching a CSS selector, if present.
    async fn click_selector(&mut self, selector: &str) -> Result<bool, BrowserError>;

    /// Absolute hrefs of every anchor on the page, document order.
    async fn outbound_links(&mut self) -> Result<Vec<String>, BrowserError>;

    /// Tear the session down. Must be called on every exit path.
    async fn close(self: Box<Self>);
}

/// Opens isolated [`PageSession`]s.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageSession>, BrowserError>;
}

/// Target descriptor returned by the DevTools `/json/new` endpoint.
#[derive(Debug, serde::Deserialize)]
struct TargetInfo {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Session factory backed by a Chrome instance exposing its DevTools HTTP
/// endpoint (e.g. `http://localhost:9222`). Each `open` creates a new tab.
pub struct ChromeSessions {
    devtools_url: String,
    http: reqwest::Client,
}

impl ChromeSessions {
    pub fn new(devtools_url: impl Into<String>) -> Self {
        Self {
            devtools_url: devtools_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessions {
    async fn open(&self) -> Result<Box<dyn PageSession>, BrowserError> {
        let endpoint = format!("{}/json/new?about:blank", self.devtools_url);
        // Newer Chrome only accepts PUT here.
        let target: TargetInfo = self
            .http
            .put(&endpoint)
            .send()
            .await
            .map_err(|e| BrowserError::DevTools {
                url: endpoint.clone(),
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| BrowserError::DevTools {
                url: endpoint,
                reason: e.to_string(),
            })?;

        let conn = CdpConnection::connect(&target.web_socket_debugger_url).await?;
        conn.enable("Page").await?;
        conn.enable("Runtime").await?;

        Ok(Box::new(ChromePage {
            conn,
            target_id: target.id,
            devtools_url: self.devtools_url.clone(),
            http: self.http.clone(),
        }))
    }
}

/// A single Chrome tab driven over CDP.
pub struct ChromePage {
    conn: CdpConnection,
    target_id: String,
    devtools_url: String,
    http: reqwest::Client,
}

impl ChromePage {
    /// Evaluate a JavaScript expression in page context, surfacing thrown
    /// exceptions as [`BrowserError::JsException`].
    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let result = self
            .conn
            .call(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("unknown exception")
                .to_string();
            return Err(BrowserError::JsException { message });
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PageSession for ChromePage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        let result = self
            .conn
            .call("Page.navigate", serde_json::json!({ "url": url }))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            return Err(BrowserError::NavigationFailed {
                reason: error_text.to_string(),
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BrowserError::PageLoadTimeout { duration: timeout });
            }
            match tokio::time::timeout(remaining, self.conn.next_event()).await {
                Ok(Some(event)) if event.method == "Page.loadEventFired" => return Ok(()),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(BrowserError::Protocol {
                        detail: "connection closed while waiting for page load".to_string(),
                    })
                }
                Err(_) => return Err(BrowserError::PageLoadTimeout { duration: timeout }),
            }
        }
    }

    async fn settle(&mut self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    async fn click_by_text(&mut self, keywords: &[&str]) -> Result<bool, BrowserError> {
        let clicked = self
            .evaluate(&click_by_text_script(keywords))
            .await?
            .as_bool()
            .unwrap_or(false);
        Ok(clicked)
    }

    async fn click_selector(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let clicked = self
            .evaluate(&click_selector_script(selector))
            .await?
            .as_bool()
            .unwrap_or(false);
        Ok(clicked)
    }

    async fn outbound_links(&mut self) -> Result<Vec<String>, BrowserError> {
        let value = self
            .evaluate("Array.from(document.querySelectorAll('a[href]')).map((a) => a.href)")
            .await?;
        let links = value
            .as_array()
            .map(|hrefs| {
                hrefs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(links)
    }

    async fn close(self: Box<Self>) {
        let endpoint = format!("{}/json/close/{}", self.devtools_url, self.target_id);
        if let Err(e) = self.http.get(&endpoint).send().await {
            tracing::warn!(target = %self.target_id, error = %e, "failed to close browser tab");
        }
        // Dropping self tears down the WebSocket reader.
    }
}

fn click_by_text_script(keywords: &[&str]) -> String {
    // serde_json produces a valid JS array literal with escaped strings.
    let keywords = serde_json::json!(keywords).to_string();
    format!(
        r#"(() => {{
            const keywords = {keywords};
            for (const el of document.querySelectorAll('a, button')) {{
                const text = (el.innerText || el.textContent || '').toLowerCase();
                if (keywords.some((k) => text.includes(k))) {{ el.click(); return true; }}
            }}
            return false;
        }})()"#
    )
}

fn click_selector_script(selector: &str) -> String {
    let selector = serde_json::json!(selector).to_string();
    format!(
        r#"(() => {{
            const el = document.querySelector({selector});
            if (!el) return false;
            el.click();
            return true;
        }})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_script_embeds_keywords_as_json() {
        let script = click_by_text_script(&["yes", "this was me"]);
        assert!(script.contains(r#"["yes","this was me"]"#));
    }

    #[test]
    fn click_script_escapes_quotes() {
        let script = click_by_text_script(&[r#"say "yes""#]);
        assert!(script.contains(r#"say \"yes\""#));
    }

    #[test]
    fn selector_script_quotes_selector() {
        let script = click_selector_script("button[data-uia='confirm']");
        assert!(script.contains(r#""button[data-uia='confirm']""#));
    }

    #[test]
    fn target_info_deserializes_devtools_response() {
        let json = r#"{
            "id": "AB12",
            "type": "page",
            "url": "about:blank",
            "webSocketDebuggerUrl": "ws://localhost:9222/devtools/page/AB12"
        }"#;
        let target: TargetInfo = serde_json::from_str(json).unwrap();
        assert_eq!(target.id, "AB12");
        assert!(target.web_socket_debugger_url.ends_with("/AB12"));
    }
}
