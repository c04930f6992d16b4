use std::time::Duration;

use thiserror::Error;

/// Errors produced by the DevTools client and page sessions.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The DevTools HTTP endpoint could not be reached or returned garbage.
    #[error("DevTools endpoint {url} unavailable: {reason}")]
    DevTools { url: String, reason: String },

    /// The WebSocket connection to a page target failed.
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The browser reported a navigation-level error (DNS, TLS, blocked).
    #[error("navigation failed: {reason}")]
    NavigationFailed { reason: String },

    /// The page did not finish loading within the allotted time.
    #[error("page load timed out after {duration:?}")]
    PageLoadTimeout { duration: Duration },

    /// A CDP command did not receive a response in time.
    #[error("{method} timed out after {duration:?}")]
    CommandTimeout { method: String, duration: Duration },

    /// The browser returned a CDP-level error for a command.
    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    /// A JavaScript expression evaluated in the page threw.
    #[error("javascript exception: {message}")]
    JsException { message: String },

    /// The wire protocol was violated or the connection dropped mid-command.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },
}
