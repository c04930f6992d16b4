//! Chrome DevTools Protocol automation for confirmation click-throughs.
//!
//! Two layers:
//!
//! - [`cdp`]: low-level WebSocket client with JSON-RPC command/response
//!   correlation and an event stream.
//! - [`session`]: the [`session::PageSession`] capability surface (navigate,
//!   settle, click by visible text or selector, enumerate links, close) and
//!   its Chrome-backed implementation, one isolated tab per session.
//!
//! Chrome must be running with `--remote-debugging-port`:
//!
//! ```sh
//! chromium --headless --remote-debugging-port=9222
//! ```

pub mod cdp;
pub mod error;
pub mod session;

pub use error::BrowserError;
pub use session::{ChromeSessions, PageSession, SessionFactory};
