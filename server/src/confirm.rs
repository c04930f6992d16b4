//! Bounded click-through of verification pages.
//!
//! Each visited URL gets its own isolated browser session: load, settle,
//! click a primary confirmation control by visible text, settle, click a
//! secondary one, then (below the depth ceiling) collect same-domain
//! outbound links minus logout links and recurse into at most the first two
//! at the next depth. Sessions are closed on every exit path; everything is
//! best-effort and failures are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browser::{PageSession, SessionFactory};
use futures::future::BoxFuture;
use futures::FutureExt;

/// Visible-text keywords for the first confirmation control on a page.
const PRIMARY_KEYWORDS: &[&str] = &["yes", "this was me", "continue"];

/// Keywords for the follow-up control, most specific first.
const SECONDARY_KEYWORDS: &[&str] = &["confirm update", "confirm", "continue"];

/// How many outbound links to recurse into per page.
const BRANCH_LIMIT: usize = 2;

/// Drives the confirmation flow for one actionable link.
#[async_trait]
pub trait LinkConfirmer: Send + Sync {
    async fn confirm(&self, url: &str);
}

#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Domain outbound links must contain to be followed.
    pub domain: String,
    /// Depth ceiling; depth 1 is the email link itself.
    pub max_depth: u32,
    pub nav_timeout: Duration,
    /// Settle time after page load, before the first click.
    pub settle_delay: Duration,
    /// Settle time after each click.
    pub post_click_delay: Duration,
    /// Known CSS selector for the secondary control, tried when no keyword
    /// matches.
    pub secondary_selector: Option<String>,
}

pub struct ConfirmRunner {
    sessions: Arc<dyn SessionFactory>,
    config: TraversalConfig,
}

impl ConfirmRunner {
    pub fn new(sessions: Arc<dyn SessionFactory>, config: TraversalConfig) -> Self {
        Self { sessions, config }
    }

    fn visit<'a>(&'a self, url: String, depth: u32) -> BoxFuture<'a, ()> {
        async move {
            tracing::info!(depth, url = %url, "navigating");

            let mut session = match self.sessions.open().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open browser session");
                    return;
                }
            };

            let next = self.visit_page(session.as_mut(), &url, depth).await;
            session.close().await;

            for link in next {
                self.visit(link, depth + 1).await;
            }
        }
        .boxed()
    }

    /// Work through one page; returns the links to recurse into. Never
    /// fails: any error ends this branch with no follow-up links.
    async fn visit_page(
        &self,
        session: &mut dyn PageSession,
        url: &str,
        depth: u32,
    ) -> Vec<String> {
        if let Err(e) = session.navigate(url, self.config.nav_timeout).await {
            tracing::warn!(url = %url, error = %e, "navigation failed");
            return Vec::new();
        }
        session.settle(self.config.settle_delay).await;

        match session.click_by_text(PRIMARY_KEYWORDS).await {
            Ok(true) => {
                tracing::debug!("clicked primary confirmation control");
                session.settle(self.config.post_click_delay).await;
            }
            Ok(false) => tracing::debug!("no primary confirmation control found"),
            Err(e) => tracing::warn!(error = %e, "primary click failed"),
        }

        let secondary = match session.click_by_text(SECONDARY_KEYWORDS).await {
            Ok(clicked) => clicked,
            Err(e) => {
                tracing::warn!(error = %e, "secondary click failed");
                false
            }
        };
        if !secondary {
            if let Some(selector) = &self.config.secondary_selector {
                match session.click_selector(selector).await {
                    Ok(true) => {
                        tracing::debug!(selector = %selector, "clicked secondary control");
                        session.settle(self.config.post_click_delay).await;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "selector click failed"),
                }
            }
        } else {
            session.settle(self.config.post_click_delay).await;
        }

        if depth >= self.config.max_depth {
            return Vec::new();
        }

        let links = match session.outbound_links().await {
            Ok(links) => links,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate outbound links");
                return Vec::new();
            }
        };

        links
            .into_iter()
            .filter(|href| href.contains(&self.config.domain) && !href.contains("logout"))
            .take(BRANCH_LIMIT)
            .collect()
    }
}

#[async_trait]
impl LinkConfirmer for ConfirmRunner {
    async fn confirm(&self, url: &str) {
        self.visit(url.to_string(), 1).await;
    }
}
