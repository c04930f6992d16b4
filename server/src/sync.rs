//! Incremental mailbox synchronization.
//!
//! One [`SyncEngine`] instance exists per mailbox, owned by the app state
//! behind a mutex so overlapping webhook deliveries are serialized. The
//! engine owns the only two pieces of mutable state in the process: the last
//! processed checkpoint and the set of message ids already dispatched.
//!
//! Policy choices, made deliberate rather than accidental:
//!
//! - **Mark-before dispatch**: a message id enters the processed set before
//!   its dispatch runs, giving at-most-once dispatch per engine lifetime
//!   even across overlapping or duplicate history windows.
//! - **Advance-always**: the checkpoint moves to the notification's value
//!   after a pass even when individual dispatches failed, favoring liveness.
//!   Only a failure of the history listing itself aborts the pass without
//!   advancing.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::gmail::{MailMessage, MailboxProvider};

/// Receives each newly observed message exactly once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &MailMessage) -> Result<()>;
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The notification carried no usable checkpoint; nothing was done.
    MissingCheckpoint,
    /// First notification ever seen: newest message inspected, checkpoint
    /// recorded.
    Initialized,
    /// Normal incremental pass.
    Synced { events: usize, dispatched: usize },
}

impl ReconcileOutcome {
    /// Status string returned on the webhook response body.
    pub fn status(&self) -> &'static str {
        match self {
            ReconcileOutcome::MissingCheckpoint => "No historyId",
            ReconcileOutcome::Initialized => "Initialized with first mail",
            ReconcileOutcome::Synced { .. } => "OK",
        }
    }
}

pub struct SyncEngine<P> {
    provider: Arc<P>,
    handler: Arc<dyn MessageHandler>,
    store: Option<CheckpointStore>,
    last_checkpoint: Option<u64>,
    processed: HashSet<String>,
}

impl<P: MailboxProvider> SyncEngine<P> {
    /// A persisted checkpoint, when a store is configured and holds one,
    /// seeds the engine so restarts resume instead of re-bootstrapping.
    pub fn new(
        provider: Arc<P>,
        handler: Arc<dyn MessageHandler>,
        store: Option<CheckpointStore>,
    ) -> Self {
        let last_checkpoint = store.as_ref().and_then(|s| s.load());
        Self {
            provider,
            handler,
            store,
            last_checkpoint,
            processed: HashSet::new(),
        }
    }

    pub fn last_checkpoint(&self) -> Option<u64> {
        self.last_checkpoint
    }

    /// Overwrite the checkpoint, e.g. from a watch response.
    pub fn set_checkpoint(&mut self, checkpoint: u64) {
        self.advance(checkpoint);
    }

    /// Run one reconciliation pass for a notification carrying `checkpoint`.
    pub async fn reconcile(&mut self, checkpoint: u64) -> Result<ReconcileOutcome> {
        if checkpoint == 0 {
            tracing::warn!("notification carried no history id, ignoring");
            return Ok(ReconcileOutcome::MissingCheckpoint);
        }

        let Some(last) = self.last_checkpoint else {
            return self.bootstrap(checkpoint).await;
        };

        tracing::debug!(from = last, to = checkpoint, "fetching mailbox history");
        // A listing failure aborts the pass; the checkpoint stays put and the
        // provider's redelivery retries the whole window.
        let added = self.provider.added_since(last).await?;
        tracing::debug!(events = added.len(), "history events received");

        let mut dispatched = 0;
        for id in &added {
            if !self.processed.insert(id.clone()) {
                tracing::trace!(message_id = %id, "already dispatched, skipping");
                continue;
            }
            match self.provider.fetch_message(id).await {
                Ok(message) => match self.handler.handle(&message).await {
                    Ok(()) => dispatched += 1,
                    Err(e) => {
                        tracing::warn!(message_id = %id, error = %e, "dispatch failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "failed to fetch message");
                }
            }
        }

        self.advance(checkpoint);
        Ok(ReconcileOutcome::Synced {
            events: added.len(),
            dispatched,
        })
    }

    /// Cold start: no prior checkpoint to diff against, so inspect only the
    /// newest inbox message rather than replaying full history.
    async fn bootstrap(&mut self, checkpoint: u64) -> Result<ReconcileOutcome> {
        tracing::info!("no previous checkpoint, inspecting newest inbox message");

        match self.provider.latest_inbox_message().await? {
            Some(message) => {
                self.processed.insert(message.id.clone());
                if let Err(e) = self.handler.handle(&message).await {
                    tracing::warn!(message_id = %message.id, error = %e, "dispatch failed");
                }
            }
            None => tracing::info!("inbox is empty"),
        }

        self.advance(checkpoint);
        Ok(ReconcileOutcome::Initialized)
    }

    fn advance(&mut self, checkpoint: u64) {
        self.last_checkpoint = Some(checkpoint);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(checkpoint) {
                tracing::warn!(error = %e, "failed to persist checkpoint");
            }
        }
        tracing::info!(checkpoint, "checkpoint advanced");
    }
}
