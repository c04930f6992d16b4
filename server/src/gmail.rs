//! Gmail API client and the provider traits the sync engine consumes.
//!
//! The client authenticates with a stored OAuth refresh token via the
//! authorized-user flow and exposes exactly the read surface the engine
//! needs (newest inbox message, added-message history, full message fetch),
//! plus sending for the forward action and `users.watch` for the push
//! subscription.

use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::api::{Message, MessagePart, WatchRequest};
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::Gmail;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;

/// Read-only mailbox operations the sync engine depends on.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// The single most recent inbox message, if the inbox is non-empty.
    async fn latest_inbox_message(&self) -> Result<Option<MailMessage>>;

    /// Ids of messages added after `checkpoint`, in provider order.
    async fn added_since(&self, checkpoint: u64) -> Result<Vec<String>>;

    /// Full message by id.
    async fn fetch_message(&self, id: &str) -> Result<MailMessage>;
}

/// Outbound mail, used by the forward dispatch action.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn forward(&self, message: &MailMessage, recipients: &[String]) -> Result<()>;
}

/// A mail message reduced to what classification and dispatch need.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub parts: Vec<MailPart>,
}

/// One node of the MIME part tree, payload already base64-decoded.
#[derive(Debug, Clone, Default)]
pub struct MailPart {
    pub mime_type: String,
    pub data: Option<String>,
    pub parts: Vec<MailPart>,
}

impl MailMessage {
    /// First HTML body in the part tree, breadth-first: a direct `text/html`
    /// part wins over one nested inside `multipart/alternative`.
    pub fn html_body(&self) -> Option<&str> {
        let mut queue: std::collections::VecDeque<&MailPart> = self.parts.iter().collect();
        while let Some(part) = queue.pop_front() {
            if part.mime_type == "text/html" {
                if let Some(data) = &part.data {
                    return Some(data);
                }
            }
            if part.mime_type.starts_with("multipart/") {
                queue.extend(part.parts.iter());
            }
        }
        None
    }
}

/// Outcome of `users.watch`, echoed back to the caller and persisted.
#[derive(Debug, Clone, Serialize)]
pub struct WatchStarted {
    #[serde(rename = "historyId")]
    pub history_id: Option<u64>,
    pub expiration: Option<i64>,
}

/// Client for the Gmail API, bound to the account owning the refresh token.
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    /// Build a client from `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET` and
    /// `GOOGLE_REFRESH_TOKEN`.
    pub async fn from_env() -> Result<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID")
            .context("GOOGLE_CLIENT_ID environment variable must be set")?;
        let client_secret = std::env::var("GOOGLE_CLIENT_SECRET")
            .context("GOOGLE_CLIENT_SECRET environment variable must be set")?;
        let refresh_token = std::env::var("GOOGLE_REFRESH_TOKEN")
            .context("GOOGLE_REFRESH_TOKEN environment variable must be set")?;

        // Use the yup_oauth2 re-exported by google_gmail1 to avoid version
        // mismatch.
        let secret = google_gmail1::yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id,
            client_secret,
            refresh_token,
            key_type: "authorized_user".to_string(),
        };
        let auth = google_gmail1::yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .context("Failed to build authenticator from refresh token")?;

        let connector = google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            hub: Gmail::new(client, auth),
        })
    }

    /// Start (or renew) the push-notification subscription on the inbox.
    pub async fn start_watch(&self, topic: &str) -> Result<WatchStarted> {
        let request = WatchRequest {
            topic_name: Some(topic.to_string()),
            label_ids: Some(vec!["INBOX".to_string()]),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .users()
            .watch(request, "me")
            .doit()
            .await
            .context("Failed to start Gmail watch")?;

        tracing::info!(
            history_id = ?response.history_id,
            expiration = ?response.expiration,
            "Gmail watch started"
        );

        Ok(WatchStarted {
            history_id: response.history_id,
            expiration: response.expiration,
        })
    }

    fn parse_message(message: Message) -> MailMessage {
        let id = message.id.unwrap_or_default();
        let snippet = message.snippet.unwrap_or_default();

        let mut from = String::new();
        let mut subject = String::new();
        let mut date = String::new();
        let mut parts = Vec::new();

        if let Some(payload) = &message.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref() {
                        Some("From") => from = header.value.clone().unwrap_or_default(),
                        Some("Subject") => subject = header.value.clone().unwrap_or_default(),
                        Some("Date") => date = header.value.clone().unwrap_or_default(),
                        _ => {}
                    }
                }
            }

            // A single-part message has its body on the payload itself.
            parts = match &payload.parts {
                Some(children) if !children.is_empty() => {
                    children.iter().map(Self::parse_part).collect()
                }
                _ => vec![Self::parse_part(payload)],
            };
        }

        MailMessage {
            id,
            from,
            subject,
            date,
            snippet,
            parts,
        }
    }

    fn parse_part(part: &MessagePart) -> MailPart {
        MailPart {
            mime_type: part.mime_type.clone().unwrap_or_default(),
            data: part
                .body
                .as_ref()
                .and_then(|body| body.data.as_ref())
                .and_then(|data| String::from_utf8(data.clone()).ok()),
            parts: part
                .parts
                .as_ref()
                .map(|children| children.iter().map(Self::parse_part).collect())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl MailboxProvider for GmailClient {
    async fn latest_inbox_message(&self) -> Result<Option<MailMessage>> {
        let (_, listing) = self
            .hub
            .users()
            .messages_list("me")
            .add_label_ids("INBOX")
            .max_results(1)
            .doit()
            .await
            .context("Failed to list inbox messages")?;

        let Some(id) = listing
            .messages
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|m| m.id)
        else {
            return Ok(None);
        };

        Ok(Some(self.fetch_message(&id).await?))
    }

    async fn added_since(&self, checkpoint: u64) -> Result<Vec<String>> {
        let (_, response) = self
            .hub
            .users()
            .history_list("me")
            .start_history_id(checkpoint)
            .label_id("INBOX")
            .add_history_types("messageAdded")
            .doit()
            .await
            .context("Failed to list history")?;

        let mut ids = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for event in response.history.unwrap_or_default() {
            for added in event.messages_added.unwrap_or_default() {
                if let Some(id) = added.message.and_then(|m| m.id) {
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
            }
        }

        Ok(ids)
    }

    async fn fetch_message(&self, id: &str) -> Result<MailMessage> {
        let (_, message) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .with_context(|| format!("Failed to get message {id}"))?;

        Ok(Self::parse_message(message))
    }
}

#[async_trait]
impl Mailer for GmailClient {
    async fn forward(&self, message: &MailMessage, recipients: &[String]) -> Result<()> {
        let raw = build_forward_rfc822(message, recipients);

        // "message/rfc822" is a fixed valid MIME type.
        self.hub
            .users()
            .messages_send(Message::default(), "me")
            .upload(Cursor::new(raw), "message/rfc822".parse().unwrap())
            .await
            .context("Failed to send forwarded message")?;

        tracing::info!(
            message_id = %message.id,
            recipients = recipients.len(),
            "forwarded verification email"
        );
        Ok(())
    }
}

fn build_forward_rfc822(message: &MailMessage, recipients: &[String]) -> Vec<u8> {
    let body = message.html_body().unwrap_or(message.snippet.as_str());
    let lines = [
        "From: me".to_string(),
        format!("To: {}", recipients.join(", ")),
        format!("Subject: Fwd: {}", message.subject),
        r#"Content-Type: text/html; charset="UTF-8""#.to_string(),
        String::new(),
        format!(
            "<p><b>Forwarded message from:</b> {}</p><hr/>{}",
            message.from, body
        ),
    ];
    lines.join("\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html_part(data: &str) -> MailPart {
        MailPart {
            mime_type: "text/html".to_string(),
            data: Some(data.to_string()),
            parts: Vec::new(),
        }
    }

    fn message_with_parts(parts: Vec<MailPart>) -> MailMessage {
        MailMessage {
            id: "m1".to_string(),
            from: "Netflix <info@account.netflix.com>".to_string(),
            subject: "New sign-in".to_string(),
            date: "Mon, 4 Aug 2025 10:00:00 +0000".to_string(),
            snippet: "snippet".to_string(),
            parts,
        }
    }

    #[test]
    fn html_body_finds_direct_part() {
        let message = message_with_parts(vec![
            MailPart {
                mime_type: "text/plain".to_string(),
                data: Some("plain".to_string()),
                parts: Vec::new(),
            },
            html_part("<p>hi</p>"),
        ]);
        assert_eq!(message.html_body(), Some("<p>hi</p>"));
    }

    #[test]
    fn html_body_descends_into_multipart_alternative() {
        let message = message_with_parts(vec![MailPart {
            mime_type: "multipart/alternative".to_string(),
            data: None,
            parts: vec![
                MailPart {
                    mime_type: "text/plain".to_string(),
                    data: Some("plain".to_string()),
                    parts: Vec::new(),
                },
                html_part("<p>nested</p>"),
            ],
        }]);
        assert_eq!(message.html_body(), Some("<p>nested</p>"));
    }

    #[test]
    fn html_body_prefers_shallower_part() {
        let message = message_with_parts(vec![
            MailPart {
                mime_type: "multipart/alternative".to_string(),
                data: None,
                parts: vec![html_part("<p>deep</p>")],
            },
            html_part("<p>shallow</p>"),
        ]);
        assert_eq!(message.html_body(), Some("<p>shallow</p>"));
    }

    #[test]
    fn html_body_none_when_absent() {
        let message = message_with_parts(vec![MailPart {
            mime_type: "text/plain".to_string(),
            data: Some("plain".to_string()),
            parts: Vec::new(),
        }]);
        assert_eq!(message.html_body(), None);
    }

    #[test]
    fn forward_message_carries_original_sender_and_subject() {
        let message = message_with_parts(vec![html_part("<p>verify</p>")]);
        let raw = build_forward_rfc822(
            &message,
            &["a@example.org".to_string(), "b@example.org".to_string()],
        );
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("To: a@example.org, b@example.org"));
        assert!(text.contains("Subject: Fwd: New sign-in"));
        assert!(text.contains("Forwarded message from:"));
        assert!(text.contains("<p>verify</p>"));
    }

    #[test]
    fn forward_message_falls_back_to_snippet() {
        let message = message_with_parts(Vec::new());
        let raw = build_forward_rfc822(&message, &["a@example.org".to_string()]);
        assert!(String::from_utf8(raw).unwrap().contains("snippet"));
    }
}
