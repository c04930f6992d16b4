//! Classification and dispatch of newly observed messages.
//!
//! A message is dispatched when its From header matches the configured
//! sender pattern and its HTML body carries at least one actionable
//! verification link. The configured action then either drives the browser
//! click-through for every actionable link or forwards the original email
//! to a fixed recipient list.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::confirm::LinkConfirmer;
use crate::extract::{extract_code, extract_links, ExtractedLink};
use crate::gmail::{MailMessage, Mailer};
use crate::sync::MessageHandler;

/// Link labels that mark a verification control.
const CONFIRM_LABELS: &[&str] = &["yes", "confirm", "continue"];

/// What to do with a matching message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// Drive the browser through the verification links.
    AutoConfirm,
    /// Forward the raw email to the configured recipients.
    Forward,
}

impl FromStr for DispatchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto-confirm" => Ok(DispatchAction::AutoConfirm),
            "forward" => Ok(DispatchAction::Forward),
            other => Err(format!("unknown dispatch action '{other}'")),
        }
    }
}

/// How messages and links are recognized.
#[derive(Debug, Clone)]
pub struct ClassifyRules {
    /// Case-insensitive substring the From header must contain.
    pub sender_pattern: String,
    /// Domain an actionable link's href must contain.
    pub verification_domain: String,
    /// Href path fragment that marks a verification link regardless of its
    /// label.
    pub verification_path_marker: String,
}

/// What a dispatch attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    SenderMismatch,
    NoHtmlBody,
    NoActionableLinks,
    Confirmed { links: usize },
    Forwarded { recipients: usize },
}

/// Stateless per message; every invocation classifies from scratch.
pub struct Dispatcher {
    rules: ClassifyRules,
    action: DispatchAction,
    recipients: Vec<String>,
    mailer: Arc<dyn Mailer>,
    confirmer: Arc<dyn LinkConfirmer>,
}

impl Dispatcher {
    pub fn new(
        rules: ClassifyRules,
        action: DispatchAction,
        recipients: Vec<String>,
        mailer: Arc<dyn Mailer>,
        confirmer: Arc<dyn LinkConfirmer>,
    ) -> Self {
        Self {
            rules,
            action,
            recipients,
            mailer,
            confirmer,
        }
    }

    pub async fn classify_and_dispatch(&self, message: &MailMessage) -> Result<DispatchOutcome> {
        if !message
            .from
            .to_lowercase()
            .contains(&self.rules.sender_pattern.to_lowercase())
        {
            tracing::debug!(from = %message.from, "sender does not match, ignoring");
            return Ok(DispatchOutcome::SenderMismatch);
        }

        tracing::info!(
            from = %message.from,
            subject = %message.subject,
            "verification mail detected"
        );

        let Some(html) = message.html_body() else {
            tracing::warn!(message_id = %message.id, "no HTML body found");
            return Ok(DispatchOutcome::NoHtmlBody);
        };

        // Informational only; the click-through does not need the code.
        match extract_code(html) {
            Some(code) => tracing::info!(code = %code, "sign-in code detected"),
            None => tracing::debug!("no sign-in code found"),
        }

        let links = extract_links(html);
        tracing::debug!(links = links.len(), "links found in email body");

        let actionable: Vec<ExtractedLink> = links
            .into_iter()
            .filter(|link| self.is_actionable(link))
            .collect();
        if actionable.is_empty() {
            tracing::info!(message_id = %message.id, "no verification links found");
            return Ok(DispatchOutcome::NoActionableLinks);
        }

        match self.action {
            DispatchAction::AutoConfirm => {
                for link in &actionable {
                    tracing::info!(href = %link.href, "clicking verification link");
                    self.confirmer.confirm(&link.href).await;
                }
                Ok(DispatchOutcome::Confirmed {
                    links: actionable.len(),
                })
            }
            DispatchAction::Forward => {
                self.mailer.forward(message, &self.recipients).await?;
                Ok(DispatchOutcome::Forwarded {
                    recipients: self.recipients.len(),
                })
            }
        }
    }

    fn is_actionable(&self, link: &ExtractedLink) -> bool {
        if !link.href.contains(&self.rules.verification_domain) {
            return false;
        }
        let label = link.text.to_lowercase();
        CONFIRM_LABELS.iter().any(|keyword| label.contains(keyword))
            || link.href.contains(&self.rules.verification_path_marker)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: &MailMessage) -> Result<()> {
        let outcome = self.classify_and_dispatch(message).await?;
        tracing::debug!(message_id = %message.id, ?outcome, "dispatch finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::MailPart;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingMailer {
        sent: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Mailer for CountingMailer {
        async fn forward(&self, _message: &MailMessage, recipients: &[String]) -> Result<()> {
            self.sent.lock().unwrap().push(recipients.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConfirmer {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LinkConfirmer for CountingConfirmer {
        async fn confirm(&self, url: &str) {
            self.urls.lock().unwrap().push(url.to_string());
        }
    }

    fn rules() -> ClassifyRules {
        ClassifyRules {
            sender_pattern: "netflix.com".to_string(),
            verification_domain: "netflix.com".to_string(),
            verification_path_marker: "update-primary-location".to_string(),
        }
    }

    fn html_message(from: &str, html: &str) -> MailMessage {
        MailMessage {
            id: "m1".to_string(),
            from: from.to_string(),
            subject: "Important".to_string(),
            date: String::new(),
            snippet: String::new(),
            parts: vec![MailPart {
                mime_type: "text/html".to_string(),
                data: Some(html.to_string()),
                parts: Vec::new(),
            }],
        }
    }

    fn dispatcher(
        action: DispatchAction,
    ) -> (Dispatcher, Arc<CountingMailer>, Arc<CountingConfirmer>) {
        let mailer = Arc::new(CountingMailer::default());
        let confirmer = Arc::new(CountingConfirmer::default());
        let dispatcher = Dispatcher::new(
            rules(),
            action,
            vec!["a@example.org".to_string()],
            mailer.clone(),
            confirmer.clone(),
        );
        (dispatcher, mailer, confirmer)
    }

    const VERIFY_HTML: &str = r#"
        <p>Was this you?</p>
        <a href="https://www.netflix.com/account/verify?nftoken=x">Yes, this was me</a>
    "#;

    #[tokio::test]
    async fn unmatched_sender_has_no_side_effects() {
        let (dispatcher, mailer, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let message = html_message("no-reply@example.org", VERIFY_HTML);

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::SenderMismatch);
        assert!(confirmer.urls.lock().unwrap().is_empty());
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sender_match_is_case_insensitive() {
        let (dispatcher, _, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let message = html_message("Netflix <info@account.NETFLIX.com>", VERIFY_HTML);

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Confirmed { links: 1 });
        assert_eq!(confirmer.urls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_without_html_body_is_skipped() {
        let (dispatcher, _, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let mut message = html_message("info@account.netflix.com", "");
        message.parts = vec![MailPart {
            mime_type: "text/plain".to_string(),
            data: Some("plain only".to_string()),
            parts: Vec::new(),
        }];

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::NoHtmlBody);
        assert!(confirmer.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn off_domain_links_are_not_actionable() {
        let (dispatcher, _, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let message = html_message(
            "info@account.netflix.com",
            r#"<a href="https://phishy.example.com/confirm">Yes</a>"#,
        );

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::NoActionableLinks);
        assert!(confirmer.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_marker_makes_link_actionable_without_label() {
        let (dispatcher, _, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let message = html_message(
            "info@account.netflix.com",
            r#"<a href="https://www.netflix.com/update-primary-location?t=1">Household</a>"#,
        );

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Confirmed { links: 1 });
        assert_eq!(
            *confirmer.urls.lock().unwrap(),
            vec!["https://www.netflix.com/update-primary-location?t=1"]
        );
    }

    #[tokio::test]
    async fn every_actionable_link_is_confirmed_in_order() {
        let (dispatcher, _, confirmer) = dispatcher(DispatchAction::AutoConfirm);
        let message = html_message(
            "info@account.netflix.com",
            r#"
                <a href="https://www.netflix.com/verify/1">Yes, this was me</a>
                <a href="https://www.netflix.com/unsubscribe">Unsubscribe</a>
                <a href="https://www.netflix.com/verify/2">Confirm update</a>
            "#,
        );

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Confirmed { links: 2 });
        assert_eq!(
            *confirmer.urls.lock().unwrap(),
            vec![
                "https://www.netflix.com/verify/1",
                "https://www.netflix.com/verify/2"
            ]
        );
    }

    #[tokio::test]
    async fn forward_action_sends_instead_of_clicking() {
        let (dispatcher, mailer, confirmer) = dispatcher(DispatchAction::Forward);
        let message = html_message("info@account.netflix.com", VERIFY_HTML);

        let outcome = dispatcher.classify_and_dispatch(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Forwarded { recipients: 1 });
        assert!(confirmer.urls.lock().unwrap().is_empty());
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn dispatch_action_parses_from_config_values() {
        assert_eq!(
            "auto-confirm".parse::<DispatchAction>().unwrap(),
            DispatchAction::AutoConfirm
        );
        assert_eq!(
            "Forward".parse::<DispatchAction>().unwrap(),
            DispatchAction::Forward
        );
        assert!("clickthrough".parse::<DispatchAction>().is_err());
    }
}
