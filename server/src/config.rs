//! Runtime configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::DispatchAction;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,

    /// Case-insensitive substring the From header must contain.
    pub sender_pattern: String,
    /// Domain actionable links and followed outbound links must contain.
    pub verification_domain: String,
    /// Href fragment that marks a verification link regardless of label.
    pub verification_path_marker: String,

    pub action: DispatchAction,
    pub forward_recipients: Vec<String>,

    /// Depth ceiling for the browser click-through.
    pub max_click_depth: u32,
    pub devtools_url: String,
    pub nav_timeout: Duration,
    pub settle_delay: Duration,
    pub post_click_delay: Duration,
    /// Known CSS selector for the secondary confirmation control.
    pub secondary_selector: Option<String>,

    /// Checkpoint persistence; empty value disables it.
    pub checkpoint_file: Option<PathBuf>,

    /// Full Pub/Sub topic name, or empty when watch is unconfigured.
    pub watch_topic: String,
}

impl Settings {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let port = env_parsed("PORT", 3000);

        let sender_pattern = env_or("SENDER_PATTERN", "netflix.com");
        let verification_domain = env_or("VERIFICATION_DOMAIN", "netflix.com");
        let verification_path_marker =
            env_or("VERIFICATION_PATH_MARKER", "update-primary-location");

        let action = match std::env::var("DISPATCH_ACTION") {
            Ok(value) => value.parse().unwrap_or_else(|e: String| {
                tracing::warn!("{e}, defaulting to auto-confirm");
                DispatchAction::AutoConfirm
            }),
            Err(_) => DispatchAction::AutoConfirm,
        };

        let forward_recipients = std::env::var("FORWARD_RECIPIENTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let checkpoint_file = match std::env::var("CHECKPOINT_FILE") {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(PathBuf::from(value)),
            Err(_) => Some(PathBuf::from("lastHistory.json")),
        };

        let watch_topic = match (
            std::env::var("GCP_PROJECT_ID"),
            std::env::var("GMAIL_TOPIC_NAME"),
        ) {
            (Ok(project), Ok(topic)) if !project.is_empty() && !topic.is_empty() => {
                format!("projects/{project}/topics/{topic}")
            }
            _ => String::new(),
        };

        Self {
            port,
            sender_pattern,
            verification_domain,
            verification_path_marker,
            action,
            forward_recipients,
            max_click_depth: env_parsed("MAX_CLICK_DEPTH", 2),
            devtools_url: env_or("DEVTOOLS_URL", "http://localhost:9222"),
            nav_timeout: Duration::from_secs(env_parsed("NAV_TIMEOUT_SECS", 30)),
            settle_delay: Duration::from_millis(env_parsed("SETTLE_DELAY_MS", 3000)),
            post_click_delay: Duration::from_millis(env_parsed("POST_CLICK_DELAY_MS", 2000)),
            secondary_selector: std::env::var("SECONDARY_SELECTOR")
                .ok()
                .filter(|s| !s.is_empty()),
            checkpoint_file,
            watch_topic,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
