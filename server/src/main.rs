use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod checkpoint;
mod config;
mod confirm;
mod dispatch;
mod error;
mod extract;
mod gmail;
mod ingress;
mod sync;

use checkpoint::CheckpointStore;
use config::Settings;
use confirm::{ConfirmRunner, TraversalConfig};
use dispatch::{ClassifyRules, Dispatcher};
use gmail::GmailClient;
use ingress::AppState;
use sync::SyncEngine;

#[derive(Parser)]
#[command(about = "Auto-confirms mailbox verification emails via Gmail push notifications")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server (default).
    Serve,
    /// Start the Gmail push-notification watch and exit.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Watch => watch(settings).await,
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let gmail = Arc::new(GmailClient::from_env().await?);

    let sessions = Arc::new(browser::ChromeSessions::new(&settings.devtools_url));
    let runner = ConfirmRunner::new(
        sessions,
        TraversalConfig {
            domain: settings.verification_domain.clone(),
            max_depth: settings.max_click_depth,
            nav_timeout: settings.nav_timeout,
            settle_delay: settings.settle_delay,
            post_click_delay: settings.post_click_delay,
            secondary_selector: settings.secondary_selector.clone(),
        },
    );

    let dispatcher = Arc::new(Dispatcher::new(
        ClassifyRules {
            sender_pattern: settings.sender_pattern.clone(),
            verification_domain: settings.verification_domain.clone(),
            verification_path_marker: settings.verification_path_marker.clone(),
        },
        settings.action,
        settings.forward_recipients.clone(),
        gmail.clone(),
        Arc::new(runner),
    ));

    let store = settings.checkpoint_file.clone().map(CheckpointStore::new);
    let engine = SyncEngine::new(gmail.clone(), dispatcher, store);

    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        gmail,
        watch_topic: settings.watch_topic.clone(),
    };

    let app = Router::new()
        .route("/health", get(ingress::health_check))
        .route("/gmail-webhook", post(ingress::gmail_webhook))
        .route("/start-watch", get(ingress::start_watch))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("listening on {addr}, webhook at /gmail-webhook");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn watch(settings: Settings) -> anyhow::Result<()> {
    if settings.watch_topic.is_empty() {
        anyhow::bail!("GCP_PROJECT_ID and GMAIL_TOPIC_NAME must be set to start a watch");
    }

    let gmail = GmailClient::from_env().await?;
    let started = gmail.start_watch(&settings.watch_topic).await?;

    if let (Some(history_id), Some(path)) = (started.history_id, &settings.checkpoint_file) {
        CheckpointStore::new(path).save(history_id)?;
    }

    Ok(())
}
