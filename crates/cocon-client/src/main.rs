//! CoCon Monitor
//!
//! Connects to a CoCon server, subscribes to a set of models and logs every
//! notification until interrupted.
//!
//! # Configuration
//!
//! - `COCON_*` variables (see [`cocon_client::Config::from_env`])
//! - `COCON_SUBSCRIBE`: comma-separated model tags (default
//!   `Delegate,Microphone`)
//! - `COCON_LOG_FORMAT=json`: emit JSON log lines
//! - `RUST_LOG`: log filter (default `cocon_client=info,cocon_monitor=info`)

#![warn(clippy::pedantic)]

use anyhow::Context;
use cocon_client::{CoConClient, Config, HandlerFailure, Model, NotificationEvent};
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SUBSCRIBE: &str = "Delegate,Microphone";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let models = parse_models(
        &std::env::var("COCON_SUBSCRIBE").unwrap_or_else(|_| DEFAULT_SUBSCRIBE.to_string()),
    )?;

    info!(
        base_url = %config.base_url(),
        poll_interval_secs = config.poll_interval.as_secs(),
        max_retries = config.max_retries,
        models = ?models,
        "Starting CoCon monitor"
    );

    let client = CoConClient::builder(config)
        .handler(log_event)
        .error_hook(|failure: &HandlerFailure, event: &NotificationEvent| {
            warn!(kind = failure.kind(), model = ?event.model(), "Event was not handled");
        })
        .build()?;

    client.connect().await.context("failed to connect")?;

    if let Err(e) = client.subscribe(&models).await {
        // Subscriptions stay desired and are re-asserted on the next session
        warn!(error = %e, "Initial subscribe failed");
    }

    info!("CoCon monitor running - press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Shutdown signal received, closing client...");
    client.close().await;
    info!("CoCon monitor stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cocon_client=info,cocon_monitor=info".into());

    let json = std::env::var("COCON_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[allow(clippy::unnecessary_wraps)]
fn log_event(event: &NotificationEvent) -> anyhow::Result<()> {
    let payload = Value::Object(event.payload.clone());
    info!(
        model = ?event.model(),
        received_at = %event.received_at,
        payload = %payload,
        "Notification"
    );
    Ok(())
}

fn parse_models(list: &str) -> anyhow::Result<Vec<Model>> {
    list.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.parse::<Model>().with_context(|| format!("COCON_SUBSCRIBE: {tag}")))
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
