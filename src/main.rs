use clap::Parser;
use comfylite::config::{GatewayConfig, ServeArgs};
use comfylite::engine_client::{EngineClient, HttpEngineClient};
use comfylite::http::{AppState, router};
use comfylite::notifier::HttpNotifier;
use comfylite::service::Service;
use comfylite::tracker::Tracker;
use comfylite::workflow::WorkflowBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    let filter_layer = tracing_subscriber::EnvFilter::try_from_env("COMFYLITE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = ServeArgs::parse();

    let config = GatewayConfig::load().unwrap_or_default().merge_cli(&cli);

    init_tracing();
    tracing::info!(bind_addr = %config.bind_addr, engine_address = %config.engine_address, "starting comfylite");

    let client_id = uuid::Uuid::new_v4();
    let builder = WorkflowBuilder::new(config.template_dir.clone(), config.config_dir.clone());
    let notifier = Arc::new(HttpNotifier::new(Duration::from_secs(config.webhook_timeout_secs)));
    let engine: Arc<dyn EngineClient> = Arc::new(HttpEngineClient::new(config.engine_address.clone(), client_id));
    let tracker = Tracker::new(notifier, Duration::from_secs(config.idle_timeout_secs));

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(100);
    if let Err(err) = engine.start(event_tx).await {
        tracing::error!(%err, "failed to connect to engine");
        std::process::exit(1);
    }

    let (tracker_shutdown_tx, tracker_shutdown_rx) = tokio::sync::oneshot::channel();
    let tracker_task = tokio::spawn(tracker.clone().run(event_rx, tracker_shutdown_rx));

    let service = Service::new(builder, engine, tracker);
    let state = Arc::new(AppState { service });
    let app = router(state);

    let bind_addr = normalize_bind_addr(&config.bind_addr);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, bind_addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(bind_addr, "listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(%err, "server error");
    }

    let _ = tracker_shutdown_tx.send(());
    let _ = tracker_task.await;
}

/// `:8083` is shorthand for "any interface, port 8083" the way Go's
/// `net.Listen` treats it; Rust's `TcpListener` needs an explicit host.
fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(err) => tracing::error!(%err, "failed to install signal handler"),
    }
}
