//! Relaybox Outbox Relay
//!
//! Polls application outbox stores and publishes pending messages to the
//! AMQP broker with publisher confirms. Supports SQLite and PostgreSQL
//! outbox backends, plus an in-memory store for local development.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RB_CONFIG_FILE` | - | TOML file with the broker settings; replaces the `RB_*` broker variables below |
//! | `RB_DSN` | - | Broker URI, e.g. `amqp://rabbit:5672/%2f` (required) |
//! | `RB_USERNAME`, `RB_PASSWORD` | - | Broker credentials (required) |
//! | `RB_APP_NAME` | - | Application name stamped on retry publishes (required) |
//! | `RB_FANOUT_EXCHANGE`, `RB_DIRECT_EXCHANGE` | - | Exchange names (required) |
//! | `RB_PRIMARY_QUEUE`, `RB_RETRY_QUEUE` | - | Queue names (required) |
//! | `RB_RETRY_BINDING_KEY`, `RB_ERROR_BINDING_KEY` | - | Direct-exchange binding keys (required) |
//! | `RB_HEARTBEAT_INTERVAL` | - | Heartbeat in seconds (required) |
//! | `RB_DELAYED_RETRIES`, `RB_IMMEDIATE_RETRIES` | - | Retry budgets (required) |
//! | `RB_RETRY_QUEUE_MESSAGE_TTL` | - | Retry queue TTL in milliseconds (required) |
//! | `RB_DISPATCH_MESSAGE_LIMIT` | `0` | Max messages per relay cycle, zero means uncapped |
//! | `RB_MAX_RECONNECT_TRIES` | `3` | Connect attempts before a cycle gives up |
//! | `RB_OUTBOX_DB_TYPE` | `postgres` | Outbox store: `sqlite`, `postgres`, `memory` |
//! | `RB_OUTBOX_DB_URL` | - | Store connection URL (required unless `memory`) |
//! | `RB_OUTBOX_POLL_INTERVAL_MS` | `1000` | Poll interval in milliseconds |
//! | `RB_HTTP_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::Json;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rb_amqp::{ConnectionManager, Producer};
use rb_common::{DeliveryObserver, LogObserver};
use rb_config::AmqpConfig;
use rb_outbox::repository::OutboxRepository;
use rb_outbox::{InMemoryOutboxRepository, OutboxRelay};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Relaybox Outbox Relay");

    // Configuration
    let config = load_config()?;
    let db_type = env_or("RB_OUTBOX_DB_TYPE", "postgres");
    let poll_interval_ms: u64 = env_or_parse("RB_OUTBOX_POLL_INTERVAL_MS", 1000);
    let http_port: u16 = env_or_parse("RB_HTTP_PORT", 9090);

    // The recorder must be in place before the first counter is touched.
    let recorder_handle = PrometheusBuilder::new().install_recorder()?;

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize outbox repository
    let repository = create_outbox_repository(&db_type).await?;
    info!("Outbox repository initialized ({})", db_type);

    // Initialize AMQP producer
    let connection = Arc::new(ConnectionManager::new(config.clone()));
    let observer: Arc<dyn DeliveryObserver> = Arc::new(LogObserver);
    let producer = Arc::new(Producer::new(connection, config.clone(), observer));
    info!("AMQP producer initialized: {}", config.fanout_exchange);

    // Create the relay
    let relay = OutboxRelay::new(
        repository,
        producer,
        Duration::from_millis(poll_interval_ms),
        config.dispatch_message_limit,
    );

    // Start relay
    let relay_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = relay.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Outbox relay shutting down");
                }
            }
        })
    };

    // Start metrics server
    let http_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!("Metrics server listening on http://{}/metrics", http_addr);

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(recorder_handle);

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("Relaybox Outbox Relay started");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = relay_handle.await;
        let _ = http_handle.await;
    })
    .await;

    info!("Relaybox Outbox Relay shutdown complete");
    Ok(())
}

fn load_config() -> Result<AmqpConfig> {
    match std::env::var("RB_CONFIG_FILE") {
        Ok(path) => {
            info!("Loading broker config from {}", path);
            Ok(AmqpConfig::from_toml_file(&path)?)
        }
        Err(_) => Ok(AmqpConfig::from_env()?),
    }
}

async fn create_outbox_repository(db_type: &str) -> Result<Arc<dyn OutboxRepository>> {
    match db_type {
        "sqlite" => {
            let url = env_required("RB_OUTBOX_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let repository = rb_outbox::sqlite::SqliteOutboxRepository::new(pool);
            repository.init_schema().await?;
            info!("Using SQLite outbox: {}", url);
            Ok(Arc::new(repository))
        }
        "postgres" => {
            let url = env_required("RB_OUTBOX_DB_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let repository = rb_outbox::postgres::PostgresOutboxRepository::new(pool);
            repository.init_schema().await?;
            info!("Using PostgreSQL outbox");
            Ok(Arc::new(repository))
        }
        "memory" => {
            info!("Using in-memory outbox");
            Ok(Arc::new(InMemoryOutboxRepository::new()))
        }
        other => Err(anyhow::anyhow!(
            "Unknown outbox database type: {}. Use sqlite, postgres, or memory",
            other
        )),
    }
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
