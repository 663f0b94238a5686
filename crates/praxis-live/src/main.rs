//! Live broadcast server binary.
//!
//! Startup order matters: database first (connect, migrate, changefeed
//! install + verify), then the fan-out machinery, then the upstream
//! listener, and only then the HTTP surface. Clients connecting during the
//! window before the listener is up simply see a degraded `/health` and no
//! events, never an error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use praxis_core::{defaults, EventBus};
use praxis_db::{changefeed, Database};
use praxis_live::{
    app, spawn_fanout, spawn_heartbeat, AppState, ChangeListener, ConnectionRegistry,
    ListenerConfig, StaticTokenVerifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   PRAXIS_LOG         - env filter (default: "praxis_live=debug,tower_http=info")
    //   PRAXIS_LOG_FORMAT  - "json" or "text" (default: "text")
    //   PRAXIS_LOG_DIR     - directory for daily-rotated file output (optional)
    let log_format = std::env::var("PRAXIS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_dir = std::env::var("PRAXIS_LOG_DIR").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("PRAXIS_LOG")
        .unwrap_or_else(|_| "praxis_live=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(dir, "praxis-live.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false) // no ANSI in files
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_dir = log_dir.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Get configuration from environment
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/praxis".to_string());
    let host = std::env::var("PRAXIS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PRAXIS_PORT")
        .unwrap_or_else(|_| defaults::SERVER_PORT.to_string())
        .parse()
        .unwrap_or(defaults::SERVER_PORT);

    // Connect to database
    info!("Connecting to database...");
    let db = Database::connect(&database_url).await?;
    info!("Database connected");

    // Run pending database migrations on startup
    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    // Migrations carry the changefeed, but a database provisioned by other
    // means may lack it; install is idempotent and verify names the gaps.
    changefeed::install(db.pool()).await?;
    for status in changefeed::verify(db.pool()).await? {
        if !status.healthy() {
            warn!(
                entity = %status.entity,
                table = status.table,
                table_exists = status.table_exists,
                trigger_installed = status.trigger_installed,
                "Changefeed incomplete for tracked table"
            );
        }
    }

    // Fan-out machinery: bus, registry, delivery and heartbeat tasks
    let bus = Arc::new(EventBus::new(defaults::EVENT_BUS_CAPACITY));
    let connections = Arc::new(ConnectionRegistry::new());
    let fanout_task = spawn_fanout(Arc::clone(&bus), Arc::clone(&connections));
    let heartbeat_task = spawn_heartbeat(
        Arc::clone(&connections),
        Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS),
        Duration::from_secs(defaults::HEARTBEAT_TIMEOUT_SECS),
    );

    // Upstream listener
    info!("Starting change listener...");
    let listener_config = ListenerConfig::from_env().with_database_url(database_url.clone());
    let listener = ChangeListener::new(listener_config, Arc::clone(&bus));
    let listener_status = listener.status();
    let listener_handle = listener.start();

    // HTTP surface
    let auth = Arc::new(StaticTokenVerifier::from_env());
    let state = AppState::new(connections, auth, listener_status);
    let router = app(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(tcp, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    listener_handle.shutdown().await.ok();
    fanout_task.abort();
    heartbeat_task.abort();
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
