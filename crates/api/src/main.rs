use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use archery_api::config::ServerConfig;
use archery_api::router::build_app_router;
use archery_api::state::AppState;
use archery_api::{background, ws};
use archery_worker::{Dispatcher, DispatcherConfig, DockerCli, PgBuildStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "archery_api=debug,archery_worker=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let dispatcher_config = DispatcherConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        docker_bin = %dispatcher_config.docker_bin,
        "Loaded server configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = archery_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    archery_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    archery_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));

    // --- Event bus + dispatcher ---
    let event_bus = Arc::new(archery_events::EventBus::default());
    let dispatcher = Dispatcher::new(
        Arc::new(PgBuildStore::new(pool.clone())),
        Arc::new(DockerCli::new(dispatcher_config.docker_bin.clone())),
        Arc::clone(&event_bus),
    );

    // --- Background tasks ---
    let background_cancel = CancellationToken::new();
    let mut background_handles = Vec::new();

    match dispatcher_config.sweep_interval {
        Some(interval) => {
            let sweeper = dispatcher.clone();
            let cancel = background_cancel.clone();
            background_handles.push(tokio::spawn(async move {
                sweeper.run_sweep(interval, cancel).await;
            }));
        }
        None => {
            tracing::info!("Dispatcher sweep disabled, resuming queued builds once");
            dispatcher.trigger();
        }
    }

    background_handles.push(tokio::spawn(background::build_retention::run(
        pool.clone(),
        config.build_retention_days,
        background_cancel.clone(),
    )));

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        event_bus: Arc::clone(&event_bus),
        dispatcher: dispatcher.clone(),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    background_cancel.cancel();
    for handle in background_handles {
        let _ = tokio::time::timeout(shutdown_timeout, handle).await;
    }
    tracing::info!("Background tasks stopped");

    if tokio::time::timeout(shutdown_timeout, dispatcher.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!("Build still in progress at shutdown; it stays recorded as running");
    }

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
