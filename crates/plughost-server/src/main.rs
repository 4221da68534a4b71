use std::net::SocketAddr;
use std::sync::Arc;

use plughost_plugin::{HttpFetcher, NullHost, Runtime, RuntimeConfig, WasmLoader};
use plughost_store::SeaOrmBackend;
use sea_orm_migration::MigratorTrait;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api;

/// Shared state of every request handler.
pub struct AppState {
    pub runtime: Runtime,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Database connection
    let db_config = plughost_store::DatabaseConfig::from_env();
    tracing::info!("connecting to database...");
    let db = plughost_store::connect(&db_config)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("running database migrations...");
    plughost_migration::Migrator::up(&db, None)
        .await
        .expect("failed to run migrations");
    tracing::info!("migrations complete");

    // Plugin runtime
    let config = RuntimeConfig::from_env();
    tracing::info!(host_version = %config.host_version, "starting plugin runtime");
    let loader = Arc::new(WasmLoader::new(config.sandbox.clone()));
    let fetcher = Arc::new(HttpFetcher::new(config.sandbox.http_timeout_secs));
    let host = Arc::new(NullHost::new(config.host_version.clone()));
    let runtime = Runtime::new(
        config,
        Arc::new(SeaOrmBackend::new(db)),
        loader,
        fetcher,
        host,
    );

    let stop = runtime
        .start_all()
        .await
        .expect("failed to start plugin runtime");

    let state = Arc::new(AppState { runtime });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = std::env::var("PLUGHOST_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
        .parse()
        .expect("PLUGHOST_LISTEN must be a socket address");
    tracing::info!(%addr, "server started");

    axum::serve(
        tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listener"),
        app,
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("stopping plugins...");
    stop.stop_all().await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
