//! media-sync - media server library synchronization service

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_sync::config::Config;
use media_sync::db::Database;
use media_sync::services::{
    BroadcastSink, HttpProviderFactory, ImageCacheManager, RateLimitedClient, SyncService,
};
use media_sync::{AppState, build_app, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_sync=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!("Starting media-sync");

    let db = Database::connect_with_retry(
        &config.database_url,
        Duration::from_secs(2),
        Duration::from_secs(30),
    )
    .await?;
    db.migrate().await?;
    tracing::info!("Database connected");

    let client = RateLimitedClient::build_shared_client(config.provider_timeout)?;
    let providers = Arc::new(HttpProviderFactory::new(client.clone()));
    let image_cache = Arc::new(ImageCacheManager::new(config.image_cache(), client));
    let events = Arc::new(BroadcastSink::default());

    let sync = Arc::new(SyncService::new(
        db.clone(),
        providers,
        Some(image_cache.clone()),
        events,
        config.sync(),
    ));

    let recovered = sync.recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Reset syncs interrupted by the last shutdown");
    }

    let mut scheduler = jobs::start_scheduler(&config, sync.clone(), image_cache).await?;

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        sync,
    };
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    scheduler.shutdown().await?;
    db.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
