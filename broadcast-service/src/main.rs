use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{info, warn};

use broadcast_service::config::Config;
use broadcast_service::handlers::{self, AppState};
use broadcast_service::services::{EventIngress, Reconciler, StreamService, ViewerTracker};
use broadcast_service::store::memory::MemoryLifecycleStore;
use broadcast_service::store::postgres::PgLifecycleStore;
use broadcast_service::store::LifecycleStore;
use provider_client::ProviderClient;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .init();

    let config =
        Config::from_env().map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    let store: Arc<dyn LifecycleStore> = match &config.database.url {
        Some(url) => {
            info!("Using PostgreSQL lifecycle store");
            Arc::new(PgLifecycleStore::connect(url, config.database.max_connections).await?)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory lifecycle store");
            Arc::new(MemoryLifecycleStore::new())
        }
    };

    let (updates, _) = broadcast::channel(256);
    let provider = Arc::new(ProviderClient::new(
        config.provider.api_base.clone(),
        config.provider.api_token.clone(),
    ));
    let ingress = Arc::new(EventIngress::new(
        config.provider.webhook_secret.clone(),
        Duration::from_secs(config.lifecycle.dedup_window_secs),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        updates.clone(),
        config.lifecycle.clone(),
        config.provider.playback_base.clone(),
    ));
    let tracker = Arc::new(ViewerTracker::new(
        store.clone(),
        updates.clone(),
        config.viewers.session_ttl_secs,
    ));
    let streams = Arc::new(StreamService::new(
        store.clone(),
        provider,
        reconciler.clone(),
        config.provider.playback_base.clone(),
        config.access.min_member_tier,
    ));

    // reap viewer sessions whose heartbeat went quiet
    {
        let tracker = tracker.clone();
        let interval = Duration::from_secs(config.viewers.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = tracker.sweep_stale().await {
                    warn!(error = %err, "Viewer session sweep failed");
                }
            }
        });
    }

    // expire dedup entries and re-match orphan recordings
    {
        let reconciler = reconciler.clone();
        let ingress = ingress.clone();
        let interval = Duration::from_secs(config.lifecycle.orphan_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                ingress.sweep();
                match reconciler.sweep_orphans().await {
                    Ok(0) => {}
                    Ok(attached) => info!(attached, "Orphan sweep attached recordings"),
                    Err(err) => warn!(error = %err, "Orphan sweep failed"),
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        store,
        ingress,
        reconciler,
        tracker,
        streams,
    };

    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    info!(%bind_addr, env = %config.app.env, "Starting broadcast-service");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .configure(handlers::routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind on {bind_addr}"))?
    .run()
    .await
    .context("HTTP server error")?;

    Ok(())
}
