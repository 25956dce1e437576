/**
 * OPWATCH KERNEL - Point d'entrée principal du serveur d'observation
 *
 * RÔLE : Orchestration de tous les modules : config, observer, store,
 * coordinateur de refresh, API HTTP. Bootstrap complet avec logging.
 *
 * ARCHITECTURE : Pull HTTP des agents de nœud + agrégation pure + API REST.
 * UTILITÉ : Point d'administration unique du parc de caches PHP.
 */

mod agent;
mod aggregate;
mod config;
mod error;
mod http;
mod models;
mod observer;
mod refresh;
mod state;

use crate::http::AppState;
use crate::observer::{spawn_polling, Observer};
use crate::refresh::RefreshCoordinator;
use crate::state::Store;
use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("opwatch_kernel=info")),
        )
        .init();

    let config = config::load_config().await?;
    info!(
        clusters = config.clusters.len(),
        pull_interval_seconds = config.pull_interval_seconds,
        "starting observer"
    );

    let observer = Arc::new(Observer::new(config.clusters.clone()));
    let store = Store::new();
    let coordinator = Arc::new(RefreshCoordinator::new(
        observer.clone(),
        store.clone(),
        Duration::from_millis(config.settle_delay_ms),
    ));

    // pull périodique, premier passage immédiat
    spawn_polling(
        observer.clone(),
        store.clone(),
        Duration::from_secs(config.pull_interval_seconds),
    );

    let app_state = AppState {
        store,
        observer,
        coordinator,
        started: Instant::now(),
    };
    let router = http::build_router(app_state);

    let addr = config.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("can not bind http server on {addr}"))?;
    info!(%addr, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("stopping server");
        })
        .await?;

    Ok(())
}
