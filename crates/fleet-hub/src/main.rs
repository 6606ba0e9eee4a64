mod api;
mod app;
mod config;
mod connection;
mod dispatch;
mod events;
mod folder_stats;
mod jobs;
mod logging;
mod registry;
mod saga;
mod scheduler;

use chrono::Utc;
use fleet_core::store::{EventSink, JobRepository};
use fleet_storage::FleetStore;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::{router, AppState};
use crate::config::load_config;
use crate::logging::init_logging;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(event = "db_dir_error", error = %err, path = %parent.display());
                return;
            }
        }
    }
    let store = match FleetStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "db_open_error", error = %err, path = %config.db_path.display());
            return;
        }
    };

    let repo: Arc<dyn JobRepository> = store.clone();
    let sink: Arc<dyn EventSink> = store;
    let state = AppState::new(config.clone(), repo.clone(), Some(sink));

    let scheduler = Scheduler::new(repo, state.dispatcher.clone(), config.scheduler_interval);
    match scheduler.backfill(Utc::now()).await {
        Ok(count) => info!(event = "scheduler_backfill", jobs = count),
        Err(err) => error!(event = "scheduler_backfill_error", error = %err),
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = scheduler.spawn(shutdown_rx);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db_path = %config.db_path.display(),
        log_file = ?log_guard.as_ref().and_then(|guard| guard.path()),
        confirmation = ?config.confirmation
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    info!(event = "hub_stop");
}
