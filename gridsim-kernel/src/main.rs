//! GridSim kernel - the device lifecycle supervisor process.
//!
//! Bootstraps the stores, reconciles persisted device state (nothing can
//! still be running after a restart), then serves the JSON control API
//! until shutdown, stopping every tracked worker on the way out.

mod http;
mod state;
mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use gridsim_core::sink::{SqliteSink, MEASUREMENTS_DB_FILE};
use gridsim_core::status::{StatusStore, STATUS_FILE};

use crate::http::AppState;
use crate::state::new_state;
use crate::supervisor::{DeviceSupervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let data_dir = PathBuf::from(
        std::env::var("GRIDSIM_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    );
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let sink = Arc::new(
        SqliteSink::open(data_dir.join(MEASUREMENTS_DB_FILE)).context("open measurement sink")?,
    );
    let store = StatusStore::new(data_dir.join(STATUS_FILE));

    let mut supervisor =
        DeviceSupervisor::new(SupervisorConfig::new(&data_dir), store, sink.clone());
    if let Err(e) = supervisor.reconcile_on_startup() {
        error!(error = %e, "failed to load persisted device state, starting fresh");
    }
    let supervisor = new_state(supervisor);

    let app = http::build_router(AppState {
        supervisor: supervisor.clone(),
        sink,
        data_dir,
    });

    let port: u16 = std::env::var("GRIDSIM_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "kernel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("http server failed")?;

    supervisor.lock().cleanup();
    info!("kernel shut down");
    Ok(())
}
