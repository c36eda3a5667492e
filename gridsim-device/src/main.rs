//! GridSim device worker - one isolated OS process per simulated device.
//!
//! The supervisor hands this process its identity and parameters through
//! GRIDSIM_* environment variables. The worker samples measurements on a
//! fixed interval, persists each one, and forwards it over the uplink
//! session when telemetry is enabled. Settings are read once at startup;
//! changing them only affects devices started afterward.

mod uplink;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use gridsim_core::device_types::{self, DeviceType};
use gridsim_core::settings::{
    UplinkSettings, DEFAULT_INTERVAL_SECS, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS,
    UPLINK_SETTINGS_FILE,
};
use gridsim_core::sink::{MeasurementSink, SqliteSink, MEASUREMENTS_DB_FILE};
use gridsim_core::status::{StatusStore, STATUS_FILE};
use uplink::UplinkSession;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let device_id = std::env::var("GRIDSIM_DEVICE_ID").context("GRIDSIM_DEVICE_ID not set")?;
    let device_type = match std::env::var("GRIDSIM_DEVICE_TYPE")
        .ok()
        .as_deref()
        .and_then(DeviceType::from_display)
    {
        Some(ty) => ty,
        None => DeviceType::from_device_id(&device_id)
            .with_context(|| format!("cannot resolve a device type for {device_id}"))?,
    };
    let interval_secs = std::env::var("GRIDSIM_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS)
        .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
    let data_dir = PathBuf::from(
        std::env::var("GRIDSIM_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    );

    info!(
        device_id = %device_id,
        device_type = device_type.display(),
        interval_secs,
        "device worker starting"
    );

    let sink =
        SqliteSink::open(data_dir.join(MEASUREMENTS_DB_FILE)).context("open measurement sink")?;
    let store = StatusStore::new(data_dir.join(STATUS_FILE));
    let uplink_settings = UplinkSettings::load(&data_dir.join(UPLINK_SETTINGS_FILE));

    let session = if uplink_settings.enabled {
        let device_name = uplink_settings.device_name(&device_id);
        let session = UplinkSession::new(device_id.clone(), uplink_settings, store.clone());
        if session.connect().await {
            if !session
                .register(device_type.display(), &device_name, false)
                .await
            {
                warn!(device_id = %device_id, "remote registration failed, continuing unregistered");
            }
        } else {
            // The session stays around; forwarding retries inline later.
            warn!(device_id = %device_id, "uplink connect failed, measurements stay local for now");
        }
        Some(session)
    } else {
        None
    };

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut rng = rand::thread_rng();
    loop {
        let prev = match sink.last_sample(&device_id) {
            Ok(prev) => prev,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "failed to read previous sample");
                None
            }
        };
        let sample = device_types::generate_sample(
            &device_id,
            device_type,
            prev.as_ref(),
            Utc::now(),
            &mut rng,
        );
        if let Err(e) = sink.insert(&sample) {
            error!(device_id = %device_id, error = %e, "failed to persist sample");
        } else {
            debug!(
                device_id = %device_id,
                power = sample.power,
                kwh = sample.kwh,
                "sample stored"
            );
        }
        if let Some(session) = &session {
            if !session.send_measurement(&sample).await {
                debug!(device_id = %device_id, "measurement not forwarded");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            _ = stop_rx.changed() => {
                info!(device_id = %device_id, "termination signal received");
                break;
            }
        }
    }

    if let Some(session) = session {
        session.disconnect().await;
    }
    info!(device_id = %device_id, "device worker shut down");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
