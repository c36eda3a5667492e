//! JSON control surface for the supervisor.
//!
//! This is the seam the (external) dashboard drives: device CRUD and
//! start/stop, measurement browsing, and the two settings documents.
//! Responses carry a success flag; causes stay in the kernel log.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use gridsim_core::device_types::DeviceType;
use gridsim_core::models::MeasurementSample;
use gridsim_core::settings::{
    SamplingSettings, UplinkSettings, SAMPLING_SETTINGS_FILE, UPLINK_SETTINGS_FILE,
};
use gridsim_core::sink::MeasurementSink;

use crate::state::Shared;
use crate::supervisor::{DeviceSupervisor, DeviceView};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Shared<DeviceSupervisor>,
    pub sink: Arc<dyn MeasurementSink>,
    pub data_dir: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/devices", get(list_devices).post(add_device))
        .route("/devices/{id}", get(get_device).delete(delete_device))
        .route("/devices/{id}/start", post(start_device))
        .route("/devices/{id}/stop", post(stop_device))
        .route("/measurements", get(get_measurements))
        .route("/settings/sampling", get(get_sampling).put(put_sampling))
        .route("/settings/uplink", get(get_uplink).put(put_uplink))
        .with_state(state)
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(app.supervisor.lock().list_all())
}

// GET /devices/{id}
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    app.supervisor
        .lock()
        .get_status(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct AddDeviceBody {
    device_type: String,
}

// POST /devices
async fn add_device(
    State(app): State<AppState>,
    Json(body): Json<AddDeviceBody>,
) -> Result<Json<Value>, StatusCode> {
    let Some(device_type) = DeviceType::from_display(&body.device_type) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let device_id = app.supervisor.lock().add_device(device_type);
    Ok(Json(json!({ "ok": true, "device_id": device_id })))
}

// POST /devices/{id}/start
async fn start_device(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let ok = app.supervisor.lock().start_device(&id);
    Json(json!({ "ok": ok }))
}

// POST /devices/{id}/stop
async fn stop_device(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let ok = app.supervisor.lock().stop_device(&id);
    Json(json!({ "ok": ok }))
}

// DELETE /devices/{id}
async fn delete_device(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let ok = app.supervisor.lock().delete_device(&id);
    Json(json!({ "ok": ok }))
}

#[derive(Debug, Deserialize)]
struct MeasurementsQuery {
    device_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

// GET /measurements?device_id=&limit=&offset=
async fn get_measurements(
    State(app): State<AppState>,
    Query(query): Query<MeasurementsQuery>,
) -> Result<Json<Vec<MeasurementSample>>, StatusCode> {
    let device_id = query.device_id.as_deref().filter(|s| !s.is_empty());
    let limit = query.limit.unwrap_or(100).min(1000);
    let offset = query.offset.unwrap_or(0);
    app.sink
        .recent(device_id, limit, offset)
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "measurement query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

// GET /settings/sampling
async fn get_sampling(State(app): State<AppState>) -> Json<SamplingSettings> {
    Json(SamplingSettings::load(
        &app.data_dir.join(SAMPLING_SETTINGS_FILE),
    ))
}

#[derive(Debug, Deserialize)]
struct SamplingBody {
    measurement_interval: u64,
}

// PUT /settings/sampling
async fn put_sampling(
    State(app): State<AppState>,
    Json(body): Json<SamplingBody>,
) -> Result<Json<Value>, StatusCode> {
    let path = app.data_dir.join(SAMPLING_SETTINGS_FILE);
    let mut settings = SamplingSettings::load(&path);
    settings.set_measurement_interval(body.measurement_interval);
    match settings.save(&path) {
        Ok(()) => Ok(Json(json!({
            "ok": true,
            "measurement_interval": settings.measurement_interval
        }))),
        Err(e) => {
            error!(error = %e, "failed to save sampling settings");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /settings/uplink
async fn get_uplink(State(app): State<AppState>) -> Json<UplinkSettings> {
    Json(UplinkSettings::load(&app.data_dir.join(UPLINK_SETTINGS_FILE)))
}

// PUT /settings/uplink - whole-document replace, last writer wins.
// Running workers keep the settings they started with.
async fn put_uplink(
    State(app): State<AppState>,
    Json(settings): Json<UplinkSettings>,
) -> Result<Json<Value>, StatusCode> {
    match settings.save(&app.data_dir.join(UPLINK_SETTINGS_FILE)) {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => {
            error!(error = %e, "failed to save uplink settings");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
