//! GridSim core - shared foundation for the supervisor and the device workers
//!
//! Everything both halves of the simulator need lives here:
//! - device models and the closed device-type registry
//! - the measurement sink (SQLite) and the persisted status file
//! - settings files (sampling interval, telemetry uplink)
//! - SmartREST wire formats for the remote platform
//! - the telemetry-link seam the uplink session publishes through

pub mod device_types;
pub mod error;
pub mod link;
pub mod models;
pub mod settings;
pub mod sink;
pub mod smartrest;
pub mod status;

pub use device_types::DeviceType;
pub use error::StoreError;
pub use link::{LinkError, TelemetryLink};
pub use models::{DeviceRecord, DeviceStatus, MeasurementSample};
pub use sink::{MeasurementSink, SqliteSink};
pub use status::StatusStore;
