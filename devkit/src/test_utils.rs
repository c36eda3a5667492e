//! Fixtures shared by the gridsim test suites.

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use gridsim_core::models::MeasurementSample;
use gridsim_core::settings::UplinkSettings;
use gridsim_core::status::{StatusStore, STATUS_FILE};

/// A throwaway data directory with the layout the kernel and the workers
/// expect. Removed on drop.
pub struct TestDataDir {
    dir: TempDir,
}

impl TestDataDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp data dir"),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn status_store(&self) -> StatusStore {
        StatusStore::new(self.dir.path().join(STATUS_FILE))
    }
}

impl Default for TestDataDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Uplink settings pointing at a (nonexistent) local broker, enabled.
pub fn enabled_uplink_settings() -> UplinkSettings {
    UplinkSettings {
        enabled: true,
        broker_host: "localhost".to_string(),
        username: "tester".to_string(),
        password: "secret".to_string(),
        tenant: "t100".to_string(),
        ..UplinkSettings::default()
    }
}

/// A sample with fixed electrical values, for tests that only care about
/// identity, time and energy.
pub fn sample(device_id: &str, at: DateTime<Utc>, kwh: f64) -> MeasurementSample {
    MeasurementSample {
        device_id: device_id.to_string(),
        timestamp: at,
        voltage: 230.0,
        current: 10.0,
        power: 2300.0,
        kwh,
    }
}
