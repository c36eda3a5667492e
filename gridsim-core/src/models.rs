use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device_types::DeviceType;

/// Last-known intent for a device, not live process truth. Liveness is
/// recomputed from the supervisor's process handles at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Stopped,
    Active,
}

/// Persisted identity/type/status tuple for one simulated device.
///
/// Owned exclusively by the supervisor; mutated only through its operations.
/// `created_at` is kept as the ISO-8601 string it was persisted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub created_at: String,
}

impl DeviceRecord {
    pub fn new(device_id: String, device_type: DeviceType) -> Self {
        Self {
            device_id,
            device_type,
            status: DeviceStatus::Stopped,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// One electrical measurement, written once by a worker and immutable after.
///
/// `power` is voltage x current; `kwh` is the device's cumulative energy,
/// non-decreasing across the sample sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub kwh: f64,
}
