//! Device-type registry: the closed set of simulated device kinds and the
//! value ranges their measurements are drawn from.
//!
//! Extending the fleet means adding a variant and a table row here; nothing
//! else in the system switches on concrete types.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::MeasurementSample;

/// The simulated device kinds. Serde names match the persisted status file
/// and the registration payloads of the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "PV")]
    Pv,
    #[serde(rename = "Heat Pump")]
    HeatPump,
    #[serde(rename = "Main Grid")]
    MainGrid,
}

/// Per-type metadata: id prefix for device naming plus measurement ranges.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTypeSpec {
    pub type_id: &'static str,
    pub display: &'static str,
    pub voltage_range: (f64, f64),
    pub current_range: (f64, f64),
}

const PV: DeviceTypeSpec = DeviceTypeSpec {
    type_id: "pv",
    display: "PV",
    voltage_range: (200.0, 250.0),
    current_range: (5.0, 15.0),
};

const HEAT_PUMP: DeviceTypeSpec = DeviceTypeSpec {
    type_id: "heatpump",
    display: "Heat Pump",
    voltage_range: (220.0, 240.0),
    current_range: (8.0, 20.0),
};

const MAIN_GRID: DeviceTypeSpec = DeviceTypeSpec {
    type_id: "maingrid",
    display: "Main Grid",
    voltage_range: (230.0, 240.0),
    current_range: (10.0, 50.0),
};

impl DeviceType {
    pub const ALL: [DeviceType; 3] = [DeviceType::Pv, DeviceType::HeatPump, DeviceType::MainGrid];

    pub fn spec(self) -> &'static DeviceTypeSpec {
        match self {
            DeviceType::Pv => &PV,
            DeviceType::HeatPump => &HEAT_PUMP,
            DeviceType::MainGrid => &MAIN_GRID,
        }
    }

    /// Display name, e.g. `"Heat Pump"`.
    pub fn display(self) -> &'static str {
        self.spec().display
    }

    /// Identifier prefix, e.g. `"heatpump"` for `heatpump001`.
    pub fn type_id(self) -> &'static str {
        self.spec().type_id
    }

    pub fn from_display(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.display() == name)
    }

    /// Resolve the type from a device identifier's prefix.
    pub fn from_device_id(device_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| device_id.starts_with(t.type_id()))
    }
}

/// Cumulative energy for a new sample: previous total plus the current power
/// integrated over the time since the previous sample. A device's first
/// sample starts at zero.
pub fn accumulate_kwh(
    prev: Option<&MeasurementSample>,
    power_w: f64,
    at: DateTime<Utc>,
) -> f64 {
    let Some(prev) = prev else { return 0.0 };
    let elapsed_ms = (at - prev.timestamp).num_milliseconds().max(0);
    let elapsed_hours = elapsed_ms as f64 / 3_600_000.0;
    round_to(prev.kwh + power_w / 1000.0 * elapsed_hours, 6)
}

/// Draw a sample for `device_id` within its type's ranges.
pub fn generate_sample(
    device_id: &str,
    device_type: DeviceType,
    prev: Option<&MeasurementSample>,
    at: DateTime<Utc>,
    rng: &mut impl Rng,
) -> MeasurementSample {
    let spec = device_type.spec();
    let voltage = round_to(rng.gen_range(spec.voltage_range.0..=spec.voltage_range.1), 2);
    let current = round_to(rng.gen_range(spec.current_range.0..=spec.current_range.1), 2);
    let power = round_to(voltage * current, 2);
    let kwh = accumulate_kwh(prev, power, at);
    MeasurementSample {
        device_id: device_id.to_string(),
        timestamp: at,
        voltage,
        current,
        power,
        kwh,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
