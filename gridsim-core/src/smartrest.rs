//! SmartREST static-template rows for the remote telemetry platform.
//!
//! These strings are interoperability contracts: the platform parses them by
//! template number and field position, so the exact shapes matter.

use crate::models::MeasurementSample;

/// Upstream static-template topic (measurements, events, alarms, operation
/// status).
pub const TOPIC_MEASUREMENTS: &str = "s/us";

/// Downstream static-template topic carrying operations for the device.
pub const TOPIC_COMMANDS: &str = "s/ds";

/// Operation-status rows for the simulated restart sequence.
pub const RESTART_ACK: &str = "501,c8y_Restart";
pub const RESTART_COMPLETE: &str = "503,c8y_Restart";

/// Per-device inventory topic used for registration.
pub fn inventory_topic(device_id: &str) -> String {
    format!("s/ud/{device_id}")
}

/// Template 100: create the device in the platform inventory.
pub fn registration(device_name: &str, device_type: &str) -> String {
    format!("100,{device_name},{device_type}")
}

/// Template 200 rows, one per measured quantity, each tagged with its SI
/// unit and the sample timestamp.
pub fn measurement_rows(sample: &MeasurementSample) -> [String; 4] {
    let ts = sample.timestamp.to_rfc3339();
    [
        format!("200,c8y_Voltage,{},V,{}", sample.voltage, ts),
        format!("200,c8y_Current,{},A,{}", sample.current, ts),
        format!("200,c8y_Power,{},W,{}", sample.power, ts),
        format!("200,c8y_EnergyConsumption,{},kWh,{}", sample.kwh, ts),
    ]
}

/// Template 301: raise an alarm.
pub fn alarm(alarm_type: &str, text: &str, severity: &str) -> String {
    format!("301,{alarm_type},{text},{severity}")
}

/// Template 400 event used as the uplink keep-alive.
pub fn heartbeat_event() -> String {
    "400,c8y_Heartbeat,Device heartbeat".to_string()
}

/// True when a downstream payload contains a 510 restart operation.
pub fn is_restart_command(payload: &str) -> bool {
    payload
        .lines()
        .any(|line| line.split(',').next().map(str::trim) == Some("510"))
}
