//! Process-wide settings files.
//!
//! Both files are whole-file JSON with last-writer-wins semantics: the
//! supervisor reads them fresh on every relevant operation, workers read
//! them once at startup. A missing or unreadable file yields defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

pub const SAMPLING_SETTINGS_FILE: &str = "sampling_settings.json";
pub const UPLINK_SETTINGS_FILE: &str = "uplink_settings.json";

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Global sampling configuration shared by all devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    #[serde(default = "default_interval")]
    pub measurement_interval: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            measurement_interval: DEFAULT_INTERVAL_SECS,
        }
    }
}

impl SamplingSettings {
    pub fn load(path: &Path) -> Self {
        let mut settings = load_or_default::<Self>(path);
        settings.measurement_interval = settings
            .measurement_interval
            .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        settings
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_pretty(path, self)
    }

    /// Clamps to the accepted [1, 300] second window.
    pub fn set_measurement_interval(&mut self, secs: u64) {
        self.measurement_interval = secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
    }
}

/// Connection settings for the remote telemetry platform.
///
/// Credentials pass through to the broker untouched; nothing here manages
/// secrets beyond that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkSettings {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub tenant: String,
    pub use_ssl: bool,
    pub ca_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub device_name_prefix: String,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: String::new(),
            broker_port: 1883,
            username: String::new(),
            password: String::new(),
            tenant: String::new(),
            use_ssl: false,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            device_name_prefix: "iot_sim_".to_string(),
        }
    }
}

impl UplinkSettings {
    pub fn load(path: &Path) -> Self {
        load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_pretty(path, self)
    }

    /// SSL brokers listen on 8883 regardless of the configured port.
    pub fn effective_port(&self) -> u16 {
        if self.use_ssl {
            8883
        } else {
            self.broker_port
        }
    }

    /// Tenant-qualified broker username (`tenant/user`).
    pub fn qualified_username(&self) -> String {
        if self.tenant.is_empty() {
            self.username.clone()
        } else {
            format!("{}/{}", self.tenant, self.username)
        }
    }

    /// External name a device registers under.
    pub fn device_name(&self, device_id: &str) -> String {
        format!("{}{}", self.device_name_prefix, device_id)
    }
}

fn load_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                T::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
            T::default()
        }
    }
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let uplink = UplinkSettings::load(&dir.path().join(UPLINK_SETTINGS_FILE));
        assert!(!uplink.enabled);
        assert_eq!(uplink.broker_port, 1883);
        assert_eq!(uplink.device_name_prefix, "iot_sim_");

        let sampling = SamplingSettings::load(&dir.path().join(SAMPLING_SETTINGS_FILE));
        assert_eq!(sampling.measurement_interval, 5);
    }

    #[test]
    fn interval_is_clamped_on_set_and_load() {
        let mut s = SamplingSettings::default();
        s.set_measurement_interval(0);
        assert_eq!(s.measurement_interval, 1);
        s.set_measurement_interval(4000);
        assert_eq!(s.measurement_interval, 300);

        let dir = tempdir().unwrap();
        let path = dir.path().join(SAMPLING_SETTINGS_FILE);
        std::fs::write(&path, r#"{"measurement_interval": 900}"#).unwrap();
        assert_eq!(SamplingSettings::load(&path).measurement_interval, 300);
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(UPLINK_SETTINGS_FILE);
        let mut settings = UplinkSettings::default();
        settings.enabled = true;
        settings.broker_host = "tenant.example.com".into();
        settings.tenant = "t1234".into();
        settings.username = "device".into();
        settings.save(&path).unwrap();

        let loaded = UplinkSettings::load(&path);
        assert!(loaded.enabled);
        assert_eq!(loaded.broker_host, "tenant.example.com");
        assert_eq!(loaded.qualified_username(), "t1234/device");
    }

    #[test]
    fn ssl_forces_port_8883() {
        let mut settings = UplinkSettings::default();
        settings.broker_port = 1883;
        assert_eq!(settings.effective_port(), 1883);
        settings.use_ssl = true;
        assert_eq!(settings.effective_port(), 8883);
    }

    #[test]
    fn partial_settings_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(UPLINK_SETTINGS_FILE);
        std::fs::write(&path, r#"{"enabled": true, "broker_host": "mqtt.local"}"#).unwrap();
        let loaded = UplinkSettings::load(&path);
        assert!(loaded.enabled);
        assert_eq!(loaded.broker_host, "mqtt.local");
        assert_eq!(loaded.broker_port, 1883);
        assert_eq!(loaded.device_name_prefix, "iot_sim_");
    }
}
