//! Device lifecycle supervisor.
//!
//! Owns the device records, the per-type id counters and one OS process
//! handle per running device. Exactly one worker process may exist per
//! device id; liveness is checked before every spawn. Start/stop/delete
//! failures are logged and reported as booleans, never raised: a stuck
//! device must not take a batch operation down with it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use gridsim_core::device_types::DeviceType;
use gridsim_core::error::StoreError;
use gridsim_core::models::{DeviceRecord, DeviceStatus};
use gridsim_core::settings::{SamplingSettings, SAMPLING_SETTINGS_FILE};
use gridsim_core::sink::MeasurementSink;
use gridsim_core::status::{PersistedDevice, StatusStore};

pub const TERM_GRACE: Duration = Duration::from_secs(3);
pub const KILL_GRACE: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_millis(100);

pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub term_grace: Duration,
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            term_grace: TERM_GRACE,
            kill_grace: KILL_GRACE,
        }
    }
}

/// The worker binary ships next to the kernel executable.
fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("gridsim-device")))
        .unwrap_or_else(|| PathBuf::from("gridsim-device"))
}

/// Operator-facing view of one device, liveness already resolved.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub created_at: String,
}

pub struct DeviceSupervisor {
    config: SupervisorConfig,
    store: StatusStore,
    sink: Arc<dyn MeasurementSink>,
    records: HashMap<String, DeviceRecord>,
    handles: HashMap<String, Child>,
    counters: HashMap<String, u32>,
}

impl DeviceSupervisor {
    pub fn new(
        config: SupervisorConfig,
        store: StatusStore,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            records: HashMap::new(),
            handles: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    /// Load persisted records and counters. Any record saved as active is
    /// rewritten to stopped: no worker process can have survived a
    /// supervisor restart. Legacy counter keys are folded in on the way.
    pub fn reconcile_on_startup(&mut self) -> Result<(), StoreError> {
        let mut file = self.store.load()?;
        file.migrate_legacy_counters();
        let mut corrected = 0;
        for device in file.devices.values_mut() {
            if device.status == DeviceStatus::Active {
                device.status = DeviceStatus::Stopped;
                corrected += 1;
            }
        }
        self.counters = file.counters.clone();
        self.records = file
            .devices
            .iter()
            .map(|(id, d)| {
                (
                    id.clone(),
                    DeviceRecord {
                        device_id: id.clone(),
                        device_type: d.device_type,
                        status: d.status,
                        created_at: d.created_at.clone(),
                    },
                )
            })
            .collect();
        self.store.save(&file)?;
        info!(
            devices = self.records.len(),
            corrected, "persisted device state reconciled"
        );
        Ok(())
    }

    /// Allocate the next id for a type and create its record (stopped).
    /// Persistence is best-effort: an I/O failure is logged and the
    /// in-memory record survives.
    pub fn add_device(&mut self, device_type: DeviceType) -> String {
        let counter = self
            .counters
            .entry(device_type.type_id().to_string())
            .or_insert(0);
        *counter += 1;
        let device_id = format!("{}{:03}", device_type.type_id(), counter);
        self.records.insert(
            device_id.clone(),
            DeviceRecord::new(device_id.clone(), device_type),
        );
        self.persist_logged();
        info!(device_id = %device_id, device_type = device_type.display(), "device added");
        device_id
    }

    /// Spawn a worker process for the device. Returns false when one is
    /// already running or the spawn fails; the record stays stopped then.
    pub fn start_device(&mut self, device_id: &str) -> bool {
        if self.is_live(device_id) {
            warn!(device_id, "device is already running");
            return false;
        }
        // Whatever handle is left at this point belongs to an exited
        // process; drop it before spawning a replacement.
        self.handles.remove(device_id);

        let Some(device_type) = DeviceType::from_device_id(device_id) else {
            warn!(device_id, "unrecognized device id prefix");
            return false;
        };
        let interval =
            SamplingSettings::load(&self.config.data_dir.join(SAMPLING_SETTINGS_FILE))
                .measurement_interval;

        let mut command = Command::new(&self.config.worker_program);
        command
            .args(&self.config.worker_args)
            .env("GRIDSIM_DEVICE_ID", device_id)
            .env("GRIDSIM_DEVICE_TYPE", device_type.display())
            .env("GRIDSIM_INTERVAL_SECS", interval.to_string())
            .env("GRIDSIM_DATA_DIR", &self.config.data_dir);

        match command.spawn() {
            Ok(child) => {
                info!(device_id, pid = child.id(), interval, "device worker started");
                self.handles.insert(device_id.to_string(), child);
                let record = self
                    .records
                    .entry(device_id.to_string())
                    .or_insert_with(|| DeviceRecord::new(device_id.to_string(), device_type));
                record.status = DeviceStatus::Active;
                self.persist_logged();
                true
            }
            Err(e) => {
                error!(device_id, error = %e, "failed to spawn device worker");
                false
            }
        }
    }

    /// Stop a device's worker. Degrades to "best effort stopped": a process
    /// that survives both the graceful signal and the kill is logged and
    /// abandoned, and the record still ends up stopped.
    pub fn stop_device(&mut self, device_id: &str) -> bool {
        let Some(mut child) = self.handles.remove(device_id) else {
            warn!(device_id, "device not tracked as running");
            // Self-healing: force the persisted intent back to stopped.
            let had_record = match self.records.get_mut(device_id) {
                Some(record) => {
                    record.status = DeviceStatus::Stopped;
                    true
                }
                None => false,
            };
            if had_record {
                self.persist_logged();
            }
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(device_id, %status, "device process had already exited")
            }
            _ => self.terminate(device_id, &mut child),
        }

        if let Some(record) = self.records.get_mut(device_id) {
            record.status = DeviceStatus::Stopped;
        }
        self.persist_logged();
        info!(device_id, "device stopped");
        true
    }

    /// Remove a device entirely: stop its worker, drop the record, purge
    /// its stored samples. Deleting an unknown id is a no-op success.
    pub fn delete_device(&mut self, device_id: &str) -> bool {
        if self.handles.contains_key(device_id) {
            self.stop_device(device_id);
        }
        let existed = self.records.remove(device_id).is_some();
        match self.sink.purge_device(device_id) {
            Ok(deleted) if deleted > 0 => {
                info!(device_id, deleted, "purged stored measurements")
            }
            Ok(_) => {}
            Err(e) => error!(device_id, error = %e, "failed to purge measurements"),
        }
        self.persist_logged();
        if existed {
            info!(device_id, "device deleted");
        } else {
            debug!(device_id, "delete of unknown device is a no-op");
        }
        true
    }

    /// Status with liveness recomputed from the process handle when one
    /// exists; otherwise the persisted intent stands.
    pub fn get_status(&mut self, device_id: &str) -> Option<DeviceView> {
        let status = if self.handles.contains_key(device_id) {
            if self.is_live(device_id) {
                DeviceStatus::Active
            } else {
                DeviceStatus::Stopped
            }
        } else {
            self.records
                .get(device_id)
                .map(|r| r.status)
                .unwrap_or(DeviceStatus::Stopped)
        };
        let record = self.records.get(device_id)?;
        Some(DeviceView {
            device_id: record.device_id.clone(),
            device_type: record.device_type.display().to_string(),
            status,
            created_at: record.created_at.clone(),
        })
    }

    pub fn list_all(&mut self) -> Vec<DeviceView> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.get_status(id)).collect()
    }

    /// Stop every running device; the supervisor shutdown path.
    pub fn cleanup(&mut self) {
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping all devices");
        for id in ids {
            self.stop_device(&id);
        }
    }

    fn is_live(&mut self, device_id: &str) -> bool {
        match self.handles.get_mut(device_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Graceful-then-forced termination with bounded waits; never blocks
    /// past term_grace + kill_grace.
    fn terminate(&self, device_id: &str, child: &mut Child) {
        let pid = child.id();
        if send_sigterm(child) {
            debug!(device_id, pid, "sent termination signal");
            if wait_for_exit(child, self.config.term_grace) {
                info!(device_id, pid, "device process terminated");
                return;
            }
            warn!(device_id, pid, "no response to termination signal, killing");
        } else {
            warn!(device_id, pid, "termination signal failed, killing");
        }
        if let Err(e) = child.kill() {
            warn!(device_id, pid, error = %e, "kill failed");
        }
        if !wait_for_exit(child, self.config.kill_grace) {
            error!(device_id, pid, "failed to kill device process, proceeding anyway");
        }
    }

    /// Whole-file rewrite of the status document. The file is re-read first
    /// so registration fields written by workers carry through; concurrent
    /// writers still race last-writer-wins.
    fn persist(&self) -> Result<(), StoreError> {
        let mut file = self.store.load().unwrap_or_default();
        file.counters = self.counters.clone();
        let mut devices = HashMap::new();
        for (id, record) in &self.records {
            let mut entry = file.devices.remove(id).unwrap_or_else(|| {
                PersistedDevice::new(record.device_type, record.status, record.created_at.clone())
            });
            entry.device_type = record.device_type;
            entry.status = record.status;
            entry.created_at = record.created_at.clone();
            devices.insert(id.clone(), entry);
        }
        file.devices = devices;
        self.store.save(&file)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            error!(error = %e, "failed to persist device status");
        }
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return false;
                }
                std::thread::sleep(WAIT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "wait on device process failed");
                return true;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) -> bool {
    // No graceful signal on this platform; go straight to kill.
    child.kill().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridsim_core::models::MeasurementSample;
    use gridsim_core::sink::SqliteSink;
    use gridsim_core::status::{StatusFile, STATUS_FILE};
    use tempfile::tempdir;

    fn test_supervisor(dir: &std::path::Path) -> (DeviceSupervisor, Arc<SqliteSink>) {
        let mut config = SupervisorConfig::new(dir);
        // A stand-in worker that just idles until signalled.
        config.worker_program = PathBuf::from("sleep");
        config.worker_args = vec!["30".to_string()];
        config.term_grace = Duration::from_millis(500);
        config.kill_grace = Duration::from_millis(500);
        let store = StatusStore::new(dir.join(STATUS_FILE));
        let sink = Arc::new(SqliteSink::in_memory().unwrap());
        (
            DeviceSupervisor::new(config, store, sink.clone()),
            sink,
        )
    }

    fn sample(device_id: &str) -> MeasurementSample {
        MeasurementSample {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            voltage: 230.0,
            current: 10.0,
            power: 2300.0,
            kwh: 0.0,
        }
    }

    #[test]
    fn ids_increase_per_type_without_collisions() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());

        assert_eq!(sup.add_device(DeviceType::Pv), "pv001");
        assert_eq!(sup.add_device(DeviceType::Pv), "pv002");
        assert_eq!(sup.add_device(DeviceType::HeatPump), "heatpump001");
        assert_eq!(sup.add_device(DeviceType::MainGrid), "maingrid001");
        assert_eq!(sup.add_device(DeviceType::Pv), "pv003");
    }

    #[test]
    fn counters_survive_a_supervisor_restart() {
        let dir = tempdir().unwrap();
        {
            let (mut sup, _sink) = test_supervisor(dir.path());
            sup.add_device(DeviceType::Pv);
            sup.add_device(DeviceType::Pv);
        }
        let (mut sup, _sink) = test_supervisor(dir.path());
        sup.reconcile_on_startup().unwrap();
        assert_eq!(sup.add_device(DeviceType::Pv), "pv003");
    }

    #[test]
    fn legacy_counter_keys_migrate_on_reconcile() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path().join(STATUS_FILE));
        let mut file = StatusFile::default();
        file.counters.insert("PV".into(), 5);
        store.save(&file).unwrap();

        let (mut sup, _sink) = test_supervisor(dir.path());
        sup.reconcile_on_startup().unwrap();
        assert_eq!(sup.add_device(DeviceType::Pv), "pv006");
    }

    #[test]
    fn reconcile_rewrites_active_records_to_stopped() {
        let dir = tempdir().unwrap();
        {
            let (mut sup, _sink) = test_supervisor(dir.path());
            let id = sup.add_device(DeviceType::HeatPump);
            // Simulate a crash while active: persist the record as active
            // without going through stop_device.
            sup.records.get_mut(&id).unwrap().status = DeviceStatus::Active;
            sup.persist().unwrap();
        }

        let (mut sup, _sink) = test_supervisor(dir.path());
        sup.reconcile_on_startup().unwrap();
        let view = sup.get_status("heatpump001").unwrap();
        assert_eq!(view.status, DeviceStatus::Stopped);

        // The correction is persisted, not just in memory.
        let store = StatusStore::new(dir.path().join(STATUS_FILE));
        let file = store.load().unwrap();
        assert_eq!(file.devices["heatpump001"].status, DeviceStatus::Stopped);
    }

    #[test]
    fn stop_is_idempotent_for_never_started_devices() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        let id = sup.add_device(DeviceType::Pv);

        assert!(!sup.stop_device(&id));
        assert!(!sup.stop_device(&id));
        assert_eq!(sup.get_status(&id).unwrap().status, DeviceStatus::Stopped);

        // Unknown ids do not panic either.
        assert!(!sup.stop_device("pv999"));
    }

    #[test]
    fn start_of_unknown_prefix_fails() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        assert!(!sup.start_device("toaster001"));
    }

    #[test]
    fn spawn_failure_leaves_record_stopped() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        sup.config.worker_program = dir.path().join("does-not-exist");
        let id = sup.add_device(DeviceType::Pv);

        assert!(!sup.start_device(&id));
        assert_eq!(sup.get_status(&id).unwrap().status, DeviceStatus::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn start_twice_returns_true_then_false() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        let id = sup.add_device(DeviceType::Pv);

        assert!(sup.start_device(&id));
        assert_eq!(sup.get_status(&id).unwrap().status, DeviceStatus::Active);
        assert!(!sup.start_device(&id));

        assert!(sup.stop_device(&id));
        assert_eq!(sup.get_status(&id).unwrap().status, DeviceStatus::Stopped);

        // After a stop the device can start again.
        assert!(sup.start_device(&id));
        sup.cleanup();
    }

    #[cfg(unix)]
    #[test]
    fn delete_stops_the_worker_and_purges_samples() {
        let dir = tempdir().unwrap();
        let (mut sup, sink) = test_supervisor(dir.path());
        let id = sup.add_device(DeviceType::MainGrid);

        sink.insert(&sample(&id)).unwrap();
        sink.insert(&sample(&id)).unwrap();
        assert_eq!(sink.measurement_count(Some(&id)).unwrap(), 2);

        assert!(sup.start_device(&id));
        assert!(sup.delete_device(&id));

        assert!(sup.get_status(&id).is_none());
        assert!(sup.handles.is_empty());
        assert_eq!(sink.measurement_count(Some(&id)).unwrap(), 0);

        // Deleting again is a no-op success.
        assert!(sup.delete_device(&id));
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_stops_every_tracked_device() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        let a = sup.add_device(DeviceType::Pv);
        let b = sup.add_device(DeviceType::HeatPump);
        assert!(sup.start_device(&a));
        assert!(sup.start_device(&b));

        sup.cleanup();
        assert!(sup.handles.is_empty());
        assert_eq!(sup.get_status(&a).unwrap().status, DeviceStatus::Stopped);
        assert_eq!(sup.get_status(&b).unwrap().status, DeviceStatus::Stopped);
    }

    #[test]
    fn persist_preserves_worker_written_registration_fields() {
        let dir = tempdir().unwrap();
        let (mut sup, _sink) = test_supervisor(dir.path());
        let id = sup.add_device(DeviceType::Pv);

        // A worker process records its registration between supervisor writes.
        let store = StatusStore::new(dir.path().join(STATUS_FILE));
        store
            .mark_registered(&id, "iot_sim_pv001", "2026-02-01T08:00:00+00:00")
            .unwrap();

        sup.stop_device(&id);

        let file = store.load().unwrap();
        assert_eq!(file.devices[&id].cumulocity_registered, Some(true));
        assert_eq!(
            file.devices[&id].cumulocity_device_name.as_deref(),
            Some("iot_sim_pv001")
        );
    }
}
