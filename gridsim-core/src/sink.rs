//! Measurement persistence.
//!
//! The sink is an external collaborator from the core's point of view: the
//! trait is what the supervisor and the workers program against, and the
//! SQLite implementation is the embedded default (schema matches the
//! original simulator's `measurements` table).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StoreError;
use crate::models::MeasurementSample;

pub const MEASUREMENTS_DB_FILE: &str = "measurements.db";

/// Append-only store of measurement samples.
pub trait MeasurementSink: Send + Sync {
    fn insert(&self, sample: &MeasurementSample) -> Result<(), StoreError>;

    /// Most recent sample for a device, ordered by timestamp then insert
    /// order. This anchors the cumulative-energy computation.
    fn last_sample(&self, device_id: &str) -> Result<Option<MeasurementSample>, StoreError>;

    /// Newest-first page of samples, optionally filtered by device.
    fn recent(
        &self,
        device_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MeasurementSample>, StoreError>;

    fn measurement_count(&self, device_id: Option<&str>) -> Result<u64, StoreError>;

    /// Count of distinct devices that have stored at least one sample.
    fn device_count(&self) -> Result<u64, StoreError>;

    /// Delete every sample for a device; returns how many rows went away.
    fn purge_device(&self, device_id: &str) -> Result<u64, StoreError>;
}

/// SQLite-backed sink. A single connection behind a mutex is plenty for the
/// one-writer-per-process access pattern.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        debug!(path = %path.display(), "measurement sink ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory sink for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                voltage REAL NOT NULL,
                current REAL NOT NULL,
                power REAL NOT NULL,
                kwh REAL NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_device_timestamp
             ON measurements(device_id, timestamp)",
            [],
        )?;
        Ok(())
    }
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> Result<MeasurementSample, rusqlite::Error> {
    let timestamp: String = row.get(1)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(MeasurementSample {
        device_id: row.get(0)?,
        timestamp,
        voltage: row.get(2)?,
        current: row.get(3)?,
        power: row.get(4)?,
        kwh: row.get(5)?,
    })
}

const SAMPLE_COLUMNS: &str = "device_id, timestamp, voltage, current, power, kwh";

impl MeasurementSink for SqliteSink {
    fn insert(&self, sample: &MeasurementSample) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO measurements (device_id, timestamp, voltage, current, power, kwh)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.device_id,
                sample.timestamp.to_rfc3339(),
                sample.voltage,
                sample.current,
                sample.power,
                sample.kwh
            ],
        )?;
        Ok(())
    }

    fn last_sample(&self, device_id: &str) -> Result<Option<MeasurementSample>, StoreError> {
        let conn = self.conn.lock();
        let sample = conn
            .query_row(
                &format!(
                    "SELECT {SAMPLE_COLUMNS} FROM measurements
                     WHERE device_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1"
                ),
                params![device_id],
                row_to_sample,
            )
            .optional()?;
        Ok(sample)
    }

    fn recent(
        &self,
        device_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MeasurementSample>, StoreError> {
        let conn = self.conn.lock();
        let mut samples = Vec::new();
        match device_id {
            Some(id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SAMPLE_COLUMNS} FROM measurements
                     WHERE device_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![id, limit as i64, offset as i64], row_to_sample)?;
                for row in rows {
                    samples.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SAMPLE_COLUMNS} FROM measurements
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_sample)?;
                for row in rows {
                    samples.push(row?);
                }
            }
        }
        Ok(samples)
    }

    fn measurement_count(&self, device_id: Option<&str>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = match device_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM measurements WHERE device_id = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    fn device_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(DISTINCT device_id) FROM measurements",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn purge_device(&self, device_id: &str) -> Result<u64, StoreError> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM measurements WHERE device_id = ?1",
            params![device_id],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(device_id: &str, at: DateTime<Utc>, kwh: f64) -> MeasurementSample {
        MeasurementSample {
            device_id: device_id.to_string(),
            timestamp: at,
            voltage: 230.0,
            current: 10.0,
            power: 2300.0,
            kwh,
        }
    }

    #[test]
    fn insert_and_read_back() {
        let sink = SqliteSink::in_memory().unwrap();
        let at = Utc::now();
        sink.insert(&sample("pv001", at, 0.0)).unwrap();

        let got = sink.last_sample("pv001").unwrap().unwrap();
        assert_eq!(got.device_id, "pv001");
        assert_eq!(got.power, 2300.0);
        assert_eq!(got.kwh, 0.0);
        assert!((got.timestamp - at).num_milliseconds().abs() < 1000);
    }

    #[test]
    fn last_sample_is_newest() {
        let sink = SqliteSink::in_memory().unwrap();
        let start = Utc::now();
        for i in 0..5 {
            sink.insert(&sample("pv001", start + Duration::seconds(i), i as f64 * 0.01))
                .unwrap();
        }
        let last = sink.last_sample("pv001").unwrap().unwrap();
        assert_eq!(last.kwh, 0.04);
    }

    #[test]
    fn last_sample_for_unknown_device_is_none() {
        let sink = SqliteSink::in_memory().unwrap();
        assert!(sink.last_sample("pv999").unwrap().is_none());
    }

    #[test]
    fn counts_and_purge() {
        let sink = SqliteSink::in_memory().unwrap();
        let now = Utc::now();
        for i in 0..3 {
            sink.insert(&sample("pv001", now + Duration::seconds(i), 0.0))
                .unwrap();
        }
        sink.insert(&sample("heatpump001", now, 0.0)).unwrap();

        assert_eq!(sink.measurement_count(Some("pv001")).unwrap(), 3);
        assert_eq!(sink.measurement_count(None).unwrap(), 4);
        assert_eq!(sink.device_count().unwrap(), 2);

        assert_eq!(sink.purge_device("pv001").unwrap(), 3);
        assert_eq!(sink.measurement_count(Some("pv001")).unwrap(), 0);
        assert_eq!(sink.measurement_count(None).unwrap(), 1);
    }

    #[test]
    fn recent_pages_newest_first() {
        let sink = SqliteSink::in_memory().unwrap();
        let start = Utc::now();
        for i in 0..10 {
            sink.insert(&sample("pv001", start + Duration::seconds(i), i as f64))
                .unwrap();
        }
        let page = sink.recent(Some("pv001"), 3, 0).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].kwh, 9.0);
        assert_eq!(page[2].kwh, 7.0);

        let next = sink.recent(Some("pv001"), 3, 3).unwrap();
        assert_eq!(next[0].kwh, 6.0);
    }
}
