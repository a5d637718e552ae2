use super::SpeedStore;
use crate::error::StoreError;
use crate::types::{SensorId, SpeedPoint};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite implementation of the speed layer
///
/// One row per (sensor, window timestamp). The primary key clusters rows by
/// sensor then time, so "latest N for a sensor" is an index range scan.
pub struct SqliteSpeedStore {
    conn: Mutex<Connection>,
}

impl SqliteSpeedStore {
    /// Open (or create) the database and its schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;

        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        log::debug!("SQLite journal_mode={}", mode);

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sensor_data (
                sensor_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                temp REAL NOT NULL,
                PRIMARY KEY (sensor_id, timestamp)
            ) WITHOUT ROWID;",
        )?;

        log::info!("✅ Speed layer database initialized with WAL mode");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn row_to_point(sensor: SensorId, row: &Row<'_>) -> rusqlite::Result<SpeedPoint> {
        let millis: i64 = row.get(0)?;
        let value: f64 = row.get(1)?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, millis))?;

        Ok(SpeedPoint {
            sensor_id: sensor,
            timestamp,
            value,
        })
    }
}

#[async_trait]
impl SpeedStore for SqliteSpeedStore {
    async fn insert(
        &self,
        sensor: SensorId,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sensor_data (sensor_id, timestamp, temp) VALUES (?1, ?2, ?3)",
            params![sensor.as_str(), timestamp.timestamp_millis(), value],
        )?;
        Ok(())
    }

    async fn query_latest(&self, sensor: SensorId, limit: usize) -> Result<Vec<SpeedPoint>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, temp FROM sensor_data
             WHERE sensor_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let points = stmt
            .query_map(params![sensor.as_str(), limit], |row| Self::row_to_point(sensor, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    async fn query_range(
        &self,
        sensor: SensorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SpeedPoint>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, temp FROM sensor_data
             WHERE sensor_id = ?1 AND timestamp BETWEEN ?2 AND ?3
             ORDER BY timestamp ASC",
        )?;

        let points = stmt
            .query_map(
                params![sensor.as_str(), start.timestamp_millis(), end.timestamp_millis()],
                |row| Self::row_to_point(sensor, row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_query_latest() {
        let dir = tempdir().unwrap();
        let store = SqliteSpeedStore::open(dir.path().join("speed.db")).unwrap();

        for i in 0..5 {
            store.insert(SensorId::A1, ts(i), 100.0 + i as f64).await.unwrap();
        }
        store.insert(SensorId::B1, ts(10), 2000.0).await.unwrap();

        let latest = store.query_latest(SensorId::A1, 3).await.unwrap();
        let values: Vec<f64> = latest.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![104.0, 103.0, 102.0]);
        assert!(latest.iter().all(|p| p.sensor_id == SensorId::A1));

        assert_eq!(store.query_latest(SensorId::B1, 10).await.unwrap().len(), 1);
        assert!(store.query_latest(SensorId::C1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_range_is_inclusive_and_ascending() {
        let dir = tempdir().unwrap();
        let store = SqliteSpeedStore::open(dir.path().join("speed.db")).unwrap();

        for i in 0..10 {
            store.insert(SensorId::C1, ts(i), i as f64).await.unwrap();
        }

        let points = store.query_range(SensorId::C1, ts(3), ts(6)).await.unwrap();
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(points[0].timestamp, ts(3));
        assert_eq!(points[3].timestamp - points[0].timestamp, Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_same_window_timestamp_replaces() {
        let dir = tempdir().unwrap();
        let store = SqliteSpeedStore::open(dir.path().join("nested/dir/speed.db")).unwrap();

        store.insert(SensorId::A1, ts(0), 1.0).await.unwrap();
        store.insert(SensorId::A1, ts(0), 2.0).await.unwrap();

        let latest = store.query_latest(SensorId::A1, 10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 2.0);
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("speed.db");
        let _store = SqliteSpeedStore::open(&db_path).unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }
}
