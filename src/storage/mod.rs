//! Storage contracts for the two layers
//!
//! - [`ArchiveStore`]: durable, append-only batch layer (HDFS-like namespace of
//!   absolute `/`-separated paths)
//! - [`SpeedStore`]: low-latency store of clean per-window aggregates
//!
//! Concrete backends:
//! - `LocalArchive` - directory tree on the local filesystem
//! - `WebHdfsArchive` - HDFS through the WebHDFS REST API
//! - `SqliteSpeedStore` - SQLite table clustered by (sensor, timestamp)

pub mod local;
pub mod speed;
pub mod webhdfs;

pub use local::LocalArchive;
pub use speed::SqliteSpeedStore;
pub use webhdfs::WebHdfsArchive;

use crate::error::StoreError;
use crate::types::{SensorId, SpeedPoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Durable archive (batch layer)
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Whether a file or directory exists at `path`
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Names (not full paths) of the entries directly under `dir`
    async fn list(&self, dir: &str) -> Result<Vec<String>, StoreError>;

    /// Write a whole object. With `overwrite == false` an existing object is an error.
    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError>;

    /// Read a whole object
    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Copy an object to a local file, replacing it
    async fn download(&self, path: &str, local_path: &Path) -> Result<(), StoreError>;

    /// Delete an object. Returns false when nothing was there.
    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    /// Create a directory and its parents
    async fn makedirs(&self, path: &str) -> Result<(), StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Low-latency store (speed layer)
#[async_trait]
pub trait SpeedStore: Send + Sync {
    async fn insert(
        &self,
        sensor: SensorId,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<(), StoreError>;

    /// Most recent points first
    async fn query_latest(&self, sensor: SensorId, limit: usize) -> Result<Vec<SpeedPoint>, StoreError>;

    /// Points with `start <= timestamp <= end`, oldest first
    async fn query_range(
        &self,
        sensor: SensorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SpeedPoint>, StoreError>;
}

/// Join an archive directory and an entry name
pub fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Create every directory in `dirs` (idempotent)
pub async fn ensure_layout(archive: &dyn ArchiveStore, dirs: &[String]) -> Result<(), StoreError> {
    for dir in dirs {
        if !archive.exists(dir).await? {
            log::info!("📁 Creating archive directory {}", dir);
            archive.makedirs(dir).await?;
        }
    }
    Ok(())
}
