//! Discard accounting: how many window aggregates the filter rejected
//!
//! Rejections accumulate in memory and are merged into the durable stats file
//! on a fixed interval with a read-modify-write. The in-memory delta is only
//! reduced after the write succeeded, so a failed or interrupted flush retries
//! the same delta instead of losing or double-applying it.
//!
//! Durable schema (dual generation):
//!
//! ```json
//! {"previous": 120, "current": 7}
//! ```
//!
//! `current` counts rejections since the last rotation; `previous` everything
//! before it. A rotation is requested by the offline trainer dropping a
//! trigger file; the ingestion side folds `current` into `previous`, starts
//! `current` from the rejections not yet flushed and deletes the trigger. Legacy `{"total": n}` files are read as
//! `{"previous": 0, "current": n}`.

use crate::error::StoreError;
use crate::storage::ArchiveStore;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardStats {
    #[serde(default)]
    pub previous: u64,
    #[serde(default, alias = "total")]
    pub current: u64,
}

impl DiscardStats {
    pub fn total(&self) -> u64 {
        self.previous + self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending
    Skipped,
    /// Delta merged; carries the new durable state
    Flushed { delta: u64, stats: DiscardStats },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// No trigger present
    NotRequested,
    Rotated(DiscardStats),
}

pub struct DiscardAccounting {
    delta: Mutex<u64>,
    stats_path: String,
    trigger_path: String,
}

impl DiscardAccounting {
    pub fn new(stats_path: impl Into<String>, trigger_path: impl Into<String>) -> Self {
        Self {
            delta: Mutex::new(0),
            stats_path: stats_path.into(),
            trigger_path: trigger_path.into(),
        }
    }

    fn delta_guard(&self) -> MutexGuard<'_, u64> {
        match self.delta.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one rejected aggregate
    pub fn increment(&self) {
        *self.delta_guard() += 1;
    }

    /// Rejections not yet merged into the durable record
    pub fn pending(&self) -> u64 {
        *self.delta_guard()
    }

    /// Write a zeroed stats file if none exists yet
    pub async fn initialize(&self, archive: &dyn ArchiveStore) -> Result<bool, StoreError> {
        if archive.exists(&self.stats_path).await? {
            return Ok(false);
        }
        let body = serde_json::to_vec(&DiscardStats::default())?;
        archive.write(&self.stats_path, &body, true).await?;
        log::info!("📝 Initialized discard stats at {}", self.stats_path);
        Ok(true)
    }

    /// Read the durable stats
    ///
    /// Absent file → zero. Empty or corrupt content → zero (fresh start),
    /// logged. Transport errors are returned so the caller keeps its delta.
    pub async fn load(&self, archive: &dyn ArchiveStore) -> Result<DiscardStats, StoreError> {
        if !archive.exists(&self.stats_path).await? {
            return Ok(DiscardStats::default());
        }

        let bytes = match archive.read(&self.stats_path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(DiscardStats::default()),
            Err(e) => return Err(e),
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(DiscardStats::default());
        }

        match serde_json::from_slice::<DiscardStats>(&bytes) {
            Ok(stats) => Ok(stats),
            Err(e) => {
                log::warn!(
                    "⚠️  Discard stats at {} are corrupt ({}), starting from zero",
                    self.stats_path,
                    e
                );
                Ok(DiscardStats::default())
            }
        }
    }

    async fn store(&self, archive: &dyn ArchiveStore, stats: &DiscardStats) -> Result<(), StoreError> {
        let body = serde_json::to_vec(stats)?;
        archive.write(&self.stats_path, &body, true).await
    }

    /// Merge the pending delta into the durable `current` generation
    pub async fn flush(&self, archive: &dyn ArchiveStore) -> Result<FlushOutcome, StoreError> {
        let delta = self.pending();
        if delta == 0 {
            return Ok(FlushOutcome::Skipped);
        }

        let mut stats = self.load(archive).await?;
        stats.current += delta;
        self.store(archive, &stats).await?;

        // Increments that landed during the write stay pending
        *self.delta_guard() -= delta;

        log::info!("📊 Discard stats flushed: +{} → {:?}", delta, stats);
        Ok(FlushOutcome::Flushed { delta, stats })
    }

    /// Roll generations if the trigger file is present
    ///
    /// Rejections still pending in memory belong to the new generation and
    /// become its starting `current` in the same write.
    pub async fn rotate_if_requested(&self, archive: &dyn ArchiveStore) -> Result<RotateOutcome, StoreError> {
        if !archive.exists(&self.trigger_path).await? {
            return Ok(RotateOutcome::NotRequested);
        }

        log::info!("🔁 Rotate trigger found at {}", self.trigger_path);

        let delta = self.pending();
        let old = self.load(archive).await?;
        let rotated = DiscardStats {
            previous: old.previous + old.current,
            current: delta,
        };
        self.store(archive, &rotated).await?;
        *self.delta_guard() -= delta;

        log::info!("✅ Discard generations rotated: {:?} → {:?}", old, rotated);

        match archive.delete(&self.trigger_path).await {
            Ok(_) => log::info!("🗑️  Rotate trigger removed"),
            Err(e) => log::error!("❌ Failed to remove rotate trigger {}: {}", self.trigger_path, e),
        }

        Ok(RotateOutcome::Rotated(rotated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalArchive;
    use crate::test_support::FlakyArchive;
    use tempfile::tempdir;

    const STATS: &str = "/models/discard_stats.json";
    const TRIGGER: &str = "/models/rotate_trigger";

    async fn read_stats(archive: &dyn ArchiveStore) -> serde_json::Value {
        serde_json::from_slice(&archive.read(STATS).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_first_flush_without_file() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let discards = DiscardAccounting::new(STATS, TRIGGER);

        for _ in 0..3 {
            discards.increment();
        }

        let outcome = discards.flush(&archive).await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                delta: 3,
                stats: DiscardStats { previous: 0, current: 3 }
            }
        );
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 0, "current": 3}));
        assert_eq!(discards.pending(), 0);

        // Nothing pending → no write
        assert_eq!(discards.flush(&archive).await.unwrap(), FlushOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_failed_write_retains_delta_and_is_not_double_applied() {
        let dir = tempdir().unwrap();
        let archive = FlakyArchive::new(dir.path());
        let discards = DiscardAccounting::new(STATS, TRIGGER);

        archive.write(STATS, br#"{"previous": 10, "current": 5}"#, true).await.unwrap();

        discards.increment();
        discards.increment();
        archive.set_failing(true);
        assert!(discards.flush(&archive).await.is_err());
        assert_eq!(discards.pending(), 2);

        // One more rejection arrives while the archive is down
        discards.increment();

        archive.set_failing(false);
        discards.flush(&archive).await.unwrap();
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 10, "current": 8}));
        assert_eq!(discards.pending(), 0);
    }

    #[tokio::test]
    async fn test_legacy_and_corrupt_files() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let discards = DiscardAccounting::new(STATS, TRIGGER);

        archive.write(STATS, br#"{"total": 41}"#, true).await.unwrap();
        assert_eq!(discards.load(&archive).await.unwrap(), DiscardStats { previous: 0, current: 41 });

        archive.write(STATS, b"{not json", true).await.unwrap();
        assert_eq!(discards.load(&archive).await.unwrap(), DiscardStats::default());

        discards.increment();
        discards.flush(&archive).await.unwrap();
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 0, "current": 1}));
    }

    #[tokio::test]
    async fn test_rotation_starts_new_generation_with_pending() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let discards = DiscardAccounting::new(STATS, TRIGGER);

        assert!(discards.initialize(&archive).await.unwrap());
        assert!(!discards.initialize(&archive).await.unwrap());
        assert_eq!(discards.rotate_if_requested(&archive).await.unwrap(), RotateOutcome::NotRequested);

        archive.write(STATS, br#"{"previous": 4, "current": 6}"#, true).await.unwrap();
        archive.write(TRIGGER, b"", true).await.unwrap();
        discards.increment();

        let outcome = discards.rotate_if_requested(&archive).await.unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated(DiscardStats { previous: 10, current: 1 }));
        assert!(!archive.exists(TRIGGER).await.unwrap());
        assert_eq!(discards.pending(), 0);
        assert_eq!(discards.load(&archive).await.unwrap().total(), 11);
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_trigger_and_delta() {
        // Test: a rotation whose write fails is retried whole, without double counting
        let dir = tempdir().unwrap();
        let archive = FlakyArchive::new(dir.path());
        let discards = DiscardAccounting::new(STATS, TRIGGER);

        archive.write(STATS, br#"{"previous": 4, "current": 6}"#, true).await.unwrap();
        archive.write(TRIGGER, b"", true).await.unwrap();
        discards.increment();
        discards.increment();

        archive.set_failing(true);
        assert!(discards.rotate_if_requested(&archive).await.is_err());
        assert_eq!(discards.pending(), 2);
        assert!(archive.exists(TRIGGER).await.unwrap());
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 4, "current": 6}));

        archive.set_failing(false);
        let outcome = discards.rotate_if_requested(&archive).await.unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated(DiscardStats { previous: 10, current: 2 }));
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 10, "current": 2}));
        assert_eq!(discards.pending(), 0);
        assert!(!archive.exists(TRIGGER).await.unwrap());

        // Trigger gone: a further check is a no-op
        assert_eq!(discards.rotate_if_requested(&archive).await.unwrap(), RotateOutcome::NotRequested);
        assert_eq!(read_stats(&archive).await, serde_json::json!({"previous": 10, "current": 2}));
    }
}
