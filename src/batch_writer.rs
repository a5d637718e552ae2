//! Batch writer - the single consumer of the ingestion queue
//!
//! Every reading taken off the queue goes two ways:
//! 1. into the speed-layer aggregation buffer
//! 2. serialized into the in-memory batch buffer
//!
//! The batch buffer is written to the archive as a new `batch_<ms>.jsonl`
//! object once it holds `batch_size` lines or `flush_interval` has elapsed
//! since the last successful flush. A failed write keeps the buffer for the
//! next attempt. After each successful flush only the newest `retention`
//! batch files are kept in the incoming directory.

use crate::aggregation::AggregationBuffer;
use crate::error::StoreError;
use crate::queue::{Dequeued, IngestionReceiver};
use crate::storage::{join_path, ArchiveStore};
use crate::types::Reading;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const BATCH_PREFIX: &str = "batch_";
const BATCH_SUFFIX: &str = ".jsonl";

/// Parse the millisecond stamp out of a `batch_<ms>.jsonl` name
pub fn batch_file_millis(name: &str) -> Option<i64> {
    name.strip_prefix(BATCH_PREFIX)?
        .strip_suffix(BATCH_SUFFIX)?
        .parse()
        .ok()
}

pub struct BatchWriter {
    archive: Arc<dyn ArchiveStore>,
    incoming_dir: String,
    aggregation: Arc<AggregationBuffer>,

    buffer: Vec<String>,
    last_flush: Instant,
    last_name_ms: i64,

    batch_size: usize,
    flush_interval: Duration,
    retention: usize,
}

impl BatchWriter {
    pub fn new(
        archive: Arc<dyn ArchiveStore>,
        incoming_dir: impl Into<String>,
        aggregation: Arc<AggregationBuffer>,
        batch_size: usize,
        flush_interval: Duration,
        retention: usize,
    ) -> Self {
        Self {
            archive,
            incoming_dir: incoming_dir.into(),
            aggregation,
            buffer: Vec::with_capacity(batch_size),
            last_flush: Instant::now(),
            last_name_ms: 0,
            batch_size,
            flush_interval,
            retention,
        }
    }

    /// Lines waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Route one reading to both layers
    pub fn ingest(&mut self, reading: Reading) {
        log::debug!("[{}] -> {}: {}", reading.source, reading.sensor_id, reading.value);

        self.aggregation.push(reading.sensor_id, reading.value);

        match reading.to_batch_line() {
            Ok(line) => self.buffer.push(line),
            Err(e) => log::warn!("⚠️  Failed to serialize reading for {}: {}", reading.sensor_id, e),
        }
    }

    /// Wait for one reading, then take everything already queued
    ///
    /// Returns true once the queue is closed and empty.
    pub async fn drain_cycle(&mut self, rx: &mut IngestionReceiver) -> bool {
        match rx.dequeue().await {
            Dequeued::Reading(reading) => {
                self.ingest(reading);

                let mut ready = Vec::new();
                let closed = rx.drain_ready(&mut ready);
                for reading in ready {
                    self.ingest(reading);
                }
                closed
            }
            Dequeued::Idle => false,
            Dequeued::Closed => true,
        }
    }

    /// Non-empty and either full or overdue
    pub fn should_flush(&self) -> bool {
        !self.buffer.is_empty()
            && (self.buffer.len() >= self.batch_size || self.last_flush.elapsed() >= self.flush_interval)
    }

    /// Unique, strictly increasing batch name
    fn next_batch_name(&mut self) -> String {
        let ms = Utc::now().timestamp_millis().max(self.last_name_ms + 1);
        self.last_name_ms = ms;
        format!("{}{}{}", BATCH_PREFIX, ms, BATCH_SUFFIX)
    }

    /// Write the buffer as a new batch file
    ///
    /// Returns the archive path written, or `None` when the buffer was empty.
    /// On error the buffer is left untouched.
    pub async fn flush(&mut self) -> Result<Option<String>, StoreError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let name = self.next_batch_name();
        let path = join_path(&self.incoming_dir, &name);

        let mut body = self.buffer.join("\n");
        body.push('\n');

        self.archive.write(&path, body.as_bytes(), false).await?;

        log::info!("💾 Batch saved: {} ({} lines)", name, self.buffer.len());
        self.buffer.clear();
        self.last_flush = Instant::now();

        self.trim_retention().await;
        Ok(Some(path))
    }

    /// Delete all but the newest `retention` batch files; returns how many went
    pub async fn trim_retention(&self) -> usize {
        let names = match self.archive.list(&self.incoming_dir).await {
            Ok(names) => names,
            Err(e) => {
                log::error!("❌ Failed to list {} for retention: {}", self.incoming_dir, e);
                return 0;
            }
        };

        let mut batches: Vec<(i64, String)> = names
            .into_iter()
            .filter_map(|name| batch_file_millis(&name).map(|ms| (ms, name)))
            .collect();
        if batches.len() <= self.retention {
            return 0;
        }
        batches.sort();

        let excess = batches.len() - self.retention;
        let mut deleted = 0;
        for (_, name) in batches.into_iter().take(excess) {
            let path = join_path(&self.incoming_dir, &name);
            match self.archive.delete(&path).await {
                Ok(_) => {
                    deleted += 1;
                    log::info!("🗑️  Removed old batch: {}", name);
                }
                Err(e) => log::warn!("⚠️  Could not remove {}: {}", name, e),
            }
        }
        deleted
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            log::error!("❌ Batch write failed ({} lines kept): {}", self.buffer.len(), e);
        }
    }

    /// Consume the queue until every producer is gone, then flush what is left
    pub async fn run(mut self, mut rx: IngestionReceiver) {
        log::info!("🚀 Starting batch writer");
        log::info!("   ├─ Target: {} ({})", self.incoming_dir, self.archive.backend_type());
        log::info!("   ├─ Batch size: {} | flush interval: {}s", self.batch_size, self.flush_interval.as_secs());
        log::info!("   └─ Retention: {} files", self.retention);

        let capacity = rx.capacity().max(1);
        let mut last_usage_log = Instant::now();

        loop {
            let closed = self.drain_cycle(&mut rx).await;

            if self.should_flush() {
                self.flush_logged().await;
            }

            if last_usage_log.elapsed() >= Duration::from_secs(60) {
                let usage = rx.len();
                log::info!(
                    "📊 Queue: {}/{} | buffered: {} | dropped: {}",
                    usage,
                    capacity,
                    self.buffer.len(),
                    rx.dropped()
                );
                if usage > capacity / 2 {
                    log::warn!("⚠️  Queue usage high: {}/{} ({}%)", usage, capacity, (usage * 100) / capacity);
                }
                last_usage_log = Instant::now();
            }

            if closed {
                log::warn!("⚠️  Ingestion queue closed, stopping batch writer");
                log::info!("🔄 Performing final flush...");
                self.flush_logged().await;
                break;
            }
        }

        log::info!("✅ Batch writer stopped");
    }
}
