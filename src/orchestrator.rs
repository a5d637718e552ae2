//! Orchestrator - wires stores, queue, feeds and background tasks together
//!
//! Startup:
//! 1. Open the speed store and the archive, retrying with a fixed delay until
//!    both answer (the archive is probed by creating its directory layout)
//! 2. Create the discard stats file if missing, try a first model load
//! 3. Spawn: batch writer, speed-layer aggregation, watchdog, maintenance
//!    (model refresh + discard flush/rotation) and one task per feed
//!
//! Shutdown closes the queue by stopping every producer, waits for the batch
//! writer's final flush and writes out pending discards.

use crate::aggregation::{AggregationBuffer, SpeedLayerWriter};
use crate::batch_writer::BatchWriter;
use crate::config::{ArchiveBackend, FeedKind, IngestConfig};
use crate::discard::{DiscardAccounting, FlushOutcome, RotateOutcome};
use crate::error::StoreError;
use crate::model::ModelManager;
use crate::queue::{ingestion_queue, IngestionSender};
use crate::retry::{MaxRetriesExceeded, RetryPolicy};
use crate::sources::{BinanceStream, CoinGeckoPoller, CoinbasePoller};
use crate::storage::{ensure_layout, ArchiveStore, LocalArchive, SpeedStore, SqliteSpeedStore, WebHdfsArchive};
use crate::watchdog::{run_watchdog, ActivityMonitor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Upper bound on waiting for the batch writer's final flush
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the configured archive client (no I/O yet)
pub fn build_archive(config: &IngestConfig) -> Result<Arc<dyn ArchiveStore>, StoreError> {
    Ok(match config.archive_backend {
        ArchiveBackend::Local => Arc::new(LocalArchive::new(&config.archive_root)),
        ArchiveBackend::WebHdfs => Arc::new(WebHdfsArchive::new(
            &config.webhdfs_url,
            &config.webhdfs_user,
            config.webhdfs_timeout,
        )?),
    })
}

/// Open the speed store, retrying until it succeeds
pub async fn connect_speed_store(
    path: &str,
    retry: &RetryPolicy,
) -> Result<Arc<dyn SpeedStore>, MaxRetriesExceeded> {
    let store = retry
        .run("speed layer", || async { SqliteSpeedStore::open(path) })
        .await?;
    Ok(Arc::new(store))
}

/// Create the archive layout, retrying until the archive answers
pub async fn prepare_archive(
    archive: &dyn ArchiveStore,
    layout: &[String],
    retry: &RetryPolicy,
) -> Result<(), MaxRetriesExceeded> {
    retry
        .run("archive", || ensure_layout(archive, layout))
        .await
}

/// Periodic model refresh and discard flush/rotation
async fn run_maintenance(
    archive: Arc<dyn ArchiveStore>,
    model: Arc<ModelManager>,
    discards: Arc<DiscardAccounting>,
    refresh_interval: Duration,
    stats_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut refresh_timer = interval(refresh_interval);
    refresh_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_timer = interval(stats_interval);
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Both were already run once at startup
    refresh_timer.tick().await;
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = refresh_timer.tick() => {
                model.refresh(archive.as_ref()).await;
            }
            _ = stats_timer.tick() => {
                flush_discards(archive.as_ref(), &discards).await;
            }
            _ = stop_rx.changed() => break,
        }
    }
}

/// One discard maintenance step: rotation if requested, else a plain flush
pub async fn flush_discards(archive: &dyn ArchiveStore, discards: &DiscardAccounting) {
    match discards.rotate_if_requested(archive).await {
        Ok(RotateOutcome::Rotated(_)) => return,
        Ok(RotateOutcome::NotRequested) => {}
        Err(e) => {
            log::error!("❌ Discard rotation failed ({} pending kept): {}", discards.pending(), e);
            return;
        }
    }

    match discards.flush(archive).await {
        Ok(FlushOutcome::Skipped) | Ok(FlushOutcome::Flushed { .. }) => {}
        Err(e) => log::error!("❌ Discard stats flush failed ({} pending kept): {}", discards.pending(), e),
    }
}

/// Stores and shared state, ready to start
pub struct Pipeline {
    config: IngestConfig,
    archive: Arc<dyn ArchiveStore>,
    speed: Arc<dyn SpeedStore>,
    model: Arc<ModelManager>,
    discards: Arc<DiscardAccounting>,
}

impl Pipeline {
    /// Wrap already-connected stores
    pub fn new(config: IngestConfig, archive: Arc<dyn ArchiveStore>, speed: Arc<dyn SpeedStore>) -> Self {
        let model = Arc::new(ModelManager::new(config.model_path.clone()));
        let discards = Arc::new(DiscardAccounting::new(
            config.discard_stats_path.clone(),
            config.rotate_trigger_path.clone(),
        ));

        Self {
            config,
            archive,
            speed,
            model,
            discards,
        }
    }

    /// Connect both stores, waiting for them as long as it takes
    pub async fn bootstrap(config: IngestConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let retry = RetryPolicy::unbounded(config.bootstrap_retry_delay);

        log::info!("🔧 Connecting speed layer ({})...", config.speed_db_path);
        let speed = connect_speed_store(&config.speed_db_path, &retry).await?;
        log::info!("✅ Speed layer ready");

        let archive = build_archive(&config)?;
        log::info!("🔧 Connecting archive ({})...", archive.backend_type());
        prepare_archive(archive.as_ref(), &config.archive_layout(), &retry).await?;
        log::info!("✅ Archive ready");

        Ok(Self::new(config, archive, speed))
    }

    pub fn model(&self) -> Arc<ModelManager> {
        self.model.clone()
    }

    fn spawn_feeds(&self, tx: &IngestionSender, monitor: &Arc<ActivityMonitor>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for feed in &self.config.sources {
            match feed {
                FeedKind::Binance => {
                    let stream = BinanceStream::new(
                        self.config.binance_ws_url.clone(),
                        tx.clone(),
                        monitor.clone(),
                        self.config.reconnect_delay,
                    );
                    handles.push(tokio::spawn(stream.run()));
                    log::info!("   ├─ Binance push stream spawned");
                }
                FeedKind::Coinbase => match CoinbasePoller::new(
                    self.config.coinbase_api_url.clone(),
                    self.config.coinbase_poll_interval,
                    self.config.coinbase_timeout,
                    tx.clone(),
                ) {
                    Ok(poller) => {
                        handles.push(tokio::spawn(poller.run()));
                        log::info!("   ├─ Coinbase poller spawned");
                    }
                    Err(e) => log::error!("❌ Coinbase poller not started: {}", e),
                },
                FeedKind::CoinGecko => match CoinGeckoPoller::new(
                    &self.config.coingecko_api_url,
                    self.config.coingecko_poll_interval,
                    self.config.coingecko_timeout,
                    tx.clone(),
                ) {
                    Ok(poller) => {
                        handles.push(tokio::spawn(poller.run()));
                        log::info!("   ├─ CoinGecko poller spawned");
                    }
                    Err(e) => log::error!("❌ CoinGecko poller not started: {}", e),
                },
            }
        }

        log::info!("   └─ {} feed(s) running", handles.len());
        handles
    }

    /// Spawn every task
    pub async fn start(self) -> RunningPipeline {
        match self.discards.initialize(self.archive.as_ref()).await {
            Ok(_) => {}
            Err(e) => log::warn!("⚠️  Could not initialize discard stats: {}", e),
        }
        self.model.refresh(self.archive.as_ref()).await;

        let (tx, rx) = ingestion_queue(
            self.config.queue_capacity,
            self.config.enqueue_timeout,
            self.config.dequeue_timeout,
        );
        log::info!("✅ Ingestion queue created (capacity: {})", self.config.queue_capacity);

        let aggregation = Arc::new(AggregationBuffer::new());
        let monitor = Arc::new(ActivityMonitor::new());

        log::info!("🚀 Spawning background tasks...");

        let writer = BatchWriter::new(
            self.archive.clone(),
            self.config.incoming_dir.clone(),
            aggregation.clone(),
            self.config.batch_size,
            self.config.batch_flush_interval,
            self.config.batch_retention,
        );
        let writer_handle = tokio::spawn(writer.run(rx));

        let speed_writer = SpeedLayerWriter::new(
            aggregation,
            self.model.clone(),
            self.discards.clone(),
            self.speed.clone(),
        );
        let aggregation_handle = tokio::spawn(speed_writer.run(self.config.aggregation_window));

        let watchdog_handle = tokio::spawn(run_watchdog(
            monitor.clone(),
            self.config.watchdog_check_interval,
            self.config.watchdog_timeout,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let maintenance_handle = tokio::spawn(run_maintenance(
            self.archive.clone(),
            self.model.clone(),
            self.discards.clone(),
            self.config.model_refresh_interval,
            self.config.stats_flush_interval,
            stop_rx,
        ));

        log::info!("🚀 Spawning feeds...");
        let feed_handles = self.spawn_feeds(&tx, &monitor);

        RunningPipeline {
            tx: Some(tx),
            feed_handles,
            writer_handle,
            aggregation_handle,
            watchdog_handle,
            maintenance_handle,
            stop_tx,
            archive: self.archive,
            model: self.model,
            discards: self.discards,
        }
    }
}

pub struct RunningPipeline {
    tx: Option<IngestionSender>,
    feed_handles: Vec<JoinHandle<()>>,
    writer_handle: JoinHandle<()>,
    aggregation_handle: JoinHandle<()>,
    watchdog_handle: JoinHandle<()>,
    maintenance_handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    archive: Arc<dyn ArchiveStore>,
    model: Arc<ModelManager>,
    discards: Arc<DiscardAccounting>,
}

impl RunningPipeline {
    /// Extra producer handle; drop it before calling [`shutdown`](Self::shutdown)
    pub fn sender(&self) -> Option<IngestionSender> {
        self.tx.clone()
    }

    pub fn model(&self) -> Arc<ModelManager> {
        self.model.clone()
    }

    pub fn discards(&self) -> Arc<DiscardAccounting> {
        self.discards.clone()
    }

    /// Stop producers, drain the queue into a last batch, persist discards
    pub async fn shutdown(mut self) {
        log::info!("🛑 Shutting down pipeline...");

        for handle in &self.feed_handles {
            handle.abort();
        }
        for handle in self.feed_handles.drain(..) {
            let _ = handle.await;
        }
        // Last producer gone: the writer sees the queue close
        self.tx.take();

        let _ = self.stop_tx.send(true);
        let _ = self.maintenance_handle.await;

        match tokio::time::timeout(FINAL_FLUSH_TIMEOUT, &mut self.writer_handle).await {
            Ok(_) => log::info!("✅ Batch writer finished"),
            Err(_) => {
                log::warn!("⚠️  Batch writer did not finish within {}s", FINAL_FLUSH_TIMEOUT.as_secs());
                self.writer_handle.abort();
            }
        }

        self.aggregation_handle.abort();
        self.watchdog_handle.abort();

        flush_discards(self.archive.as_ref(), &self.discards).await;
        log::info!("✅ Pipeline stopped");
    }
}

/// Run until CTRL+C
pub async fn run(config: IngestConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = Pipeline::bootstrap(config).await?;
    let running = pipeline.start().await;

    log::info!("🔄 Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::warn!("⚠️  Received CTRL+C, shutting down..."),
        Err(e) => log::error!("❌ Failed to listen for CTRL+C: {}", e),
    }

    running.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prepare_archive_creates_layout() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let layout = vec!["/iot-data".to_string(), "/iot-data/incoming".to_string(), "/models".to_string()];

        prepare_archive(&archive, &layout, &RetryPolicy::bounded(Duration::from_millis(1), 2))
            .await
            .unwrap();

        for dir in &layout {
            assert!(archive.exists(dir).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_speed_store_retry_gives_up_when_bounded() {
        let dir = tempdir().unwrap();
        // A regular file where the parent directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("speed.db");

        let result = connect_speed_store(
            path.to_str().unwrap(),
            &RetryPolicy::bounded(Duration::from_millis(1), 2),
        )
        .await;
        assert_eq!(result.err().map(|e| e.attempts), Some(2));
    }

    #[tokio::test]
    async fn test_flush_discards_prefers_rotation() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let discards = DiscardAccounting::new("/models/discard_stats.json", "/models/rotate_trigger");

        discards.increment();
        flush_discards(&archive, &discards).await;
        assert_eq!(discards.load(&archive).await.unwrap().current, 1);

        discards.increment();
        archive.write("/models/rotate_trigger", b"", true).await.unwrap();
        flush_discards(&archive, &discards).await;

        let stats = discards.load(&archive).await.unwrap();
        assert_eq!((stats.previous, stats.current), (1, 1));
        assert_eq!(discards.pending(), 0);
    }
}
