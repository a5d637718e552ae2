//! Speed layer: per-sensor window aggregation, filtering and low-latency writes
//!
//! Every window the buffer is swapped out under its lock, averaged per sensor
//! and each mean is classified against the current model:
//! - clean → written to the speed store at the window timestamp
//! - anomalous (or sensor missing from the model) → discard counter + 1
//!
//! Until a model has been loaded the buffer is dropped wholesale, without
//! writing and without counting, so the speed layer stays empty during
//! calibration.

use crate::discard::DiscardAccounting;
use crate::model::{ModelManager, Verdict};
use crate::storage::SpeedStore;
use crate::types::SensorId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

const WAITING_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Values collected for each sensor during the current window
#[derive(Debug, Default)]
pub struct AggregationBuffer {
    values: Mutex<HashMap<SensorId, Vec<f64>>>,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<SensorId, Vec<f64>>> {
        match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, sensor: SensorId, value: f64) {
        self.guard().entry(sensor).or_default().push(value);
    }

    /// Swap the buffer out, leaving an empty one in place
    pub fn take(&self) -> HashMap<SensorId, Vec<f64>> {
        std::mem::take(&mut *self.guard())
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Number of buffered values across all sensors
    pub fn len(&self) -> usize {
        self.guard().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arithmetic mean per sensor; sensors without values are left out
pub fn window_means(window: &HashMap<SensorId, Vec<f64>>) -> Vec<(SensorId, f64)> {
    let mut means: Vec<(SensorId, f64)> = window
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(sensor, values)| (*sensor, values.iter().sum::<f64>() / values.len() as f64))
        .collect();
    means.sort_by_key(|(sensor, _)| *sensor);
    means
}

/// What one window produced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowReport {
    pub written: usize,
    pub discarded: usize,
    /// Values dropped because no model was loaded yet
    pub dropped_uncalibrated: usize,
    pub write_failures: usize,
}

pub struct SpeedLayerWriter {
    buffer: Arc<AggregationBuffer>,
    model: Arc<ModelManager>,
    discards: Arc<DiscardAccounting>,
    store: Arc<dyn SpeedStore>,
    last_waiting_log: Option<Instant>,
}

impl SpeedLayerWriter {
    pub fn new(
        buffer: Arc<AggregationBuffer>,
        model: Arc<ModelManager>,
        discards: Arc<DiscardAccounting>,
        store: Arc<dyn SpeedStore>,
    ) -> Self {
        Self {
            buffer,
            model,
            discards,
            store,
            last_waiting_log: None,
        }
    }

    /// Close the current window and process it
    pub async fn run_window(&mut self, window_ts: DateTime<Utc>) -> WindowReport {
        let mut report = WindowReport::default();

        // One model version for the whole window
        let Some(model) = self.model.snapshot() else {
            let dropped = self.buffer.take();
            report.dropped_uncalibrated = dropped.values().map(Vec::len).sum();

            let due = self
                .last_waiting_log
                .map_or(true, |at| at.elapsed() >= WAITING_LOG_INTERVAL);
            if due {
                log::info!("⏳ Waiting for filter model (calibration), speed layer paused");
                self.last_waiting_log = Some(Instant::now());
            }
            return report;
        };

        let window = self.buffer.take();
        if window.is_empty() {
            return report;
        }

        for (sensor, mean) in window_means(&window) {
            match model.classify(sensor, mean) {
                Verdict::Clean => match self.store.insert(sensor, window_ts, mean).await {
                    Ok(()) => report.written += 1,
                    Err(e) => {
                        report.write_failures += 1;
                        log::error!("❌ Speed layer write failed for {}: {}", sensor, e);
                    }
                },
                Verdict::Anomalous | Verdict::Unmodeled => {
                    self.discards.increment();
                    report.discarded += 1;
                    log::info!("⚠️  Anomaly discarded (speed layer): {} - {:.2}", sensor, mean);
                }
            }
        }

        report
    }

    /// Run forever, closing a window every `window`
    pub async fn run(mut self, window: Duration) {
        log::info!("🚀 Starting speed layer aggregation (window: {}ms)", window.as_millis());

        let mut timer = interval(window);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            let report = self.run_window(Utc::now()).await;
            if report.written > 0 || report.discarded > 0 {
                log::debug!(
                    "Window closed: {} written, {} discarded, {} failed",
                    report.written,
                    report.discarded,
                    report.write_failures
                );
            }
        }
    }
}
