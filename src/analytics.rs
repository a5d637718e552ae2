//! Offline batch-layer analytics: model training and daily summaries
//!
//! Both jobs read the archived batch files. Malformed lines are skipped.
//!
//! Training (per sensor, needs more than 4 points):
//! 1. sort the values
//! 2. Q1 = v[⌊0.25·n⌋], Q3 = v[⌊0.75·n⌋], IQR = Q3 − Q1
//! 3. keep values inside [Q1 − 1.5·IQR, Q3 + 1.5·IQR]
//! 4. with more than one value left, publish mean and sample std-dev
//!    rounded to 2 decimals

use crate::batch_writer::batch_file_millis;
use crate::error::StoreError;
use crate::model::{FilterModel, SensorStats};
use crate::storage::{join_path, ArchiveStore};
use crate::types::{BatchRecord, SensorId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Minimum points before a sensor gets a model entry (exclusive)
const MIN_TRAINING_POINTS: usize = 4;
const IQR_FENCE: f64 = 1.5;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse every well-formed record of a batch file body
pub fn parse_batch_body(body: &str) -> Vec<BatchRecord> {
    body.lines().filter_map(BatchRecord::parse_line).collect()
}

/// Read every `batch_*.jsonl` file in `dir`, oldest first
pub async fn load_batches(archive: &dyn ArchiveStore, dir: &str) -> Result<Vec<BatchRecord>, StoreError> {
    let mut files: Vec<(i64, String)> = archive
        .list(dir)
        .await?
        .into_iter()
        .filter_map(|name| batch_file_millis(&name).map(|ms| (ms, name)))
        .collect();
    files.sort();

    let mut records = Vec::new();
    for (_, name) in files {
        let bytes = archive.read(&join_path(dir, &name)).await?;
        let body = String::from_utf8_lossy(&bytes);
        let parsed = parse_batch_body(&body);
        log::debug!("Read {} records from {}", parsed.len(), name);
        records.extend(parsed);
    }
    Ok(records)
}

/// IQR-filtered mean and sample std-dev of one sensor's values
pub fn fit_sensor(mut values: Vec<f64>) -> Option<SensorStats> {
    let n = values.len();
    if n <= MIN_TRAINING_POINTS {
        return None;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let q1 = values[n / 4];
    let q3 = values[(n * 3) / 4];
    let iqr = q3 - q1;
    let lower = q1 - IQR_FENCE * iqr;
    let upper = q3 + IQR_FENCE * iqr;

    let cleaned: Vec<f64> = values.into_iter().filter(|v| lower <= *v && *v <= upper).collect();
    let kept = cleaned.len();
    if kept <= 1 {
        return None;
    }

    let mean = cleaned.iter().sum::<f64>() / kept as f64;
    let variance = cleaned.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (kept - 1) as f64;

    Some(SensorStats::new(round2(mean), round2(variance.sqrt())))
}

/// Train a filter model from archived records
pub fn train_model(records: &[BatchRecord]) -> FilterModel {
    let mut by_sensor: HashMap<SensorId, Vec<f64>> = HashMap::new();
    for record in records {
        if let Some(sensor) = record.sensor() {
            by_sensor.entry(sensor).or_default().push(record.temp);
        }
    }

    let sensors = by_sensor
        .into_iter()
        .filter_map(|(sensor, values)| {
            let count = values.len();
            match fit_sensor(values) {
                Some(stats) => Some((sensor, stats)),
                None => {
                    log::info!("⏭️  Not enough clean data for {} ({} points), skipped", sensor, count);
                    None
                }
            }
        })
        .collect();

    FilterModel::new(sensors)
}

/// Per-sensor, per-UTC-day statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub sensor_id: String,
    pub date: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Default)]
struct DayAccumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: usize,
}

impl DayAccumulator {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Group records by (sensor, day) and summarize, ordered by sensor then day
pub fn daily_summaries(records: &[BatchRecord]) -> Vec<DailySummary> {
    let mut groups: BTreeMap<(String, NaiveDate), DayAccumulator> = BTreeMap::new();

    for record in records {
        let Some(ts) = record.parsed_timestamp() else {
            continue;
        };
        groups
            .entry((record.sensor_id.clone(), ts.date_naive()))
            .or_default()
            .push(record.temp);
    }

    groups
        .into_iter()
        .map(|((sensor_id, date), acc)| DailySummary {
            sensor_id,
            date: date.format("%Y-%m-%d").to_string(),
            mean: round2(acc.sum / acc.count as f64),
            min: round2(acc.min),
            max: round2(acc.max),
            count: acc.count,
        })
        .collect()
}

/// One JSON object per line, newline-terminated
pub fn summaries_to_jsonl(summaries: &[DailySummary]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for summary in summaries {
        out.push_str(&serde_json::to_string(summary)?);
        out.push('\n');
    }
    Ok(out)
}
