//! Anomaly-filtering model: per-sensor Gaussian envelope and its refresh cycle
//!
//! The model is published by the offline trainer as a JSON object
//! `{sensor_id: {"mean": f64, "std_dev": f64}}`. The manager downloads it to a
//! local temp file, parses it, and swaps the shared `Arc` only once the new
//! version is complete. Readers never see a half-parsed model.

use crate::storage::ArchiveStore;
use crate::types::SensorId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Accepted band is mean ± SIGMA_BAND * std_dev
pub const SIGMA_BAND: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorStats {
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub std_dev: Option<f64>,
}

impl SensorStats {
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self {
            mean: Some(mean),
            std_dev: Some(std_dev),
        }
    }

    /// Inclusive accepted band, or None when this entry cannot discriminate
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match (self.mean, self.std_dev) {
            (Some(mean), Some(std_dev)) if std_dev > 0.0 => {
                Some((mean - SIGMA_BAND * std_dev, mean + SIGMA_BAND * std_dev))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Anomalous,
    /// No entry for this sensor
    Unmodeled,
}

/// Immutable model version
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterModel {
    sensors: HashMap<SensorId, SensorStats>,
}

impl FilterModel {
    pub fn new(sensors: HashMap<SensorId, SensorStats>) -> Self {
        Self { sensors }
    }

    /// Parse the published JSON. Unknown sensor keys are skipped.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, SensorStats> = serde_json::from_str(content)?;
        let mut sensors = HashMap::with_capacity(raw.len());

        for (key, stats) in raw {
            match key.parse::<SensorId>() {
                Ok(sensor) => {
                    sensors.insert(sensor, stats);
                }
                Err(_) => log::warn!("⚠️  Model entry for unknown sensor '{}' ignored", key),
            }
        }

        Ok(Self { sensors })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let raw: std::collections::BTreeMap<&str, &SensorStats> = self
            .sensors
            .iter()
            .map(|(sensor, stats)| (sensor.as_str(), stats))
            .collect();
        serde_json::to_string_pretty(&raw)
    }

    pub fn classify(&self, sensor: SensorId, value: f64) -> Verdict {
        let Some(stats) = self.sensors.get(&sensor) else {
            return Verdict::Unmodeled;
        };

        match stats.bounds() {
            // Zero or missing deviation: filtering disabled for this sensor
            None => Verdict::Clean,
            Some((lower, upper)) if lower <= value && value <= upper => Verdict::Clean,
            Some(_) => Verdict::Anomalous,
        }
    }

    pub fn get(&self, sensor: SensorId) -> Option<&SensorStats> {
        self.sensors.get(&sensor)
    }

    pub fn sensors(&self) -> Vec<SensorId> {
        let mut ids: Vec<SensorId> = self.sensors.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// Result of one refresh attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New model swapped in
    Updated(Vec<SensorId>),
    /// Trainer has not published a model yet
    NotPublished,
    /// Published file was empty or `{}`
    Empty,
    /// Download or parse failed; previous model kept
    Failed(String),
}

/// Owns the current model and swaps in new versions
pub struct ModelManager {
    current: RwLock<Option<Arc<FilterModel>>>,
    model_path: String,
}

impl ModelManager {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(None),
            model_path: model_path.into(),
        }
    }

    /// Current model version, if any
    pub fn snapshot(&self) -> Option<Arc<FilterModel>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_model(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Replace the current model (pointer swap only)
    pub fn install(&self, model: FilterModel) {
        let model = Arc::new(model);
        match self.current.write() {
            Ok(mut guard) => *guard = Some(model),
            Err(poisoned) => *poisoned.into_inner() = Some(model),
        }
    }

    pub fn classify(&self, sensor: SensorId, value: f64) -> Verdict {
        match self.snapshot() {
            Some(model) => model.classify(sensor, value),
            None => Verdict::Unmodeled,
        }
    }

    /// Aggregation-path classification: an unmodeled sensor is not clean
    pub fn is_clean(&self, sensor: SensorId, value: f64) -> bool {
        self.classify(sensor, value) == Verdict::Clean
    }

    /// Check the archive for a published model and load it
    ///
    /// Never fails: any problem leaves the current model untouched and is
    /// reported through the returned outcome and the log.
    pub async fn refresh(&self, archive: &dyn ArchiveStore) -> RefreshOutcome {
        let outcome = self.try_refresh(archive).await;

        match &outcome {
            RefreshOutcome::Updated(sensors) => {
                log::info!("🔄 Filter model updated, sensors: {:?}", sensors)
            }
            RefreshOutcome::NotPublished => {
                log::info!("⏳ No model published at {} yet", self.model_path)
            }
            RefreshOutcome::Empty => {
                log::warn!("⚠️  Model file {} is empty, keeping current model", self.model_path)
            }
            RefreshOutcome::Failed(reason) => {
                log::warn!("⚠️  Model refresh failed, keeping current model: {}", reason)
            }
        }

        outcome
    }

    async fn try_refresh(&self, archive: &dyn ArchiveStore) -> RefreshOutcome {
        match archive.exists(&self.model_path).await {
            Ok(true) => {}
            Ok(false) => return RefreshOutcome::NotPublished,
            Err(e) => return RefreshOutcome::Failed(format!("status check: {}", e)),
        }

        // Temp file is removed when `tmp` drops, success or not
        let tmp = match tempfile::NamedTempFile::new() {
            Ok(tmp) => tmp,
            Err(e) => return RefreshOutcome::Failed(format!("temp file: {}", e)),
        };

        if let Err(e) = archive.download(&self.model_path, tmp.path()).await {
            return RefreshOutcome::Failed(format!("download: {}", e));
        }

        let content = match tokio::fs::read_to_string(tmp.path()).await {
            Ok(content) => content,
            Err(e) => return RefreshOutcome::Failed(format!("read temp file: {}", e)),
        };

        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            return RefreshOutcome::Empty;
        }

        let model = match FilterModel::from_json(trimmed) {
            Ok(model) => model,
            Err(e) => return RefreshOutcome::Failed(format!("parse: {}", e)),
        };

        if model.is_empty() {
            return RefreshOutcome::Empty;
        }

        let sensors = model.sensors();
        self.install(model);
        RefreshOutcome::Updated(sensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalArchive;
    use tempfile::tempdir;

    fn model_with(sensor: SensorId, mean: f64, std_dev: f64) -> FilterModel {
        let mut sensors = HashMap::new();
        sensors.insert(sensor, SensorStats::new(mean, std_dev));
        FilterModel::new(sensors)
    }

    #[test]
    fn test_three_sigma_band() {
        let model = model_with(SensorId::A1, 100.0, 2.0);

        assert_eq!(model.classify(SensorId::A1, 104.0), Verdict::Clean);
        assert_eq!(model.classify(SensorId::A1, 94.0), Verdict::Clean);
        assert_eq!(model.classify(SensorId::A1, 106.0), Verdict::Clean);
        assert_eq!(model.classify(SensorId::A1, 110.0), Verdict::Anomalous);
        assert_eq!(model.classify(SensorId::A1, 93.9), Verdict::Anomalous);
        assert_eq!(model.classify(SensorId::B1, 1.0), Verdict::Unmodeled);
    }

    #[test]
    fn test_zero_or_missing_deviation_accepts_everything() {
        let model = model_with(SensorId::C1, 50.0, 0.0);
        assert_eq!(model.classify(SensorId::C1, 1_000_000.0), Verdict::Clean);

        let model = FilterModel::from_json(r#"{"C1": {"mean": 50.0}}"#).unwrap();
        assert_eq!(model.classify(SensorId::C1, -3.0), Verdict::Clean);
    }

    #[test]
    fn test_from_json_skips_unknown_sensors() {
        let model = FilterModel::from_json(
            r#"{"A1": {"mean": 100.0, "std_dev": 2.0}, "ZZ": {"mean": 1.0, "std_dev": 1.0}}"#,
        )
        .unwrap();

        assert_eq!(model.sensors(), vec![SensorId::A1]);
        assert!(FilterModel::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_manager_without_model_is_not_clean() {
        let manager = ModelManager::new("/models/model.json");
        assert!(!manager.has_model());
        assert!(!manager.is_clean(SensorId::A1, 100.0));

        manager.install(model_with(SensorId::A1, 100.0, 2.0));
        assert!(manager.is_clean(SensorId::A1, 100.0));
        assert!(!manager.is_clean(SensorId::B1, 100.0));
    }

    #[tokio::test]
    async fn test_refresh_lifecycle() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let manager = ModelManager::new("/models/model.json");

        // Not published yet
        assert_eq!(manager.refresh(&archive).await, RefreshOutcome::NotPublished);

        // Empty object keeps "no model"
        archive.write("/models/model.json", b"{}", true).await.unwrap();
        assert_eq!(manager.refresh(&archive).await, RefreshOutcome::Empty);
        assert!(!manager.has_model());

        // Real model gets installed
        archive
            .write("/models/model.json", br#"{"A1": {"mean": 100.0, "std_dev": 2.0}}"#, true)
            .await
            .unwrap();
        assert_eq!(
            manager.refresh(&archive).await,
            RefreshOutcome::Updated(vec![SensorId::A1])
        );
        let first = manager.snapshot().unwrap();

        // Corrupt file leaves the previous version in place
        archive.write("/models/model.json", b"{\"A1\": {", true).await.unwrap();
        assert!(matches!(manager.refresh(&archive).await, RefreshOutcome::Failed(_)));
        assert!(Arc::ptr_eq(&first, &manager.snapshot().unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_versions() {
        let manager = Arc::new(ModelManager::new("/models/model.json"));
        manager.install(model_with(SensorId::A1, 100.0, 1.0));

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..1_000 {
                    let model = manager.snapshot().unwrap();
                    let stats = model.get(SensorId::A1).unwrap();
                    // Old version: (100, 1); new version: (200, 2). Never mixed.
                    let pair = (stats.mean.unwrap(), stats.std_dev.unwrap());
                    assert!(pair == (100.0, 1.0) || pair == (200.0, 2.0));
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..100 {
            if i % 2 == 0 {
                manager.install(model_with(SensorId::A1, 200.0, 2.0));
            } else {
                manager.install(model_with(SensorId::A1, 100.0, 1.0));
            }
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }
}
