//! Model Trainer - offline batch-layer job
//!
//! Reads every archived batch file, then:
//! 1. trains the per-sensor filter model and publishes it to `MODEL_PATH`
//! 2. writes per-sensor daily summaries to `<ARCHIVE_BASE_DIR>/daily/daily_summary.jsonl`
//! 3. drops the rotate trigger so the ingestion runtime starts a new discard generation
//!
//! Usage:
//!   cargo run --release --bin model_trainer
//!
//! Uses the same environment variables as `ingest_runtime` for the archive
//! location. `TRAINER_RETRY_ATTEMPTS` (default: 5) bounds the archive probe.

use log::{info, warn};
use priceflow::analytics::{daily_summaries, load_batches, summaries_to_jsonl, train_model};
use priceflow::config::IngestConfig;
use priceflow::error::StoreError;
use priceflow::orchestrator::{build_archive, prepare_archive};
use priceflow::retry::RetryPolicy;
use priceflow::storage::join_path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .init();

    let config = IngestConfig::from_env();
    config.validate()?;

    let attempts = std::env::var("TRAINER_RETRY_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let retry = RetryPolicy::bounded(config.bootstrap_retry_delay, attempts);

    info!("🚀 Model Trainer");
    info!("   ├─ Incoming: {}", config.incoming_dir);
    info!("   └─ Model: {}", config.model_path);

    let archive = build_archive(&config)?;
    prepare_archive(archive.as_ref(), &config.archive_layout(), &retry).await?;

    let records = match load_batches(archive.as_ref(), &config.incoming_dir).await {
        Ok(records) => records,
        Err(StoreError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    if records.is_empty() {
        warn!("⚠️  No archived readings yet, nothing to train on");
        return Ok(());
    }
    info!("📥 Loaded {} archived readings", records.len());

    // 1. Model
    let model = train_model(&records);
    if model.is_empty() {
        warn!("⚠️  No sensor has enough clean data, keeping the published model");
    } else {
        archive
            .write(&config.model_path, model.to_json()?.as_bytes(), true)
            .await?;
        info!("✅ Model published for sensors: {:?}", model.sensors());
    }

    // 2. Daily summaries
    let summaries = daily_summaries(&records);
    let daily_dir = join_path(&config.base_dir, "daily");
    archive.makedirs(&daily_dir).await?;
    let summary_path = join_path(&daily_dir, "daily_summary.jsonl");
    archive
        .write(&summary_path, summaries_to_jsonl(&summaries)?.as_bytes(), true)
        .await?;
    info!("✅ {} daily summaries written to {}", summaries.len(), summary_path);

    // 3. New discard generation
    archive.write(&config.rotate_trigger_path, b"", true).await?;
    info!("🔁 Rotate trigger written to {}", config.rotate_trigger_path);

    Ok(())
}
