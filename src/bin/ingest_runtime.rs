//! Ingestion Runtime - live feeds into the batch and speed layers
//!
//! Usage:
//!   cargo run --release --bin ingest_runtime
//!
//! Environment variables: see `IngestConfig::from_env` (a `.env` file is
//! loaded when present). `RUST_LOG` overrides the default `info` level.

use log::{error, info, warn};
use priceflow::config::{ArchiveBackend, IngestConfig};
use priceflow::orchestrator;

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.target(env_logger::Target::Stderr);

    // Keep transport crates quiet unless explicitly enabled
    let log_level = std::env::var("RUST_LOG").unwrap_or_default();
    for module in ["reqwest", "hyper", "hyper_util", "tungstenite", "tokio_tungstenite", "rustls"] {
        if !log_level.contains(module) {
            builder.filter_module(module, log::LevelFilter::Warn);
        }
    }

    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_logging();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("⚠️  A rustls crypto provider was already installed");
    }

    let config = IngestConfig::from_env();
    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        return Err(e.into());
    }

    info!("🚀 Ingestion Runtime");
    info!("   ├─ Speed layer: {}", config.speed_db_path);
    match config.archive_backend {
        ArchiveBackend::Local => info!("   ├─ Archive: local ({})", config.archive_root),
        ArchiveBackend::WebHdfs => info!("   ├─ Archive: webhdfs ({})", config.webhdfs_url),
    }
    info!("   ├─ Incoming: {}", config.incoming_dir);
    info!("   ├─ Model: {}", config.model_path);
    info!("   ├─ Window: {}ms | batch: {} lines / {}s", config.aggregation_window.as_millis(), config.batch_size, config.batch_flush_interval.as_secs());
    info!("   └─ Feeds: {:?}", config.sources);

    orchestrator::run(config).await?;

    info!("✅ Ingestion runtime stopped");
    Ok(())
}
