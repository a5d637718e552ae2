//! Ingestion configuration from environment variables

use crate::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveBackend {
    /// Directory tree on the local filesystem
    Local,
    /// HDFS through the WebHDFS REST gateway
    WebHdfs,
}

/// Market-data feeds the runtime can start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Binance,
    Coinbase,
    CoinGecko,
}

impl FromStr for FeedKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(FeedKind::Binance),
            "coinbase" => Ok(FeedKind::Coinbase),
            "coingecko" => Ok(FeedKind::CoinGecko),
            other => Err(ConfigError::InvalidValue(format!("unknown feed '{}'", other))),
        }
    }
}

/// Parse a comma-separated feed list; blank entries are ignored
pub fn parse_feeds(list: &str) -> Result<Vec<FeedKind>, ConfigError> {
    let mut feeds = Vec::new();
    for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
        let feed = entry.parse()?;
        if !feeds.contains(&feed) {
            feeds.push(feed);
        }
    }
    Ok(feeds)
}

/// Configuration for the ingestion runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Path to the SQLite speed-layer database
    pub speed_db_path: String,

    pub archive_backend: ArchiveBackend,

    /// Root directory of the local archive backend
    pub archive_root: String,

    /// WebHDFS namenode URL, e.g. http://namenode:9870
    pub webhdfs_url: String,
    pub webhdfs_user: String,
    pub webhdfs_timeout: Duration,

    pub base_dir: String,
    pub incoming_dir: String,
    pub model_path: String,
    pub discard_stats_path: String,
    pub rotate_trigger_path: String,

    /// Ingestion queue capacity (readings)
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub dequeue_timeout: Duration,

    /// Speed-layer aggregation window
    pub aggregation_window: Duration,

    /// Batch flush threshold (readings)
    pub batch_size: usize,
    pub batch_flush_interval: Duration,

    /// Number of batch files kept in the incoming directory
    pub batch_retention: usize,

    pub stats_flush_interval: Duration,
    pub model_refresh_interval: Duration,

    pub watchdog_timeout: Duration,
    pub watchdog_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub bootstrap_retry_delay: Duration,

    /// Feeds to start
    pub sources: Vec<FeedKind>,

    pub binance_ws_url: String,
    pub coinbase_api_url: String,
    pub coingecko_api_url: String,
    pub coinbase_poll_interval: Duration,
    pub coingecko_poll_interval: Duration,
    pub coinbase_timeout: Duration,
    pub coingecko_timeout: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(name: &str, default: u64) -> Duration {
    Duration::from_secs(parsed_or(name, default))
}

fn millis_or(name: &str, default: u64) -> Duration {
    Duration::from_millis(parsed_or(name, default))
}

impl IngestConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (defaults in parentheses):
    /// - `SPEED_DB_PATH` (data/speed_layer.db)
    /// - `ARCHIVE_BACKEND` (local) - `local` or `webhdfs`
    /// - `ARCHIVE_ROOT` (data/archive), `WEBHDFS_URL` (http://namenode:9870), `WEBHDFS_USER` (root)
    /// - `WEBHDFS_TIMEOUT_SECS` (15)
    /// - `ARCHIVE_BASE_DIR` (/iot-data), `ARCHIVE_INCOMING_DIR` (/iot-data/incoming)
    /// - `MODEL_PATH`, `DISCARD_STATS_PATH`, `ROTATE_TRIGGER_PATH` (under /models)
    /// - `QUEUE_CAPACITY` (10000), `ENQUEUE_TIMEOUT_MS` (1000), `DEQUEUE_TIMEOUT_MS` (1000)
    /// - `AGGREGATION_WINDOW_MS` (1000)
    /// - `BATCH_SIZE` (500), `BATCH_FLUSH_INTERVAL_SECS` (60), `BATCH_RETENTION` (3)
    /// - `STATS_FLUSH_INTERVAL_SECS` (10), `MODEL_REFRESH_INTERVAL_SECS` (60)
    /// - `WATCHDOG_TIMEOUT_SECS` (40), `WATCHDOG_CHECK_INTERVAL_SECS` (10)
    /// - `RECONNECT_DELAY_SECS` (10), `BOOTSTRAP_RETRY_DELAY_SECS` (5)
    /// - `SOURCES` (binance,coinbase,coingecko) - unknown names are skipped with a warning
    /// - `BINANCE_WS_URL`, `COINBASE_API_URL`, `COINGECKO_API_URL`
    /// - `COINBASE_POLL_INTERVAL_SECS` (5), `COINGECKO_POLL_INTERVAL_SECS` (20)
    /// - `COINBASE_TIMEOUT_SECS` (5), `COINGECKO_TIMEOUT_SECS` (10)
    pub fn from_env() -> Self {
        let archive_backend = match var_or("ARCHIVE_BACKEND", "local").to_lowercase().as_str() {
            "webhdfs" | "hdfs" => ArchiveBackend::WebHdfs,
            "local" => ArchiveBackend::Local,
            other => {
                log::warn!("Invalid ARCHIVE_BACKEND '{}', defaulting to local", other);
                ArchiveBackend::Local
            }
        };

        let sources_var = var_or("SOURCES", "binance,coinbase,coingecko");
        let sources = match parse_feeds(&sources_var) {
            Ok(feeds) => feeds,
            Err(e) => {
                log::warn!("Invalid SOURCES '{}' ({}), keeping the known entries", sources_var, e);
                sources_var.split(',').filter_map(|s| s.parse().ok()).collect()
            }
        };

        Self {
            speed_db_path: var_or("SPEED_DB_PATH", "data/speed_layer.db"),
            archive_backend,
            archive_root: var_or("ARCHIVE_ROOT", "data/archive"),
            webhdfs_url: var_or("WEBHDFS_URL", "http://namenode:9870"),
            webhdfs_user: var_or("WEBHDFS_USER", "root"),
            webhdfs_timeout: secs_or("WEBHDFS_TIMEOUT_SECS", 15),

            base_dir: var_or("ARCHIVE_BASE_DIR", "/iot-data"),
            incoming_dir: var_or("ARCHIVE_INCOMING_DIR", "/iot-data/incoming"),
            model_path: var_or("MODEL_PATH", "/models/model.json"),
            discard_stats_path: var_or("DISCARD_STATS_PATH", "/models/discard_stats.json"),
            rotate_trigger_path: var_or("ROTATE_TRIGGER_PATH", "/models/rotate_trigger"),

            queue_capacity: parsed_or("QUEUE_CAPACITY", 10_000),
            enqueue_timeout: millis_or("ENQUEUE_TIMEOUT_MS", 1_000),
            dequeue_timeout: millis_or("DEQUEUE_TIMEOUT_MS", 1_000),
            aggregation_window: millis_or("AGGREGATION_WINDOW_MS", 1_000),

            batch_size: parsed_or("BATCH_SIZE", 500),
            batch_flush_interval: secs_or("BATCH_FLUSH_INTERVAL_SECS", 60),
            batch_retention: parsed_or("BATCH_RETENTION", 3),

            stats_flush_interval: secs_or("STATS_FLUSH_INTERVAL_SECS", 10),
            model_refresh_interval: secs_or("MODEL_REFRESH_INTERVAL_SECS", 60),

            watchdog_timeout: secs_or("WATCHDOG_TIMEOUT_SECS", 40),
            watchdog_check_interval: secs_or("WATCHDOG_CHECK_INTERVAL_SECS", 10),
            reconnect_delay: secs_or("RECONNECT_DELAY_SECS", 10),
            bootstrap_retry_delay: secs_or("BOOTSTRAP_RETRY_DELAY_SECS", 5),

            sources,
            binance_ws_url: var_or("BINANCE_WS_URL", "wss://stream.binance.com:9443/stream"),
            coinbase_api_url: var_or(
                "COINBASE_API_URL",
                "https://api.coinbase.com/v2/prices/{}/spot",
            ),
            coingecko_api_url: var_or(
                "COINGECKO_API_URL",
                "https://api.coingecko.com/api/v3/simple/price",
            ),
            coinbase_poll_interval: secs_or("COINBASE_POLL_INTERVAL_SECS", 5),
            coingecko_poll_interval: secs_or("COINGECKO_POLL_INTERVAL_SECS", 20),
            coinbase_timeout: secs_or("COINBASE_TIMEOUT_SECS", 5),
            coingecko_timeout: secs_or("COINGECKO_TIMEOUT_SECS", 10),
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("QUEUE_CAPACITY must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("BATCH_SIZE must be > 0".to_string()));
        }
        if self.batch_retention == 0 {
            return Err(ConfigError::InvalidValue("BATCH_RETENTION must be > 0".to_string()));
        }
        if self.aggregation_window.is_zero() {
            return Err(ConfigError::InvalidValue(
                "AGGREGATION_WINDOW_MS must be > 0".to_string(),
            ));
        }
        // Each of these drives a timer in a background task
        let timers = [
            ("WATCHDOG_CHECK_INTERVAL_SECS", self.watchdog_check_interval),
            ("STATS_FLUSH_INTERVAL_SECS", self.stats_flush_interval),
            ("MODEL_REFRESH_INTERVAL_SECS", self.model_refresh_interval),
            ("COINBASE_POLL_INTERVAL_SECS", self.coinbase_poll_interval),
            ("COINGECKO_POLL_INTERVAL_SECS", self.coingecko_poll_interval),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, every)| every.is_zero()) {
            return Err(ConfigError::InvalidValue(format!("{} must be > 0", name)));
        }
        if !self.coinbase_api_url.contains("{}") {
            return Err(ConfigError::InvalidValue(
                "COINBASE_API_URL must contain a {} placeholder for the currency pair".to_string(),
            ));
        }
        if self.archive_backend == ArchiveBackend::WebHdfs
            && !self.webhdfs_url.starts_with("http://")
            && !self.webhdfs_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "WEBHDFS_URL must start with http:// or https://".to_string(),
            ));
        }
        Ok(())
    }

    /// Directories the archive must contain before ingestion starts
    pub fn archive_layout(&self) -> Vec<String> {
        let models_dir = match self.model_path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => self.model_path[..idx].to_string(),
        };
        vec![self.base_dir.clone(), self.incoming_dir.clone(), models_dir]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases live in one test: env vars are process-global and tests run in parallel.
    #[test]
    fn test_config_from_env() {
        // Test: Default configuration when no env vars set
        env::remove_var("SPEED_DB_PATH");
        env::remove_var("QUEUE_CAPACITY");
        env::remove_var("BATCH_SIZE");
        env::remove_var("ARCHIVE_BACKEND");
        env::remove_var("SOURCES");

        let config = IngestConfig::from_env();

        assert_eq!(config.speed_db_path, "data/speed_layer.db");
        assert_eq!(
            config.sources,
            vec![FeedKind::Binance, FeedKind::Coinbase, FeedKind::CoinGecko]
        );
        assert_eq!(config.archive_backend, ArchiveBackend::Local);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_retention, 3);
        assert_eq!(config.batch_flush_interval, Duration::from_secs(60));
        assert_eq!(config.watchdog_timeout, Duration::from_secs(40));
        assert_eq!(config.model_path, "/models/model.json");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.archive_layout(),
            vec!["/iot-data".to_string(), "/iot-data/incoming".to_string(), "/models".to_string()]
        );

        // Test: Custom configuration from env vars
        env::set_var("SPEED_DB_PATH", "/tmp/speed.db");
        env::set_var("QUEUE_CAPACITY", "250");
        env::set_var("BATCH_SIZE", "0");
        env::set_var("ARCHIVE_BACKEND", "webhdfs");
        env::set_var("SOURCES", "coingecko, binance,bogus");

        let config = IngestConfig::from_env();

        assert_eq!(config.speed_db_path, "/tmp/speed.db");
        assert_eq!(config.queue_capacity, 250);
        assert_eq!(config.archive_backend, ArchiveBackend::WebHdfs);
        assert_eq!(config.sources, vec![FeedKind::CoinGecko, FeedKind::Binance]);
        assert!(config.validate().is_err());

        // Test: Zero timer intervals are rejected before any task starts
        env::set_var("BATCH_SIZE", "500");
        env::set_var("ARCHIVE_BACKEND", "local");
        assert!(IngestConfig::from_env().validate().is_ok());
        for name in [
            "STATS_FLUSH_INTERVAL_SECS",
            "MODEL_REFRESH_INTERVAL_SECS",
            "COINBASE_POLL_INTERVAL_SECS",
            "COINGECKO_POLL_INTERVAL_SECS",
            "WATCHDOG_CHECK_INTERVAL_SECS",
        ] {
            env::set_var(name, "0");
            match IngestConfig::from_env().validate() {
                Err(ConfigError::InvalidValue(msg)) => assert!(msg.contains(name), "{}", msg),
                other => panic!("{}=0 accepted: {:?}", name, other),
            }
            env::remove_var(name);
        }

        // Cleanup
        env::remove_var("SPEED_DB_PATH");
        env::remove_var("QUEUE_CAPACITY");
        env::remove_var("BATCH_SIZE");
        env::remove_var("ARCHIVE_BACKEND");
        env::remove_var("SOURCES");
    }

    #[test]
    fn test_parse_feeds() {
        assert!(parse_feeds("").unwrap().is_empty());
        assert_eq!(
            parse_feeds("Binance,coinbase,binance").unwrap(),
            vec![FeedKind::Binance, FeedKind::Coinbase]
        );
        assert!(parse_feeds("binance,kraken").is_err());
    }
}
