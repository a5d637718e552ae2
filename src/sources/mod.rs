//! Market-data feed adapters
//!
//! Each adapter runs as its own task and pushes normalized [`Reading`]s onto
//! the shared ingestion queue:
//! - `binance` - trade push stream over WebSocket, supervised by the watchdog
//! - `coinbase` - spot price polling, one request per pair
//! - `coingecko` - batched simple-price polling
//!
//! Adapters never stop on a bad message or a failed request; they log and
//! carry on with the next one.
//!
//! [`Reading`]: crate::types::Reading

pub mod binance;
pub mod coinbase;
pub mod coingecko;

pub use binance::BinanceStream;
pub use coinbase::CoinbasePoller;
pub use coingecko::CoinGeckoPoller;

use crate::error::SourceError;
use crate::types::SensorId;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Provider identifier → sensor
///
/// Binance symbols (lowercase), Coinbase pairs and CoinGecko ids all map onto
/// the same three sensors.
const SYMBOLS: &[(&str, SensorId)] = &[
    ("btcusdt", SensorId::A1),
    ("ethusdt", SensorId::B1),
    ("solusdt", SensorId::C1),
    ("BTC-USD", SensorId::A1),
    ("ETH-USD", SensorId::B1),
    ("SOL-USD", SensorId::C1),
    ("bitcoin", SensorId::A1),
    ("ethereum", SensorId::B1),
    ("solana", SensorId::C1),
];

pub const BINANCE_STREAMS: [&str; 3] = ["btcusdt@trade", "ethusdt@trade", "solusdt@trade"];
pub const COINBASE_PAIRS: [&str; 3] = ["BTC-USD", "ETH-USD", "SOL-USD"];
pub const COINGECKO_IDS: [&str; 3] = ["bitcoin", "ethereum", "solana"];

pub fn sensor_for(identifier: &str) -> Option<SensorId> {
    SYMBOLS
        .iter()
        .find(|(id, _)| *id == identifier)
        .map(|(_, sensor)| *sensor)
}

/// Prices arrive as JSON strings on some feeds and numbers on others
pub fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    price.is_finite().then_some(price)
}

/// HTTP client shared by the polling adapters
pub fn http_client(timeout: Duration) -> Result<Client, SourceError> {
    Ok(Client::builder().timeout(timeout).build()?)
}
