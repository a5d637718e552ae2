//! CoinGecko simple-price polling
//!
//! ## API Reference
//!
//! Endpoint: https://api.coingecko.com/api/v3/simple/price?ids=bitcoin,ethereum,solana&vs_currencies=usd
//! Returns: `{"bitcoin": {"usd": 37123}, "ethereum": {"usd": 2011.5}, ...}`
//!
//! One batched request per tick, one reading per coin in the answer.

use super::{http_client, parse_price, sensor_for, COINGECKO_IDS};
use crate::error::SourceError;
use crate::queue::IngestionSender;
use crate::types::{Reading, SensorId, Source};
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Full request URL for the tracked coins, quoted in USD
pub fn simple_price_url(base: &str) -> String {
    format!("{}?ids={}&vs_currencies=usd", base, COINGECKO_IDS.join(","))
}

/// Prices for every known coin in a response; unknown ids and entries
/// without a usable `usd` field are skipped
pub fn parse_simple_price(body: &str) -> Result<Vec<(SensorId, f64)>, SourceError> {
    let value: Value = serde_json::from_str(body).map_err(|e| SourceError::Malformed(e.to_string()))?;
    let coins = value
        .as_object()
        .ok_or_else(|| SourceError::Malformed("expected an object".to_string()))?;

    let mut prices: Vec<(SensorId, f64)> = coins
        .iter()
        .filter_map(|(id, quote)| {
            let sensor = sensor_for(id)?;
            let price = quote.get("usd").and_then(parse_price)?;
            Some((sensor, price))
        })
        .collect();
    prices.sort_by_key(|(sensor, _)| *sensor);
    Ok(prices)
}

pub struct CoinGeckoPoller {
    client: Client,
    url: String,
    poll_interval: Duration,
    tx: IngestionSender,
}

impl CoinGeckoPoller {
    /// `base_url` is the simple-price endpoint without a query string
    pub fn new(
        base_url: &str,
        poll_interval: Duration,
        request_timeout: Duration,
        tx: IngestionSender,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(request_timeout)?,
            url: simple_price_url(base_url),
            poll_interval,
            tx,
        })
    }

    pub async fn fetch_prices(&self) -> Result<Vec<(SensorId, f64)>, SourceError> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_simple_price(&body)
    }

    /// One batched request; returns how many readings were enqueued
    pub async fn poll_once(&self) -> usize {
        let prices = match self.fetch_prices().await {
            Ok(prices) => prices,
            Err(e) => {
                log::debug!("CoinGecko poll failed: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut enqueued = 0;
        for (sensor, price) in prices {
            if self.tx.enqueue(Reading::new(sensor, now, price, Source::PollB)).await {
                enqueued += 1;
            }
        }
        enqueued
    }

    pub async fn run(self) {
        log::info!("🚀 Starting CoinGecko poller (every {}s)", self.poll_interval.as_secs());

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if self.tx.is_closed() {
                log::info!("Ingestion queue closed, stopping CoinGecko poller");
                break;
            }
            self.poll_once().await;
        }
    }
}
