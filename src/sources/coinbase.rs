//! Coinbase spot price polling
//!
//! ## API Reference
//!
//! Endpoint: https://api.coinbase.com/v2/prices/{pair}/spot
//! Returns: `{"data": {"base": "BTC", "currency": "USD", "amount": "37123.45"}}`
//!
//! One request per pair per tick.

use super::{http_client, parse_price, sensor_for, COINBASE_PAIRS};
use crate::error::SourceError;
use crate::queue::IngestionSender;
use crate::types::{Reading, Source};
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Fill the `{}` placeholder of the endpoint template with a pair
pub fn spot_url(template: &str, pair: &str) -> String {
    template.replacen("{}", pair, 1)
}

/// Pull the spot amount out of a response body
pub fn parse_spot_response(body: &str) -> Result<f64, SourceError> {
    let value: Value = serde_json::from_str(body).map_err(|e| SourceError::Malformed(e.to_string()))?;
    value
        .get("data")
        .and_then(|data| data.get("amount"))
        .and_then(parse_price)
        .ok_or_else(|| SourceError::Malformed("missing data.amount".to_string()))
}

pub struct CoinbasePoller {
    client: Client,
    url_template: String,
    poll_interval: Duration,
    tx: IngestionSender,
}

impl CoinbasePoller {
    pub fn new(
        url_template: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
        tx: IngestionSender,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(request_timeout)?,
            url_template: url_template.into(),
            poll_interval,
            tx,
        })
    }

    pub async fn fetch_spot(&self, pair: &str) -> Result<f64, SourceError> {
        let response = self.client.get(spot_url(&self.url_template, pair)).send().await?;

        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_spot_response(&body)
    }

    /// Query every pair once; returns how many readings were enqueued
    pub async fn poll_once(&self) -> usize {
        let mut enqueued = 0;

        for pair in COINBASE_PAIRS {
            let Some(sensor) = sensor_for(pair) else {
                continue;
            };

            match self.fetch_spot(pair).await {
                Ok(price) => {
                    let reading = Reading::new(sensor, Utc::now(), price, Source::PollA);
                    if self.tx.enqueue(reading).await {
                        enqueued += 1;
                    }
                }
                Err(e) => log::debug!("Coinbase {} poll failed: {}", pair, e),
            }
        }

        enqueued
    }

    pub async fn run(self) {
        log::info!(
            "🚀 Starting Coinbase poller ({} pairs every {}s)",
            COINBASE_PAIRS.len(),
            self.poll_interval.as_secs()
        );

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if self.tx.is_closed() {
                log::info!("Ingestion queue closed, stopping Coinbase poller");
                break;
            }
            self.poll_once().await;
        }
    }
}
