//! Binance combined trade stream (push feed)
//!
//! Connects to the combined-stream endpoint, subscribes to the trade streams
//! and turns every trade event into a reading. A session ends on a transport
//! error, a server close, or a forced close from the watchdog; in every case
//! the adapter waits `reconnect_delay` and connects again.
//!
//! Message shape:
//!
//! ```json
//! {"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000123,"s":"BTCUSDT","p":"37123.45", ...}}
//! ```

use super::{parse_price, sensor_for, BINANCE_STREAMS};
use crate::error::SourceError;
use crate::queue::IngestionSender;
use crate::types::{Reading, SensorId, Source};
use crate::watchdog::ActivityMonitor;
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Subscription request sent right after connecting
pub fn subscribe_message() -> String {
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": BINANCE_STREAMS,
        "id": 1,
    })
    .to_string()
}

/// Extract (sensor, event time, price) from one stream message
///
/// Anything that is not a trade event for a known symbol yields `None`.
pub fn parse_trade_message(text: &str) -> Result<Option<(SensorId, DateTime<Utc>, f64)>, SourceError> {
    let message: Value =
        serde_json::from_str(text).map_err(|e| SourceError::Malformed(e.to_string()))?;

    // Subscription acks and other control messages carry no `data`
    let Some(data) = message.get("data") else {
        return Ok(None);
    };
    if data.get("e").and_then(Value::as_str) != Some("trade") {
        return Ok(None);
    }

    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::Malformed("trade without symbol".to_string()))?;
    let Some(sensor) = sensor_for(&symbol.to_lowercase()) else {
        return Ok(None);
    };

    let millis = data
        .get("E")
        .and_then(Value::as_i64)
        .ok_or_else(|| SourceError::Malformed(format!("{} trade without event time", symbol)))?;
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| SourceError::Malformed(format!("event time out of range: {}", millis)))?;

    let price = data
        .get("p")
        .and_then(parse_price)
        .ok_or_else(|| SourceError::Malformed(format!("{} trade without price", symbol)))?;

    Ok(Some((sensor, timestamp, price)))
}

/// Drops trades that repeat the previous event time of the same instrument
#[derive(Debug, Default)]
pub struct TradeDedup {
    last_seen: HashMap<SensorId, DateTime<Utc>>,
}

impl TradeDedup {
    /// True when the trade is new and should be emitted
    pub fn accept(&mut self, sensor: SensorId, timestamp: DateTime<Utc>) -> bool {
        match self.last_seen.insert(sensor, timestamp) {
            Some(previous) => previous != timestamp,
            None => true,
        }
    }
}

#[derive(Debug, PartialEq)]
enum SessionEnd {
    ServerClosed,
    StreamEnded,
    ForcedClose,
}

pub struct BinanceStream {
    url: String,
    tx: IngestionSender,
    monitor: Arc<ActivityMonitor>,
    reconnect_delay: Duration,
    dedup: TradeDedup,
}

impl BinanceStream {
    pub fn new(
        url: impl Into<String>,
        tx: IngestionSender,
        monitor: Arc<ActivityMonitor>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            tx,
            monitor,
            reconnect_delay,
            dedup: TradeDedup::default(),
        }
    }

    /// Handle one text frame; returns true when a reading was enqueued
    async fn handle_text(&mut self, text: &str) -> bool {
        let (sensor, timestamp, price) = match parse_trade_message(text) {
            Ok(Some(trade)) => trade,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("⚠️  Dropping Binance message: {}", e);
                return false;
            }
        };

        if !self.dedup.accept(sensor, timestamp) {
            return false;
        }

        self.tx
            .enqueue(Reading::new(sensor, timestamp, price, Source::PushStream))
            .await
    }

    async fn run_session(&mut self, close_rx: &mut watch::Receiver<u64>) -> Result<SessionEnd, SourceError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        write.send(Message::Text(subscribe_message())).await?;
        self.monitor.mark_connected();
        log::info!("✅ Connected to Binance stream ({})", self.url);

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    // Only delivered readings count as liveness
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_text(&text).await {
                            self.monitor.record_activity();
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::ServerClosed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::StreamEnded),
                },
                _ = close_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::ForcedClose);
                }
            }
        }
    }

    /// Run sessions back to back until the queue is closed
    pub async fn run(mut self) {
        log::info!("🚀 Starting Binance trade stream");
        log::info!("   ├─ Endpoint: {}", self.url);
        log::info!("   └─ Streams: {}", BINANCE_STREAMS.join(", "));

        let mut close_rx = self.monitor.subscribe_close();

        loop {
            // Closes requested before this session are stale
            close_rx.borrow_and_update();

            match self.run_session(&mut close_rx).await {
                Ok(SessionEnd::ForcedClose) => log::warn!("⚠️  Binance session closed by watchdog"),
                Ok(end) => log::warn!("⚠️  Binance session ended: {:?}", end),
                Err(e) => log::warn!("⚠️  Binance connection error: {}", e),
            }
            self.monitor.mark_disconnected();

            if self.tx.is_closed() {
                log::info!("Ingestion queue closed, stopping Binance stream");
                break;
            }

            log::info!("🔄 Reconnecting to Binance in {}s...", self.reconnect_delay.as_secs());
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}
