//! Core data types shared by the adapters, the batch layer and the speed layer

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tracked instrument
///
/// The ids are kept short and stable because they are the partition key in
/// the speed layer and the grouping key of every offline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorId {
    /// Bitcoin
    A1,
    /// Ether
    B1,
    /// Solana
    C1,
}

impl SensorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::A1 => "A1",
            SensorId::B1 => "B1",
            SensorId::C1 => "C1",
        }
    }

    pub fn all() -> [SensorId; 3] {
        [SensorId::A1, SensorId::B1, SensorId::C1]
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A1" => Ok(SensorId::A1),
            "B1" => Ok(SensorId::B1),
            "C1" => Ok(SensorId::C1),
            other => Err(format!("unknown sensor id: {}", other)),
        }
    }
}

/// Feed a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "Binance")]
    PushStream,
    #[serde(rename = "Coinbase")]
    PollA,
    #[serde(rename = "CoinGecko")]
    PollB,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::PushStream => "Binance",
            Source::PollA => "Coinbase",
            Source::PollB => "CoinGecko",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized price observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub source: Source,
}

impl Reading {
    pub fn new(sensor_id: SensorId, timestamp: DateTime<Utc>, value: f64, source: Source) -> Self {
        Self {
            sensor_id,
            timestamp,
            value,
            source,
        }
    }

    /// Serialize to one batch-file line (without the trailing newline)
    pub fn to_batch_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&BatchRecord::from(self))
    }
}

/// On-disk shape of a reading inside a batch file
///
/// The value column is called `temp` for compatibility with the offline jobs,
/// which predate the price feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub sensor_id: String,
    pub timestamp: String,
    pub temp: f64,
    pub source: String,
}

impl From<&Reading> for BatchRecord {
    fn from(reading: &Reading) -> Self {
        Self {
            sensor_id: reading.sensor_id.to_string(),
            timestamp: reading
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            temp: reading.value,
            source: reading.source.to_string(),
        }
    }
}

impl BatchRecord {
    /// Parse one batch-file line. Returns None for blank or malformed lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    pub fn sensor(&self) -> Option<SensorId> {
        self.sensor_id.parse().ok()
    }

    /// RFC 3339, or an offset-less `YYYY-MM-DDTHH:MM:SS[.fff]` taken as UTC
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

/// One row served back by the speed layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedPoint {
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_line_format() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let reading = Reading::new(SensorId::A1, ts, 37123.5, Source::PushStream);

        let line = reading.to_batch_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["sensor_id"], "A1");
        assert_eq!(value["timestamp"], "2023-11-14T22:13:20.123Z");
        assert_eq!(value["temp"], 37123.5);
        assert_eq!(value["source"], "Binance");
    }

    #[test]
    fn test_parse_line_skips_garbage() {
        assert!(BatchRecord::parse_line("").is_none());
        assert!(BatchRecord::parse_line("not json").is_none());

        let record = BatchRecord::parse_line(
            r#"{"sensor_id":"C1","timestamp":"2024-01-02T03:04:05.000Z","temp":101.25,"source":"CoinGecko"}"#,
        )
        .unwrap();
        assert_eq!(record.sensor(), Some(SensorId::C1));
        assert_eq!(record.parsed_timestamp().unwrap().timestamp(), 1_704_164_645);
    }

    #[test]
    fn test_parsed_timestamp_without_offset() {
        // Test: batch lines without an offset are read as UTC
        let naive = BatchRecord::parse_line(
            r#"{"sensor_id":"A1","timestamp":"2025-10-31T10:00:00.123","temp":1.0,"source":"Binance"}"#,
        )
        .unwrap();
        let ts = naive.parsed_timestamp().unwrap();
        assert_eq!(ts, Utc.timestamp_millis_opt(1_761_904_800_123).unwrap());

        let whole_seconds = BatchRecord::parse_line(
            r#"{"sensor_id":"A1","timestamp":"2025-10-31T10:00:00","temp":1.0,"source":"Binance"}"#,
        )
        .unwrap();
        assert_eq!(whole_seconds.parsed_timestamp().unwrap().timestamp(), 1_761_904_800);

        let offset = BatchRecord::parse_line(
            r#"{"sensor_id":"A1","timestamp":"2025-10-31T12:00:00+02:00","temp":1.0,"source":"Binance"}"#,
        )
        .unwrap();
        assert_eq!(offset.parsed_timestamp().unwrap().timestamp(), 1_761_904_800);
    }

    #[test]
    fn test_sensor_id_round_trip_through_str() {
        for sensor in SensorId::all() {
            assert_eq!(sensor.as_str().parse::<SensorId>(), Ok(sensor));
        }
        assert!("Z9".parse::<SensorId>().is_err());
    }
}
