//! priceflow - lambda-architecture price ingestion
//!
//! Live market-data feeds land on one bounded queue. Every reading is archived
//! in append-only batch files (batch layer) and averaged per window into a
//! low-latency store (speed layer), where window means outside the trained
//! model's ±3σ band are discarded and counted.

pub mod aggregation;
pub mod analytics;
pub mod batch_writer;
pub mod config;
pub mod discard;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod sources;
pub mod storage;
pub mod types;
pub mod watchdog;

#[cfg(test)]
mod test_support;
