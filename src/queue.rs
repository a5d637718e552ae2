//! Bounded ingestion queue between the feed adapters and the batch writer
//!
//! Producers wait for capacity up to `enqueue_timeout` (backpressure), then
//! give up on the offered reading. The single consumer waits up to
//! `dequeue_timeout` so its loop can run flush checks with no traffic.

use crate::types::Reading;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TryRecvError};

/// Create a queue with the given capacity and timeouts
pub fn ingestion_queue(
    capacity: usize,
    enqueue_timeout: Duration,
    dequeue_timeout: Duration,
) -> (IngestionSender, IngestionReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        IngestionSender {
            tx,
            enqueue_timeout,
            dropped: dropped.clone(),
        },
        IngestionReceiver {
            rx,
            dequeue_timeout,
            capacity,
            dropped,
        },
    )
}

/// Outcome of a blocking dequeue
#[derive(Debug, PartialEq)]
pub enum Dequeued {
    Reading(Reading),
    /// Nothing arrived within the timeout
    Idle,
    /// Every producer is gone and the queue is empty
    Closed,
}

#[derive(Debug, Clone)]
pub struct IngestionSender {
    tx: mpsc::Sender<Reading>,
    enqueue_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl IngestionSender {
    /// Offer a reading, waiting for capacity up to the enqueue timeout
    ///
    /// Returns false when the reading was discarded (queue stayed full, or
    /// the consumer is gone).
    pub async fn enqueue(&self, reading: Reading) -> bool {
        match self.tx.send_timeout(reading, self.enqueue_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(r)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "⚠️  Ingestion queue full for {:?}, dropped {} reading from {} (total dropped: {})",
                    self.enqueue_timeout,
                    r.sensor_id,
                    r.source,
                    total
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                log::debug!("Ingestion queue closed, reading discarded");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct IngestionReceiver {
    rx: mpsc::Receiver<Reading>,
    dequeue_timeout: Duration,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl IngestionReceiver {
    /// Wait up to the dequeue timeout for the next reading
    pub async fn dequeue(&mut self) -> Dequeued {
        match tokio::time::timeout(self.dequeue_timeout, self.rx.recv()).await {
            Ok(Some(reading)) => Dequeued::Reading(reading),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Idle,
        }
    }

    /// Take every reading that is already queued, without waiting
    ///
    /// Returns true when the queue turned out to be closed.
    pub fn drain_ready(&mut self, out: &mut Vec<Reading>) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(reading) => out.push(reading),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readings discarded by producers because the queue stayed full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SensorId, Source};
    use chrono::Utc;

    fn reading(value: f64) -> Reading {
        Reading::new(SensorId::A1, Utc::now(), value, Source::PollA)
    }

    #[tokio::test]
    async fn test_enqueue_then_dequeue_in_order() {
        let (tx, mut rx) = ingestion_queue(10, Duration::from_millis(50), Duration::from_millis(50));

        assert!(tx.enqueue(reading(1.0)).await);
        assert!(tx.enqueue(reading(2.0)).await);

        match rx.dequeue().await {
            Dequeued::Reading(r) => assert_eq!(r.value, 1.0),
            other => panic!("unexpected {:?}", other),
        }
        match rx.dequeue().await {
            Dequeued::Reading(r) => assert_eq!(r.value, 2.0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.dequeue().await, Dequeued::Idle);
    }

    #[tokio::test]
    async fn test_full_queue_drops_after_timeout() {
        let (tx, rx) = ingestion_queue(2, Duration::from_millis(20), Duration::from_millis(20));

        assert!(tx.enqueue(reading(1.0)).await);
        assert!(tx.enqueue(reading(2.0)).await);
        assert!(!tx.enqueue(reading(3.0)).await);

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_blocked_producer_resumes_when_consumer_drains() {
        let (tx, mut rx) = ingestion_queue(1, Duration::from_secs(2), Duration::from_millis(500));

        assert!(tx.enqueue(reading(1.0)).await);

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.enqueue(reading(2.0)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(rx.dequeue().await, Dequeued::Reading(_)));

        assert!(producer.await.unwrap());
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn test_closed_after_all_senders_dropped() {
        let (tx, mut rx) = ingestion_queue(4, Duration::from_millis(20), Duration::from_millis(20));
        assert!(tx.enqueue(reading(1.0)).await);
        drop(tx);

        let mut out = Vec::new();
        assert!(rx.drain_ready(&mut out));
        assert_eq!(out.len(), 1);
        assert_eq!(rx.dequeue().await, Dequeued::Closed);
    }
}
