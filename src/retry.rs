use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Fixed-delay retry policy used for connection bootstrap
///
/// `max_attempts: None` retries forever. The ingestion service has no caller
/// waiting on it, so startup simply blocks until every store is reachable.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    delay: Duration,
    max_attempts: Option<u32>,
}

#[derive(Debug, Error)]
#[error("Maximum retry attempts exceeded ({attempts})")]
pub struct MaxRetriesExceeded {
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    /// Run `op` until it succeeds, sleeping `delay` between attempts
    ///
    /// Every failure is logged at warn level with `label`.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut op: F) -> Result<T, MaxRetriesExceeded>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("✅ {} ready after {} attempts", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            log::error!("❌ {} failed after {} attempts: {}", label, attempt, e);
                            return Err(MaxRetriesExceeded { attempts: attempt });
                        }
                    }
                    log::warn!(
                        "⏳ Waiting for {}... attempt {} failed ({}), retrying in {}s",
                        label,
                        attempt,
                        e,
                        self.delay.as_secs_f64()
                    );
                    sleep(self.delay).await;
                }
            }
        }
    }
}
