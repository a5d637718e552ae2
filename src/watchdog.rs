//! Silence watchdog for the push-stream connection
//!
//! The push adapter records activity for every reading it enqueues. The
//! watchdog polls the monitor on a fixed interval; once the connection has
//! been silent for longer than the timeout it bumps the close generation,
//! which the adapter observes and answers by dropping the session and
//! reconnecting. It fires at most once per silence episode: the episode ends
//! when activity resumes or the adapter reports a fresh connection.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Debug)]
struct MonitorState {
    last_activity: Instant,
    connected: bool,
    fired: bool,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    state: Mutex<MonitorState>,
    close_tx: watch::Sender<u64>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        let (close_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(MonitorState {
                last_activity: Instant::now(),
                connected: false,
                fired: false,
            }),
            close_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_activity(&self) {
        let mut state = self.lock();
        state.last_activity = Instant::now();
        state.fired = false;
    }

    /// A new session is up; starts a fresh episode
    pub fn mark_connected(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.last_activity = Instant::now();
        state.fired = false;
    }

    pub fn mark_disconnected(&self) {
        self.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Time since the last recorded activity
    pub fn silence(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Receiver that changes every time the watchdog forces a close
    pub fn subscribe_close(&self) -> watch::Receiver<u64> {
        self.close_tx.subscribe()
    }

    /// Number of forced closes so far
    pub fn close_generation(&self) -> u64 {
        *self.close_tx.borrow()
    }

    /// Fire the close signal if the connection has gone quiet
    ///
    /// Returns true when this call fired.
    pub fn check(&self, timeout: Duration) -> bool {
        let silence = {
            let mut state = self.lock();
            if !state.connected || state.fired {
                return false;
            }
            let silence = state.last_activity.elapsed();
            if silence <= timeout {
                return false;
            }
            state.fired = true;
            silence
        };

        log::warn!(
            "⚠️  Watchdog: no data for {}s (timeout {}s), forcing reconnect",
            silence.as_secs(),
            timeout.as_secs()
        );
        self.close_tx.send_modify(|generation| *generation += 1);
        true
    }
}

/// Check the monitor every `check_interval` until the task is aborted
pub async fn run_watchdog(monitor: Arc<ActivityMonitor>, check_interval: Duration, timeout: Duration) {
    log::info!(
        "🐕 Watchdog started (check every {}s, timeout {}s)",
        check_interval.as_secs(),
        timeout.as_secs()
    );

    let mut timer = interval(check_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        timer.tick().await;
        monitor.check(timeout);
    }
}
