//! Health monitoring
//!
//! Watches the polling loop through its narrow control interface and clears
//! a stuck update flag so a wedged batch cannot stall collection forever.

use crate::config::constants::{
    HEALTH_CHECK_INTERVAL, RECOVERY_THROTTLE, UPDATE_STUCK_CRITICAL, UPDATE_STUCK_WARN,
};
use crate::scheduler::PollingControl;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Fetches older than this count as stale for stall detection.
const RECENT_FETCH_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub scheduler_running: bool,
    pub active_tickers: usize,
    pub update_in_progress: bool,
    pub recovery_attempts: u32,
    pub update_duration_ms: Option<u128>,
}

#[derive(Default)]
struct HealthState {
    last_fetch_times: HashMap<String, Instant>,
    update_in_progress: bool,
    update_started: Option<Instant>,
    recovery_attempts: u32,
    last_recovery: Option<Instant>,
}

/// Detects stuck updates and stalled collection
pub struct HealthCheck {
    polling: Arc<dyn PollingControl>,
    state: Mutex<HealthState>,
    stop: watch::Sender<bool>,
}

impl HealthCheck {
    pub fn new(polling: Arc<dyn PollingControl>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            polling,
            state: Mutex::new(HealthState::default()),
            stop,
        }
    }

    /// Run checks on a cadence until stopped.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            info!("Health check started");
            loop {
                tokio::select! {
                    _ = tick.tick() => self.perform_check(),
                    _ = stop.changed() => {
                        info!("Health check stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Called by the coordinator whenever a ticker batch starts.
    pub fn record_fetch(&self, ticker: &str) {
        self.state
            .lock()
            .last_fetch_times
            .insert(ticker.to_string(), Instant::now());
    }

    pub fn set_update_in_progress(&self, in_progress: bool) {
        let mut state = self.state.lock();
        state.update_in_progress = in_progress;
        state.update_started = in_progress.then(Instant::now);
    }

    fn perform_check(&self) {
        if !self.polling.is_running() {
            warn!("Polling loop is not running");
            self.trigger_recovery("polling loop not running");
            return;
        }

        let (stuck_duration, stale) = {
            let state = self.state.lock();
            let stuck = state
                .update_in_progress
                .then(|| state.update_started.map(|s| s.elapsed()))
                .flatten();
            let recent = state
                .last_fetch_times
                .values()
                .filter(|t| t.elapsed() < RECENT_FETCH_WINDOW)
                .count();
            (stuck, !state.last_fetch_times.is_empty() && recent == 0)
        };

        if let Some(duration) = stuck_duration {
            if duration >= UPDATE_STUCK_CRITICAL {
                error!(seconds = duration.as_secs(), "Update stuck, forcing flag reset");
                self.set_update_in_progress(false);
                self.trigger_recovery("update stuck past critical threshold");
                return;
            }
            if duration >= UPDATE_STUCK_WARN {
                warn!(seconds = duration.as_secs(), "Update in progress for a long time");
            }
        }

        if stale && self.polling.active_ticker_count() > 0 {
            warn!("No recent fetches detected, possible stall");
            self.trigger_recovery("no recent fetches");
        }
    }

    fn trigger_recovery(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state
                .last_recovery
                .is_some_and(|t| t.elapsed() < RECOVERY_THROTTLE)
            {
                return;
            }
            state.recovery_attempts += 1;
            state.last_recovery = Some(Instant::now());
            info!(
                reason,
                attempt = state.recovery_attempts,
                "Health check recovery triggered"
            );
        }
        self.set_update_in_progress(false);
    }

    pub fn status(&self) -> HealthStatus {
        let state = self.state.lock();
        HealthStatus {
            scheduler_running: self.polling.is_running(),
            active_tickers: self.polling.active_ticker_count(),
            update_in_progress: state.update_in_progress,
            recovery_attempts: state.recovery_attempts,
            update_duration_ms: state.update_started.map(|s| s.elapsed().as_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockPolling {
        running: AtomicBool,
        tickers: usize,
        triggered: AtomicUsize,
    }

    impl MockPolling {
        fn new(running: bool, tickers: usize) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(running),
                tickers,
                triggered: AtomicUsize::new(0),
            })
        }
    }

    impl PollingControl for MockPolling {
        fn trigger_immediate_polling(&self) {
            self.triggered.fetch_add(1, Ordering::SeqCst);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn active_ticker_count(&self) -> usize {
            self.tickers
        }
    }

    #[test]
    fn test_stuck_update_forces_flag_reset() {
        let health = HealthCheck::new(MockPolling::new(true, 1));
        health.set_update_in_progress(true);
        {
            let mut state = health.state.lock();
            state.update_started = Instant::now().checked_sub(Duration::from_secs(61));
        }

        health.perform_check();

        let status = health.status();
        assert!(!status.update_in_progress);
        assert_eq!(status.recovery_attempts, 1);
    }

    #[test]
    fn test_recovery_throttled() {
        let health = HealthCheck::new(MockPolling::new(false, 0));
        health.perform_check();
        health.perform_check();
        assert_eq!(health.status().recovery_attempts, 1);
    }

    #[test]
    fn test_healthy_system_no_recovery() {
        let health = HealthCheck::new(MockPolling::new(true, 1));
        health.record_fetch("SPX");
        health.perform_check();
        assert_eq!(health.status().recovery_attempts, 0);
    }

    #[test]
    fn test_stale_fetches_trigger_recovery() {
        let health = HealthCheck::new(MockPolling::new(true, 1));
        {
            let mut state = health.state.lock();
            if let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) {
                state.last_fetch_times.insert("SPX".to_string(), old);
            }
        }
        health.perform_check();
        assert_eq!(health.status().recovery_attempts, 1);
    }
}
