//! Per-ticker polling loop
//!
//! One cooperative worker task per enabled ticker. Workers are created on
//! enable and torn down on disable; each one is independent, with a panic
//! barrier so a crashed worker cannot take the others down. The only
//! suspension point is the select over (timer, wake, per-worker stop,
//! global stop).

use crate::charts::DisplayTracker;
use crate::config::constants::MARKET_CLOSED_POLL_SECS;
use crate::market_hours;
use crate::scheduler::AdaptiveScheduler;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The narrow view of the polling loop that monitors need.
pub trait PollingControl: Send + Sync {
    /// Ask every active worker to emit a ready event as soon as possible.
    fn trigger_immediate_polling(&self);
    fn is_running(&self) -> bool;
    fn active_ticker_count(&self) -> usize;
}

/// Callback fired when a ticker is due. Must return quickly; downstream work
/// is scheduled asynchronously by the callee.
pub type TickerReadyFn = Arc<dyn Fn(String) + Send + Sync>;

struct Worker {
    stop: watch::Sender<bool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct LoopState {
    workers: HashMap<String, Worker>,
    enabled_tickers: Vec<String>,
    running: bool,
    global_stop: watch::Sender<bool>,
}

/// Spawns and supervises one polling worker per enabled ticker
pub struct PollingLoop {
    scheduler: Arc<AdaptiveScheduler>,
    displays: Arc<DisplayTracker>,
    on_ticker_ready: TickerReadyFn,
    /// Collect outside market hours. Exposed for completeness; the engine
    /// wires it to false.
    allow_after_hours: bool,
    state: Mutex<LoopState>,
}

impl PollingLoop {
    pub fn new(
        scheduler: Arc<AdaptiveScheduler>,
        displays: Arc<DisplayTracker>,
        on_ticker_ready: TickerReadyFn,
        allow_after_hours: bool,
    ) -> Self {
        let (global_stop, _) = watch::channel(false);
        Self {
            scheduler,
            displays,
            on_ticker_ready,
            allow_after_hours,
            state: Mutex::new(LoopState {
                workers: HashMap::new(),
                enabled_tickers: Vec::new(),
                running: false,
                global_stop,
            }),
        }
    }

    /// Start workers for every enabled ticker.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running {
            debug!("Polling loop already running");
            return;
        }
        state.running = true;
        let (global_stop, _) = watch::channel(false);
        state.global_stop = global_stop;

        let tickers = state.enabled_tickers.clone();
        info!(count = tickers.len(), "Starting polling loop");
        for ticker in tickers {
            self.spawn_worker(&mut state, ticker);
        }
    }

    /// Stop every worker. Workers observe the signal at their next
    /// suspension point.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        let _ = state.global_stop.send(true);
        for (ticker, worker) in state.workers.drain() {
            let _ = worker.stop.send(true);
            debug!(%ticker, "Stopped ticker worker");
        }
        info!("Polling loop stopped");
    }

    /// Apply a new enabled-ticker list: stop workers for removed tickers,
    /// spawn workers for added ones (only while the loop is running).
    pub fn update_tickers(&self, tickers: Vec<String>) {
        let mut state = self.state.lock();

        let removed: Vec<String> = state
            .workers
            .keys()
            .filter(|t| !tickers.contains(t))
            .cloned()
            .collect();
        for ticker in removed {
            if let Some(worker) = state.workers.remove(&ticker) {
                let _ = worker.stop.send(true);
                info!(%ticker, "Stopped worker for disabled ticker");
            }
        }

        if state.running {
            for ticker in &tickers {
                if !state.workers.contains_key(ticker) {
                    self.spawn_worker(&mut state, ticker.clone());
                }
            }
        }

        info!(
            enabled = tickers.len(),
            active = state.workers.len(),
            "Updated polling tickers"
        );
        state.enabled_tickers = tickers;
    }

    fn spawn_worker(&self, state: &mut LoopState, ticker: String) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let global_rx = state.global_stop.subscribe();

        let context = WorkerContext {
            ticker: ticker.clone(),
            scheduler: Arc::clone(&self.scheduler),
            displays: Arc::clone(&self.displays),
            on_ticker_ready: Arc::clone(&self.on_ticker_ready),
            allow_after_hours: self.allow_after_hours,
        };
        let worker_wake = Arc::clone(&wake);

        let handle = tokio::spawn(run_worker(context, stop_rx, worker_wake, global_rx));
        state.workers.insert(
            ticker,
            Worker {
                stop: stop_tx,
                wake,
                handle,
            },
        );
    }

    /// Reap finished worker tasks. A worker whose task has ended (panic or
    /// stop) stays in the map until this or `update_tickers` runs; the
    /// health check calls this on its cadence.
    pub fn reap_finished_workers(&self) {
        let mut state = self.state.lock();
        state.workers.retain(|ticker, worker| {
            if worker.handle.is_finished() {
                debug!(%ticker, "Reaped finished ticker worker");
                false
            } else {
                true
            }
        });
    }
}

impl PollingControl for PollingLoop {
    fn trigger_immediate_polling(&self) {
        let state = self.state.lock();
        for (ticker, worker) in &state.workers {
            debug!(%ticker, "Triggering immediate poll");
            worker.wake.notify_one();
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn active_ticker_count(&self) -> usize {
        self.state.lock().workers.len()
    }
}

struct WorkerContext {
    ticker: String,
    scheduler: Arc<AdaptiveScheduler>,
    displays: Arc<DisplayTracker>,
    on_ticker_ready: TickerReadyFn,
    allow_after_hours: bool,
}

async fn run_worker(
    context: WorkerContext,
    stop: watch::Receiver<bool>,
    wake: Arc<Notify>,
    global_stop: watch::Receiver<bool>,
) {
    let ticker = context.ticker.clone();
    // Panic barrier: a crashed worker logs and exits without restarting;
    // the other workers are unaffected.
    let outcome = AssertUnwindSafe(worker_loop(context, stop, wake, global_stop))
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(%ticker, "Ticker worker panicked and exits: {message}");
    } else {
        debug!(%ticker, "Ticker worker exiting");
    }
}

async fn worker_loop(
    context: WorkerContext,
    mut stop: watch::Receiver<bool>,
    wake: Arc<Notify>,
    mut global_stop: watch::Receiver<bool>,
) {
    let ticker = &context.ticker;

    // Immediate fetch on startup, unless the market is closed and
    // after-hours collection is off.
    let market_open = market_hours::is_market_open();
    if market_open || context.allow_after_hours {
        (context.on_ticker_ready)(ticker.clone());
    } else {
        debug!(%ticker, "Market closed at startup, waiting for open");
    }

    let mut last_market_state = market_open;

    loop {
        let market_open = market_hours::is_market_open();
        if market_open != last_market_state {
            debug!(%ticker, market_open, "Market state changed");
            last_market_state = market_open;
        }

        let interval = if !market_open && !context.allow_after_hours {
            // Poll the clock, not the API.
            MARKET_CLOSED_POLL_SECS
        } else {
            let displayed = context.displays.displayed();
            let interval = context.scheduler.calculate_interval(ticker, &displayed);
            if interval <= 0.0 {
                5.0
            } else {
                interval
            }
        };

        // Record the prospective fetch so overlapping schedulers do not
        // consider the ticker due again immediately.
        context.scheduler.record_fetch(ticker);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {
                if market_hours::is_market_open() || context.allow_after_hours {
                    (context.on_ticker_ready)(ticker.clone());
                }
            }
            _ = wake.notified() => {
                if market_hours::is_market_open() || context.allow_after_hours {
                    (context.on_ticker_ready)(ticker.clone());
                }
            }
            _ = stop.changed() => return,
            _ = global_stop.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::scheduler::RateLimitTracker;
    use parking_lot::RwLock;

    fn test_loop(ready: Arc<Mutex<Vec<String>>>) -> PollingLoop {
        let scheduler = Arc::new(AdaptiveScheduler::new(
            Arc::new(RateLimitTracker::new()),
            Arc::new(RwLock::new(Settings::default())),
        ));
        let on_ready: TickerReadyFn = Arc::new(move |ticker| ready.lock().push(ticker));
        // allow_after_hours so tests are independent of the wall clock
        PollingLoop::new(scheduler, Arc::new(DisplayTracker::new()), on_ready, true)
    }

    #[tokio::test]
    async fn test_start_emits_initial_ready() {
        let ready = Arc::new(Mutex::new(Vec::new()));
        let polling = test_loop(Arc::clone(&ready));

        polling.update_tickers(vec!["SPX".to_string()]);
        polling.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(polling.is_running());
        assert_eq!(polling.active_ticker_count(), 1);
        assert_eq!(ready.lock().as_slice(), ["SPX".to_string()]);

        polling.stop();
        assert!(!polling.is_running());
        assert_eq!(polling.active_ticker_count(), 0);
    }

    #[tokio::test]
    async fn test_update_tickers_symmetric_difference() {
        let ready = Arc::new(Mutex::new(Vec::new()));
        let polling = test_loop(Arc::clone(&ready));

        polling.update_tickers(vec!["SPX".to_string()]);
        polling.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        polling.update_tickers(vec!["NDX".to_string()]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(polling.active_ticker_count(), 1);
        let emitted = ready.lock().clone();
        assert!(emitted.contains(&"SPX".to_string()));
        assert!(emitted.contains(&"NDX".to_string()));

        polling.stop();
    }

    #[tokio::test]
    async fn test_no_spawn_when_stopped() {
        let ready = Arc::new(Mutex::new(Vec::new()));
        let polling = test_loop(Arc::clone(&ready));

        polling.update_tickers(vec!["SPX".to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!polling.is_running());
        assert_eq!(polling.active_ticker_count(), 0);
        assert!(ready.lock().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_immediate_polling() {
        let ready = Arc::new(Mutex::new(Vec::new()));
        let polling = test_loop(Arc::clone(&ready));

        polling.update_tickers(vec!["SPX".to_string()]);
        polling.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let initial = ready.lock().len();

        polling.trigger_immediate_polling();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(ready.lock().len() > initial);
        polling.stop();
    }
}
