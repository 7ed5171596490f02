//! Engine wiring and lifecycle
//!
//! Builds the static component graph, starts the background workers, and
//! tears everything down in the documented order. The shell embeds this and
//! talks to the public fields.

use crate::api::{Client, QuerySystem};
use crate::charts::DisplayTracker;
use crate::config::constants::{DB_POOL_CLEANUP_INTERVAL, DB_POOL_MAX_SIZE, DB_CONNECTION_IDLE_TIMEOUT};
use crate::config::Settings;
use crate::coordinator::{DataCollectionCoordinator, HealthCheck, PriorityWriteQueue, QueryPlanner};
use crate::db::{ConnectionPool, DataLoader, DataWriter};
use crate::error::Result;
use crate::scheduler::{AdaptiveScheduler, PollingControl, PollingLoop, RateLimitTracker, TickerReadyFn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The assembled collection engine
pub struct AppState {
    pub settings: Arc<RwLock<Settings>>,
    pub client: Arc<Client>,
    pub query_system: Arc<QuerySystem>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub polling: Arc<PollingLoop>,
    pub coordinator: Arc<DataCollectionCoordinator>,
    pub write_queue: Arc<PriorityWriteQueue>,
    pub writer: Arc<DataWriter>,
    pub loader: Arc<DataLoader>,
    pub displays: Arc<DisplayTracker>,
    pub health_check: Arc<HealthCheck>,
    shutting_down: Arc<AtomicBool>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Build the component graph. Fails only on unusable configuration or
    /// an HTTP client that cannot be constructed.
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let enabled_tickers = settings.enabled_tickers();
        let settings = Arc::new(RwLock::new(settings));

        let client = Arc::new(Client::new(settings.read().api_key.clone())?);
        let query_system = Arc::new(QuerySystem::new(Arc::clone(&settings), Arc::clone(&client)));

        let tracker = Arc::new(RateLimitTracker::new());
        let scheduler = Arc::new(AdaptiveScheduler::new(tracker, Arc::clone(&settings)));
        scheduler.set_enabled_tickers(enabled_tickers.clone());

        let writer = Arc::new(DataWriter::new(
            Arc::new(ConnectionPool::new(DB_POOL_MAX_SIZE, DB_CONNECTION_IDLE_TIMEOUT)),
            Arc::clone(&settings),
        ));
        let loader = Arc::new(DataLoader::new(
            Arc::new(ConnectionPool::new(DB_POOL_MAX_SIZE, DB_CONNECTION_IDLE_TIMEOUT)),
            Arc::clone(&settings),
        ));

        let displays = Arc::new(DisplayTracker::new());
        let write_queue = Arc::new(PriorityWriteQueue::new(Arc::clone(&writer)));
        let planner = Arc::new(QueryPlanner::new(
            Arc::clone(&settings),
            enabled_tickers.clone(),
        ));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let coordinator = Arc::new(DataCollectionCoordinator::new(
            Arc::clone(&query_system),
            Arc::clone(&writer),
            Arc::clone(&scheduler),
            planner,
            Arc::clone(&write_queue),
            Arc::clone(&displays),
            Arc::clone(&shutting_down),
        ));

        // Ticker-ready events schedule a batch and return immediately.
        let ready_coordinator = Arc::clone(&coordinator);
        let on_ticker_ready: TickerReadyFn = Arc::new(move |ticker: String| {
            let coordinator = Arc::clone(&ready_coordinator);
            tokio::spawn(async move {
                coordinator.process_ticker_batch(vec![ticker]).await;
            });
        });

        let polling = Arc::new(PollingLoop::new(
            Arc::clone(&scheduler),
            Arc::clone(&displays),
            on_ticker_ready,
            // After-hours collection stays off; the flag exists on the loop.
            false,
        ));
        polling.update_tickers(enabled_tickers);

        // Late-bound back-edge, used only by the rollover monitor.
        coordinator.set_polling_control(Arc::clone(&polling) as Arc<dyn PollingControl>);

        let health_check = Arc::new(HealthCheck::new(
            Arc::clone(&polling) as Arc<dyn PollingControl>
        ));
        coordinator.set_health_check(Arc::clone(&health_check));

        Ok(Arc::new(Self {
            settings,
            client,
            query_system,
            scheduler,
            polling,
            coordinator,
            write_queue,
            writer,
            loader,
            displays,
            health_check,
            shutting_down,
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start workers and monitors.
    pub fn start(&self) {
        info!("Starting collection engine");
        let mut tasks = self.background_tasks.lock();

        tasks.push(Arc::clone(&self.writer).spawn_background_flusher());
        tasks.push(Arc::clone(self.writer.pool()).spawn_sweeper(DB_POOL_CLEANUP_INTERVAL));
        tasks.push(Arc::clone(self.loader.pool()).spawn_sweeper(DB_POOL_CLEANUP_INTERVAL));
        tasks.push(Arc::clone(&self.health_check).spawn());
        Arc::clone(&self.coordinator).start_rollover_monitor();

        self.polling.start();
        info!(
            tickers = self.polling.active_ticker_count(),
            "Collection engine started"
        );
    }

    /// Re-read ticker configuration and propagate the enabled set.
    pub fn refresh_enabled_tickers(&self) {
        let enabled = self.settings.read().enabled_tickers();
        self.scheduler.set_enabled_tickers(enabled.clone());
        self.coordinator.update_enabled_tickers(enabled.clone());
        self.polling.update_tickers(enabled);
    }

    /// Orderly shutdown: monitors first, then workers, then the writer's
    /// final synchronous flush and the pools. Every step logs and
    /// continues on failure; shutdown never hangs.
    pub async fn shutdown(&self) {
        info!("Shutting down collection engine");
        self.shutting_down.store(true, Ordering::SeqCst);

        self.health_check.stop();
        self.coordinator.stop_rollover_monitor();
        self.polling.stop();

        if let Err(e) = self.writer.close() {
            error!("Final flush failed during shutdown: {e}");
        }
        self.loader.close();

        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_builds_and_shuts_down() {
        let state = AppState::new(Settings::default()).unwrap();
        assert!(!state.polling.is_running());

        state.start();
        assert!(state.polling.is_running());
        // No tickers enabled: no workers.
        assert_eq!(state.polling.active_ticker_count(), 0);

        state.shutdown().await;
        assert!(!state.polling.is_running());
    }

    #[tokio::test]
    async fn test_refresh_enabled_tickers_propagates() {
        let state = AppState::new(Settings::default()).unwrap();

        {
            let mut settings = state.settings.write();
            settings.ticker_configs.insert(
                "SPX".to_string(),
                crate::config::TickerConfig {
                    collection_enabled: true,
                    ..Default::default()
                },
            );
        }
        // Loop not started: the enabled set propagates but no worker
        // spawns (and therefore no fetch fires).
        state.refresh_enabled_tickers();
        assert_eq!(state.scheduler.enabled_ticker_count(), 1);
        assert_eq!(state.polling.active_ticker_count(), 0);

        state.shutdown().await;
    }
}
