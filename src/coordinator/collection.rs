//! Data-collection coordination
//!
//! Turns ticker-ready events into persisted rows: plan, validate, fan out
//! over HTTP with bounded parallelism, aggregate per ticker, and enqueue the
//! aggregated rows. Also hosts the market-date rollover monitor.

use crate::api::{ApiError, Query, QuerySystem, RESPONSE_HEADERS_KEY, RESPONSE_TIME_KEY};
use crate::charts::DisplayTracker;
use crate::config::constants::{API_EXECUTOR_WORKERS, ROLLOVER_CHECK_INTERVAL};
use crate::coordinator::{HealthCheck, PriorityWriteQueue, QueryPlanner};
use crate::db::DataWriter;
use crate::market_hours;
use crate::scheduler::{AdaptiveScheduler, PollingControl};
use chrono::NaiveDate;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Timestamps above this magnitude are milliseconds, not seconds.
const MILLISECOND_THRESHOLD: f64 = 1e10;

/// Coordinates query planning, fanout, aggregation and persistence
pub struct DataCollectionCoordinator {
    query_system: Arc<QuerySystem>,
    writer: Arc<DataWriter>,
    scheduler: Arc<AdaptiveScheduler>,
    planner: Arc<QueryPlanner>,
    write_queue: Arc<PriorityWriteQueue>,
    displays: Arc<DisplayTracker>,
    shutting_down: Arc<AtomicBool>,
    tickers_in_progress: DashSet<String>,
    // Both are late-bound by the engine after construction; the polling
    // back-edge exists only for the rollover monitor.
    health_check: RwLock<Option<Arc<HealthCheck>>>,
    polling: RwLock<Option<Arc<dyn PollingControl>>>,
    current_market_date: Mutex<NaiveDate>,
    rollover_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl DataCollectionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_system: Arc<QuerySystem>,
        writer: Arc<DataWriter>,
        scheduler: Arc<AdaptiveScheduler>,
        planner: Arc<QueryPlanner>,
        write_queue: Arc<PriorityWriteQueue>,
        displays: Arc<DisplayTracker>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            query_system,
            writer,
            scheduler,
            planner,
            write_queue,
            displays,
            shutting_down,
            tickers_in_progress: DashSet::new(),
            health_check: RwLock::new(None),
            polling: RwLock::new(None),
            current_market_date: Mutex::new(market_hours::market_date()),
            rollover_stop: Mutex::new(None),
        }
    }

    pub fn set_health_check(&self, health_check: Arc<HealthCheck>) {
        *self.health_check.write() = Some(health_check);
    }

    pub fn set_polling_control(&self, polling: Arc<dyn PollingControl>) {
        *self.polling.write() = Some(polling);
    }

    pub fn update_enabled_tickers(&self, tickers: Vec<String>) {
        self.planner.set_enabled_tickers(tickers);
    }

    pub fn is_ticker_in_progress(&self, ticker: &str) -> bool {
        self.tickers_in_progress.contains(ticker)
    }

    /// Process one batch of ready tickers end to end.
    pub async fn process_ticker_batch(&self, tickers: Vec<String>) {
        if tickers.is_empty() {
            return;
        }

        let health_check = self.health_check.read().clone();
        if let Some(health) = &health_check {
            for ticker in &tickers {
                health.record_fetch(ticker);
            }
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Shutting down, skipping batch");
            return;
        }

        // Overlapping scheduler ticks must not double-dispatch a ticker
        // whose previous batch is still in flight.
        let tickers: Vec<String> = tickers
            .into_iter()
            .filter(|t| !self.tickers_in_progress.contains(t))
            .collect();
        if tickers.is_empty() {
            return;
        }

        let plan = self.planner.build_plan(&tickers);
        if plan.is_empty() {
            debug!(?tickers, "Empty query plan, skipping batch");
            return;
        }
        let queries = self.query_system.validate_and_filter(&plan);
        debug!(
            tickers = tickers.len(),
            queries = queries.len(),
            "Processing ticker batch"
        );

        if let Some(health) = &health_check {
            health.set_update_in_progress(true);
        }
        for item in &plan {
            self.tickers_in_progress.insert(item.ticker.clone());
        }

        let results = self.fan_out(queries).await;
        let ticker_data = aggregate_results(&plan, results);

        for (ticker, data) in ticker_data {
            if data.is_empty() {
                debug!(%ticker, "No data collected this cycle");
                continue;
            }
            self.process_completed_ticker_data(&ticker, data);
        }

        for item in &plan {
            self.tickers_in_progress.remove(&item.ticker);
        }
        if let Some(health) = &health_check {
            health.set_update_in_progress(false);
        }
    }

    /// Execute the queries under the fanout semaphore, gating each request
    /// on the rate-limit tracker and the per-endpoint spacing floor.
    async fn fan_out(&self, queries: Vec<Query>) -> HashMap<Query, Map<String, Value>> {
        let results: Arc<Mutex<HashMap<Query, Map<String, Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(API_EXECUTOR_WORKERS));
        let mut handles = Vec::with_capacity(queries.len());

        for query in queries {
            let client = Arc::clone(self.query_system.client());
            let scheduler = Arc::clone(&self.scheduler);
            let tracker = Arc::clone(self.scheduler.tracker());
            let shutting_down = Arc::clone(&self.shutting_down);
            let results = Arc::clone(&results);
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                // No request is issued while the tracker reports limited.
                if tracker.is_rate_limited() {
                    warn!(
                        endpoint = %query.endpoint,
                        ticker = %query.ticker,
                        "Rate limited, dropping fetch"
                    );
                    return;
                }

                // The endpoint spacing floor defers execution, never
                // scheduling: wait here until the slot opens.
                while !(scheduler.can_fetch_endpoint(&query.endpoint)
                    && tracker.can_make_request_with_light_throttle(&query.endpoint))
                {
                    if shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                scheduler.record_endpoint_fetch(&query.endpoint);
                tracker.record_endpoint_call(&query.endpoint);

                let request_time = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
                match client.fetch_endpoint(&query.endpoint, &query.ticker).await {
                    Ok(data) => {
                        let headers = response_headers(&data);
                        tracker.record_request(request_time, true, headers.as_ref());
                        results.lock().insert(query, data);
                    }
                    Err(e) => {
                        tracker.record_request(request_time, false, None);
                        if let ApiError::RateLimited { retry_after, .. } = &e {
                            tracker.handle_rate_limit_error(*retry_after);
                        }
                        // Errors never abort the batch.
                        warn!(
                            endpoint = %query.endpoint,
                            ticker = %query.ticker,
                            "Fetch failed: {e}"
                        );
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let mut results = results.lock();
        std::mem::take(&mut *results)
    }

    /// Record the fetch, derive the canonical timestamp, pick the write
    /// priority and enqueue.
    fn process_completed_ticker_data(&self, ticker: &str, data: Map<String, Value>) {
        self.scheduler.record_fetch(ticker);

        let now = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let timestamp = canonical_timestamp(data.get("timestamp"), now);

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let priority = if self.displays.is_displayed(ticker) { 0 } else { 1 };
        debug!(
            ticker,
            timestamp,
            priority,
            fields = data.len(),
            "Enqueuing aggregated row"
        );
        self.write_queue.enqueue(ticker, timestamp, data, priority);
    }

    /// Start the 30 s market-date rollover monitor.
    pub fn start_rollover_monitor(self: Arc<Self>) {
        let mut stop_guard = self.rollover_stop.lock();
        if stop_guard.is_some() {
            debug!("Rollover monitor already running");
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *stop_guard = Some(stop_tx);
        drop(stop_guard);

        info!(
            date = %self.current_market_date.lock(),
            "Date rollover monitor started"
        );
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ROLLOVER_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.check_date_rollover(),
                    _ = stop_rx.changed() => {
                        debug!("Rollover monitor stopped");
                        return;
                    }
                }
            }
        });
    }

    pub fn stop_rollover_monitor(&self) {
        if let Some(stop) = self.rollover_stop.lock().take() {
            let _ = stop.send(true);
        }
    }

    /// Compare dates only, so clock jitter around the boundary is harmless.
    fn check_date_rollover(&self) {
        let new_date = market_hours::market_date();
        let old_date = {
            let mut current = self.current_market_date.lock();
            if *current == new_date {
                return;
            }
            std::mem::replace(&mut *current, new_date)
        };

        info!(%old_date, %new_date, "Market date rollover detected");

        // Flush the previous day's pending writes first, then kick every
        // worker so the new day's files appear promptly.
        if let Err(e) = self.writer.flush_all() {
            error!("Rollover flush failed: {e}");
        }
        match self.polling.read().clone() {
            Some(polling) => polling.trigger_immediate_polling(),
            None => warn!("No polling loop bound, cannot trigger immediate polling"),
        }
    }
}

/// Merge endpoint responses per ticker. Metadata keys are stripped; merge
/// order across endpoints is unspecified (last write wins).
fn aggregate_results(
    plan: &[crate::api::QueryPlanItem],
    results: HashMap<Query, Map<String, Value>>,
) -> HashMap<String, Map<String, Value>> {
    let mut ticker_data: HashMap<String, Map<String, Value>> = HashMap::new();
    for item in plan {
        ticker_data.entry(item.ticker.clone()).or_default();
    }

    for (query, result) in results {
        let Some(data) = ticker_data.get_mut(&query.ticker) else {
            continue;
        };
        for (key, value) in result {
            if key == RESPONSE_HEADERS_KEY || key == RESPONSE_TIME_KEY {
                continue;
            }
            data.insert(key, value);
        }
    }
    ticker_data
}

/// API timestamps may arrive in milliseconds; disambiguate by magnitude.
fn canonical_timestamp(value: Option<&Value>, now: f64) -> f64 {
    match value.and_then(Value::as_f64) {
        Some(ts) if ts > MILLISECOND_THRESHOLD => ts / 1000.0,
        Some(ts) => ts,
        None => now,
    }
}

fn response_headers(data: &Map<String, Value>) -> Option<HashMap<String, String>> {
    let Value::Object(headers) = data.get(RESPONSE_HEADERS_KEY)? else {
        return None;
    };
    Some(
        headers
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}
