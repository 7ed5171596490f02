//! Adaptive per-ticker scheduling
//!
//! Computes the polling interval for each ticker from its priority class and
//! the number of enabled tickers, floors it by the rate-limit budget, and
//! answers "is this ticker due". Independently enforces a minimum spacing
//! between successive calls to the same endpoint across all tickers.

use crate::config::Settings;
use crate::scheduler::RateLimitTracker;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Minimum seconds between calls to the same endpoint name.
const MIN_ENDPOINT_INTERVAL: f64 = 1.0;

/// Fallback interval when a computed interval is non-positive.
const FALLBACK_INTERVAL: f64 = 5.0;

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[derive(Default)]
struct SchedulerState {
    last_fetch_times: HashMap<String, f64>,
    enabled_tickers: Vec<String>,
}

/// Priority-based scheduler for ticker data collection
pub struct AdaptiveScheduler {
    tracker: Arc<RateLimitTracker>,
    settings: Arc<RwLock<Settings>>,
    state: RwLock<SchedulerState>,
    // Endpoint spacing is independent of ticker scheduling.
    endpoint_fetch_times: Mutex<HashMap<String, f64>>,
}

impl AdaptiveScheduler {
    pub fn new(tracker: Arc<RateLimitTracker>, settings: Arc<RwLock<Settings>>) -> Self {
        Self {
            tracker,
            settings,
            state: RwLock::new(SchedulerState::default()),
            endpoint_fetch_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    pub fn set_enabled_tickers(&self, tickers: Vec<String>) {
        self.state.write().enabled_tickers = tickers;
    }

    pub fn enabled_ticker_count(&self) -> usize {
        self.state.read().enabled_tickers.len()
    }

    /// Polling interval in seconds for a ticker, given the set of tickers
    /// currently displayed in charts.
    pub fn calculate_interval(&self, ticker: &str, displayed: &[String]) -> f64 {
        let ticker_count = self.enabled_ticker_count();
        let priority = self.ticker_priority(ticker, displayed);

        let mut interval = match priority {
            // Displayed tickers always poll at 1 s regardless of count.
            0 => 1.0,
            1 => match ticker_count {
                0..=5 => 6.0,
                6..=20 => 10.0,
                _ => 15.0,
            },
            _ => match ticker_count {
                0..=5 => 16.0,
                6..=20 => 22.0,
                _ => 30.0,
            },
        };

        let refresh_ms = self.ticker_refresh_ms(ticker);
        if refresh_ms > 0 {
            interval = refresh_ms as f64 / 1000.0;
        }

        let min_interval = self.tracker.get_minimum_interval(ticker_count);
        if min_interval > 0.0 && interval < min_interval {
            interval = min_interval;
        }

        trace!(
            ticker,
            priority,
            ticker_count,
            refresh_ms,
            interval,
            "Calculated polling interval"
        );
        interval
    }

    /// 0 = high, 1 = medium, 2 = low. Display wins over configuration.
    fn ticker_priority(&self, ticker: &str, displayed: &[String]) -> u8 {
        if displayed.iter().any(|t| t == ticker) {
            return 0;
        }

        {
            let settings = self.settings.read();
            if let Some(config) = settings.ticker_configs.get(ticker) {
                return match config.priority.as_str() {
                    "high" => 0,
                    "low" => 2,
                    _ => 1,
                };
            }
        }

        if self.state.read().enabled_tickers.iter().any(|t| t == ticker) {
            1
        } else {
            2
        }
    }

    /// Per-ticker refresh override in milliseconds, 0 when unset.
    fn ticker_refresh_ms(&self, ticker: &str) -> u64 {
        self.settings
            .read()
            .ticker_configs
            .get(ticker)
            .map(|c| c.effective_refresh_ms())
            .unwrap_or(0)
    }

    /// Whether the ticker is due: never fetched, or its interval elapsed.
    pub fn should_fetch(&self, ticker: &str, displayed: &[String]) -> bool {
        self.should_fetch_at(now_secs(), ticker, displayed)
    }

    fn should_fetch_at(&self, now: f64, ticker: &str, displayed: &[String]) -> bool {
        let last_fetch = self
            .state
            .read()
            .last_fetch_times
            .get(ticker)
            .copied()
            .unwrap_or(0.0);
        if last_fetch == 0.0 {
            return true;
        }

        let mut interval = self.calculate_interval(ticker, displayed);
        if interval <= 0.0 {
            interval = FALLBACK_INTERVAL;
        }
        now - last_fetch >= interval
    }

    pub fn record_fetch(&self, ticker: &str) {
        self.record_fetch_at(now_secs(), ticker);
    }

    fn record_fetch_at(&self, now: f64, ticker: &str) {
        let mut state = self.state.write();
        let entry = state.last_fetch_times.entry(ticker.to_string()).or_insert(0.0);
        // Keep last-fetch monotonic even under racing recorders.
        if now > *entry {
            *entry = now;
        }
    }

    pub fn last_fetch_time(&self, ticker: &str) -> Option<f64> {
        self.state.read().last_fetch_times.get(ticker).copied()
    }

    /// Whether the endpoint spacing floor allows a call right now.
    pub fn can_fetch_endpoint(&self, endpoint: &str) -> bool {
        self.can_fetch_endpoint_at(now_secs(), endpoint)
    }

    fn can_fetch_endpoint_at(&self, now: f64, endpoint: &str) -> bool {
        let times = self.endpoint_fetch_times.lock();
        let last = times.get(endpoint).copied().unwrap_or(0.0);
        now - last >= MIN_ENDPOINT_INTERVAL
    }

    pub fn record_endpoint_fetch(&self, endpoint: &str) {
        self.record_endpoint_fetch_at(now_secs(), endpoint);
    }

    fn record_endpoint_fetch_at(&self, now: f64, endpoint: &str) {
        self.endpoint_fetch_times
            .lock()
            .insert(endpoint.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickerConfig;
    use std::collections::HashMap as StdHashMap;

    fn scheduler_with(
        configs: Vec<(&str, TickerConfig)>,
        enabled: Vec<&str>,
    ) -> AdaptiveScheduler {
        let mut ticker_configs = StdHashMap::new();
        for (ticker, config) in configs {
            ticker_configs.insert(ticker.to_string(), config);
        }
        let settings = Settings {
            ticker_configs,
            ..Default::default()
        };
        let scheduler = AdaptiveScheduler::new(
            Arc::new(RateLimitTracker::new()),
            Arc::new(RwLock::new(settings)),
        );
        scheduler.set_enabled_tickers(enabled.into_iter().map(String::from).collect());
        scheduler
    }

    #[test]
    fn test_display_overrides_configured_priority() {
        let scheduler = scheduler_with(
            vec![(
                "SPX",
                TickerConfig {
                    priority: "low".to_string(),
                    collection_enabled: true,
                    ..Default::default()
                },
            )],
            vec!["SPX"],
        );

        let displayed = vec!["SPX".to_string()];
        assert_eq!(scheduler.calculate_interval("SPX", &displayed), 1.0);
        // Without the chart open, configured low priority applies.
        assert_eq!(scheduler.calculate_interval("SPX", &[]), 16.0);
    }

    #[test]
    fn test_interval_table_scales_with_ticker_count() {
        let enabled: Vec<String> = (0..10).map(|i| format!("T{i}")).collect();
        let scheduler = scheduler_with(vec![], enabled.iter().map(|s| s.as_str()).collect());

        // Enabled but unconfigured ticker is medium priority; N = 10.
        assert_eq!(scheduler.calculate_interval("T0", &[]), 10.0);

        scheduler.set_enabled_tickers(vec!["T0".to_string()]);
        assert_eq!(scheduler.calculate_interval("T0", &[]), 6.0);

        // Not enabled, not configured: low priority.
        assert_eq!(scheduler.calculate_interval("ZZZ", &[]), 16.0);
    }

    #[test]
    fn test_refresh_override_replaces_table_interval() {
        let scheduler = scheduler_with(
            vec![(
                "SPX",
                TickerConfig {
                    collection_enabled: true,
                    refresh_rate_ms: Some(2500),
                    ..Default::default()
                },
            )],
            vec!["SPX"],
        );
        assert_eq!(scheduler.calculate_interval("SPX", &[]), 2.5);
    }

    #[test]
    fn test_rate_limit_floor_applies() {
        let scheduler = scheduler_with(vec![], vec!["A", "B", "C", "D", "E"]);
        let mut headers = StdHashMap::new();
        headers.insert("X-RateLimit-Limit".to_string(), "30".to_string());
        scheduler.tracker().record_request(1.0, true, Some(&headers));

        // Base interval would be 6 s (medium, N=5); floor is 60/30*5 = 10 s.
        assert_eq!(scheduler.calculate_interval("A", &[]), 10.0);
    }

    #[test]
    fn test_should_fetch_first_time_and_after_interval() {
        let scheduler = scheduler_with(vec![], vec!["SPX"]);
        assert!(scheduler.should_fetch_at(100.0, "SPX", &[]));

        scheduler.record_fetch_at(100.0, "SPX");
        // Medium priority, N=1: 6 s interval.
        assert!(!scheduler.should_fetch_at(105.0, "SPX", &[]));
        assert!(scheduler.should_fetch_at(106.0, "SPX", &[]));
    }

    #[test]
    fn test_last_fetch_monotonic() {
        let scheduler = scheduler_with(vec![], vec!["SPX"]);
        scheduler.record_fetch_at(200.0, "SPX");
        scheduler.record_fetch_at(150.0, "SPX");
        assert_eq!(scheduler.last_fetch_time("SPX"), Some(200.0));
    }

    #[test]
    fn test_endpoint_spacing_floor() {
        let scheduler = scheduler_with(vec![], vec![]);
        assert!(scheduler.can_fetch_endpoint_at(10.0, "classic_zero"));
        scheduler.record_endpoint_fetch_at(10.0, "classic_zero");
        assert!(!scheduler.can_fetch_endpoint_at(10.5, "classic_zero"));
        assert!(scheduler.can_fetch_endpoint_at(11.0, "classic_zero"));
        // Spacing is per endpoint name.
        assert!(scheduler.can_fetch_endpoint_at(10.5, "classic_one"));
    }
}
