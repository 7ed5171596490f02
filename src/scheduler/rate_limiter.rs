//! Rate-limit tracking
//!
//! Authoritative state for whether the next request may be issued and for the
//! server-declared window. All operations go through a single lock and are
//! O(window size) at worst.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Sliding window length in seconds.
const RATE_LIMIT_WINDOW: f64 = 60.0;
/// Request history cap; trimmed to the window when exceeded.
const MAX_REQUEST_HISTORY: usize = 2000;
/// 429 ring capacity.
const MAX_RATE_LIMIT_ERRORS: usize = 100;
/// Minimum spacing per endpoint while light throttle is on, seconds.
const LIGHT_THROTTLE_INTERVAL: f64 = 0.2;
/// 429s within the window required to turn light throttle on.
const RATE_LIMIT_ERROR_THRESHOLD: usize = 5;
/// Per-endpoint call records older than this are garbage-collected, seconds.
const ENDPOINT_CALL_GC: f64 = 1.0;

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[derive(Default)]
struct TrackerState {
    request_times: Vec<f64>,
    max_requests: i64,
    remaining: i64,
    reset_time: f64,
    is_rate_limited: bool,
    retry_after: f64,
    rate_limit_errors: VecDeque<f64>,
    light_throttle_enabled: bool,
    endpoint_last_call: HashMap<String, f64>,
}

/// Tracks API rate limits and ensures the engine respects them
pub struct RateLimitTracker {
    state: Mutex<TrackerState>,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record an issued request and fold in any rate-limit headers the server
    /// echoed back. Unknown header values are ignored.
    pub fn record_request(
        &self,
        request_time: f64,
        success: bool,
        headers: Option<&HashMap<String, String>>,
    ) {
        let mut state = self.state.lock();

        state.request_times.push(request_time);
        if state.request_times.len() > MAX_REQUEST_HISTORY {
            let cutoff = request_time - RATE_LIMIT_WINDOW;
            state.request_times.retain(|&t| t > cutoff);
        }

        if let Some(headers) = headers {
            if let Some(limit) = headers.get("X-RateLimit-Limit") {
                if let Ok(v) = limit.trim().parse::<i64>() {
                    if v > 0 {
                        state.max_requests = v;
                    }
                }
            }
            if let Some(remaining) = headers.get("X-RateLimit-Remaining") {
                if let Ok(v) = remaining.trim().parse::<i64>() {
                    if v >= 0 {
                        state.remaining = v;
                    }
                }
            }
            if let Some(reset) = headers.get("X-RateLimit-Reset") {
                if let Ok(v) = reset.trim().parse::<f64>() {
                    if v > 0.0 {
                        state.reset_time = v;
                    }
                }
            }
        }

        if !success {
            state.is_rate_limited = true;
        } else if state.max_requests > 0
            && state.request_times.len() as i64 >= state.max_requests
        {
            state.is_rate_limited = true;
        } else {
            state.is_rate_limited = false;
        }
    }

    /// Handle a 429 response. The retry horizon is the server's Retry-After
    /// when positive, else the declared reset time, else one window from now.
    pub fn handle_rate_limit_error(&self, retry_after: Option<f64>) {
        self.handle_rate_limit_error_at(now_secs(), retry_after);
    }

    fn handle_rate_limit_error_at(&self, now: f64, retry_after: Option<f64>) {
        let mut state = self.state.lock();
        state.is_rate_limited = true;

        state.rate_limit_errors.push_back(now);
        if state.rate_limit_errors.len() > MAX_RATE_LIMIT_ERRORS {
            state.rate_limit_errors.pop_front();
        }

        Self::update_light_throttle(&mut state, now);

        state.retry_after = match retry_after {
            Some(secs) if secs > 0.0 => now + secs,
            _ if state.reset_time > 0.0 => state.reset_time,
            _ => now + RATE_LIMIT_WINDOW,
        };
    }

    /// Hysteresis: on at >= threshold recent 429s, off below half of it.
    fn update_light_throttle(state: &mut TrackerState, now: f64) {
        let cutoff = now - RATE_LIMIT_WINDOW;
        while state
            .rate_limit_errors
            .front()
            .is_some_and(|&t| t <= cutoff)
        {
            state.rate_limit_errors.pop_front();
        }

        let count = state.rate_limit_errors.len();
        if count >= RATE_LIMIT_ERROR_THRESHOLD {
            state.light_throttle_enabled = true;
        } else if state.light_throttle_enabled && count < RATE_LIMIT_ERROR_THRESHOLD / 2 {
            state.light_throttle_enabled = false;
        }
    }

    /// Whether a call to `endpoint` is allowed under light throttling.
    pub fn can_make_request_with_light_throttle(&self, endpoint: &str) -> bool {
        self.can_make_request_with_light_throttle_at(now_secs(), endpoint)
    }

    fn can_make_request_with_light_throttle_at(&self, now: f64, endpoint: &str) -> bool {
        let mut state = self.state.lock();
        // The error ring decays with time, so re-evaluate the flag on read
        // rather than only when a new 429 arrives.
        Self::update_light_throttle(&mut state, now);

        if !state.light_throttle_enabled {
            return true;
        }
        let last_call = state.endpoint_last_call.get(endpoint).copied().unwrap_or(0.0);
        now - last_call >= LIGHT_THROTTLE_INTERVAL
    }

    /// Record a call to `endpoint` for light-throttle spacing.
    pub fn record_endpoint_call(&self, endpoint: &str) {
        self.record_endpoint_call_at(now_secs(), endpoint);
    }

    fn record_endpoint_call_at(&self, now: f64, endpoint: &str) {
        let mut state = self.state.lock();
        if state.light_throttle_enabled {
            state.endpoint_last_call.insert(endpoint.to_string(), now);
            let cutoff = now - ENDPOINT_CALL_GC;
            state.endpoint_last_call.retain(|_, &mut t| t >= cutoff);
        }
    }

    /// Whether the tracker currently reports rate-limited. Clears the flag
    /// opportunistically once the retry horizon has elapsed.
    pub fn is_rate_limited(&self) -> bool {
        self.is_rate_limited_at(now_secs())
    }

    fn is_rate_limited_at(&self, now: f64) -> bool {
        let mut state = self.state.lock();
        if state.retry_after > 0.0 && now >= state.retry_after {
            state.is_rate_limited = false;
            state.retry_after = 0.0;
        }
        state.is_rate_limited
    }

    /// Whether a request may be issued right now.
    pub fn can_make_request(&self) -> bool {
        if self.is_rate_limited() {
            return false;
        }
        let state = self.state.lock();
        if state.max_requests > 0 {
            (state.request_times.len() as i64) < state.max_requests
        } else {
            true
        }
    }

    /// Minimum per-ticker polling interval so that `ticker_count` tickers
    /// polling in parallel cannot exceed the server budget. 0 when the
    /// budget is unknown.
    pub fn get_minimum_interval(&self, ticker_count: usize) -> f64 {
        let state = self.state.lock();
        if state.max_requests <= 0 {
            return 0.0;
        }
        let mut min_interval = RATE_LIMIT_WINDOW / state.max_requests as f64;
        if ticker_count > 0 {
            min_interval *= ticker_count as f64;
        }
        min_interval
    }

    pub fn light_throttle_enabled(&self) -> bool {
        self.state.lock().light_throttle_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_headers(limit: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("X-RateLimit-Limit".to_string(), limit.to_string());
        headers
    }

    #[test]
    fn test_request_history_blocks_at_limit() {
        let tracker = RateLimitTracker::new();
        tracker.record_request(1.0, true, Some(&limit_headers("3")));
        assert!(tracker.can_make_request());
        tracker.record_request(2.0, true, None);
        tracker.record_request(3.0, true, None);
        // Third request filled the window: tracker flips to limited.
        assert!(!tracker.can_make_request());
    }

    #[test]
    fn test_unparseable_headers_ignored() {
        let tracker = RateLimitTracker::new();
        tracker.record_request(1.0, true, Some(&limit_headers("not-a-number")));
        assert_eq!(tracker.get_minimum_interval(10), 0.0);
    }

    #[test]
    fn test_retry_after_quiet_window() {
        let tracker = RateLimitTracker::new();
        let now = 1000.0;
        tracker.handle_rate_limit_error_at(now, Some(5.0));

        assert!(tracker.is_rate_limited_at(now + 4.9));
        assert!(!tracker.is_rate_limited_at(now + 5.0));
        // Flag stays cleared afterwards
        assert!(!tracker.is_rate_limited_at(now + 5.1));
    }

    #[test]
    fn test_retry_horizon_fallbacks() {
        let tracker = RateLimitTracker::new();
        let now = 1000.0;
        // No Retry-After, no reset time: one full window
        tracker.handle_rate_limit_error_at(now, None);
        assert!(tracker.is_rate_limited_at(now + 59.9));
        assert!(!tracker.is_rate_limited_at(now + 60.0));
    }

    #[test]
    fn test_light_throttle_hysteresis() {
        let tracker = RateLimitTracker::new();
        let base = 5000.0;

        // Five 429s within ten seconds switch the throttle on.
        for i in 0..5 {
            tracker.handle_rate_limit_error_at(base + i as f64 * 2.0, Some(1.0));
        }
        assert!(tracker.light_throttle_enabled());

        // Second call to the same endpoint within 200 ms is blocked.
        tracker.record_endpoint_call_at(base + 10.0, "classic_zero");
        assert!(!tracker.can_make_request_with_light_throttle_at(base + 10.1, "classic_zero"));
        assert!(tracker.can_make_request_with_light_throttle_at(base + 10.3, "classic_zero"));

        // After a minute of silence the ring decays below half the
        // threshold and the flag clears.
        assert!(tracker.can_make_request_with_light_throttle_at(base + 70.0, "classic_zero"));
        assert!(!tracker.light_throttle_enabled());
    }

    #[test]
    fn test_endpoint_call_gc() {
        let tracker = RateLimitTracker::new();
        let base = 100.0;
        for i in 0..5 {
            tracker.handle_rate_limit_error_at(base + i as f64, Some(1.0));
        }
        tracker.record_endpoint_call_at(base + 5.0, "a");
        tracker.record_endpoint_call_at(base + 6.5, "b");
        // "a" is older than one second and was collected on the update.
        assert_eq!(tracker.state.lock().endpoint_last_call.len(), 1);
    }

    #[test]
    fn test_minimum_interval_scales_with_tickers() {
        let tracker = RateLimitTracker::new();
        assert_eq!(tracker.get_minimum_interval(10), 0.0);

        tracker.record_request(1.0, true, Some(&limit_headers("120")));
        // 60 / 120 = 0.5 s per request, times 10 tickers
        assert!((tracker.get_minimum_interval(10) - 5.0).abs() < 1e-9);
        assert!((tracker.get_minimum_interval(0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_failure_marks_limited() {
        let tracker = RateLimitTracker::new();
        tracker.record_request(1.0, false, None);
        assert!(!tracker.can_make_request());
        // A later success below the (unknown) budget clears it.
        tracker.record_request(2.0, true, None);
        assert!(tracker.can_make_request());
    }
}
