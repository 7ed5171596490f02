//! Scheduling: rate-limit tracking, adaptive intervals, per-ticker workers

mod adaptive;
mod polling;
mod rate_limiter;

pub use adaptive::AdaptiveScheduler;
pub use polling::{PollingControl, PollingLoop, TickerReadyFn};
pub use rate_limiter::RateLimitTracker;
