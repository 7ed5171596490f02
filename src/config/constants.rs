//! Contract-level constants for the collection engine.
//!
//! These values are part of the engine's behavioural contract with the
//! upstream API and the on-disk format. They are documented here and used
//! directly by the components; they are deliberately not exposed as tunables.

use std::time::Duration;

/// Upstream API base URL.
pub const API_BASE_URL: &str = "https://api.gexbot.com";

/// Environment variable that overrides the configured API key.
pub const API_KEY_ENV_VAR: &str = "GEXBOT_API_KEY";

/// Default settings file name.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Parallel fanout width for endpoint fetches within one batch.
pub const API_EXECUTOR_WORKERS: usize = 96;

/// HTTP connection pool: max idle connections kept per host.
pub const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 128;

/// HTTP connection pool: idle connection timeout.
pub const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Overall per-request timeout.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-error retry backoffs (also used by the write queue).
pub const RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// Timestamps closer together than this collapse to a single row.
pub const TIMESTAMP_DEDUP_TOLERANCE_SECS: f64 = 0.1;

/// Collection-priority writes flush at this pending count...
pub const FILE_WRITE_COUNT_THRESHOLD: usize = 5;

/// ...or once the oldest pending write is this old.
pub const FILE_WRITE_INTERVAL_COLLECTION: Duration = Duration::from_secs(2);

/// Cadence of the writer's background flusher.
pub const BACKGROUND_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Database connection pool size cap.
pub const DB_POOL_MAX_SIZE: usize = 20;

/// Pooled connections idle longer than this are closed.
pub const DB_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the connection pool's idle sweep.
pub const DB_POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Query result cache: entry cap and TTL.
pub const QUERY_CACHE_MAX_ENTRIES: usize = 50;
pub const QUERY_CACHE_TTL: Duration = Duration::from_secs(5);

/// Row cap for the chart reader (full trading day at 1 s is ~23,400 rows).
pub const MAX_CHART_ROWS: usize = 30_000;

/// Per-ticker worker cadence while the market is closed (polls the clock).
pub const MARKET_CLOSED_POLL_SECS: f64 = 60.0;

/// Cadence of the market-date rollover monitor.
pub const ROLLOVER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Health-check cadence and stuck-update thresholds.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(2000);
pub const UPDATE_STUCK_WARN: Duration = Duration::from_secs(30);
pub const UPDATE_STUCK_CRITICAL: Duration = Duration::from_secs(60);

/// Minimum spacing between recovery attempts.
pub const RECOVERY_THROTTLE: Duration = Duration::from_secs(30);

/// Delayed flush after a priority-0 write, to maximise display freshness.
pub const ACTIVE_FLUSH_DELAY: Duration = Duration::from_millis(100);
