//! Continuous market-data collection engine.
//!
//! Polls a remote HTTP API for a configured set of tickers, aggregates the
//! per-ticker responses across endpoints, and persists them as time-indexed
//! rows in per-ticker, per-market-day SQLite files. Long-running by design:
//! it respects the server's published rate limits, survives transient
//! failures, and keeps writes durable and ordered.

pub mod api;
pub mod charts;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod market_hours;
pub mod scheduler;
pub mod state;

pub use error::{AppError, Result};
pub use state::AppState;
