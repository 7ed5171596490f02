//! Per-ticker collection configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single ticker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    /// Show this ticker in the shell's table/chart surfaces
    pub display: bool,
    /// Collect data for this ticker
    pub collection_enabled: bool,
    /// "high", "medium" or "low"; empty means medium
    pub priority: String,
    /// Optional polling override in milliseconds. `None` or 0 means
    /// priority-based scheduling; non-zero values are clamped to >= 1000.
    pub refresh_rate_ms: Option<u64>,
}

impl TickerConfig {
    /// Effective refresh override in milliseconds, 0 if disabled.
    pub fn effective_refresh_ms(&self) -> u64 {
        match self.refresh_rate_ms {
            None | Some(0) => 0,
            Some(ms) => ms.max(1000),
        }
    }
}

/// Tickers with `collection_enabled` set.
pub fn enabled_tickers(configs: &HashMap<String, TickerConfig>) -> Vec<String> {
    let mut enabled: Vec<String> = configs
        .iter()
        .filter(|(_, c)| c.collection_enabled)
        .map(|(t, _)| t.clone())
        .collect();
    enabled.sort();
    enabled
}
