//! Displayed-ticker tracking
//!
//! The shell registers a ticker here whenever a chart window for it opens.
//! Displayed tickers are polled at high priority and their writes flush
//! immediately.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Tracks which tickers are currently displayed in chart windows
#[derive(Default)]
pub struct DisplayTracker {
    displayed: RwLock<HashSet<String>>,
}

impl DisplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a ticker as displayed.
    pub fn register(&self, ticker: &str) {
        self.displayed.write().insert(ticker.to_string());
    }

    /// Mark a ticker as no longer displayed.
    pub fn unregister(&self, ticker: &str) {
        self.displayed.write().remove(ticker);
    }

    pub fn is_displayed(&self, ticker: &str) -> bool {
        self.displayed.read().contains(ticker)
    }

    pub fn displayed(&self) -> Vec<String> {
        self.displayed.read().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.displayed.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let tracker = DisplayTracker::new();
        assert!(!tracker.is_displayed("SPX"));

        tracker.register("SPX");
        assert!(tracker.is_displayed("SPX"));
        assert_eq!(tracker.count(), 1);

        // Registering twice is idempotent
        tracker.register("SPX");
        assert_eq!(tracker.count(), 1);

        tracker.unregister("SPX");
        assert!(!tracker.is_displayed("SPX"));
        assert_eq!(tracker.count(), 0);
    }
}
