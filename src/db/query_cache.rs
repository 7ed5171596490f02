//! Query result caching
//!
//! Full-range loads are cached briefly so repeated chart refreshes within a
//! few seconds do not re-read the file. TTL expiry plus LRU eviction at a
//! small fixed capacity.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Column-oriented query result: column name -> one value per row.
pub type ColumnData = HashMap<String, Vec<Value>>;

struct CacheEntry {
    data: Arc<ColumnData>,
    stored_at: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // LRU order, most recent at the end
    access_order: Vec<String>,
}

/// TTL + LRU cache for query results
pub struct QueryCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                access_order: Vec::new(),
            }),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<ColumnData>> {
        let state = self.state.lock();
        let entry = state.entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(Arc::clone(&entry.data))
    }

    pub fn set(&self, key: String, data: Arc<ColumnData>) {
        let mut state = self.state.lock();

        let ttl = self.ttl;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            state.entries.remove(&key);
            state.access_order.retain(|k| k != &key);
        }

        if state.entries.len() >= self.max_size && !state.entries.contains_key(&key) {
            if !state.access_order.is_empty() {
                let oldest = state.access_order.remove(0);
                state.entries.remove(&oldest);
            }
        }

        state.entries.insert(
            key.clone(),
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
        state.access_order.retain(|k| k != &key);
        state.access_order.push(key);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for a (ticker, date) load, optionally bounded by a time range.
pub fn cache_key(ticker: &str, date: &str, start: f64, end: f64) -> String {
    if start > 0.0 && end > 0.0 {
        format!("{ticker}:{date}:{start:.3}:{end:.3}")
    } else {
        format!("{ticker}:{date}")
    }
}
