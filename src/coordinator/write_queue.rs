//! Priority write queue
//!
//! Coalesces writes per ticker: a newer enqueue overwrites any still-pending
//! task for the same ticker, because the newer row supersedes the older one.
//! Dispatch retries with backoff, falls back to one synchronous attempt, and
//! as a last resort drops the write with a critical log so collection keeps
//! running.

use crate::config::constants::{ACTIVE_FLUSH_DELAY, RETRY_BACKOFFS};
use crate::db::DataWriter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A queued database write
#[derive(Debug, Clone)]
struct WriteTask {
    timestamp: f64,
    data: Map<String, Value>,
    /// 0 = displayed ticker, >= 1 = collection-only
    priority: u8,
}

/// At most one pending write per ticker; latest enqueue wins
pub struct PriorityWriteQueue {
    writer: Arc<DataWriter>,
    pending: Arc<Mutex<HashMap<String, WriteTask>>>,
}

impl PriorityWriteQueue {
    pub fn new(writer: Arc<DataWriter>) -> Self {
        Self {
            writer,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a write and dispatch it asynchronously. Replaces any pending
    /// task for the same ticker.
    pub fn enqueue(&self, ticker: &str, timestamp: f64, data: Map<String, Value>, priority: u8) {
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(ticker) {
                debug!(ticker, "Replacing pending write with newer row");
            }
            pending.insert(
                ticker.to_string(),
                WriteTask {
                    timestamp,
                    data,
                    priority,
                },
            );
        }

        let pending = Arc::clone(&self.pending);
        let writer = Arc::clone(&self.writer);
        let ticker = ticker.to_string();
        tokio::spawn(async move {
            process_task(pending, writer, ticker).await;
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

async fn process_task(
    pending: Arc<Mutex<HashMap<String, WriteTask>>>,
    writer: Arc<DataWriter>,
    ticker: String,
) {
    let task = { pending.lock().remove(&ticker) };
    let Some(task) = task else {
        // A concurrent dispatch already took it.
        debug!(%ticker, "No pending write, nothing to do");
        return;
    };

    let is_active = task.priority == 0;

    let mut last_error = None;
    for (attempt, delay) in RETRY_BACKOFFS.iter().enumerate() {
        match writer.write_entry(&ticker, task.timestamp, &task.data, is_active) {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                if attempt + 1 < RETRY_BACKOFFS.len() {
                    warn!(
                        %ticker,
                        attempt = attempt + 1,
                        "Write failed, retrying in {:?}: {e}",
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    if let Some(async_error) = last_error {
        error!(
            %ticker,
            "All async write retries failed, attempting synchronous fallback: {async_error}"
        );
        if let Err(e) = writer.write_entry(&ticker, task.timestamp, &task.data, is_active) {
            // Dropping the row is the final resort; collection must continue.
            error!(%ticker, "CRITICAL: synchronous fallback failed, dropping write: {e}");
            return;
        }
        debug!(%ticker, "Synchronous fallback succeeded");
    }

    if is_active {
        // Explicit flush shortly after the write keeps displays fresh.
        tokio::spawn(async move {
            tokio::time::sleep(ACTIVE_FLUSH_DELAY).await;
            if let Err(e) = writer.flush_ticker(&ticker) {
                error!(%ticker, "Post-write flush failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::{db_path, ConnectionPool};
    use parking_lot::RwLock;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn weekday_noon_ts() -> f64 {
        use chrono::TimeZone;
        crate::market_hours::MARKET_TIMEZONE
            .with_ymd_and_hms(2026, 3, 4, 12, 0, 0)
            .unwrap()
            .timestamp() as f64
    }

    fn queue_with_dir(dir: &std::path::Path) -> (PriorityWriteQueue, Arc<DataWriter>) {
        let settings = Arc::new(RwLock::new(Settings {
            data_directory: dir.to_str().unwrap().to_string(),
            ..Default::default()
        }));
        let writer = Arc::new(DataWriter::new(
            Arc::new(ConnectionPool::new(5, Duration::from_secs(10))),
            settings,
        ));
        (PriorityWriteQueue::new(Arc::clone(&writer)), writer)
    }

    #[tokio::test]
    async fn test_latest_wins_coalescing() {
        let dir = tempdir().unwrap();
        let (queue, writer) = queue_with_dir(dir.path());
        let ts = weekday_noon_ts();

        // Two rapid enqueues; the dispatch for the first may find the
        // second's task, which is exactly the contract.
        queue.enqueue("AAPL", ts, object(json!({"spot": 1.0})), 1);
        queue.enqueue("AAPL", ts + 0.002, object(json!({"spot": 2.0})), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.flush_ticker("AAPL").unwrap();

        let path = db_path(
            dir.path().to_str().unwrap(),
            "AAPL",
            chrono::NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
        );
        let conn = rusqlite::Connection::open(&path).unwrap();
        let (count, timestamp, spot): (i64, f64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(timestamp), MAX(spot) FROM ticker_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!((timestamp - (ts + 0.002)).abs() < 1e-6);
        assert_eq!(spot, 2.0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_active_write_flushes_without_manual_flush() {
        let dir = tempdir().unwrap();
        let (queue, _writer) = queue_with_dir(dir.path());
        let ts = weekday_noon_ts();

        queue.enqueue("SPX", ts, object(json!({"spot": 5.0})), 0);

        // Dispatch + 100 ms delayed flush.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let path = db_path(
            dir.path().to_str().unwrap(),
            "SPX",
            chrono::NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
        );
        assert!(path.exists());
    }
}
