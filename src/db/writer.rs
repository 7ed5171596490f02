//! Batched data writer
//!
//! Rows are queued per ticker and flushed in batches: displayed tickers on
//! every write, collection tickers when five rows are pending or the oldest
//! pending row is two seconds old. A background flusher enforces the time
//! bound even when no new writes arrive. Each flush deduplicates near-equal
//! timestamps, extends the table schema, writes one transaction, and
//! truncates the WAL.

use crate::api::{RESPONSE_HEADERS_KEY, RESPONSE_TIME_KEY};
use crate::config::constants::{
    BACKGROUND_FLUSH_INTERVAL, FILE_WRITE_COUNT_THRESHOLD, FILE_WRITE_INTERVAL_COLLECTION,
    TIMESTAMP_DEDUP_TOLERANCE_SECS,
};
use crate::config::Settings;
use crate::db::schema::{sanitize_field_name, SchemaManager, CHART_COLUMNS};
use crate::db::{db_path, ConnectionPool};
use crate::error::Result;
use crate::market_hours;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct PendingWrite {
    timestamp: f64,
    scalars: Map<String, Value>,
    profiles: Map<String, Value>,
    date: NaiveDate,
}

#[derive(Default)]
struct WriterState {
    pending: HashMap<String, Vec<PendingWrite>>,
    /// When the oldest write of the current batch arrived.
    first_pending: HashMap<String, Instant>,
    /// Present once a ticker has flushed at least once.
    last_flush: HashMap<String, Instant>,
}

/// Writes aggregated rows to per-ticker, per-date SQLite files
pub struct DataWriter {
    pool: Arc<ConnectionPool>,
    settings: Arc<RwLock<Settings>>,
    state: Mutex<WriterState>,
    flush_tx: mpsc::UnboundedSender<String>,
    flush_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stop: watch::Sender<bool>,
}

impl DataWriter {
    pub fn new(pool: Arc<ConnectionPool>, settings: Arc<RwLock<Settings>>) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            pool,
            settings,
            state: Mutex::new(WriterState::default()),
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
            stop,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Queue one aggregated row. The market date is derived from the row's
    /// own timestamp, so late rows still land in the correct day's file.
    pub fn write_entry(
        &self,
        ticker: &str,
        timestamp: f64,
        data: &Map<String, Value>,
        is_active: bool,
    ) -> Result<()> {
        let (scalars, profiles) = split_fields(data);
        let date = market_hours::market_date_for_timestamp(timestamp);

        let first_ever;
        {
            let mut state = self.state.lock();
            first_ever = !state.last_flush.contains_key(ticker);
            let pending = state.pending.entry(ticker.to_string()).or_default();
            pending.push(PendingWrite {
                timestamp,
                scalars,
                profiles,
                date,
            });
            if pending.len() == 1 {
                state.first_pending.insert(ticker.to_string(), Instant::now());
            }
        }

        // The lock is released before the flush decision, which re-acquires
        // it on its own.
        if first_ever || self.should_flush(ticker, is_active) {
            debug!(ticker, first_ever, is_active, "Requesting flush");
            let _ = self.flush_tx.send(ticker.to_string());
        }
        Ok(())
    }

    fn should_flush(&self, ticker: &str, is_active: bool) -> bool {
        let state = self.state.lock();
        let pending_count = state.pending.get(ticker).map(Vec::len).unwrap_or(0);
        if pending_count == 0 {
            return false;
        }
        // Displayed tickers flush on every write.
        if is_active {
            return true;
        }
        if pending_count >= FILE_WRITE_COUNT_THRESHOLD {
            return true;
        }
        match state.first_pending.get(ticker) {
            Some(first) => first.elapsed() >= FILE_WRITE_INTERVAL_COLLECTION,
            // Pending writes without a tracked start: flush to be safe.
            None => true,
        }
    }

    /// Flush everything pending for one ticker. On failure the writes are
    /// re-queued and the error surfaced.
    pub fn flush_ticker(&self, ticker: &str) -> Result<()> {
        let pending = {
            let mut state = self.state.lock();
            let pending = state
                .pending
                .get_mut(ticker)
                .map(std::mem::take)
                .unwrap_or_default();
            if pending.is_empty() {
                return Ok(());
            }
            state.first_pending.remove(ticker);
            state.last_flush.insert(ticker.to_string(), Instant::now());
            pending
        };

        let mut by_date: HashMap<NaiveDate, Vec<PendingWrite>> = HashMap::new();
        for write in pending {
            by_date.entry(write.date).or_default().push(write);
        }
        let mut groups: Vec<(NaiveDate, Vec<PendingWrite>)> = by_date.into_iter().collect();

        let mut index = 0;
        while index < groups.len() {
            let (date, writes) = &groups[index];
            if let Err(e) = self.flush_date(ticker, *date, writes) {
                // Re-queue this group and everything not yet attempted.
                let mut state = self.state.lock();
                let pending = state.pending.entry(ticker.to_string()).or_default();
                for (_, writes) in groups.drain(index..) {
                    pending.extend(writes);
                }
                return Err(e);
            }
            index += 1;
        }
        Ok(())
    }

    fn flush_date(&self, ticker: &str, date: NaiveDate, writes: &[PendingWrite]) -> Result<()> {
        let writes = deduplicate(writes.to_vec(), TIMESTAMP_DEDUP_TOLERANCE_SECS);
        if writes.is_empty() {
            return Ok(());
        }

        let data_dir = self.settings.read().data_directory().to_string();
        let path = db_path(&data_dir, ticker, date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.pool.get(&path, false)?;
        let mut guard = conn.lock();

        // Stable, collision-free column list for this batch. First field to
        // claim a sanitised name wins.
        let mut seen: HashSet<String> = ["timestamp", "profiles_blob"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut columns: Vec<(String, String)> = Vec::new();
        for write in &writes {
            for field in write.scalars.keys() {
                let column = sanitize_field_name(field);
                if column.is_empty() {
                    continue;
                }
                if seen.insert(column.clone()) {
                    columns.push((field.clone(), column));
                }
            }
        }

        // The canonical chart columns are created even when this batch lacks
        // them, so readers never hit "no such column" on a fresh file.
        let mut schema_fields: Vec<String> = columns.iter().map(|(f, _)| f.clone()).collect();
        for chart_column in CHART_COLUMNS {
            if !seen.contains(chart_column) {
                schema_fields.push(chart_column.to_string());
            }
        }
        SchemaManager::new(&guard).ensure_table(&schema_fields)?;

        let tx = guard.transaction()?;
        {
            let mut column_names = vec!["timestamp".to_string(), "profiles_blob".to_string()];
            column_names.extend(columns.iter().map(|(_, c)| c.clone()));
            let placeholders: Vec<String> =
                (1..=column_names.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT OR REPLACE INTO ticker_data ({}) VALUES ({})",
                column_names.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;

            for write in &writes {
                let blob = if write.profiles.is_empty() {
                    SqlValue::Null
                } else {
                    SqlValue::Blob(gzip_json(&write.profiles)?)
                };
                let mut params: Vec<SqlValue> = Vec::with_capacity(column_names.len());
                params.push(SqlValue::Real(write.timestamp));
                params.push(blob);
                for (field, _) in &columns {
                    params.push(
                        write
                            .scalars
                            .get(field)
                            .map(scalar_sql_value)
                            .unwrap_or(SqlValue::Null),
                    );
                }
                stmt.execute(params_from_iter(params))?;
            }
        }
        tx.commit()?;

        // Keep the WAL bounded.
        if let Err(e) = guard.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!(ticker, "WAL checkpoint failed: {e}");
        }

        debug!(
            ticker,
            date = %date,
            rows = writes.len(),
            path = %path.display(),
            "Flushed batch"
        );
        Ok(())
    }

    /// Flush every ticker with pending writes.
    pub fn flush_all(&self) -> Result<()> {
        let tickers: Vec<String> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|(_, p)| !p.is_empty())
                .map(|(t, _)| t.clone())
                .collect()
        };

        let mut last_error = None;
        for ticker in &tickers {
            if let Err(e) = self.flush_ticker(ticker) {
                error!(%ticker, "Flush failed: {e}");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn pending_count(&self, ticker: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(ticker)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Run flush requests and the periodic pending check until stopped.
    pub fn spawn_background_flusher(self: Arc<Self>) -> JoinHandle<()> {
        let mut flush_rx = self
            .flush_rx
            .lock()
            .take()
            .expect("background flusher already started");
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BACKGROUND_FLUSH_INTERVAL);
            debug!("Background flusher started");
            loop {
                tokio::select! {
                    Some(ticker) = flush_rx.recv() => {
                        if let Err(e) = self.flush_ticker(&ticker) {
                            error!(%ticker, "Flush failed: {e}");
                        }
                    }
                    _ = tick.tick() => self.check_pending(),
                    _ = stop.changed() => {
                        debug!("Background flusher stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Enforce the time bound for tickers nothing has written to recently.
    fn check_pending(&self) {
        let tickers: Vec<String> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|(_, p)| !p.is_empty())
                .map(|(t, _)| t.clone())
                .collect()
        };
        for ticker in tickers {
            if self.should_flush(&ticker, false) {
                if let Err(e) = self.flush_ticker(&ticker) {
                    error!(%ticker, "Background flush failed: {e}");
                }
            }
        }
    }

    /// Stop the background flusher, flush everything synchronously, and
    /// close the pool (checkpointing each file).
    pub fn close(&self) -> Result<()> {
        info!("Closing data writer");
        let _ = self.stop.send(true);
        let result = self.flush_all();
        self.pool.close_all();
        result
    }
}

/// Partition an aggregated row into scalar columns and profile fields.
/// Zero, empty-string and false scalars are dropped; a nested `profiles`
/// object merges into the profile set.
fn split_fields(data: &Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut scalars = Map::new();
    let mut profiles = Map::new();

    if let Some(Value::Object(nested)) = data.get("profiles") {
        for (key, value) in nested {
            profiles.insert(key.clone(), value.clone());
        }
    }

    for (key, value) in data {
        if key == "profiles"
            || key == "timestamp"
            || key == "ticker"
            || key == RESPONSE_HEADERS_KEY
            || key == RESPONSE_TIME_KEY
        {
            continue;
        }
        match value {
            Value::Array(_) | Value::Object(_) => {
                profiles.insert(key.clone(), value.clone());
            }
            scalar => {
                if !is_zero_value(scalar) {
                    scalars.insert(key.clone(), scalar.clone());
                }
            }
        }
    }
    (scalars, profiles)
}

fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn scalar_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Number(n) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::String(s) => SqlValue::Text(s.clone()),
        _ => SqlValue::Null,
    }
}

pub(crate) fn gzip_json(profiles: &Map<String, Value>) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(profiles)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Sort ascending and collapse runs whose consecutive gaps are within the
/// tolerance, keeping the last write of each run.
fn deduplicate(mut writes: Vec<PendingWrite>, tolerance: f64) -> Vec<PendingWrite> {
    writes.sort_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut result = Vec::with_capacity(writes.len());
    let mut iter = writes.into_iter().peekable();
    while let Some(write) = iter.next() {
        if let Some(next) = iter.peek() {
            if next.timestamp - write.timestamp <= tolerance {
                continue;
            }
        }
        result.push(write);
    }
    result
}
