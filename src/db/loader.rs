//! Data readers
//!
//! Three read paths with very different costs: the chart reader and the
//! latest-row reader select only the canonical display columns and must
//! never touch the profiles blob; the full-range readers decompress the
//! blob and merge profile fields into the column map, and are cached
//! briefly because chart refreshes hit them repeatedly.

use crate::config::constants::{QUERY_CACHE_MAX_ENTRIES, QUERY_CACHE_TTL};
use crate::config::Settings;
use crate::db::query_cache::{cache_key, ColumnData, QueryCache};
use crate::db::schema::table_columns;
use crate::db::{db_path, ConnectionPool};
use crate::error::Result;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use parking_lot::RwLock;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Columns for the chart reader: timestamp plus the canonical chart set.
const CHART_READ_COLUMNS: [&str; 11] = [
    "timestamp",
    "spot",
    "zero_gamma",
    "major_pos_vol",
    "major_neg_vol",
    "major_long_gamma",
    "major_short_gamma",
    "major_positive",
    "major_negative",
    "major_pos_oi",
    "major_neg_oi",
];

/// Columns for the latest-row reader used by the ticker table.
const TICKER_READ_COLUMNS: [&str; 5] = [
    "timestamp",
    "spot",
    "zero_gamma",
    "major_pos_vol",
    "major_neg_vol",
];

/// Display fields that fall back to the most recent non-null value when the
/// latest row is null.
const FALLBACK_FIELDS: [&str; 4] = ["spot", "zero_gamma", "major_pos_vol", "major_neg_vol"];

/// Reads ticker databases through a read-only connection pool
pub struct DataLoader {
    pool: Arc<ConnectionPool>,
    settings: Arc<RwLock<Settings>>,
    cache: QueryCache,
}

impl DataLoader {
    pub fn new(pool: Arc<ConnectionPool>, settings: Arc<RwLock<Settings>>) -> Self {
        Self {
            pool,
            settings,
            cache: QueryCache::new(QUERY_CACHE_MAX_ENTRIES, QUERY_CACHE_TTL),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn path_for(&self, ticker: &str, date: NaiveDate) -> std::path::PathBuf {
        let data_dir = self.settings.read().data_directory().to_string();
        db_path(&data_dir, ticker, date)
    }

    /// Chart data: ascending by timestamp, row-capped, never loads the
    /// profiles blob, never cached. Missing file or missing columns yield
    /// empty arrays so the shell can render "no data".
    pub fn load_chart_data(
        &self,
        ticker: &str,
        date: NaiveDate,
        max_rows: usize,
    ) -> Result<ColumnData> {
        let path = self.path_for(ticker, date);
        if !path.exists() {
            debug!(ticker, path = %path.display(), "No database file yet");
            return Ok(empty_columns(&CHART_READ_COLUMNS));
        }

        let conn = self.pool.get(&path, true)?;
        let guard = conn.lock();

        let available = existing_of(&guard, &CHART_READ_COLUMNS)?;
        if available.is_empty() || available == ["timestamp"] {
            return Ok(empty_columns(&CHART_READ_COLUMNS));
        }

        let sql = format!(
            "SELECT {} FROM ticker_data ORDER BY timestamp ASC LIMIT {max_rows}",
            available.join(", ")
        );
        let mut result = empty_columns(&CHART_READ_COLUMNS);
        let mut stmt = guard.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (index, column) in available.iter().enumerate() {
                let value = column_value(row.get_ref(index)?);
                if let Some(values) = result.get_mut(column.as_str()) {
                    values.push(value);
                }
            }
        }
        Ok(result)
    }

    /// Latest row for the main ticker table. For critical display fields a
    /// null latest value falls back to the most recent non-null one
    /// (zero_gamma additionally treats 0.0 as missing).
    pub fn load_ticker_latest(&self, ticker: &str, date: NaiveDate) -> Result<ColumnData> {
        let path = self.path_for(ticker, date);
        if !path.exists() {
            return Ok(empty_columns(&TICKER_READ_COLUMNS));
        }

        let conn = self.pool.get(&path, true)?;
        let guard = conn.lock();

        // Make freshly checkpointed writes visible to this connection.
        let _ = guard.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()));

        let available = existing_of(&guard, &TICKER_READ_COLUMNS)?;
        if available.is_empty() || available == ["timestamp"] {
            return Ok(empty_columns(&TICKER_READ_COLUMNS));
        }

        let sql = format!(
            "SELECT {} FROM ticker_data ORDER BY timestamp DESC LIMIT 1",
            available.join(", ")
        );
        let mut result = empty_columns(&TICKER_READ_COLUMNS);
        let mut stmt = guard.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            for (index, column) in available.iter().enumerate() {
                let value = column_value(row.get_ref(index)?);
                if let Some(values) = result.get_mut(column.as_str()) {
                    values.push(value);
                }
            }
        }
        drop(rows);
        drop(stmt);

        for field in FALLBACK_FIELDS {
            if !available.iter().any(|c| c == field) {
                continue;
            }
            let needs_fallback = match result.get(field).and_then(|v| v.first()) {
                None | Some(Value::Null) => true,
                Some(value) => field == "zero_gamma" && value.as_f64() == Some(0.0),
            };
            if !needs_fallback {
                continue;
            }
            let sql = if field == "zero_gamma" {
                format!(
                    "SELECT {field} FROM ticker_data \
                     WHERE {field} IS NOT NULL AND {field} != 0.0 \
                     ORDER BY timestamp DESC LIMIT 1"
                )
            } else {
                format!(
                    "SELECT {field} FROM ticker_data \
                     WHERE {field} IS NOT NULL ORDER BY timestamp DESC LIMIT 1"
                )
            };
            match guard.query_row(&sql, [], |row| row.get::<_, f64>(0)) {
                Ok(last_known) => {
                    debug!(ticker, field, last_known, "Using last known value");
                    result.insert(field.to_string(), vec![last_known.into()]);
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => warn!(ticker, field, "Fallback query failed: {e}"),
            }
        }

        Ok(result)
    }

    /// Everything for a day, including decompressed profiles. Cached.
    pub fn load_full(&self, ticker: &str, date: NaiveDate) -> Result<Arc<ColumnData>> {
        let key = cache_key(ticker, &date.to_string(), 0.0, 0.0);
        if let Some(cached) = self.cache.get(&key) {
            debug!(ticker, %date, "Query cache hit");
            return Ok(cached);
        }

        let path = self.path_for(ticker, date);
        if !path.exists() {
            let empty = Arc::new(ColumnData::new());
            self.cache.set(key, Arc::clone(&empty));
            return Ok(empty);
        }

        let conn = self.pool.get(&path, true)?;
        let guard = conn.lock();
        let data = Arc::new(scan_all_columns(
            &guard,
            "ORDER BY timestamp ASC",
            &[],
        )?);
        self.cache.set(key, Arc::clone(&data));
        Ok(data)
    }

    /// Rows within `[start, end]`, including decompressed profiles. Cached.
    pub fn load_time_range(
        &self,
        ticker: &str,
        date: NaiveDate,
        start: f64,
        end: f64,
    ) -> Result<Arc<ColumnData>> {
        let key = cache_key(ticker, &date.to_string(), start, end);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let path = self.path_for(ticker, date);
        if !path.exists() {
            let empty = Arc::new(ColumnData::new());
            self.cache.set(key, Arc::clone(&empty));
            return Ok(empty);
        }

        let conn = self.pool.get(&path, true)?;
        let guard = conn.lock();
        let data = Arc::new(scan_all_columns(
            &guard,
            "WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
            &[&start as &dyn rusqlite::ToSql, &end],
        )?);
        self.cache.set(key, Arc::clone(&data));
        Ok(data)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn close(&self) {
        self.pool.close_all();
    }
}

/// Requested columns that actually exist in the table, request order.
fn existing_of(conn: &Connection, requested: &[&str]) -> Result<Vec<String>> {
    let existing = table_columns(conn)?;
    Ok(requested
        .iter()
        .filter(|c| existing.iter().any(|e| e == *c))
        .map(|c| (*c).to_string())
        .collect())
}

fn empty_columns(columns: &[&str]) -> ColumnData {
    columns
        .iter()
        .map(|c| ((*c).to_string(), Vec::new()))
        .collect()
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        // Blobs are handled by the profile decompression path only.
        ValueRef::Blob(_) => Value::Null,
    }
}

/// Scan every column; the profiles blob is decompressed and its fields
/// merged into the column map instead of being returned raw.
fn scan_all_columns(
    conn: &Connection,
    tail: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<ColumnData> {
    let mut columns = vec!["timestamp".to_string(), "profiles_blob".to_string()];
    for column in table_columns(conn)? {
        if column != "timestamp" && column != "profiles_blob" {
            columns.push(column);
        }
    }

    let sql = format!("SELECT {} FROM ticker_data {tail}", columns.join(", "));
    let mut result = ColumnData::new();
    for column in &columns {
        if column != "profiles_blob" {
            result.insert(column.clone(), Vec::new());
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    while let Some(row) = rows.next()? {
        for (index, column) in columns.iter().enumerate() {
            if column == "profiles_blob" {
                if let ValueRef::Blob(blob) = row.get_ref(index)? {
                    if !blob.is_empty() {
                        merge_profiles(blob, &mut result);
                    }
                }
                continue;
            }
            let value = column_value(row.get_ref(index)?);
            if let Some(values) = result.get_mut(column.as_str()) {
                values.push(value);
            }
        }
    }
    Ok(result)
}

fn merge_profiles(blob: &[u8], result: &mut ColumnData) {
    let mut decoder = GzDecoder::new(blob);
    let mut decompressed = Vec::new();
    if decoder.read_to_end(&mut decompressed).is_err() {
        warn!("Failed to decompress profiles blob, skipping row");
        return;
    }
    match serde_json::from_slice::<Value>(&decompressed) {
        Ok(Value::Object(profiles)) => {
            for (key, value) in profiles {
                result.entry(key).or_default().push(value);
            }
        }
        Ok(_) | Err(_) => warn!("Profiles blob is not a JSON object, skipping row"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::writer::DataWriter;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn object(value: Value) -> serde_json::Map<String, Value> {
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

    fn test_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 4).unwrap()
    }

    fn loader_and_writer(dir: &std::path::Path) -> (DataLoader, Arc<DataWriter>) {
        let settings = Arc::new(RwLock::new(Settings {
            data_directory: dir.to_str().unwrap().to_string(),
            ..Default::default()
        }));
        let writer = Arc::new(DataWriter::new(
            Arc::new(ConnectionPool::new(5, Duration::from_secs(10))),
            Arc::clone(&settings),
        ));
        let loader = DataLoader::new(
            Arc::new(ConnectionPool::new(5, Duration::from_secs(10))),
            settings,
        );
        (loader, writer)
    }

    #[tokio::test]
    async fn test_chart_data_missing_file_yields_empty_arrays() {
        let dir = tempdir().unwrap();
        let (loader, _writer) = loader_and_writer(dir.path());

        let data = loader.load_chart_data("SPX", test_date(), 1000).unwrap();
        assert_eq!(data.len(), CHART_READ_COLUMNS.len());
        assert!(data["timestamp"].is_empty());
        assert!(data["spot"].is_empty());
    }

    #[tokio::test]
    async fn test_chart_data_reads_rows_without_blob() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        for i in 0..3 {
            writer
                .write_entry(
                    "SPX",
                    ts + i as f64,
                    &object(json!({"spot": 100.0 + i as f64, "strikes": [1, 2]})),
                    false,
                )
                .unwrap();
        }
        writer.flush_ticker("SPX").unwrap();

        let data = loader.load_chart_data("SPX", test_date(), 30_000).unwrap();
        assert_eq!(data["timestamp"].len(), 3);
        assert_eq!(data["spot"].len(), 3);
        // Chart reader never surfaces profile fields.
        assert!(!data.contains_key("strikes"));
        assert_eq!(data["spot"][0].as_f64(), Some(100.0));
    }

    #[tokio::test]
    async fn test_chart_data_row_cap() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        for i in 0..5 {
            writer
                .write_entry("SPX", ts + i as f64, &object(json!({"spot": 1.0})), false)
                .unwrap();
        }
        writer.flush_ticker("SPX").unwrap();

        let data = loader.load_chart_data("SPX", test_date(), 2).unwrap();
        assert_eq!(data["timestamp"].len(), 2);
    }

    #[tokio::test]
    async fn test_latest_row_with_fallback() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        // Older row carries spot; the latest row lacks it (dropped zero).
        writer
            .write_entry("SPX", ts, &object(json!({"spot": 123.0})), false)
            .unwrap();
        writer
            .write_entry("SPX", ts + 1.0, &object(json!({"spot": 0.0, "major_pos_vol": 7.0})), false)
            .unwrap();
        writer.flush_ticker("SPX").unwrap();

        let data = loader.load_ticker_latest("SPX", test_date()).unwrap();
        assert_eq!(data["timestamp"].len(), 1);
        // Latest row's spot is NULL; fallback finds the older value.
        assert_eq!(data["spot"][0].as_f64(), Some(123.0));
        assert_eq!(data["major_pos_vol"][0].as_f64(), Some(7.0));
    }

    #[tokio::test]
    async fn test_full_load_merges_profiles() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        writer
            .write_entry(
                "SPX",
                ts,
                &object(json!({"spot": 9.0, "gamma_profile": [0.1, 0.2]})),
                false,
            )
            .unwrap();
        writer.flush_ticker("SPX").unwrap();

        let data = loader.load_full("SPX", test_date()).unwrap();
        assert_eq!(data["timestamp"].len(), 1);
        assert_eq!(data["gamma_profile"][0], json!([0.1, 0.2]));
        assert!(!data.contains_key("profiles_blob"));
    }

    #[tokio::test]
    async fn test_full_load_uses_cache() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        writer
            .write_entry("SPX", ts, &object(json!({"spot": 9.0})), false)
            .unwrap();
        writer.flush_ticker("SPX").unwrap();

        let first = loader.load_full("SPX", test_date()).unwrap();
        let second = loader.load_full("SPX", test_date()).unwrap();
        assert!(Arc::ptr_eq(&first, &second), "second load is the cached Arc");
    }

    #[tokio::test]
    async fn test_time_range_bounds() {
        let dir = tempdir().unwrap();
        let (loader, writer) = loader_and_writer(dir.path());
        let ts = weekday_noon_ts();

        for i in 0..5 {
            writer
                .write_entry("SPX", ts + i as f64, &object(json!({"spot": i as f64 + 1.0})), false)
                .unwrap();
        }
        writer.flush_ticker("SPX").unwrap();

        let data = loader
            .load_time_range("SPX", test_date(), ts + 1.0, ts + 3.0)
            .unwrap();
        assert_eq!(data["timestamp"].len(), 3);
    }
}
