//! Per-ticker, per-market-day SQLite storage

mod connection;
mod loader;
mod query_cache;
mod schema;
mod writer;

pub use connection::ConnectionPool;
pub use loader::DataLoader;
pub use query_cache::{ColumnData, QueryCache};
pub use schema::{sanitize_field_name, SchemaManager, CHART_COLUMNS};
pub use writer::DataWriter;

use crate::market_hours;
use chrono::NaiveDate;
use std::path::PathBuf;

/// Database file path for a ticker and date:
/// `<data_dir> <MM.DD.YYYY>/<ticker>.db` (literal space before the date).
/// Weekend dates collapse to the prior Friday.
pub fn db_path(data_dir: &str, ticker: &str, date: NaiveDate) -> PathBuf {
    let date = market_hours::storage_date(date);
    let dir = format!("{} {}", data_dir, date.format("%m.%d.%Y"));
    PathBuf::from(dir).join(format!("{ticker}.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_format() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 14).unwrap();
        let path = db_path("Tickers", "SPX", date);
        assert_eq!(path, PathBuf::from("Tickers 01.14.2026/SPX.db"));
    }

    #[test]
    fn test_db_path_weekend_collapse() {
        // Saturday 2026-03-07 lands in Friday's directory
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        let path = db_path("Tickers", "SPX", date);
        assert_eq!(path, PathBuf::from("Tickers 03.06.2026/SPX.db"));
    }
}
