//! Dynamic table schema
//!
//! Each ticker file carries one `ticker_data` table whose scalar column set
//! grows as new fields appear; columns are only ever added, never migrated
//! away. Column additions race across processes, so a duplicate-column
//! error from ALTER TABLE is swallowed.

use crate::error::Result;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::debug;

/// Columns the chart readers expect. Always created so a reader can never
/// hit "no such column" against a freshly created file.
pub const CHART_COLUMNS: [&str; 10] = [
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

/// Sanitise a field name for use as a SQL column name.
///
/// Non-alphanumeric characters become `_`, leading/trailing underscores are
/// stripped, and a `_` prefix is added when the result does not start with a
/// letter or underscore. Idempotent: sanitising a sanitised name is a no-op.
pub fn sanitize_field_name(field: &str) -> String {
    let mut sanitized: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    sanitized = sanitized.trim_matches('_').to_string();

    match sanitized.chars().next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => sanitized,
        Some(_) => format!("_{sanitized}"),
        None => sanitized,
    }
}

/// Manages creation and extension of the `ticker_data` table
pub struct SchemaManager<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SchemaManager<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Create the table if missing and append any scalar column not yet
    /// present. New columns default to REAL.
    pub fn ensure_table(&self, scalar_fields: &[String]) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ticker_data (
                timestamp REAL PRIMARY KEY,
                profiles_blob BLOB
            ) WITHOUT ROWID",
        )?;

        let existing = self.existing_columns()?;

        for field in scalar_fields {
            let column = sanitize_field_name(field);
            if column.is_empty() || column == "timestamp" || column == "profiles_blob" {
                continue;
            }
            if existing.contains(&column) {
                continue;
            }
            let sql = format!("ALTER TABLE ticker_data ADD COLUMN {column} REAL");
            if let Err(e) = self.conn.execute_batch(&sql) {
                // Another writer may have added it between our column scan
                // and the ALTER.
                if e.to_string().contains("duplicate column") {
                    debug!(column, "Column already added by a concurrent writer");
                    continue;
                }
                return Err(e.into());
            }
        }

        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_timestamp_desc
             ON ticker_data(timestamp DESC)",
        )?;
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_timestamp_asc
             ON ticker_data(timestamp ASC)",
        )?;

        Ok(())
    }

    fn existing_columns(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info('ticker_data')")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(columns)
    }
}

/// Column names currently present on `ticker_data`.
pub(crate) fn table_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('ticker_data')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_and_trims() {
        assert_eq!(sanitize_field_name("major-pos.vol"), "major_pos_vol");
        assert_eq!(sanitize_field_name("_leading_"), "leading");
        assert_eq!(sanitize_field_name("spot price"), "spot_price");
        assert_eq!(sanitize_field_name("0dte"), "_0dte");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for field in ["major-pos.vol", "spot", "0dte", "a b c", "__x__"] {
            let once = sanitize_field_name(field);
            assert_eq!(sanitize_field_name(&once), once, "field {field:?}");
        }
    }

    #[test]
    fn test_ensure_table_creates_and_extends() {
        let conn = Connection::open_in_memory().unwrap();
        let manager = SchemaManager::new(&conn);

        manager.ensure_table(&["spot".to_string()]).unwrap();
        let columns = table_columns(&conn).unwrap();
        assert!(columns.contains(&"timestamp".to_string()));
        assert!(columns.contains(&"profiles_blob".to_string()));
        assert!(columns.contains(&"spot".to_string()));

        // A later batch introduces a new field; the column set is a superset.
        manager
            .ensure_table(&["spot".to_string(), "zero_gamma".to_string()])
            .unwrap();
        let columns = table_columns(&conn).unwrap();
        assert!(columns.contains(&"spot".to_string()));
        assert!(columns.contains(&"zero_gamma".to_string()));
    }

    #[test]
    fn test_ensure_table_sanitizes_fields() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaManager::new(&conn)
            .ensure_table(&["major-pos.vol".to_string()])
            .unwrap();
        let columns = table_columns(&conn).unwrap();
        assert!(columns.contains(&"major_pos_vol".to_string()));
    }

    #[test]
    fn test_ensure_table_repeat_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let manager = SchemaManager::new(&conn);
        manager.ensure_table(&["spot".to_string()]).unwrap();
        manager.ensure_table(&["spot".to_string()]).unwrap();
        let count = table_columns(&conn)
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "spot")
            .count();
        assert_eq!(count, 1);
    }
}
