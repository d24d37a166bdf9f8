//! Results Database Access
//!
//! Read-only access to the CI results store (issues, incidents, builds,
//! tests, checkouts) through a generic parameterized query executor.
//! Rows come back as column-name -> value maps so the correlation queries
//! can project whatever columns they need.
//!
//! All parameters are bound server-side with named placeholders; query text
//! never carries interpolated values. A failed query is logged and
//! propagated as a fatal error for the current operation - this is a batch
//! tool, there is no partial-result recovery.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, ToSql};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::error;

use crate::config::DatabaseConfig;

/// One result row: column name -> JSON value
pub type Row = BTreeMap<String, Value>;

/// Timestamp format used for query parameters.
///
/// Fixed-width UTC with millisecond precision, so that string comparison in
/// the store matches chronological order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for binding as a query parameter
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a timestamp coming back from the store
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in result row: '{}'", raw))
}

/// Handle to the results database
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open the database for the active profile, read-only
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = config.resolve_path()?;
        Self::open_path(&path)
    }

    /// Open a specific database file, read-only
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open results database {}", path.display()))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection (used by tests and tooling)
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Execute a parameterized query and collect all rows.
    ///
    /// An empty result set is an empty vec, not an error. Any execution
    /// failure is logged with the driver message and propagated.
    pub fn query(&self, sql: &str, params: &[(&str, &dyn ToSql)]) -> Result<Vec<Row>> {
        self.run(sql, params).map_err(|e| {
            error!("Query execution failed: {e:#}");
            e
        })
    }

    fn run(&self, sql: &str, params: &[(&str, &dyn ToSql)]) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(params)?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Row::new();
            for (i, name) in columns.iter().enumerate() {
                map.insert(name.clone(), value_to_json(row.get_ref(i)?));
            }
            result.push(map);
        }

        Ok(result)
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Typed accessors over a result row
pub trait RowExt {
    /// Required text column
    fn str_field(&self, name: &str) -> Result<String>;
    /// Nullable text column
    fn opt_str(&self, name: &str) -> Option<String>;
    /// Required integer column
    fn i64_field(&self, name: &str) -> Result<i64>;
    /// Required timestamp column
    fn ts_field(&self, name: &str) -> Result<DateTime<Utc>>;
    /// Nullable timestamp column
    fn opt_ts(&self, name: &str) -> Result<Option<DateTime<Utc>>>;
}

impl RowExt for Row {
    fn str_field(&self, name: &str) -> Result<String> {
        self.opt_str(name)
            .with_context(|| format!("Missing or null column '{}'", name))
    }

    fn opt_str(&self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn i64_field(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(Value::Number(n)) => n
                .as_i64()
                .with_context(|| format!("Column '{}' is not an integer", name)),
            _ => anyhow::bail!("Missing or null column '{}'", name),
        }
    }

    fn ts_field(&self, name: &str) -> Result<DateTime<Utc>> {
        let raw = self.str_field(name)?;
        parse_ts(&raw)
    }

    fn opt_ts(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.opt_str(name) {
            Some(raw) => Ok(Some(parse_ts(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_db() -> Db {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT, n INTEGER, x REAL, note TEXT);
             INSERT INTO t VALUES ('a', 1, 1.5, 'first');
             INSERT INTO t VALUES ('b', 2, NULL, NULL);",
        )
        .unwrap();
        Db::new(conn)
    }

    #[test]
    fn test_query_returns_maps() {
        let db = test_db();
        let rows = db.query("SELECT id, n, x, note FROM t ORDER BY id", &[]).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].str_field("id").unwrap(), "a");
        assert_eq!(rows[0].i64_field("n").unwrap(), 1);
        assert_eq!(rows[0].opt_str("note").unwrap(), "first");
        assert_eq!(rows[1].opt_str("x"), None);
        assert_eq!(rows[1].opt_str("note"), None);
    }

    #[test]
    fn test_empty_result_is_empty_vec() {
        let db = test_db();
        let rows = db
            .query(
                "SELECT * FROM t WHERE id = :id",
                &[(":id", &"nope" as &dyn ToSql)],
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_named_parameter_binding() {
        let db = test_db();
        let rows = db
            .query(
                "SELECT id FROM t WHERE n >= :min ORDER BY id",
                &[(":min", &2i64 as &dyn ToSql)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].str_field("id").unwrap(), "b");
    }

    #[test]
    fn test_bad_query_is_error() {
        let db = test_db();
        assert!(db.query("SELECT * FROM no_such_table", &[]).is_err());
    }

    #[test]
    fn test_timestamp_format_orders_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(250);

        let a = format_ts(early);
        let b = format_ts(late);
        assert!(a < b);
        assert_eq!(parse_ts(&a).unwrap(), early);
        assert_eq!(parse_ts(&b).unwrap(), late);
    }
}
