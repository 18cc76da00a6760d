//! SQLite adapter
//!
//! Wraps one rusqlite connection. JSON parameters are converted on the way in
//! (booleans become integers, arrays and objects become JSON text) and result
//! cells are converted back to plain JSON scalars.

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Number, Value};
use tracing::debug;

use super::{Database, Placeholder, PlaceholderStyle, Row};
use crate::error::{DbError, DbResult};

/// Per-record id sequences
const ID_TABLE: &str = "_IDS_";

pub struct SqliteDatabase {
    path: String,
    conn: Mutex<Option<Connection>>,
}

impl SqliteDatabase {
    /// Create an adapter for the database file at `path` (or `:memory:`).
    /// The connection is opened by [`Database::open`].
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| DbError::DatabaseError("database is not open".to_string()))?;
        f(conn).map_err(map_error)
    }
}

/// Unique id violations surface as duplicate records
fn map_error(error: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &error {
        if failure.code == ErrorCode::ConstraintViolation {
            return DbError::DuplicateRecord(
                message.clone().unwrap_or_else(|| failure.to_string()),
            );
        }
    }
    DbError::SqliteError(error)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

impl Database for SqliteDatabase {
    fn open(&self) -> DbResult<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (name TEXT PRIMARY KEY, last INTEGER NOT NULL)",
                ID_TABLE
            ),
            [],
        )?;
        debug!("Opened SQLite database {}", self.path);
        *guard = Some(conn);
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| DbError::SqliteError(e))?;
            debug!("Closed SQLite database {}", self.path);
        }
        Ok(())
    }

    fn query(&self, sql: &str, params: &[Value], name: &str) -> DbResult<Vec<Row>> {
        debug!("query [{}] {} ({} params)", name, sql, params.len());
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Map::new();
                for (index, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), from_sql_ref(row.get_ref(index)?));
                }
                out.push(record);
            }
            Ok(out)
        })
    }

    fn insert(&self, sql: &str, params: &[Value], name: &str) -> DbResult<i64> {
        debug!("insert [{}] {} ({} params)", name, sql, params.len());
        self.with_connection(|conn| {
            conn.execute(sql, params_from_iter(params.iter().map(to_sql_value)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn execute(&self, sql: &str, params: &[Value], name: &str) -> DbResult<usize> {
        debug!("execute [{}] {} ({} params)", name, sql, params.len());
        self.with_connection(|conn| {
            conn.execute(sql, params_from_iter(params.iter().map(to_sql_value)))
        })
    }

    fn get_auto_id(&self, record_name: &str) -> DbResult<i64> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "INSERT INTO \"{}\" (name, last) VALUES (?1, 1) \
                     ON CONFLICT(name) DO UPDATE SET last = last + 1 RETURNING last",
                    ID_TABLE
                ),
                params![record_name],
                |row| row.get(0),
            )
        })
    }

    fn reserve_id(&self, record_name: &str, id: i64) -> DbResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (name, last) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO UPDATE SET last = MAX(last, excluded.last)",
                    ID_TABLE
                ),
                params![record_name, id],
            )
            .map(|_| ())
        })
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::new(PlaceholderStyle::Question)
    }

    fn begin(&self) -> DbResult<()> {
        self.with_connection(|conn| conn.execute_batch("BEGIN"))
    }

    fn commit(&self) -> DbResult<()> {
        self.with_connection(|conn| conn.execute_batch("COMMIT"))
    }

    fn rollback(&self) -> DbResult<()> {
        self.with_connection(|conn| conn.execute_batch("ROLLBACK"))
    }
}
