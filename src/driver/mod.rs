//! Database adapter contract
//!
//! The engine never talks to a database directly. Everything goes through the
//! [`Database`] trait: parameterized queries, inserts, per-record id
//! allocation, placeholder generation and the transaction boundary. Parameters
//! and result cells are JSON values.
//!
//! [`sqlite::SqliteDatabase`] is the bundled implementation.

pub mod sqlite;

use serde_json::{Map, Value};

use crate::error::DbResult;

pub use sqlite::SqliteDatabase;

/// One result row keyed by column alias
pub type Row = Map<String, Value>;

/// Placeholder syntax of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Numbered,
}

/// Generates the placeholders of one statement
#[derive(Debug, Clone)]
pub struct Placeholder {
    style: PlaceholderStyle,
    count: usize,
}

impl Placeholder {
    pub fn new(style: PlaceholderStyle) -> Self {
        Self { style, count: 0 }
    }

    /// Next placeholder token
    pub fn next(&mut self) -> String {
        self.count += 1;
        match self.style {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Numbered => format!("${}", self.count),
        }
    }

    /// Number of tokens handed out
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Operations the engine needs from a database.
///
/// `name` arguments label statements in logs.
pub trait Database {
    /// Open the connection and prepare bookkeeping tables
    fn open(&self) -> DbResult<()>;

    fn close(&self) -> DbResult<()>;

    /// Run a SELECT and return its rows
    fn query(&self, sql: &str, params: &[Value], name: &str) -> DbResult<Vec<Row>>;

    /// Run an INSERT and return the new row id
    fn insert(&self, sql: &str, params: &[Value], name: &str) -> DbResult<i64>;

    /// Run an UPDATE, DELETE or DDL statement and return the affected row count
    fn execute(&self, sql: &str, params: &[Value], name: &str) -> DbResult<usize>;

    /// Next id for `record_name`. Ids increase monotonically per record.
    fn get_auto_id(&self, record_name: &str) -> DbResult<i64>;

    /// Make sure later auto ids of `record_name` are greater than `id`
    fn reserve_id(&self, record_name: &str, id: i64) -> DbResult<()>;

    /// Fresh placeholder generator for one statement
    fn placeholder(&self) -> Placeholder;

    fn begin(&self) -> DbResult<()>;

    fn commit(&self) -> DbResult<()>;

    fn rollback(&self) -> DbResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_styles() {
        let mut question = Placeholder::new(PlaceholderStyle::Question);
        assert_eq!(question.next(), "?");
        assert_eq!(question.next(), "?");
        assert_eq!(question.count(), 2);

        let mut numbered = Placeholder::new(PlaceholderStyle::Numbered);
        assert_eq!(numbered.next(), "$1");
        assert_eq!(numbered.next(), "$2");
    }
}
