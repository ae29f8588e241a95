//! The outcome of one reaped query.

use serde::Serialize;

use crate::row::Row;

/// Everything reaped from a single query.
///
/// Produced once by the connection and handed to the consumer by value.
/// Statements without a result set (INSERT, UPDATE, ...) produce an empty
/// `rows` vector with the OK-packet counters filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    rows: Vec<Row>,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

impl QueryResult {
    /// A result set.
    pub fn from_rows(rows: Vec<Row>, warnings: u16) -> Self {
        Self {
            rows,
            affected_rows: 0,
            last_insert_id: 0,
            warnings,
        }
    }

    /// The result of a statement that returned no rows.
    pub fn from_ok(affected_rows: u64, last_insert_id: u64, warnings: u16) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
            last_insert_id,
            warnings,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
