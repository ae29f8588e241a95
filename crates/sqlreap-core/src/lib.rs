//! Core types for sqlreap.
//!
//! This crate holds the pieces shared by the MySQL connection, the event
//! loop and the driver:
//!
//! - `Error` and its payload types (connection, state, protocol, ...)
//! - `Value`, a dynamically-typed SQL value
//! - `Row`, a single result row with shared column metadata
//! - `QueryResult`, everything reaped from one query

pub mod error;
pub mod result;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, ProtocolErrorKind,
    Result, StateError, StateErrorKind, TypeError,
};
pub use result::QueryResult;
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
