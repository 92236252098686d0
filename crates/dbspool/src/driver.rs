//! Blocking driver contract.
//!
//! The pool never talks to a database directly. It drives an implementation
//! of [`ConnectionFactory`] and [`Connection`] from dedicated worker threads,
//! so every method here may block for as long as the driver needs.
//!
//! Drivers are not expected to classify their errors. The pool's reconnect
//! heuristic is based on statement position alone: a failure on the first
//! statement of a transaction is treated as a stale connection, any later
//! failure is surfaced to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error type produced by drivers.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// A single bind parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Text value.
    Text(String),
    /// Binary value.
    Bytes(Vec<u8>),
}

impl Value {
    /// Get the integer payload, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the text payload, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A fetched row.
pub type Row = Vec<Value>;

/// Outcome of executing one statement on a driver connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cursor {
    /// Affected/returned row count as reported by the driver, if known.
    pub rowcount: Option<u64>,
    /// Fetched rows, present when the statement produced a result set.
    pub rows: Option<Vec<Row>>,
}

impl Cursor {
    /// A cursor for a statement that produced a result set.
    #[must_use]
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rowcount: Some(rows.len() as u64),
            rows: Some(rows),
        }
    }

    /// A cursor for a statement that only reports a row count.
    #[must_use]
    pub fn affected(count: u64) -> Self {
        Self {
            rowcount: Some(count),
            rows: None,
        }
    }
}

/// A live, blocking driver connection.
///
/// A connection is only ever touched from the single worker thread that
/// owns it.
pub trait Connection: Send {
    /// Execute a statement with bind parameters.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Cursor, DriverError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Close the connection.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Produces new driver connections.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError>;

    /// Whether the driver reports affected-row counts before rows are fetched.
    ///
    /// When this returns `false`, the presence of fetched rows overrides a
    /// zero row count for statements that require rows.
    fn rowcount_reliable(&self) -> bool {
        true
    }
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Result<Box<dyn Connection>, DriverError> + Send + Sync + 'static,
{
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
        self()
    }
}
