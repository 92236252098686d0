//! SQL statements submitted to a transaction.

use crate::driver::{Cursor, Row, Value};
use crate::error::{PoolError, Result};

/// A SQL statement with its bind parameters.
///
/// # Example
///
/// ```rust
/// use dbspool::Statement;
///
/// let stmt = Statement::new("DELETE FROM calendar WHERE id = %s")
///     .bind(42)
///     .raise_on_zero_rows("no such calendar");
/// assert_eq!(stmt.params().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    no_rows_error: Option<String>,
}

impl Statement {
    /// Create a statement with no parameters.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            no_rows_error: None,
        }
    }

    /// Append a bind parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Replace all bind parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Fail with [`PoolError::NoRows`] carrying `message` if the statement
    /// affects or returns zero rows.
    #[must_use]
    pub fn raise_on_zero_rows(mut self, message: impl Into<String>) -> Self {
        self.no_rows_error = Some(message.into());
        self
    }

    /// The SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The bind parameters.
    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The zero-row error message, if one was requested.
    #[must_use]
    pub fn no_rows_error(&self) -> Option<&str> {
        self.no_rows_error.as_deref()
    }

    /// Turn a driver cursor into the rows handed back to the caller.
    ///
    /// `rowcount_reliable` is the driver's answer to
    /// [`ConnectionFactory::rowcount_reliable`](crate::ConnectionFactory::rowcount_reliable).
    pub(crate) fn finish(&self, cursor: Cursor, rowcount_reliable: bool) -> Result<Vec<Row>> {
        let Some(message) = &self.no_rows_error else {
            return Ok(cursor.rows.unwrap_or_default());
        };

        let empty = match (&cursor.rows, cursor.rowcount) {
            (Some(rows), _) if !rowcount_reliable => rows.is_empty(),
            (_, Some(0)) => true,
            (Some(rows), _) => rows.is_empty(),
            (None, _) => false,
        };

        if empty {
            return Err(PoolError::NoRows(message.clone()));
        }
        Ok(cursor.rows.unwrap_or_default())
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}
