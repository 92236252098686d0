//! Pool configuration.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Default delay between failed connection attempts.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default prefix for worker thread names.
pub const DEFAULT_THREAD_NAME: &str = "dbspool-slot";

/// SQL dialect spoken by the pooled connections.
///
/// The pool never interprets the dialect; it relays it unchanged to every
/// transaction and command block so that statement builders can pick the
/// right syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dialect(Cow<'static, str>);

impl Dialect {
    /// PostgreSQL dialect.
    pub const POSTGRES: Self = Self(Cow::Borrowed("postgres-dialect"));
    /// Oracle dialect.
    pub const ORACLE: Self = Self(Cow::Borrowed("oracle-dialect"));

    /// Create a custom dialect tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    /// The dialect tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bind-parameter style expected by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStyle(Cow<'static, str>);

impl ParamStyle {
    /// `%s` / `%(name)s` placeholders.
    pub const PYFORMAT: Self = Self(Cow::Borrowed("pyformat"));
    /// `:1` positional placeholders.
    pub const NUMERIC: Self = Self(Cow::Borrowed("numeric"));
    /// `?` placeholders.
    pub const QMARK: Self = Self(Cow::Borrowed("qmark"));
    /// `:name` placeholders.
    pub const NAMED: Self = Self(Cow::Borrowed("named"));

    /// Create a custom parameter style tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    /// The parameter style tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParamStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections open or being opened at once.
    ///
    /// Connections that are committing or aborting count toward this bound;
    /// transactions waiting for a connection do not.
    pub max_connections: u32,

    /// Delay before retrying a failed connection attempt.
    pub retry_timeout: Duration,

    /// Dialect relayed to every transaction.
    pub dialect: Dialect,

    /// Parameter style relayed to every transaction.
    pub param_style: ParamStyle,

    /// Prefix for worker thread names.
    pub thread_name: Arc<str>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            dialect: Dialect::POSTGRES,
            param_style: ParamStyle::PYFORMAT,
            thread_name: Arc::from(DEFAULT_THREAD_NAME),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the delay between failed connection attempts.
    #[must_use]
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Set the dialect relayed to transactions.
    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the parameter style relayed to transactions.
    #[must_use]
    pub fn param_style(mut self, style: ParamStyle) -> Self {
        self.param_style = style;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(PoolError::Configuration(
                "thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}
