//! # dbspool
//!
//! Asynchronous transaction pool over blocking database drivers.
//!
//! Many concurrent logical transactions share a small, bounded set of real
//! connections. Each connection lives on its own worker thread so that
//! blocking driver calls never stall the async scheduler, and statements on
//! one connection always run in the order they were issued.
//!
//! ## Features
//!
//! - Non-blocking [`Pool::acquire`]: when no connection is free the
//!   transaction is spooled, recording operations until one is
//! - Connect retry with a fixed delay while the pool is running
//! - Transparent reconnect when the first statement on a connection fails
//! - Zero-statement commits that never reach the driver
//! - Pre-commit, post-commit and post-abort hooks
//! - [`CommandBlock`]s for contiguous, ordered runs of statements
//! - Graceful drain with [`Pool::stop_service`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbspool::{Dialect, Pool, Statement};
//!
//! let pool = Pool::builder(factory)
//!     .max_connections(4)
//!     .dialect(Dialect::POSTGRES)
//!     .build()?;
//!
//! let txn = pool.acquire();
//! let rows = txn
//!     .exec(Statement::new("SELECT name FROM calendar WHERE id = %s").bind(7))
//!     .await?;
//! txn.commit().await?;
//!
//! pool.stop_service().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod block;
pub mod config;
mod connection;
pub mod driver;
pub mod error;
mod hooks;
pub mod lifecycle;
pub mod pending;
pub mod pool;
pub mod slot;
pub mod statement;
pub mod transaction;

pub use block::CommandBlock;
pub use config::{Dialect, ParamStyle, PoolConfig};
pub use driver::{Connection, ConnectionFactory, Cursor, DriverError, Row, Value};
pub use error::{BoxError, PoolError, Result};
pub use lifecycle::{ServiceState, SlotState, TransactionState};
pub use pending::Pending;
pub use pool::{Pool, PoolBuilder, PoolStatus};
pub use slot::WorkerSlot;
pub use statement::Statement;
pub use transaction::Transaction;
