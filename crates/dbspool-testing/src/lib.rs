//! # dbspool-testing
//!
//! Test infrastructure for dbspool.
//!
//! ## Features
//!
//! - [`FakeFactory`]: an in-process driver whose connections echo
//!   `[connection id, sql]` for every statement
//! - Scripted connect outcomes, one-shot commit/rollback failures and
//!   statement failure injection
//! - A gate that parks every driver call on its worker thread, for testing
//!   what happens while work is in flight
//! - An event journal of everything the driver was asked to do
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbspool::Pool;
//! use dbspool_testing::FakeFactory;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn test_with_fake_driver() {
//!     let factory = FakeFactory::new();
//!     factory.will_fail();
//!     factory.will_connect();
//!
//!     let pool = Pool::builder(factory.clone()).build().unwrap();
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fake_driver;
pub mod fixtures;

pub use fake_driver::{DriverEvent, FakeConnection, FakeDriverError, FakeFactory};
pub use fixtures::{eventually, init_tracing, test_pool, TEST_RETRY_TIMEOUT};
