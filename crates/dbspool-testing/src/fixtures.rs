//! Test fixture utilities.

use std::sync::Once;
use std::time::Duration;

use dbspool::{Pool, PoolError};
use tracing_subscriber::EnvFilter;

use crate::fake_driver::FakeFactory;

/// Retry delay used by [`test_pool`]; short enough for tests to wait out.
pub const TEST_RETRY_TIMEOUT: Duration = Duration::from_millis(50);

/// How long [`eventually`] polls before giving up.
const EVENTUALLY_LIMIT: Duration = Duration::from_secs(5);

/// Install a tracing subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a pool over `factory` with a short retry delay.
pub fn test_pool(factory: &FakeFactory, max_connections: u32) -> Result<Pool, PoolError> {
    init_tracing();
    Pool::builder(factory.clone())
        .max_connections(max_connections)
        .retry_timeout(TEST_RETRY_TIMEOUT)
        .thread_name("test-slot")
        .build()
}

/// Poll `condition` until it holds, for up to five seconds.
///
/// Returns whether the condition was met.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENTUALLY_LIMIT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
