//! Connection pool lifecycle tests.
//!
//! These drive a real pool, with real worker threads, over the fake driver
//! from `dbspool-testing`. Driver calls can be parked at the fake's gate to
//! observe the pool while work is in flight.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::future::Future;
use std::time::Duration;

use dbspool::{Row, ServiceState, TransactionState};
use dbspool_testing::{FakeFactory, TEST_RETRY_TIMEOUT, eventually, test_pool};

const LIMIT: Duration = Duration::from_secs(5);

/// Long enough for anything that was going to happen to have happened.
const SETTLE: Duration = Duration::from_millis(100);

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(LIMIT, future)
        .await
        .expect("operation timed out")
}

fn conn_of(rows: &[Row]) -> i64 {
    rows[0][0].as_int().expect("connection id column")
}

// =============================================================================
// Connection Bound
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_too_many_connections() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let a = pool.acquire();
    let alpha = within(a.exec("alpha")).await.unwrap();

    let b = pool.acquire();
    let beta = within(b.exec("beta")).await.unwrap();
    assert_eq!(factory.connections(), 2);
    assert_ne!(conn_of(&alpha), conn_of(&beta));

    // Both connections are held, so the third transaction has to wait.
    let c = pool.acquire();
    let mut gamma = c.exec("gamma");
    tokio::time::sleep(SETTLE).await;
    assert!(gamma.try_take().is_none(), "statement ran too soon");
    assert_eq!(factory.connections(), 2);
    assert_eq!(pool.status().waiting, 1);

    within(b.commit()).await.unwrap();

    // 'c' picks up the connection 'b' released, not a new one.
    let gamma = within(gamma).await.unwrap();
    assert_eq!(conn_of(&gamma), conn_of(&beta));
    assert_eq!(factory.connections(), 2);

    within(a.commit()).await.unwrap();
    within(c.commit()).await.unwrap();
    within(pool.stop_service()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_too_many_connections_while_others_finish() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let a = pool.acquire();
    let b = pool.acquire();
    within(a.exec("a")).await.unwrap();
    within(b.exec("b")).await.unwrap();

    factory.hold();
    let abort_a = a.abort();
    let abort_b = b.abort();
    assert!(eventually(|| factory.blocked() == 2).await);

    // Both connections are finishing; a new transaction must not open a third.
    let c = pool.acquire();
    let status = pool.status();
    assert_eq!(status.connecting, 0);
    assert_eq!(status.busy + status.finishing, 2);

    factory.release();
    within(abort_a).await.unwrap();
    within(abort_b).await.unwrap();

    within(c.exec("c")).await.unwrap();
    assert_eq!(factory.connections(), 2);
    within(c.commit()).await.unwrap();
    within(pool.stop_service()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spooled_transactions_promoted_in_order() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 1).unwrap();

    let holder = pool.acquire();
    within(holder.exec("hold")).await.unwrap();

    let first = pool.acquire();
    let second = pool.acquire();
    // Issued out of acquisition order on purpose.
    let second_exec = second.exec("second-1");
    let first_exec = first.exec("first-1");
    let first_commit = first.commit();
    let second_commit = second.commit();

    within(holder.commit()).await.unwrap();
    within(first_exec).await.unwrap();
    within(first_commit).await.unwrap();
    within(second_exec).await.unwrap();
    within(second_commit).await.unwrap();

    let sql: Vec<String> = factory.executed().into_iter().map(|(_, sql)| sql).collect();
    assert_eq!(sql, ["hold", "first-1", "second-1"]);
    within(pool.stop_service()).await.unwrap();
}

// =============================================================================
// Connect Retry
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_after_connect_error() {
    let factory = FakeFactory::new();
    factory.will_fail();
    factory.will_fail();
    factory.will_connect();
    let pool = test_pool(&factory, 2).unwrap();

    let c = pool.acquire();
    let mut alpha = c.exec("alpha");
    assert!(eventually(|| factory.connect_failures() == 1).await);
    assert!(alpha.try_take().is_none());

    let rows = within(alpha).await.unwrap();
    assert_eq!(factory.connect_failures(), 2);
    assert_eq!(conn_of(&rows), 1);
    assert_eq!(rows[0][1].as_text(), Some("alpha"));

    within(c.commit()).await.unwrap();
    within(pool.stop_service()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_retry() {
    let factory = FakeFactory::new();
    factory.default_fail();
    let pool = test_pool(&factory, 2).unwrap();

    let txn = pool.acquire();
    assert!(eventually(|| factory.connect_failures() >= 1).await);

    within(pool.stop_service()).await.unwrap();
    assert_eq!(pool.state(), ServiceState::Stopped);
    assert_eq!(pool.status().total(), 0);

    // The retry was cancelled along with its slot.
    let failures = factory.connect_failures();
    tokio::time::sleep(TEST_RETRY_TIMEOUT * 3).await;
    assert_eq!(factory.connect_failures(), failures);
    assert_eq!(factory.connections(), 0);

    assert!(within(txn.exec("x")).await.unwrap_err().is_connection_error());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_attempt_success() {
    let factory = FakeFactory::new();
    factory.hold();
    let pool = test_pool(&factory, 2).unwrap();

    let _txn = pool.acquire();
    assert!(eventually(|| factory.blocked() == 1).await);

    let mut stopped = pool.stop_service();
    tokio::time::sleep(SETTLE).await;
    assert!(stopped.try_take().is_none());
    assert_eq!(pool.state(), ServiceState::Stopping);

    factory.release();
    within(stopped).await.unwrap();
    assert_eq!(factory.connections(), 1);
    assert!(factory.is_closed(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_attempt_failed() {
    let factory = FakeFactory::new();
    factory.default_fail();
    factory.hold();
    let pool = test_pool(&factory, 2).unwrap();

    let _txn = pool.acquire();
    assert!(eventually(|| factory.blocked() == 1).await);

    let mut stopped = pool.stop_service();
    tokio::time::sleep(SETTLE).await;
    assert!(stopped.try_take().is_none());

    factory.release();
    within(stopped).await.unwrap();
    assert_eq!(factory.connect_failures(), 1);
    assert_eq!(factory.connections(), 0);
}

// =============================================================================
// Stop Service
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_service() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let a = pool.acquire();
    within(a.exec("alpha")).await.unwrap();
    assert_eq!(factory.connections(), 1);

    within(pool.stop_service()).await.unwrap();
    assert_eq!(factory.connections(), 1);
    assert!(factory.is_closed(1));
    assert_eq!(factory.rollbacks(), 1);
    assert_eq!(a.state(), TransactionState::Aborted);
    assert!(within(a.exec("beta")).await.unwrap_err().is_already_finished());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_service_mid_abort() {
    let factory = FakeFactory::new();
    factory.hold();
    let pool = test_pool(&factory, 2).unwrap();

    let c = pool.acquire();
    // Never connected, so the abort does not wait for anything.
    within(c.abort()).await.unwrap();

    let mut stopped = pool.stop_service();
    tokio::time::sleep(SETTLE).await;
    assert!(stopped.try_take().is_none());

    factory.release();
    within(stopped).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_service_with_spooled() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let a = pool.acquire();
    let b = pool.acquire();
    within(a.exec("a")).await.unwrap();
    within(b.exec("b")).await.unwrap();

    let c = pool.acquire();
    let mut exec = c.exec("alpha");
    let mut commit = c.commit();
    assert!(exec.try_take().is_none());
    assert!(commit.try_take().is_none());

    within(pool.stop_service()).await.unwrap();
    assert!(within(exec).await.unwrap_err().is_connection_error());
    assert!(within(commit).await.unwrap_err().is_connection_error());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repool_spooled() {
    let factory = FakeFactory::new();
    factory.hold();
    let pool = test_pool(&factory, 2).unwrap();

    let c1 = pool.acquire();
    let c2 = pool.acquire();
    let c3 = pool.acquire();
    let commits = [c1.commit(), c2.commit(), c3.commit()];
    factory.release();
    for commit in commits {
        within(commit).await.unwrap();
    }
    assert_eq!(factory.connections(), 2);

    within(pool.stop_service()).await.unwrap();
    assert_eq!(factory.connections(), 2);
    assert!(factory.is_closed(1));
    assert!(factory.is_closed(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_after_stop() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();
    within(pool.stop_service()).await.unwrap();

    factory.hold();
    let post_close = pool.acquire();
    let err = within(post_close.exec("hello")).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(factory.connections(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_after_started_stopping() {
    let factory = FakeFactory::new();
    factory.hold();
    let pool = test_pool(&factory, 2).unwrap();

    let pre_close = pool.acquire();
    let pre_close_result = pre_close.exec("statement");
    let mut stopped = pool.stop_service();
    let post_close = pool.acquire();
    let post_close_result = post_close.exec("hello");

    assert!(within(post_close_result).await.unwrap_err().is_connection_error());
    assert!(within(pre_close_result).await.unwrap_err().is_connection_error());
    assert!(stopped.try_take().is_none());

    factory.release();
    within(stopped).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_fails_during_stop_service() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let a = pool.acquire();
    let b = pool.acquire();
    within(a.exec("a")).await.unwrap();
    within(b.exec("b")).await.unwrap();

    factory.fail_next_rollback();
    within(pool.stop_service()).await.unwrap();
    assert_eq!(factory.rollbacks(), 2);
    assert!(factory.is_closed(1));
    assert!(factory.is_closed(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_recycled_transaction() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let recycled = pool.acquire();
    let _commit = recycled.commit();
    let _remember = pool.acquire();

    within(pool.stop_service()).await.unwrap();
    assert_eq!(factory.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_for_already_aborted_transaction() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let it = pool.acquire();
    within(it.exec("x")).await.unwrap();

    factory.hold();
    let mut aborted = it.abort();
    assert!(eventually(|| factory.blocked() == 1).await);

    let mut stopped = pool.stop_service();
    tokio::time::sleep(SETTLE).await;
    assert!(aborted.try_take().is_none());
    assert!(stopped.try_take().is_none());

    factory.release();
    within(aborted).await.unwrap();
    within(stopped).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_service_waits_for_commit() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 2).unwrap();

    let txn = pool.acquire();
    within(txn.exec("x")).await.unwrap();

    factory.hold();
    let commit = txn.commit();
    assert!(eventually(|| factory.blocked() == 1).await);

    let mut stopped = pool.stop_service();
    tokio::time::sleep(SETTLE).await;
    assert!(stopped.try_take().is_none());

    factory.release();
    within(commit).await.unwrap();
    within(stopped).await.unwrap();
    assert_eq!(factory.commits(), 1);
    assert_eq!(factory.rollbacks(), 0);
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_status_tracks_connections() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 3).unwrap();
    assert_eq!(pool.status().total(), 0);
    assert_eq!(pool.status().max, 3);

    let a = pool.acquire();
    within(a.exec("a")).await.unwrap();
    let status = pool.status();
    assert_eq!(status.busy, 1);
    assert_eq!(status.state, ServiceState::Running);

    within(a.commit()).await.unwrap();
    let status = pool.status();
    assert_eq!(status.busy, 0);
    assert_eq!(status.free, 1);

    within(pool.stop_service()).await.unwrap();
    let status = pool.status();
    assert_eq!(status.total(), 0);
    assert_eq!(status.closing, 0);
    assert_eq!(status.state, ServiceState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_transaction_returns_connection() {
    let factory = FakeFactory::new();
    let pool = test_pool(&factory, 1).unwrap();

    let txn = pool.acquire();
    within(txn.exec("x")).await.unwrap();
    drop(txn);

    assert!(eventually(|| pool.status().free == 1).await);
    assert_eq!(factory.rollbacks(), 1);

    let next = pool.acquire();
    assert!(next.is_connected());
    within(next.commit()).await.unwrap();
    within(pool.stop_service()).await.unwrap();
}
