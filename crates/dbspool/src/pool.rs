//! Connection pool implementation.
//!
//! The pool keeps its connections in four places:
//!
//! | Collection   | Holds                                               | Counts toward max |
//! |--------------|-----------------------------------------------------|-------------------|
//! | `free`       | idle connections ready for the next transaction     | yes               |
//! | `busy`       | transactions holding a connection                   | yes               |
//! | `finishing`  | transactions whose commit or abort is in flight     | yes               |
//! | `connecting` | connect attempts, including those waiting to retry  | yes               |
//! | `closing`    | connections being closed and their slots stopped    | no                |
//!
//! Transactions that found no free connection wait in `waiting` until one is
//! released or a connect attempt succeeds, first come first served.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::{Dialect, ParamStyle, PoolConfig};
use crate::connection::ConnectionSlot;
use crate::driver::ConnectionFactory;
use crate::error::{PoolError, Result};
use crate::lifecycle::ServiceState;
use crate::pending::{Completer, Pending};
use crate::transaction::{Backing, Transaction, TxnShared};

/// An outstanding connect attempt.
struct Attempt {
    slot: Arc<ConnectionSlot>,
    /// Number of the attempt in flight, starting at 1.
    attempt: u32,
    /// Set while waiting out the retry delay.
    retry: Option<AbortHandle>,
}

struct PoolState {
    run: ServiceState,
    free: VecDeque<Arc<ConnectionSlot>>,
    busy: HashMap<u64, Arc<TxnShared>>,
    finishing: HashMap<u64, Arc<TxnShared>>,
    connecting: HashMap<u64, Attempt>,
    closing: HashSet<u64>,
    waiting: VecDeque<Arc<TxnShared>>,
    stop_waiters: Vec<Completer<()>>,
}

impl PoolState {
    fn open_connections(&self) -> usize {
        self.free.len() + self.busy.len() + self.finishing.len() + self.connecting.len()
    }

    fn drained(&self) -> bool {
        self.busy.is_empty() && self.finishing.is_empty() && self.connecting.is_empty()
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    runtime: Handle,
    state: Mutex<PoolState>,
    changed: watch::Sender<()>,
    next_txn: AtomicU64,
    next_slot: AtomicU64,
}

impl PoolInner {
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn notify(&self) {
        self.changed.send_replace(());
    }

    async fn wait_until(&self, ready: impl Fn(&PoolState) -> bool) {
        let mut changed = self.changed.subscribe();
        loop {
            let done = ready(&*self.state.lock());
            if done || changed.changed().await.is_err() {
                return;
            }
        }
    }

    fn start_one_more(self: &Arc<Self>, state: &mut PoolState) {
        self.launch(state, 1);
    }

    /// Start a fresh worker slot and open its connection.
    ///
    /// A slot whose thread cannot be started still counts as a connect
    /// attempt; it is replaced by a new slot after the retry delay.
    fn launch(self: &Arc<Self>, state: &mut PoolState, attempt: u32) {
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ConnectionSlot::new(
            id,
            &self.config.thread_name,
            Arc::clone(&self.factory),
        ));
        if let Err(e) = slot.start() {
            let delay = self.config.retry_timeout;
            tracing::error!(
                slot = slot.name(),
                attempt,
                error = %e,
                retry_in = ?delay,
                "could not start worker slot"
            );
            let pool = Arc::clone(self);
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                pool.relaunch(id);
            });
            state.connecting.insert(
                id,
                Attempt {
                    slot,
                    attempt,
                    retry: Some(timer.abort_handle()),
                },
            );
            return;
        }
        state.connecting.insert(
            id,
            Attempt {
                slot: Arc::clone(&slot),
                attempt,
                retry: None,
            },
        );
        tracing::debug!(slot = slot.name(), attempt, "opening connection");
        self.submit_connect(slot);
    }

    /// Replace a slot whose thread could not be started.
    fn relaunch(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        if !state.run.is_running() {
            return;
        }
        let Some(failed) = state.connecting.remove(&id) else {
            return;
        };
        self.launch(&mut state, failed.attempt + 1);
        drop(state);
        self.notify();
    }

    fn submit_connect(self: &Arc<Self>, slot: Arc<ConnectionSlot>) {
        let connected = slot.connect();
        let pool = Arc::clone(self);
        self.spawn(async move {
            let result = connected.await;
            pool.connect_finished(slot, result);
        });
    }

    fn connect_finished(self: &Arc<Self>, slot: Arc<ConnectionSlot>, result: Result<()>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.connecting.remove(&slot.id());
                tracing::debug!(slot = slot.name(), "connection established");
                self.repool_now(&mut state, slot);
            }
            Err(e) if state.run.is_running() => {
                let delay = self.config.retry_timeout;
                let attempt = match state.connecting.get(&slot.id()) {
                    Some(attempt) => attempt.attempt,
                    None => 1,
                };
                tracing::error!(
                    slot = slot.name(),
                    attempt,
                    error = %e,
                    retry_in = ?delay,
                    "connect attempt failed"
                );
                let pool = Arc::clone(self);
                let retry_slot = Arc::clone(&slot);
                let timer = self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    pool.retry_connect(retry_slot);
                });
                match state.connecting.get_mut(&slot.id()) {
                    Some(attempt) => attempt.retry = Some(timer.abort_handle()),
                    None => {
                        state.connecting.insert(
                            slot.id(),
                            Attempt {
                                slot,
                                attempt,
                                retry: Some(timer.abort_handle()),
                            },
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    slot = slot.name(),
                    error = %e,
                    "connect attempt failed during shutdown"
                );
                state.connecting.remove(&slot.id());
                self.retire(&mut state, slot);
            }
        }
        drop(state);
        self.notify();
    }

    fn retry_connect(self: &Arc<Self>, slot: Arc<ConnectionSlot>) {
        let mut state = self.state.lock();
        if !state.run.is_running() {
            return;
        }
        let Some(attempt) = state.connecting.get_mut(&slot.id()) else {
            return;
        };
        attempt.retry = None;
        attempt.attempt += 1;
        tracing::debug!(slot = slot.name(), attempt = attempt.attempt, "retrying connect");
        drop(state);
        self.submit_connect(slot);
    }

    /// Give a connection to the longest-waiting transaction, or park it.
    fn repool_now(self: &Arc<Self>, state: &mut PoolState, mut slot: Arc<ConnectionSlot>) {
        while let Some(txn) = state.waiting.pop_front() {
            match txn.promote(slot) {
                Ok(()) => {
                    state.busy.insert(txn.id(), txn);
                    return;
                }
                Err(returned) => slot = returned,
            }
        }
        tracing::debug!(slot = slot.name(), "connection returned to free list");
        state.free.push_back(slot);
    }

    /// Close a connection and stop its slot.
    fn retire(self: &Arc<Self>, state: &mut PoolState, slot: Arc<ConnectionSlot>) {
        let id = slot.id();
        let stopped = slot.close_and_stop();
        state.closing.insert(id);
        tracing::debug!(slot = slot.name(), "closing connection");
        let pool = Arc::clone(self);
        self.spawn(async move {
            let _ = stopped.await;
            pool.state.lock().closing.remove(&id);
            pool.notify();
        });
    }

    /// A transaction started committing or aborting.
    pub(crate) fn begin_finishing(&self, txn: u64) {
        let mut state = self.state.lock();
        if let Some(shared) = state.busy.remove(&txn) {
            state.finishing.insert(txn, shared);
        }
    }

    /// A transaction is done with its connection.
    pub(crate) fn release(self: &Arc<Self>, txn: u64, slot: Arc<ConnectionSlot>, reusable: bool) {
        let mut state = self.state.lock();
        state.busy.remove(&txn);
        state.finishing.remove(&txn);
        if reusable {
            self.repool_now(&mut state, slot);
        } else {
            self.retire(&mut state, slot);
            if state.run.is_running() && state.open_connections() < self.max() {
                self.start_one_more(&mut state);
            }
        }
        drop(state);
        self.notify();
    }

    /// A spooled transaction was aborted before it got a connection.
    pub(crate) fn forget_waiting(&self, txn: u64) {
        self.state.lock().waiting.retain(|waiting| waiting.id() != txn);
    }

    fn max(&self) -> usize {
        self.config.max_connections as usize
    }

    async fn drain(self: Arc<Self>) {
        self.wait_until(PoolState::drained).await;
        {
            let mut state = self.state.lock();
            let free: Vec<_> = state.free.drain(..).collect();
            for slot in free {
                self.retire(&mut state, slot);
            }
        }
        self.wait_until(|state| state.closing.is_empty()).await;

        let waiters = {
            let mut state = self.state.lock();
            state.run = ServiceState::Stopped;
            std::mem::take(&mut state.stop_waiters)
        };
        self.notify();
        tracing::info!("connection pool stopped");
        for waiter in waiters {
            waiter.complete(Ok(()));
        }
    }
}

/// An asynchronous pool of blocking database connections.
///
/// Cloning a `Pool` is cheap; all clones share the same connections.
/// Dropping the last handle does not stop the pool; call
/// [`stop_service`](Self::stop_service) to drain it.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool builder.
    pub fn builder(factory: impl ConnectionFactory) -> PoolBuilder {
        PoolBuilder::new(factory)
    }

    /// Create a pool from a factory and configuration.
    ///
    /// Must be called from within a tokio runtime; the pool runs its
    /// bookkeeping tasks on that runtime.
    pub fn new(factory: impl ConnectionFactory, config: PoolConfig) -> Result<Self> {
        Self::with_factory(Arc::new(factory), config)
    }

    fn with_factory(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Configuration("a pool must be created inside a tokio runtime".into())
        })?;
        let (changed, _) = watch::channel(());

        tracing::info!(
            max_connections = config.max_connections,
            dialect = %config.dialect,
            "connection pool started"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                runtime,
                state: Mutex::new(PoolState {
                    run: ServiceState::Running,
                    free: VecDeque::new(),
                    busy: HashMap::new(),
                    finishing: HashMap::new(),
                    connecting: HashMap::new(),
                    closing: HashSet::new(),
                    waiting: VecDeque::new(),
                    stop_waiters: Vec::new(),
                }),
                changed,
                next_txn: AtomicU64::new(1),
                next_slot: AtomicU64::new(1),
            }),
        })
    }

    /// Start a new transaction.
    ///
    /// Never waits. If no connection is free, the transaction records its
    /// operations until one is. If the pool is stopping or stopped, every
    /// operation on the returned transaction fails with
    /// [`PoolError::Connection`], except [`abort`](Transaction::abort), which
    /// always succeeds.
    pub fn acquire(&self) -> Transaction {
        let pool = &self.inner;
        let id = pool.next_txn.fetch_add(1, Ordering::Relaxed);
        let mut state = pool.state.lock();

        if !state.run.is_running() {
            drop(state);
            tracing::trace!(txn = id, "pool not running, transaction unavailable");
            return Transaction::new(TxnShared::new(
                id,
                Arc::clone(pool),
                Backing::Unavailable("connection pool is not running".into()),
            ));
        }

        let shared = if let Some(slot) = state.free.pop_front() {
            tracing::trace!(txn = id, slot = slot.name(), "transaction connected");
            let shared = TxnShared::new(id, Arc::clone(pool), Backing::Connected(slot));
            state.busy.insert(id, Arc::clone(&shared));
            shared
        } else {
            tracing::trace!(txn = id, "transaction spooled");
            let shared = TxnShared::new(id, Arc::clone(pool), Backing::Spooled(Vec::new()));
            state.waiting.push_back(Arc::clone(&shared));
            if state.open_connections() < pool.max() {
                pool.start_one_more(&mut state);
            }
            shared
        };
        drop(state);
        Transaction::new(shared)
    }

    /// Stop the pool.
    ///
    /// Waiting transactions fail with [`PoolError::Connection`], pending
    /// retries are cancelled, and transactions still holding a connection are
    /// aborted unless they are already finishing. Resolves once every
    /// connection is closed and every worker slot stopped. Calling it again
    /// waits for the same shutdown.
    pub fn stop_service(&self) -> Pending<()> {
        let pool = &self.inner;
        let (completer, pending) = Pending::channel();
        let (waiting, active) = {
            let mut state = pool.state.lock();
            match state.run {
                ServiceState::Stopped => return Pending::ready(Ok(())),
                ServiceState::Stopping => {
                    state.stop_waiters.push(completer);
                    return pending;
                }
                ServiceState::Running => {}
            }
            tracing::info!(
                busy = state.busy.len(),
                waiting = state.waiting.len(),
                "stopping connection pool"
            );
            state.run = ServiceState::Stopping;
            state.stop_waiters.push(completer);

            let retrying: Vec<u64> = state
                .connecting
                .iter()
                .filter(|(_, attempt)| attempt.retry.is_some())
                .map(|(id, _)| *id)
                .collect();
            for id in retrying {
                if let Some(attempt) = state.connecting.remove(&id) {
                    if let Some(timer) = attempt.retry {
                        timer.abort();
                    }
                    pool.retire(&mut state, attempt.slot);
                }
            }

            let waiting: Vec<_> = state.waiting.drain(..).collect();
            let active: Vec<_> = state.busy.values().cloned().collect();
            (waiting, active)
        };

        for txn in waiting {
            txn.fail_spooled("connection pool is stopping");
        }
        for txn in active {
            txn.force_abort();
        }
        pool.notify();
        pool.spawn(Arc::clone(pool).drain());
        pending
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            free: state.free.len(),
            busy: state.busy.len(),
            finishing: state.finishing.len(),
            connecting: state.connecting.len(),
            closing: state.closing.len(),
            waiting: state.waiting.len(),
            max: self.inner.config.max_connections,
            state: state.run,
        }
    }

    /// Get the service state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.inner.state.lock().run
    }

    /// Dialect relayed to every transaction.
    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        &self.inner.config.dialect
    }

    /// Parameter style relayed to every transaction.
    #[must_use]
    pub fn param_style(&self) -> &ParamStyle {
        &self.inner.config.param_style
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections ready for reuse.
    pub free: usize,
    /// Transactions holding a connection.
    pub busy: usize,
    /// Transactions whose commit or abort is in flight.
    pub finishing: usize,
    /// Connect attempts outstanding, including ones waiting to retry.
    pub connecting: usize,
    /// Connections being closed.
    pub closing: usize,
    /// Transactions waiting for a connection.
    pub waiting: usize,
    /// Maximum allowed connections.
    pub max: u32,
    /// Service state.
    pub state: ServiceState,
}

impl PoolStatus {
    /// Connections open or being opened.
    #[must_use]
    pub fn total(&self) -> usize {
        self.free + self.busy + self.finishing + self.connecting
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a builder with default configuration.
    pub fn new(factory: impl ConnectionFactory) -> Self {
        Self {
            factory: Arc::new(factory),
            config: PoolConfig::default(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config = self.config.max_connections(count);
        self
    }

    /// Set the delay between failed connection attempts.
    #[must_use]
    pub fn retry_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config = self.config.retry_timeout(timeout);
        self
    }

    /// Set the dialect.
    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.config = self.config.dialect(dialect);
        self
    }

    /// Set the parameter style.
    #[must_use]
    pub fn param_style(mut self, style: ParamStyle) -> Self {
        self.config = self.config.param_style(style);
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.config = self.config.thread_name(name);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool> {
        Pool::with_factory(self.factory, self.config)
    }
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
