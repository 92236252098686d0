//! Transactions handed out by the pool.
//!
//! A [`Transaction`] is backed by one of:
//!
//! - a **spooled** backing, which records operations until the pool hands it
//!   a connection, then replays them in the order they were issued;
//! - a **connected** backing, which forwards each operation to the worker
//!   slot owning its connection;
//! - an **unavailable** backing, used once the pool stopped accepting work,
//!   which fails everything with [`PoolError::Connection`].
//!
//! The switch from spooled to connected happens at most once and is invisible
//! to the caller: identity, ordering and pending results carry across it.
//!
//! Every operation is recorded when it is called. The returned [`Pending`]
//! only reports the outcome, so operations keep their call order whether or
//! not, and in whatever order, their results are awaited.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{Blocks, CommandBlock, Op};
use crate::config::{Dialect, ParamStyle};
use crate::connection::ConnectionSlot;
use crate::driver::Row;
use crate::error::{BoxError, PoolError, Result};
use crate::hooks::{self, Hooks};
use crate::lifecycle::TransactionState;
use crate::pending::{Completer, Pending};
use crate::pool::PoolInner;
use crate::statement::Statement;

pub(crate) enum Backing {
    Spooled(Vec<Op>),
    Connected(Arc<ConnectionSlot>),
    Unavailable(String),
    /// The connection went back to the pool.
    Released,
}

enum HookKind {
    PreCommit,
    PostCommit,
    PostAbort,
}

struct TxnInner {
    phase: TransactionState,
    backing: Backing,
    blocks: Blocks,
    hooks: Hooks,
    /// Set once any statement has been accepted.
    executed: bool,
}

impl TxnInner {
    /// Hand an operation to the backing, in final issue order.
    fn issue(&mut self, txn: &Arc<TxnShared>, op: Op) {
        match &mut self.backing {
            Backing::Spooled(ops) => ops.push(op),
            Backing::Connected(slot) => match op {
                Op::Exec(stmt, completer) => slot.execute_to(stmt, completer),
                Op::Commit(completer) => txn.spawn_commit(Arc::clone(slot), completer),
            },
            Backing::Unavailable(reason) => op.fail(PoolError::Connection(reason.clone())),
            Backing::Released => op.fail(PoolError::AlreadyFinished),
        }
    }

    /// The commit was requested but is still queued behind open blocks.
    fn commit_deferred(&self) -> bool {
        self.phase == TransactionState::Committing && self.blocks.has_open()
    }
}

/// State shared between a transaction facade, its command blocks and the pool.
pub(crate) struct TxnShared {
    id: u64,
    pool: Arc<PoolInner>,
    dialect: Dialect,
    param_style: ParamStyle,
    inner: Mutex<TxnInner>,
}

impl TxnShared {
    pub(crate) fn new(id: u64, pool: Arc<PoolInner>, backing: Backing) -> Arc<Self> {
        let config = pool.config();
        Arc::new(Self {
            id,
            dialect: config.dialect.clone(),
            param_style: config.param_style.clone(),
            pool,
            inner: Mutex::new(TxnInner {
                phase: TransactionState::Active,
                backing,
                blocks: Blocks::default(),
                hooks: Hooks::default(),
                executed: false,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub(crate) fn param_style(&self) -> &ParamStyle {
        &self.param_style
    }

    fn state(&self) -> TransactionState {
        self.inner.lock().phase
    }

    pub(crate) fn exec(self: &Arc<Self>, stmt: Statement, block: Option<u64>) -> Pending<Vec<Row>> {
        let (completer, pending) = Pending::channel();
        let mut inner = self.inner.lock();

        let allowed = match block {
            None => inner.phase.is_active(),
            // Block statements may still run while the commit waits for them.
            Some(_) => matches!(
                inner.phase,
                TransactionState::Active | TransactionState::Committing
            ),
        };
        if !allowed {
            completer.fail(PoolError::AlreadyFinished);
            return pending;
        }
        if let Backing::Unavailable(reason) = &inner.backing {
            completer.fail(PoolError::Connection(reason.clone()));
            return pending;
        }

        let op = Op::Exec(stmt, completer);
        let ready = match block {
            None => inner.blocks.route_direct(op),
            Some(id) => match inner.blocks.route_block(id, op) {
                Ok(ready) => ready,
                Err(op) => {
                    op.fail(PoolError::AlreadyFinished);
                    return pending;
                }
            },
        };
        inner.executed = true;
        if let Some(op) = ready {
            inner.issue(self, op);
        }
        pending
    }

    pub(crate) fn commit(self: &Arc<Self>) -> Pending<()> {
        let (completer, pending) = Pending::channel();
        let mut inner = self.inner.lock();
        if !inner.phase.is_active() {
            completer.fail(PoolError::AlreadyFinished);
            return pending;
        }
        if let Backing::Unavailable(reason) = &inner.backing {
            let err = PoolError::Connection(reason.clone());
            inner.phase = TransactionState::Committed;
            completer.fail(err);
            return pending;
        }

        inner.phase = TransactionState::Committing;
        if let Some(op) = inner.blocks.route_direct(Op::Commit(completer)) {
            inner.issue(self, op);
        } else {
            tracing::debug!(txn = self.id, "commit deferred until open blocks end");
        }
        pending
    }

    pub(crate) fn abort(self: &Arc<Self>) -> Pending<()> {
        let mut inner = self.inner.lock();
        if !(inner.phase.is_active() || inner.commit_deferred()) {
            return Pending::failed(PoolError::AlreadyFinished);
        }
        inner.phase = TransactionState::Aborting;
        for op in inner.blocks.take_all() {
            op.fail(PoolError::AlreadyFinished);
        }

        match std::mem::replace(&mut inner.backing, Backing::Released) {
            Backing::Spooled(ops) => {
                for op in ops {
                    op.fail(PoolError::Connection(
                        "transaction aborted before it was connected".into(),
                    ));
                }
                inner.phase = TransactionState::Aborted;
                let post_abort = std::mem::take(&mut inner.hooks.post_abort);
                drop(inner);
                self.pool.forget_waiting(self.id);
                tracing::debug!(txn = self.id, "aborted spooled transaction");

                let (completer, pending) = Pending::channel();
                let id = self.id;
                self.pool.spawn(async move {
                    hooks::run_best_effort(post_abort, id, "post-abort").await;
                    completer.complete(Ok(()));
                });
                pending
            }
            Backing::Connected(slot) => {
                let rollback = slot.rollback();
                drop(inner);
                let (completer, pending) = Pending::channel();
                let txn = Arc::clone(self);
                self.pool.spawn(async move {
                    txn.finish_abort(slot, rollback, completer).await;
                });
                pending
            }
            Backing::Unavailable(reason) => {
                inner.backing = Backing::Unavailable(reason);
                inner.phase = TransactionState::Aborted;
                Pending::ready(Ok(()))
            }
            Backing::Released => {
                inner.phase = TransactionState::Aborted;
                Pending::ready(Ok(()))
            }
        }
    }

    async fn finish_abort(
        self: Arc<Self>,
        slot: Arc<ConnectionSlot>,
        rollback: Pending<()>,
        completer: Completer<()>,
    ) {
        self.pool.begin_finishing(self.id);
        let reusable = match rollback.await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(txn = self.id, slot = slot.name(), error = %e, "rollback failed");
                false
            }
        };
        let post_abort = self.finish_as(TransactionState::Aborted).post_abort;
        self.pool.release(self.id, slot, reusable);
        hooks::run_best_effort(post_abort, self.id, "post-abort").await;
        completer.complete(Ok(()));
    }

    fn spawn_commit(self: &Arc<Self>, slot: Arc<ConnectionSlot>, completer: Completer<()>) {
        let txn = Arc::clone(self);
        self.pool.spawn(async move {
            txn.finish_commit(slot, completer).await;
        });
    }

    async fn finish_commit(self: Arc<Self>, slot: Arc<ConnectionSlot>, completer: Completer<()>) {
        self.pool.begin_finishing(self.id);
        let pre_commit = {
            let mut inner = self.inner.lock();
            if !inner.executed {
                drop(inner);
                tracing::trace!(txn = self.id, "nothing executed, commit skipped");
                self.finish_as(TransactionState::Committed);
                self.pool.release(self.id, slot, true);
                completer.complete(Ok(()));
                return;
            }
            std::mem::take(&mut inner.hooks.pre_commit)
        };

        if let Err(hook_err) = hooks::run_all(pre_commit).await {
            tracing::warn!(txn = self.id, error = %hook_err, "pre-commit hook failed, aborting");
            let reusable = match slot.rollback().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(txn = self.id, slot = slot.name(), error = %e, "rollback failed");
                    false
                }
            };
            let post_abort = self.finish_as(TransactionState::Aborted).post_abort;
            self.pool.release(self.id, slot, reusable);
            hooks::run_best_effort(post_abort, self.id, "post-abort").await;
            completer.fail(PoolError::Hook(hook_err));
            return;
        }

        match slot.commit().await {
            Ok(()) => {
                let post_commit = self.finish_as(TransactionState::Committed).post_commit;
                self.pool.release(self.id, slot, true);
                hooks::run_best_effort(post_commit, self.id, "post-commit").await;
                completer.complete(Ok(()));
            }
            Err(e) => {
                tracing::error!(txn = self.id, slot = slot.name(), error = %e, "commit failed");
                self.finish_as(TransactionState::Committed);
                self.pool.release(self.id, slot, false);
                completer.fail(e);
            }
        }
    }

    /// Move to a terminal phase, returning the hooks that were registered.
    fn finish_as(&self, phase: TransactionState) -> Hooks {
        let mut inner = self.inner.lock();
        inner.phase = phase;
        inner.backing = Backing::Released;
        std::mem::take(&mut inner.hooks)
    }

    /// Give a spooled transaction its connection and replay its operations.
    ///
    /// Hands the slot back if the transaction no longer wants it.
    pub(crate) fn promote(
        self: &Arc<Self>,
        slot: Arc<ConnectionSlot>,
    ) -> std::result::Result<(), Arc<ConnectionSlot>> {
        let mut inner = self.inner.lock();
        let ops = match std::mem::replace(&mut inner.backing, Backing::Connected(Arc::clone(&slot))) {
            Backing::Spooled(ops) => ops,
            other => {
                inner.backing = other;
                return Err(slot);
            }
        };
        tracing::debug!(
            txn = self.id,
            slot = slot.name(),
            replayed = ops.len(),
            "promoted spooled transaction"
        );
        for op in ops {
            inner.issue(self, op);
        }
        Ok(())
    }

    /// Fail a spooled transaction that will never get a connection.
    pub(crate) fn fail_spooled(&self, reason: &str) {
        let mut inner = self.inner.lock();
        let Backing::Spooled(ops) = std::mem::replace(
            &mut inner.backing,
            Backing::Unavailable(reason.to_owned()),
        ) else {
            return;
        };
        let held = inner.blocks.take_all();
        for op in ops.into_iter().chain(held) {
            op.fail(PoolError::Connection(reason.to_owned()));
        }
        if inner.phase == TransactionState::Committing {
            inner.phase = TransactionState::Committed;
        }
    }

    /// Abort on behalf of the pool. Does nothing if already finishing.
    pub(crate) fn force_abort(self: &Arc<Self>) {
        let _ = self.abort();
    }

    pub(crate) fn open_block(self: &Arc<Self>) -> Result<CommandBlock> {
        let mut inner = self.inner.lock();
        if !inner.phase.is_active() {
            return Err(PoolError::AlreadyFinished);
        }
        let id = inner.blocks.open();
        tracing::trace!(txn = self.id, block = id, "opened command block");
        Ok(CommandBlock::new(Arc::clone(self), id))
    }

    pub(crate) fn end_block(self: &Arc<Self>, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let ready = inner.blocks.end(id)?;
        tracing::trace!(txn = self.id, block = id, released = ready.len(), "ended command block");
        for op in ready {
            inner.issue(self, op);
        }
        Ok(())
    }

    pub(crate) fn block_ended(&self, id: u64) -> bool {
        self.inner.lock().blocks.is_ended(id)
    }

    fn add_hook(&self, kind: HookKind, hook: hooks::Hook) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.phase.is_active() {
            return Err(PoolError::AlreadyFinished);
        }
        let hooks = &mut inner.hooks;
        match kind {
            HookKind::PreCommit => hooks.pre_commit.push(hook),
            HookKind::PostCommit => hooks.post_commit.push(hook),
            HookKind::PostAbort => hooks.post_abort.push(hook),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.inner.lock().backing, Backing::Connected(_))
    }
}

/// A logical transaction on a [`Pool`](crate::Pool).
///
/// Dropping a transaction that is still active aborts it.
///
/// # Example
///
/// ```rust,ignore
/// let txn = pool.acquire();
/// let rows = txn.exec(Statement::new("SELECT * FROM calendar")).await?;
/// txn.commit().await?;
/// ```
pub struct Transaction {
    shared: Arc<TxnShared>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        Self { shared }
    }

    /// Identifier, unique within the pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Dialect of the pool this transaction came from.
    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        &self.shared.dialect
    }

    /// Parameter style of the pool this transaction came from.
    #[must_use]
    pub fn param_style(&self) -> &ParamStyle {
        &self.shared.param_style
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    /// Check if the transaction currently holds a connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Execute a statement and fetch its rows.
    ///
    /// Statements issued while a command block is open run after the last
    /// open block ends.
    pub fn exec(&self, stmt: impl Into<Statement>) -> Pending<Vec<Row>> {
        self.shared.exec(stmt.into(), None)
    }

    /// Commit the transaction.
    ///
    /// A transaction that never executed a statement commits without running
    /// hooks or contacting the driver. Otherwise pre-commit hooks run first;
    /// if one fails the transaction is rolled back and the commit fails with
    /// [`PoolError::Hook`].
    pub fn commit(&self) -> Pending<()> {
        self.shared.commit()
    }

    /// Abort the transaction.
    ///
    /// Always succeeds unless the transaction already finished. Operations
    /// held by open command blocks fail with [`PoolError::AlreadyFinished`].
    pub fn abort(&self) -> Pending<()> {
        self.shared.abort()
    }

    /// Open a command block.
    pub fn command_block(&self) -> Result<CommandBlock> {
        self.shared.open_block()
    }

    /// Register a hook that runs before the commit reaches the driver.
    pub fn pre_commit<F, Fut>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.shared.add_hook(HookKind::PreCommit, hooks::boxed(hook))
    }

    /// Register a hook that runs after a successful commit.
    pub fn post_commit<F, Fut>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.shared.add_hook(HookKind::PostCommit, hooks::boxed(hook))
    }

    /// Register a hook that runs after the transaction is aborted.
    pub fn post_abort<F, Fut>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.shared.add_hook(HookKind::PostAbort, hooks::boxed(hook))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state().is_active() {
            tracing::debug!(txn = self.shared.id, "aborting dropped transaction");
            self.shared.force_abort();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("dialect", &self.shared.dialect)
            .finish()
    }
}
