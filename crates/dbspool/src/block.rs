//! Command blocks.
//!
//! A command block is a run of statements that reaches the connection
//! without interleaving with anything else on the same transaction. Blocks
//! take turns in the order they were opened: statements for the block at the
//! head of the line go straight through, statements for later blocks are held
//! until every earlier block has ended. Direct statements and the commit
//! issued while any block is open wait until the last open block ends.
//!
//! ```text
//! open A, open B, A1, B1, A2, B2, end A, end B   ─►   A1 A2 B1 B2
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::{Dialect, ParamStyle};
use crate::driver::Row;
use crate::error::{PoolError, Result};
use crate::pending::{Completer, Pending};
use crate::statement::Statement;
use crate::transaction::TxnShared;

/// An operation waiting to reach the transaction's backing.
#[derive(Debug)]
pub(crate) enum Op {
    Exec(Statement, Completer<Vec<Row>>),
    Commit(Completer<()>),
}

impl Op {
    pub(crate) fn fail(self, err: PoolError) {
        match self {
            Self::Exec(_, completer) => completer.fail(err),
            Self::Commit(completer) => completer.fail(err),
        }
    }
}

/// Block ordering state for one transaction.
#[derive(Default)]
pub(crate) struct Blocks {
    next_id: u64,
    /// Blocks not yet retired, in open order. The front block is current.
    open: VecDeque<u64>,
    held: HashMap<u64, Vec<Op>>,
    ended: HashSet<u64>,
    /// Direct operations issued while a block was open.
    deferred: Vec<Op>,
}

impl Blocks {
    pub(crate) fn open(&mut self) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.open.push_back(id);
        id
    }

    pub(crate) fn has_open(&self) -> bool {
        !self.open.is_empty()
    }

    pub(crate) fn is_ended(&self, id: u64) -> bool {
        self.ended.contains(&id)
    }

    /// Route a direct operation; `Some` means it may be issued now.
    pub(crate) fn route_direct(&mut self, op: Op) -> Option<Op> {
        if self.open.is_empty() {
            Some(op)
        } else {
            self.deferred.push(op);
            None
        }
    }

    /// Route an operation for block `id`.
    ///
    /// Returns the operation back as an error if the block has ended.
    pub(crate) fn route_block(&mut self, id: u64, op: Op) -> std::result::Result<Option<Op>, Op> {
        if self.ended.contains(&id) || !self.open.contains(&id) {
            return Err(op);
        }
        if self.open.front() == Some(&id) {
            return Ok(Some(op));
        }
        self.held.entry(id).or_default().push(op);
        Ok(None)
    }

    /// End block `id`, returning the operations it unblocks, in issue order.
    pub(crate) fn end(&mut self, id: u64) -> Result<Vec<Op>> {
        if !self.ended.insert(id) {
            return Err(PoolError::AlreadyFinished);
        }

        let mut ready = Vec::new();
        while let Some(front) = self.open.front().copied() {
            if !self.ended.contains(&front) {
                break;
            }
            self.open.pop_front();
            if let Some(next) = self.open.front() {
                ready.extend(self.held.remove(next).unwrap_or_default());
            }
        }
        if self.open.is_empty() {
            ready.append(&mut self.deferred);
        }
        Ok(ready)
    }

    /// Remove every held and deferred operation.
    pub(crate) fn take_all(&mut self) -> Vec<Op> {
        let mut ops: Vec<Op> = self.held.drain().flat_map(|(_, ops)| ops).collect();
        ops.append(&mut self.deferred);
        ops
    }
}

/// An ordered, contiguous run of statements within a transaction.
///
/// Obtained from [`Transaction::command_block`](crate::Transaction::command_block).
/// A block that is dropped without being ended is ended implicitly, so that
/// it cannot hold up the rest of the transaction.
pub struct CommandBlock {
    txn: Arc<TxnShared>,
    id: u64,
}

impl CommandBlock {
    pub(crate) fn new(txn: Arc<TxnShared>, id: u64) -> Self {
        Self { txn, id }
    }

    /// Block identifier, unique within its transaction.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dialect of the owning pool.
    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        self.txn.dialect()
    }

    /// Parameter style of the owning pool.
    #[must_use]
    pub fn param_style(&self) -> &ParamStyle {
        self.txn.param_style()
    }

    /// Execute a statement as part of this block.
    pub fn exec(&self, stmt: impl Into<Statement>) -> Pending<Vec<Row>> {
        self.txn.exec(stmt.into(), Some(self.id))
    }

    /// End the block, releasing whatever was waiting behind it.
    ///
    /// Fails with [`PoolError::AlreadyFinished`] if the block already ended.
    /// Ending a block of an aborted transaction succeeds.
    pub fn end(&self) -> Result<()> {
        self.txn.end_block(self.id)
    }

    /// Check if the block has ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.txn.block_ended(self.id)
    }
}

impl Drop for CommandBlock {
    fn drop(&mut self) {
        if !self.is_ended() {
            let _ = self.txn.end_block(self.id);
        }
    }
}

impl std::fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBlock")
            .field("txn", &self.txn.id())
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn exec(sql: &str) -> (Op, Pending<Vec<Row>>) {
        let (completer, pending) = Pending::channel();
        (Op::Exec(Statement::new(sql), completer), pending)
    }

    fn sql_of(ops: &[Op]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                Op::Exec(stmt, _) => stmt.sql().to_owned(),
                Op::Commit(_) => "COMMIT".to_owned(),
            })
            .collect()
    }

    #[test]
    fn test_direct_ops_pass_without_blocks() {
        let mut blocks = Blocks::default();
        let (op, _p) = exec("x");
        assert!(blocks.route_direct(op).is_some());
    }

    #[test]
    fn test_blocks_group_in_open_order() {
        let mut blocks = Blocks::default();
        let a = blocks.open();
        let b = blocks.open();
        let mut wire = Vec::new();
        let mut keep = Vec::new();

        for (block, sql) in [(a, "A1"), (b, "B1"), (a, "A2"), (b, "B2")] {
            let (op, p) = exec(sql);
            keep.push(p);
            if let Some(op) = blocks.route_block(block, op).ok().flatten() {
                wire.push(op);
            }
        }
        assert_eq!(sql_of(&wire), ["A1", "A2"]);

        wire.extend(blocks.end(a).unwrap());
        assert_eq!(sql_of(&wire), ["A1", "A2", "B1", "B2"]);
        assert!(blocks.end(b).unwrap().is_empty());
        assert!(!blocks.has_open());
    }

    #[test]
    fn test_later_block_ending_first_waits_for_earlier() {
        let mut blocks = Blocks::default();
        let a = blocks.open();
        let b = blocks.open();
        let c = blocks.open();

        let (op, _pb) = exec("B1");
        assert!(blocks.route_block(b, op).unwrap().is_none());
        let (op, _pc) = exec("C1");
        assert!(blocks.route_block(c, op).unwrap().is_none());
        assert!(blocks.end(b).unwrap().is_empty());

        // B is already over, so retiring A releases B and then C.
        assert_eq!(sql_of(&blocks.end(a).unwrap()), ["B1", "C1"]);
        assert!(blocks.has_open());
        assert!(blocks.end(c).unwrap().is_empty());
    }

    #[test]
    fn test_deferred_direct_ops_follow_all_blocks() {
        let mut blocks = Blocks::default();
        let a = blocks.open();
        let (op, _p1) = exec("direct");
        assert!(blocks.route_direct(op).is_none());
        let (completer, _p2) = Pending::channel();
        assert!(blocks.route_direct(Op::Commit(completer)).is_none());

        let b = blocks.open();
        let (op, _p3) = exec("B1");
        assert!(blocks.route_block(b, op).unwrap().is_none());

        assert_eq!(sql_of(&blocks.end(a).unwrap()), ["B1"]);
        assert_eq!(sql_of(&blocks.end(b).unwrap()), ["direct", "COMMIT"]);
    }

    #[test]
    fn test_end_twice_and_exec_after_end() {
        let mut blocks = Blocks::default();
        let a = blocks.open();
        blocks.end(a).unwrap();
        assert!(blocks.is_ended(a));
        assert!(matches!(blocks.end(a), Err(PoolError::AlreadyFinished)));

        let (op, _p) = exec("late");
        assert!(blocks.route_block(a, op).is_err());
    }

    #[tokio::test]
    async fn test_take_all_returns_held_and_deferred() {
        let mut blocks = Blocks::default();
        let _a = blocks.open();
        let b = blocks.open();
        let (op, held) = exec("B1");
        assert!(blocks.route_block(b, op).unwrap().is_none());
        let (op, deferred) = exec("direct");
        assert!(blocks.route_direct(op).is_none());

        for op in blocks.take_all() {
            op.fail(PoolError::AlreadyFinished);
        }
        assert!(held.await.unwrap_err().is_already_finished());
        assert!(deferred.await.unwrap_err().is_already_finished());
    }
}
