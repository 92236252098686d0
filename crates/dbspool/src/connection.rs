//! Driver connections bound to worker slots.
//!
//! A [`ConnectionHolder`] is the resource owned by a worker slot's thread.
//! Every method on it runs on that thread and may block. The pool only ever
//! talks to it through a [`ConnectionSlot`], which turns each call into a
//! work item.

use std::sync::Arc;

use crate::driver::{Connection, ConnectionFactory, Row};
use crate::error::{PoolError, Result};
use crate::lifecycle::SlotState;
use crate::pending::{Completer, Pending};
use crate::slot::WorkerSlot;
use crate::statement::Statement;

/// A driver connection and its per-transaction bookkeeping.
pub(crate) struct ConnectionHolder {
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<Box<dyn Connection>>,
    /// Statements issued since the last commit or rollback.
    executions: u64,
    slot: Arc<str>,
}

impl ConnectionHolder {
    pub(crate) fn new(factory: Arc<dyn ConnectionFactory>, slot: Arc<str>) -> Self {
        Self {
            factory,
            connection: None,
            executions: 0,
            slot,
        }
    }

    /// Open the driver connection.
    pub(crate) fn connect(&mut self) -> Result<()> {
        let connection = self.factory.connect().map_err(PoolError::Driver)?;
        self.connection = Some(connection);
        self.executions = 0;
        Ok(())
    }

    /// Execute one statement.
    ///
    /// A failure on the first statement since the last commit or rollback is
    /// taken to mean the connection went stale while idle: the connection is
    /// replaced and the statement retried once on the new one.
    pub(crate) fn execute(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        let reliable = self.factory.rowcount_reliable();
        let first = self.executions == 0;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| PoolError::Connection("connection is not open".into()))?;
        self.executions += 1;

        match connection.execute(stmt.sql(), stmt.params()) {
            Ok(cursor) => stmt.finish(cursor, reliable),
            Err(e) if first => {
                tracing::warn!(
                    slot = %self.slot,
                    error = %e,
                    "first statement failed, reconnecting"
                );
                self.close();
                let connection = self.factory.connect().map_err(|e| {
                    PoolError::Connection(format!("reconnect after statement failure: {e}"))
                })?;
                let connection = self.connection.insert(connection);
                let cursor = connection
                    .execute(stmt.sql(), stmt.params())
                    .map_err(PoolError::Driver)?;
                stmt.finish(cursor, reliable)
            }
            Err(e) => Err(PoolError::Driver(e)),
        }
    }

    /// Commit, unless nothing was executed.
    pub(crate) fn commit(&mut self) -> Result<()> {
        if self.executions == 0 {
            return Ok(());
        }
        self.executions = 0;
        self.connection
            .as_mut()
            .ok_or_else(|| PoolError::Connection("connection is not open".into()))?
            .commit()
            .map_err(PoolError::Driver)
    }

    /// Roll back. Always reaches the driver when a connection is open.
    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.executions = 0;
        self.connection
            .as_mut()
            .ok_or_else(|| PoolError::Connection("connection is not open".into()))?
            .rollback()
            .map_err(PoolError::Driver)
    }

    /// Close the driver connection, if one is open.
    pub(crate) fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close() {
                tracing::warn!(slot = %self.slot, error = %e, "error closing connection");
            }
        }
        self.executions = 0;
    }
}

/// A worker slot dedicated to one pooled connection.
pub(crate) struct ConnectionSlot {
    id: u64,
    name: Arc<str>,
    worker: WorkerSlot<ConnectionHolder>,
}

impl ConnectionSlot {
    pub(crate) fn new(id: u64, prefix: &str, factory: Arc<dyn ConnectionFactory>) -> Self {
        let name: Arc<str> = Arc::from(format!("{prefix}-{id}"));
        let holder = ConnectionHolder::new(factory, Arc::clone(&name));
        Self {
            id,
            worker: WorkerSlot::new(name.to_string(), holder),
            name,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SlotState {
        self.worker.state()
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.worker.start()
    }

    pub(crate) fn connect(&self) -> Pending<()> {
        self.worker.submit(ConnectionHolder::connect)
    }

    pub(crate) fn execute_to(&self, stmt: Statement, completer: Completer<Vec<Row>>) {
        tracing::trace!(slot = %self.name, sql = stmt.sql(), "submitting statement");
        self.worker
            .submit_to(move |holder| holder.execute(&stmt), completer);
    }

    pub(crate) fn commit(&self) -> Pending<()> {
        self.worker.submit(ConnectionHolder::commit)
    }

    pub(crate) fn rollback(&self) -> Pending<()> {
        self.worker.submit(ConnectionHolder::rollback)
    }

    /// Close the connection and stop the thread once queued work is done.
    pub(crate) fn close_and_stop(&self) -> Pending<()> {
        if self.worker.state() == SlotState::Running {
            let _ = self.worker.submit(|holder| {
                holder.close();
                Ok(())
            });
        }
        self.worker.stop()
    }
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("name", &self.name)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::driver::{Cursor, DriverError, Value};

    /// What each stub connection did, by connection number.
    #[derive(Default)]
    struct Journal {
        connects: u32,
        executed: Vec<(u32, String)>,
        commits: u32,
        rollbacks: u32,
        closed: Vec<u32>,
        /// Scripted outcomes for upcoming execute calls; empty means succeed.
        failures: VecDeque<bool>,
        refuse_connect: bool,
    }

    struct StubFactory {
        journal: Arc<Mutex<Journal>>,
        reliable: bool,
    }

    struct StubConnection {
        number: u32,
        journal: Arc<Mutex<Journal>>,
    }

    impl ConnectionFactory for StubFactory {
        fn connect(&self) -> std::result::Result<Box<dyn Connection>, DriverError> {
            let mut journal = self.journal.lock();
            if journal.refuse_connect {
                return Err("refused".into());
            }
            journal.connects += 1;
            Ok(Box::new(StubConnection {
                number: journal.connects,
                journal: Arc::clone(&self.journal),
            }))
        }

        fn rowcount_reliable(&self) -> bool {
            self.reliable
        }
    }

    impl Connection for StubConnection {
        fn execute(
            &mut self,
            sql: &str,
            _params: &[Value],
        ) -> std::result::Result<Cursor, DriverError> {
            let mut journal = self.journal.lock();
            journal.executed.push((self.number, sql.to_owned()));
            if journal.failures.pop_front().unwrap_or(false) {
                return Err("statement failed".into());
            }
            if sql.starts_with("UPDATE") {
                return Ok(Cursor::affected(0));
            }
            Ok(Cursor::with_rows(vec![vec![
                Value::Int(i64::from(self.number)),
                Value::from(sql),
            ]]))
        }

        fn commit(&mut self) -> std::result::Result<(), DriverError> {
            self.journal.lock().commits += 1;
            Ok(())
        }

        fn rollback(&mut self) -> std::result::Result<(), DriverError> {
            self.journal.lock().rollbacks += 1;
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), DriverError> {
            self.journal.lock().closed.push(self.number);
            Ok(())
        }
    }

    fn holder() -> (ConnectionHolder, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let factory = Arc::new(StubFactory {
            journal: Arc::clone(&journal),
            reliable: true,
        });
        (ConnectionHolder::new(factory, Arc::from("test-0")), journal)
    }

    #[test]
    fn test_commit_without_statements_skips_driver() {
        let (mut holder, journal) = holder();
        holder.connect().unwrap();
        holder.commit().unwrap();
        assert_eq!(journal.lock().commits, 0);

        holder.execute(&Statement::new("SELECT 1")).unwrap();
        holder.commit().unwrap();
        assert_eq!(journal.lock().commits, 1);
    }

    #[test]
    fn test_rollback_always_reaches_driver() {
        let (mut holder, journal) = holder();
        holder.connect().unwrap();
        holder.rollback().unwrap();
        assert_eq!(journal.lock().rollbacks, 1);
    }

    #[test]
    fn test_first_statement_failure_reconnects() {
        let (mut holder, journal) = holder();
        holder.connect().unwrap();
        journal.lock().failures.push_back(true);

        let rows = holder.execute(&Statement::new("SELECT 1")).unwrap();
        assert_eq!(rows[0][0], Value::Int(2));

        let journal = journal.lock();
        assert_eq!(journal.connects, 2);
        assert_eq!(journal.closed, vec![1]);
        assert_eq!(
            journal.executed,
            vec![(1, "SELECT 1".to_owned()), (2, "SELECT 1".to_owned())]
        );
    }

    #[test]
    fn test_later_statement_failure_is_surfaced() {
        let (mut holder, journal) = holder();
        holder.connect().unwrap();
        holder.execute(&Statement::new("SELECT 1")).unwrap();
        journal.lock().failures.push_back(true);

        let err = holder.execute(&Statement::new("SELECT 2")).unwrap_err();
        assert!(err.is_driver_error());
        let journal = journal.lock();
        assert_eq!(journal.connects, 1);
        assert!(journal.closed.is_empty());
    }

    #[test]
    fn test_failed_reconnect_is_a_connection_error() {
        let (mut holder, journal) = holder();
        holder.connect().unwrap();
        {
            let mut journal = journal.lock();
            journal.failures.push_back(true);
            journal.refuse_connect = true;
        }
        let err = holder.execute(&Statement::new("SELECT 1")).unwrap_err();
        assert!(err.is_connection_error());

        // With no connection left, commit and rollback fail rather than
        // pretending to succeed.
        assert!(holder.commit().unwrap_err().is_connection_error());
        assert!(holder.rollback().unwrap_err().is_connection_error());
    }

    #[test]
    fn test_zero_rows_uses_factory_reliability() {
        let (mut holder, _journal) = holder();
        holder.connect().unwrap();
        let err = holder
            .execute(&Statement::new("UPDATE t SET x = 1").raise_on_zero_rows("gone"))
            .unwrap_err();
        assert!(matches!(err, PoolError::NoRows(ref m) if m == "gone"));
    }

    #[tokio::test]
    async fn test_slot_round_trip() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let factory = Arc::new(StubFactory {
            journal: Arc::clone(&journal),
            reliable: true,
        });
        let slot = ConnectionSlot::new(7, "unit", factory);
        assert_eq!(slot.name(), "unit-7");
        assert_eq!(slot.id(), 7);

        slot.start().unwrap();
        slot.connect().await.unwrap();

        let (completer, pending) = Pending::channel();
        slot.execute_to(Statement::new("SELECT 1"), completer);
        let rows = pending.await.unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1), Value::from("SELECT 1")]]);

        slot.commit().await.unwrap();
        slot.close_and_stop().await.unwrap();
        assert_eq!(slot.state(), SlotState::Stopped);
        assert_eq!(journal.lock().closed, vec![1]);
    }
}
