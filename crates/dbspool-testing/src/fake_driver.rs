//! Scriptable fake driver.
//!
//! [`FakeFactory`] is cheap to clone; every clone shares the same script,
//! journal and gate, so a test keeps one clone and hands another to the pool.
//!
//! Connections are numbered from 1 in the order they were opened. Every
//! statement returns one row, `[connection id, sql]`, which lets a test tell
//! which connection ran it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dbspool::{Connection, ConnectionFactory, Cursor, DriverError, Value};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Failures raised by the fake driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FakeDriverError {
    /// A scripted connect failure.
    #[error("fake connection attempt failed")]
    ConnectFailed,

    /// A scripted statement failure.
    #[error("fake statement failed: {0}")]
    StatementFailed(String),

    /// A scripted commit failure.
    #[error("fake commit failed")]
    CommitFailed,

    /// A scripted rollback failure.
    #[error("fake rollback failed")]
    RollbackFailed,

    /// The connection was used after being closed.
    #[error("connection {0} is closed")]
    Closed(u32),
}

/// Something the driver was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Connection `id` was opened.
    Connect(u32),
    /// A connect attempt failed.
    ConnectFailed,
    /// A statement ran on a connection.
    Execute {
        /// Connection id.
        conn: u32,
        /// Statement text.
        sql: String,
    },
    /// Commit on a connection.
    Commit(u32),
    /// Rollback on a connection.
    Rollback(u32),
    /// A connection was closed.
    Close(u32),
}

#[derive(Debug, Clone, Copy)]
enum ConnectOutcome {
    Connect,
    Fail,
}

#[derive(Default)]
struct FakeState {
    script: VecDeque<ConnectOutcome>,
    default_fail: bool,
    commit_fail: bool,
    rollback_fail: bool,
    statement_failures: u32,
    affected: HashMap<String, u64>,
    rowcount_unreliable: bool,
    opened: u32,
    closed: Vec<u32>,
    events: Vec<DriverEvent>,
    held: bool,
    blocked: usize,
}

struct Shared {
    state: Mutex<FakeState>,
    gate: Condvar,
}

impl Shared {
    /// Wait at the gate, then run `f` on the state.
    fn enter<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock();
        if state.held {
            state.blocked += 1;
            while state.held {
                self.gate.wait(&mut state);
            }
            state.blocked -= 1;
        }
        f(&mut *state)
    }
}

/// A fake connection factory.
#[derive(Clone)]
pub struct FakeFactory {
    shared: Arc<Shared>,
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFactory {
    /// Create a factory whose connect attempts succeed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FakeState::default()),
                gate: Condvar::new(),
            }),
        }
    }

    /// Script the next unscripted connect attempt to succeed.
    pub fn will_connect(&self) {
        self.shared
            .state
            .lock()
            .script
            .push_back(ConnectOutcome::Connect);
    }

    /// Script the next unscripted connect attempt to fail.
    pub fn will_fail(&self) {
        self.shared.state.lock().script.push_back(ConnectOutcome::Fail);
    }

    /// Make unscripted connect attempts fail.
    pub fn default_fail(&self) {
        self.shared.state.lock().default_fail = true;
    }

    /// Make unscripted connect attempts succeed.
    pub fn default_connect(&self) {
        self.shared.state.lock().default_fail = false;
    }

    /// Fail the next commit that reaches the driver.
    pub fn fail_next_commit(&self) {
        self.shared.state.lock().commit_fail = true;
    }

    /// Fail the next rollback that reaches the driver.
    pub fn fail_next_rollback(&self) {
        self.shared.state.lock().rollback_fail = true;
    }

    /// Fail the next `count` statements, on any connection.
    pub fn fail_next_statements(&self, count: u32) {
        self.shared.state.lock().statement_failures += count;
    }

    /// Report `sql` as affecting `rows` rows with no result set.
    pub fn affect_rows(&self, sql: impl Into<String>, rows: u64) {
        self.shared.state.lock().affected.insert(sql.into(), rows);
    }

    /// Report a zero row count before rows are fetched, like drivers whose
    /// row counts are unreliable.
    pub fn unreliable_rowcount(&self) {
        self.shared.state.lock().rowcount_unreliable = true;
    }

    /// Park every driver call at the gate until [`release`](Self::release).
    pub fn hold(&self) {
        self.shared.state.lock().held = true;
    }

    /// Let parked and future driver calls through.
    pub fn release(&self) {
        self.shared.state.lock().held = false;
        self.shared.gate.notify_all();
    }

    /// Number of driver calls currently parked at the gate.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.shared.state.lock().blocked
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.shared.state.lock().opened
    }

    /// Check if connection `id` has been closed.
    #[must_use]
    pub fn is_closed(&self, id: u32) -> bool {
        self.shared.state.lock().closed.contains(&id)
    }

    /// Number of opened connections not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> u32 {
        let state = self.shared.state.lock();
        state.opened - state.closed.len() as u32
    }

    /// Everything the driver was asked to do, in order.
    #[must_use]
    pub fn events(&self) -> Vec<DriverEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Statements executed, as `(connection id, sql)`.
    #[must_use]
    pub fn executed(&self) -> Vec<(u32, String)> {
        self.shared
            .state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                DriverEvent::Execute { conn, sql } => Some((*conn, sql.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of failed connect attempts so far.
    #[must_use]
    pub fn connect_failures(&self) -> usize {
        self.count(|event| matches!(event, DriverEvent::ConnectFailed))
    }

    /// Number of commits that reached the driver.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.count(|event| matches!(event, DriverEvent::Commit(_)))
    }

    /// Number of rollbacks that reached the driver.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.count(|event| matches!(event, DriverEvent::Rollback(_)))
    }

    fn count(&self, pred: impl Fn(&DriverEvent) -> bool) -> usize {
        self.shared.state.lock().events.iter().filter(|e| pred(e)).count()
    }
}

impl ConnectionFactory for FakeFactory {
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
        self.shared.enter(|state| {
            let outcome = state.script.pop_front().unwrap_or(if state.default_fail {
                ConnectOutcome::Fail
            } else {
                ConnectOutcome::Connect
            });
            match outcome {
                ConnectOutcome::Fail => {
                    state.events.push(DriverEvent::ConnectFailed);
                    Err(Box::new(FakeDriverError::ConnectFailed) as DriverError)
                }
                ConnectOutcome::Connect => {
                    state.opened += 1;
                    let id = state.opened;
                    state.events.push(DriverEvent::Connect(id));
                    Ok(Box::new(FakeConnection {
                        id,
                        closed: false,
                        shared: Arc::clone(&self.shared),
                    }) as Box<dyn Connection>)
                }
            }
        })
    }

    fn rowcount_reliable(&self) -> bool {
        !self.shared.state.lock().rowcount_unreliable
    }
}

/// A connection opened by [`FakeFactory`].
pub struct FakeConnection {
    id: u32,
    closed: bool,
    shared: Arc<Shared>,
}

impl FakeConnection {
    /// Connection id, starting at 1.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(Box::new(FakeDriverError::Closed(self.id)));
        }
        Ok(())
    }
}

impl Connection for FakeConnection {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<Cursor, DriverError> {
        self.check_open()?;
        let id = self.id;
        self.shared.enter(|state| {
            state.events.push(DriverEvent::Execute {
                conn: id,
                sql: sql.to_owned(),
            });
            if state.statement_failures > 0 {
                state.statement_failures -= 1;
                return Err(Box::new(FakeDriverError::StatementFailed(sql.to_owned())) as DriverError);
            }
            if let Some(rows) = state.affected.get(sql) {
                return Ok(Cursor::affected(*rows));
            }
            let mut cursor = Cursor::with_rows(vec![vec![Value::Int(i64::from(id)), Value::from(sql)]]);
            if state.rowcount_unreliable {
                cursor.rowcount = Some(0);
            }
            Ok(cursor)
        })
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        let id = self.id;
        self.shared.enter(|state| {
            state.events.push(DriverEvent::Commit(id));
            if std::mem::take(&mut state.commit_fail) {
                return Err(Box::new(FakeDriverError::CommitFailed) as DriverError);
            }
            Ok(())
        })
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        let id = self.id;
        self.shared.enter(|state| {
            state.events.push(DriverEvent::Rollback(id));
            if std::mem::take(&mut state.rollback_fail) {
                return Err(Box::new(FakeDriverError::RollbackFailed) as DriverError);
            }
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let id = self.id;
        self.shared.enter(|state| {
            state.events.push(DriverEvent::Close(id));
            state.closed.push(id);
        });
        Ok(())
    }
}
