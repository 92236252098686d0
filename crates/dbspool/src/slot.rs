//! Dedicated execution threads for blocking driver calls.
//!
//! A [`WorkerSlot`] owns one resource (in the pool, one driver connection)
//! and one OS thread. Work items are closures over that resource; they run
//! one at a time, in submission order, and report back through a
//! [`Pending`]. The caller's async scheduler never blocks on the driver.
//!
//! ```text
//! submit() ──► unbounded queue ──► worker thread ──► oneshot ──► Pending
//! stop()   ──► Stop sentinel   ──► thread exits, resource parked
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{PoolError, Result};
use crate::lifecycle::SlotState;
use crate::pending::{Completer, Pending};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

#[cfg(test)]
thread_local! {
    static FAILING_SPAWNS: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// Make the next `count` slot starts on this thread fail to spawn.
#[cfg(test)]
pub(crate) fn fail_next_spawns(count: u32) {
    FAILING_SPAWNS.with(|left| left.set(count));
}

#[cfg(test)]
fn spawn_fails() -> bool {
    FAILING_SPAWNS.with(|left| match left.get() {
        0 => false,
        n => {
            left.set(n - 1);
            true
        }
    })
}

enum Message<S> {
    Run(Job<S>),
    Stop,
}

struct SlotInner<S> {
    state: SlotState,
    /// Parked here while the slot is stopped.
    resource: Option<S>,
    sender: Option<mpsc::UnboundedSender<Message<S>>>,
    stop_waiters: Vec<Completer<()>>,
}

struct SlotShared<S> {
    name: String,
    inner: Mutex<SlotInner<S>>,
}

impl<S> SlotShared<S> {
    /// Called on the worker thread once its loop has ended.
    fn exited(&self, resource: Option<S>) {
        let waiters = {
            let mut inner = self.inner.lock();
            if resource.is_some() {
                inner.resource = resource;
            }
            inner.state = SlotState::Stopped;
            inner.sender = None;
            std::mem::take(&mut inner.stop_waiters)
        };
        tracing::debug!(slot = %self.name, "worker slot stopped");
        for waiter in waiters {
            waiter.complete(Ok(()));
        }
    }
}

/// Publishes the stopped state even if a work item panics.
struct ExitGuard<S> {
    shared: Arc<SlotShared<S>>,
    resource: Option<S>,
}

impl<S> Drop for ExitGuard<S> {
    fn drop(&mut self) {
        self.shared.exited(self.resource.take());
    }
}

/// A single execution thread bound to one resource.
pub struct WorkerSlot<S: Send + 'static> {
    shared: Arc<SlotShared<S>>,
}

impl<S: Send + 'static> WorkerSlot<S> {
    /// Create a stopped slot owning `resource`.
    pub fn new(name: impl Into<String>, resource: S) -> Self {
        Self {
            shared: Arc::new(SlotShared {
                name: name.into(),
                inner: Mutex::new(SlotInner {
                    state: SlotState::Stopped,
                    resource: Some(resource),
                    sender: None,
                    stop_waiters: Vec::new(),
                }),
            }),
        }
    }

    /// The slot's name, also used as its thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The slot's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.shared.inner.lock().state
    }

    /// Start the execution thread.
    ///
    /// Starting a slot that is already running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.state != SlotState::Stopped {
            return Ok(());
        }
        #[cfg(test)]
        if spawn_fails() {
            return Err(PoolError::WorkerSpawn(std::io::Error::other(
                "thread limit reached",
            )));
        }
        let resource = inner.resource.take().ok_or(PoolError::SlotGone)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message<S>>();
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                let mut guard = ExitGuard {
                    shared,
                    resource: Some(resource),
                };
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Run(job) => {
                            if let Some(resource) = guard.resource.as_mut() {
                                job(resource);
                            }
                        }
                        Message::Stop => break,
                    }
                }
            });

        match spawned {
            Ok(_) => {
                inner.state = SlotState::Running;
                inner.sender = Some(tx);
                tracing::debug!(slot = %self.shared.name, "worker slot started");
                Ok(())
            }
            Err(e) => Err(PoolError::WorkerSpawn(e)),
        }
    }

    /// Run `work` on the slot's thread.
    ///
    /// Fails immediately with [`PoolError::SlotNotRunning`] unless the slot
    /// is running.
    pub fn submit<T, F>(&self, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let (completer, pending) = Pending::channel();
        self.submit_to(work, completer);
        pending
    }

    /// Run `work` on the slot's thread, answering through an existing completer.
    pub(crate) fn submit_to<T, F>(&self, work: F, completer: Completer<T>)
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let inner = self.shared.inner.lock();
        let sender = match (&inner.sender, inner.state) {
            (Some(sender), SlotState::Running) => sender,
            _ => {
                completer.fail(PoolError::SlotNotRunning {
                    slot: self.shared.name.clone(),
                });
                return;
            }
        };
        let job: Job<S> = Box::new(move |resource| completer.complete(work(resource)));
        // A closed queue drops the job, and with it the completer, which
        // resolves the caller's Pending with `SlotGone`.
        let _ = sender.send(Message::Run(job));
    }

    /// Stop the execution thread after all previously submitted work.
    ///
    /// Resolves once the thread has exited. Stopping a stopped slot resolves
    /// immediately.
    pub fn stop(&self) -> Pending<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SlotState::Stopped => return Pending::ready(Ok(())),
            SlotState::Running => {
                inner.state = SlotState::Stopping;
                if let Some(sender) = inner.sender.take() {
                    let _ = sender.send(Message::Stop);
                }
                tracing::debug!(slot = %self.shared.name, "worker slot stopping");
            }
            SlotState::Stopping => {}
        }
        let (completer, pending) = Pending::channel();
        inner.stop_waiters.push(completer);
        pending
    }
}

impl<S: Send + 'static> Drop for WorkerSlot<S> {
    fn drop(&mut self) {
        // The thread holds a reference to the shared state, so the queue
        // would otherwise never close.
        if let Some(sender) = self.shared.inner.lock().sender.take() {
            let _ = sender.send(Message::Stop);
        }
    }
}

impl<S: Send + 'static> std::fmt::Debug for WorkerSlot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
