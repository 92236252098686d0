//! Lifecycle states for the pool, its worker slots, and its transactions.
//!
//! ```text
//! Pool:         Running -> Stopping -> Stopped
//! Worker slot:  Stopped -> Running -> Stopping -> Stopped
//! Transaction:  Active -> Committing -> Committed
//!               Active -> Aborting   -> Aborted
//! ```

/// Lifecycle of a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Accepting new transactions.
    Running,
    /// `stop_service` was called; draining in-flight work.
    Stopping,
    /// Every connection is closed and every worker slot stopped.
    Stopped,
}

impl ServiceState {
    /// Check if new transactions can be handed a connection.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Lifecycle of a [`WorkerSlot`](crate::WorkerSlot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No execution thread exists.
    Stopped,
    /// The execution thread is accepting work.
    Running,
    /// The stop sentinel was queued; queued work still runs.
    Stopping,
}

impl SlotState {
    /// Check if the slot accepts new work.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Lifecycle of a [`Transaction`](crate::Transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Statements may be issued.
    Active,
    /// `commit` was requested and has not completed.
    Committing,
    /// `abort` was requested and has not completed.
    Aborting,
    /// The commit completed, successfully or not.
    Committed,
    /// The abort completed.
    Aborted,
}

impl TransactionState {
    /// Check if the transaction accepts new direct statements.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Check if commit or abort is in flight.
    #[must_use]
    pub fn is_finishing(&self) -> bool {
        matches!(self, Self::Committing | Self::Aborting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state() {
        assert!(ServiceState::Running.is_running());
        assert!(!ServiceState::Stopping.is_running());
        assert!(!ServiceState::Stopped.is_running());
    }

    #[test]
    fn test_slot_state_accepts_work() {
        assert!(SlotState::Running.accepts_work());
        assert!(!SlotState::Stopping.accepts_work());
        assert!(!SlotState::Stopped.accepts_work());
    }

    #[test]
    fn test_transaction_state_classification() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Active.is_terminal());

        assert!(TransactionState::Committing.is_finishing());
        assert!(TransactionState::Aborting.is_finishing());
        assert!(!TransactionState::Committing.is_terminal());

        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(!TransactionState::Aborted.is_finishing());
    }
}
