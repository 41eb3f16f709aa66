/// Where a builder's transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Discarded without commit or rollback: the connection was closed or the builder
    /// disposed while the transaction was still active.
    Abandoned,
}

/// Transaction begun by `Builder::build`, owned by that builder alone.
#[derive(Debug)]
pub struct TransactionHandle {
    state: TransactionState,
}

impl TransactionHandle {
    pub(crate) fn begin() -> Self {
        Self {
            state: TransactionState::Active,
        }
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Move out of `Active`. Finished transactions keep their first outcome.
    pub(crate) fn finish(&mut self, outcome: TransactionState) {
        if self.is_active() {
            self.state = outcome;
        }
    }
}
