use ptx_ledger::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Only transport-level ledger failures are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Ledger(e) => e.is_transient(),
            ReconcileError::Store(_) => false,
        }
    }
}
