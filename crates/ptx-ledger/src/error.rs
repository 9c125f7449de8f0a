/// Failures of a ledger round-trip. A dispatch that was included but failed
/// is [`LedgerError::Rejected`]; everything else means the outcome is
/// unknown or the node is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger rejected call: {reason}")]
    Rejected { reason: String },
    #[error("ledger {op} timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger payload decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Worth another attempt by a caller that owns a retry policy. The
    /// client itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout { .. } | LedgerError::Transport(_))
    }
}
