use ptx_escrow::EscrowError;
use ptx_phase::PhaseError;
use ptx_schemas::OrderStatus;
use uuid::Uuid;

/// `InvalidState.code` for any precondition miss.
pub const CODE_INVALID_STATE: &str = "INVALID_STATE";
/// `InvalidState.code` when the fiat leg is attempted before escrow.
pub const CODE_ESCROW_PENDING: &str = "ESCROW_PENDING";

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("caller {caller} is not the {required} of this order")]
    Forbidden { caller: String, required: &'static str },
    #[error("order is {actual}, expected {expected}")]
    InvalidState {
        expected: String,
        actual: OrderStatus,
        code: &'static str,
    },
    #[error("order {0} not found")]
    NotFound(Uuid),
    #[error("offer {0} not found")]
    OfferNotFound(Uuid),
    #[error("order {0} has a transition in flight")]
    Busy(Uuid),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        OrderError::Validation(msg.into())
    }

    /// Stable machine-readable code for the request layer.
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::Validation(_) => "VALIDATION",
            OrderError::Forbidden { .. } => "FORBIDDEN",
            OrderError::InvalidState { code, .. } => *code,
            OrderError::NotFound(_) | OrderError::OfferNotFound(_) => "NOT_FOUND",
            OrderError::Busy(_) => "BUSY",
            OrderError::Escrow(EscrowError::NoEscrowRecorded { .. }) => "NO_ESCROW_RECORDED",
            OrderError::Escrow(EscrowError::Ledger(_)) => "LEDGER",
            OrderError::Escrow(_) => "ESCROW",
            OrderError::Phase(PhaseError::PhaseInactive) => "PHASE_INACTIVE",
            OrderError::Phase(PhaseError::InsufficientSupply { .. }) => "INSUFFICIENT_SUPPLY",
            OrderError::Phase(PhaseError::NoNextPhase) => "NO_NEXT_PHASE",
            OrderError::Phase(PhaseError::Store(_)) | OrderError::Store(_) => "STORE",
        }
    }
}
