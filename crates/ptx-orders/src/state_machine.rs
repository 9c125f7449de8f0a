//! Order lifecycle graph.
//!
//! ```text
//!  DRAFT ──create──► AWAITING_ESCROW ──escrow──► AWAITING_FIAT_PAYMENT
//!    │                     │                          │        │
//!  cancel               cancel                      paid    dispute
//!    ▼                     ▼                          ▼        │
//!  CANCELLED           CANCELLED            AWAITING_CONFIRMATION
//!                                              │          │    │
//!                                          received   dispute  │
//!                                              ▼          ▼    ▼
//!                                          RELEASED     DISPUTE_OPEN
//!                                                  ├─► DISPUTE_RESOLVED_BUYER
//!                                                  └─► DISPUTE_RESOLVED_SELLER
//!
//!  any non-terminal ──expire──► EXPIRED
//! ```
//!
//! Pure; no IO. Who may fire a transition is answered here too, so the
//! service checks authorization before it looks at state.

use ptx_schemas::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Create,
    ConfirmEscrow,
    MarkPaid,
    ConfirmReceived,
    Cancel,
    OpenDispute,
    Expire,
    ResolveForBuyer,
    ResolveForSeller,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Create => "CREATE",
            Transition::ConfirmEscrow => "CONFIRM_ESCROW",
            Transition::MarkPaid => "MARK_PAID",
            Transition::ConfirmReceived => "CONFIRM_RECEIVED",
            Transition::Cancel => "CANCEL",
            Transition::OpenDispute => "OPEN_DISPUTE",
            Transition::Expire => "EXPIRE",
            Transition::ResolveForBuyer => "RESOLVE_FOR_BUYER",
            Transition::ResolveForSeller => "RESOLVE_FOR_SELLER",
        }
    }

    /// Audit event kind recorded when the transition succeeds.
    pub fn event_kind(&self) -> &'static str {
        match self {
            Transition::Create => "CREATED",
            Transition::ConfirmEscrow => "ESCROW_CONFIRMED",
            Transition::MarkPaid => "PAID_MARKED",
            Transition::ConfirmReceived => "RELEASED",
            Transition::Cancel => "CANCELLED",
            Transition::OpenDispute => "DISPUTE_OPENED",
            Transition::Expire => "EXPIRED",
            Transition::ResolveForBuyer => "DISPUTE_RESOLVED_BUYER",
            Transition::ResolveForSeller => "DISPUTE_RESOLVED_SELLER",
        }
    }

    /// Statuses this transition may fire from.
    pub fn sources(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Transition::Create => &[Draft],
            Transition::ConfirmEscrow => &[AwaitingEscrow],
            Transition::MarkPaid => &[AwaitingFiatPayment],
            Transition::ConfirmReceived => &[AwaitingConfirmation],
            Transition::Cancel => &[Draft, AwaitingEscrow],
            Transition::OpenDispute => &[AwaitingFiatPayment, AwaitingConfirmation],
            Transition::Expire => &[
                Draft,
                AwaitingEscrow,
                AwaitingFiatPayment,
                AwaitingConfirmation,
                DisputeOpen,
            ],
            Transition::ResolveForBuyer | Transition::ResolveForSeller => &[DisputeOpen],
        }
    }

    pub fn target(&self) -> OrderStatus {
        match self {
            Transition::Create => OrderStatus::AwaitingEscrow,
            Transition::ConfirmEscrow => OrderStatus::AwaitingFiatPayment,
            Transition::MarkPaid => OrderStatus::AwaitingConfirmation,
            Transition::ConfirmReceived => OrderStatus::Released,
            Transition::Cancel => OrderStatus::Cancelled,
            Transition::OpenDispute => OrderStatus::DisputeOpen,
            Transition::Expire => OrderStatus::Expired,
            Transition::ResolveForBuyer => OrderStatus::DisputeResolvedBuyer,
            Transition::ResolveForSeller => OrderStatus::DisputeResolvedSeller,
        }
    }

    pub fn actor(&self) -> Actor {
        match self {
            Transition::ConfirmEscrow | Transition::ConfirmReceived => Actor::Escrower,
            Transition::MarkPaid => Actor::Payer,
            Transition::Create | Transition::Cancel | Transition::OpenDispute => Actor::EitherParty,
            Transition::Expire => Actor::System,
            Transition::ResolveForBuyer | Transition::ResolveForSeller => Actor::Operator,
        }
    }
}

/// Who may fire a transition. The escrower is also the fiat receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Escrower,
    Payer,
    EitherParty,
    System,
    Operator,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Escrower => "escrower",
            Actor::Payer => "fiat payer",
            Actor::EitherParty => "order party",
            Actor::System => "system",
            Actor::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal order transition: {transition:?} from {from}")]
pub struct TransitionError {
    pub from: OrderStatus,
    pub transition: Transition,
}

/// Target status of `t` fired from `from`.
pub fn next_status(from: OrderStatus, t: Transition) -> Result<OrderStatus, TransitionError> {
    if t.sources().contains(&from) {
        Ok(t.target())
    } else {
        Err(TransitionError { from, transition: t })
    }
}

/// Render a source set as `A|B` for error messages.
pub fn describe_sources(t: Transition) -> String {
    t.sources()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|")
}
