//! Order lifecycle for peer-to-peer trades.
//!
//! [`state_machine`] is the pure transition graph; [`OrderService`] runs it
//! against storage, escrow and the phase controller.

mod error;
mod inflight;
mod service;
pub mod state_machine;
mod store;

pub use error::{OrderError, CODE_ESCROW_PENDING, CODE_INVALID_STATE};
pub use inflight::{InFlight, InFlightGuard};
pub use service::{
    CreateOrder, ExpirySweep, OrderAmount, OrderService, OrderServiceConfig, StrandedOrder,
};
pub use state_machine::{next_status, Actor, Transition, TransitionError};
pub use store::{OfferStore, OrderStore, ReleaseHook};

pub use ptx_escrow::EscrowFunding;
