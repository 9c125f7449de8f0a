//! Sale phases of the secondary asset.
//!
//! Each phase has a fixed price and a supply cap; at most one is active.
//! Sold supply is read from ledger issuance, open orders hold reservations
//! on top of it, and phases advance strictly in `seq` order.

mod controller;
mod store;

pub use controller::{ActivePhase, PhaseController, PhaseError};
pub use store::{AdvanceOutcome, PhaseStore};
