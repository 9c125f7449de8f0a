//! Ledger access for the settlement core.
//!
//! The ledger is an opaque service: submit a call and wait for inclusion,
//! query balances and storage, read events by height. Everything above this
//! crate talks to it through `Arc<dyn Ledger>`.

mod client;
mod error;
pub mod events;
pub mod paper;
pub mod rpc;
mod types;

pub use client::Ledger;
pub use error::LedgerError;
pub use events::{
    decode_event, encode_event, subscribe_events, EventBody, EventKind, LedgerEvent,
    EVENT_SCHEMA_VERSION,
};
pub use paper::PaperLedger;
pub use rpc::{RpcConfig, RpcLedger};
pub use types::{
    decode_dispatch_error, storage_uint, AssetRef, Inclusion, LedgerCall, NotUint, SubmitOutcome,
    TransferFromRequest, TransferRecord, TransferRequest, DUPLICATE_MEMO,
};
