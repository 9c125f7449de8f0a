//! In-memory stores and a wired harness for cross-crate scenarios.

mod harness;
mod memory;

pub use harness::{
    minutes_from_now, offer, phase, Harness, HarnessConfig, CUSTODY, MAKER, MAKER_ACCOUNT,
    REGISTRAR, SECONDARY_ASSET_ID, TAKER, TAKER_ACCOUNT, TREASURY,
};
pub use memory::MemoryStore;
