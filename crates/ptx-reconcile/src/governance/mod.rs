//! Governance projection: ledger council/democracy/treasury events folded
//! into off-ledger rows.

mod model;
mod preimage;
mod worker;

pub use model::{
    CouncilMotion, CouncilVote, DemocracyProposal, GovernanceEventRecord, GovernanceStore,
    MotionStatus, Referendum, ReferendumStatus, ReferendumVote, RequestStatus, TreasuryRequest,
};
pub use preimage::{decode_preimage, PreimageError, PreimageMeta, PREIMAGE_SCHEMA_VERSION, PREIMAGE_STORAGE};
pub use worker::{event_subject, spawn_governance_loop, GovernanceWorker, HandleOutcome, GOVERNANCE_KINDS};
