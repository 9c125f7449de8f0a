//! Background reconciliation against the ledger.
//!
//! - [`ReputationWorker`]: pushes non-negative reputation deltas computed
//!   from released orders and reviews.
//! - [`governance::GovernanceWorker`]: projects governance events into the
//!   local store.

mod delta;
mod error;
pub mod governance;
mod hook;
mod reputation;
mod retry;

pub use delta::{estimate_feedback_buckets, ReputationSnapshot};
pub use error::ReconcileError;
pub use hook::ReputationTrigger;
pub use reputation::{
    spawn_reputation_loop, CounterpartTruth, EntryOutcome, EntryReport, ReputationReport,
    ReputationSource, ReputationWorker, BUMP_METHOD, NOOP_DRY_RUN, NOOP_UP_TO_DATE,
    REPUTATION_SECTION, REPUTATION_STORAGE, SKIP_MISSING_ACCOUNT, SKIP_NOT_ON_LEDGER,
    SKIP_UNKNOWN_USER,
};
pub use retry::{with_retry, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
