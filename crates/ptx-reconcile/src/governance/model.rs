//! Off-ledger projection of on-ledger governance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptx_ledger::EventKind;
use ptx_schemas::MinorUnits;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($s => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(RequestStatus {
    Submitted => "SUBMITTED",
    InVoting => "IN_VOTING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    PaidOut => "PAID_OUT",
});

status_enum!(MotionStatus {
    Proposed => "PROPOSED",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Executed => "EXECUTED",
    ExecutionFailed => "EXECUTION_FAILED",
});

status_enum!(ReferendumStatus {
    Started => "STARTED",
    Passed => "PASSED",
    NotPassed => "NOT_PASSED",
    Executed => "EXECUTED",
    ExecutionFailed => "EXECUTION_FAILED",
});

impl ReferendumStatus {
    /// Lifecycle order; a status never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            ReferendumStatus::Started => 0,
            ReferendumStatus::Passed | ReferendumStatus::NotPassed => 1,
            ReferendumStatus::Executed | ReferendumStatus::ExecutionFailed => 2,
        }
    }
}

/// Spending request submitted off-ledger and voted on by the council.
/// `content_hash` is the hash of the motion that will carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreasuryRequest {
    pub id: Uuid,
    pub title: String,
    pub beneficiary: String,
    pub amount: MinorUnits,
    pub content_hash: String,
    pub status: RequestStatus,
    pub motion_hash: Option<String>,
    pub proposal_index: Option<u32>,
    pub paid_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilMotion {
    pub motion_hash: String,
    pub proposal_index: u32,
    pub proposer: String,
    pub threshold: u32,
    pub status: MotionStatus,
    pub yes: u32,
    pub no: u32,
    pub proposed_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilVote {
    pub motion_hash: String,
    pub voter: String,
    pub approve: bool,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemocracyProposal {
    pub proposal_index: u32,
    pub proposer: String,
    pub deposit: MinorUnits,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referendum {
    pub ref_index: u32,
    pub status: ReferendumStatus,
    pub threshold: String,
    pub preimage_hash: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub proposer: Option<String>,
    pub started_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferendumVote {
    pub ref_index: u32,
    pub voter: String,
    pub aye: bool,
    pub balance: MinorUnits,
    pub height: u64,
}

/// One processed ledger event; `(subject, kind)` is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceEventRecord {
    pub subject: String,
    pub kind: EventKind,
    pub height: u64,
    pub tx_ref: String,
    pub payload: Value,
}

/// Persistence for the governance projection. Every write is idempotent so
/// an event re-applied after a crash converges to the same rows.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    async fn event_seen(&self, subject: &str, kind: EventKind) -> anyhow::Result<bool>;

    /// `false` if `(subject, kind)` was already recorded.
    async fn record_event(&self, rec: &GovernanceEventRecord) -> anyhow::Result<bool>;

    async fn last_event_height(&self) -> anyhow::Result<Option<u64>>;

    async fn insert_request(&self, req: &TreasuryRequest) -> anyhow::Result<()>;

    async fn fetch_request(&self, id: Uuid) -> anyhow::Result<Option<TreasuryRequest>>;

    /// Insert if absent; an existing motion keeps its status and tally.
    async fn upsert_motion(&self, motion: &CouncilMotion) -> anyhow::Result<()>;

    async fn fetch_motion(&self, motion_hash: &str) -> anyhow::Result<Option<CouncilMotion>>;

    /// Sets the status, and the final tally when given. `false` if the
    /// motion is unknown.
    async fn set_motion_status(
        &self,
        motion_hash: &str,
        status: MotionStatus,
        tally: Option<(u32, u32)>,
    ) -> anyhow::Result<bool>;

    /// `false` if this voter already has a vote on the motion.
    async fn record_vote(&self, vote: &CouncilVote) -> anyhow::Result<bool>;

    /// Move the `SUBMITTED` request whose `content_hash` equals
    /// `motion_hash` to `IN_VOTING`.
    async fn link_request_to_motion(
        &self,
        motion_hash: &str,
        proposal_index: u32,
    ) -> anyhow::Result<Option<Uuid>>;

    /// Move the request linked to `motion_hash` to `to` if its status is in
    /// `from`.
    async fn set_request_status_by_motion(
        &self,
        motion_hash: &str,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> anyhow::Result<Option<Uuid>>;

    /// Mark the oldest `APPROVED` request for `beneficiary`/`amount` as
    /// `PAID_OUT` by `tx_ref`. A request already paid by `tx_ref` is
    /// returned unchanged.
    async fn pay_out_by_transfer(
        &self,
        beneficiary: &str,
        amount: MinorUnits,
        tx_ref: &str,
    ) -> anyhow::Result<Option<Uuid>>;

    async fn upsert_proposal(&self, proposal: &DemocracyProposal) -> anyhow::Result<()>;

    /// Insert, or refresh metadata while keeping a later status.
    async fn upsert_referendum(&self, referendum: &Referendum) -> anyhow::Result<()>;

    async fn fetch_referendum(&self, ref_index: u32) -> anyhow::Result<Option<Referendum>>;

    /// No-op (but `true`) when the stored status already ranks higher.
    /// `false` if the referendum is unknown.
    async fn set_referendum_status(
        &self,
        ref_index: u32,
        status: ReferendumStatus,
    ) -> anyhow::Result<bool>;

    /// `false` if this voter already voted on the referendum.
    async fn record_referendum_vote(&self, vote: &ReferendumVote) -> anyhow::Result<bool>;

    /// `(aye balance, nay balance)`.
    async fn referendum_tally(&self, ref_index: u32) -> anyhow::Result<(MinorUnits, MinorUnits)>;
}
