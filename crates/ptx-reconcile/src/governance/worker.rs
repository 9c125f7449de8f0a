use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use ptx_ledger::{subscribe_events, EventBody, EventKind, Ledger, LedgerError, LedgerEvent};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::model::{
    CouncilMotion, CouncilVote, DemocracyProposal, GovernanceEventRecord, GovernanceStore,
    MotionStatus, Referendum, ReferendumStatus, ReferendumVote, RequestStatus,
};
use super::preimage::{decode_preimage, PreimageMeta, PREIMAGE_STORAGE};
use crate::retry::{with_retry, RetryPolicy};
use crate::ReconcileError;

/// Every event kind the projection consumes.
pub const GOVERNANCE_KINDS: [EventKind; 12] = EventKind::ALL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Applied,
    /// `(subject, kind)` was already processed.
    Duplicate,
    /// Not governance-relevant, e.g. a transfer that did not leave the treasury.
    Ignored,
}

/// Deduplication subject of an event; unique together with its kind.
pub fn event_subject(ev: &LedgerEvent) -> String {
    match &ev.body {
        EventBody::CouncilProposed { motion_hash, .. }
        | EventBody::CouncilClosed { motion_hash, .. }
        | EventBody::CouncilExecuted { motion_hash, .. } => motion_hash.clone(),
        EventBody::CouncilVoted {
            motion_hash, voter, ..
        } => format!("{motion_hash}:{voter}"),
        EventBody::DemocracyProposed { proposal_index, .. } => format!("proposal:{proposal_index}"),
        EventBody::DemocracyStarted { ref_index, .. }
        | EventBody::DemocracyPassed { ref_index }
        | EventBody::DemocracyNotPassed { ref_index }
        | EventBody::DemocracyExecuted { ref_index, .. } => format!("ref:{ref_index}"),
        EventBody::DemocracyVoted {
            ref_index, voter, ..
        } => format!("ref:{ref_index}:{voter}"),
        EventBody::BalanceTransfer { .. } => ev.tx_ref.clone(),
        EventBody::TreasurySpending { .. } => format!("height:{}", ev.height),
    }
}

pub struct GovernanceWorker {
    store: Arc<dyn GovernanceStore>,
    ledger: Arc<dyn Ledger>,
    treasury_account: String,
    retry: RetryPolicy,
}

impl GovernanceWorker {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        ledger: Arc<dyn Ledger>,
        treasury_account: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            treasury_account: treasury_account.into(),
            retry,
        }
    }

    /// Project one event. Projections are applied before the event is
    /// recorded, and each is idempotent, so a crash in between re-applies
    /// harmlessly on the next run.
    pub async fn handle_event(&self, ev: &LedgerEvent) -> Result<HandleOutcome, ReconcileError> {
        if let EventBody::BalanceTransfer { from, .. } = &ev.body {
            if *from != self.treasury_account {
                return Ok(HandleOutcome::Ignored);
            }
        }
        let kind = ev.kind();
        let subject = event_subject(ev);
        if self.store.event_seen(&subject, kind).await? {
            debug!(%subject, kind = kind.as_str(), "governance event already processed");
            return Ok(HandleOutcome::Duplicate);
        }

        self.apply(ev).await?;

        let rec = GovernanceEventRecord {
            subject,
            kind,
            height: ev.height,
            tx_ref: ev.tx_ref.clone(),
            payload: serde_json::to_value(&ev.body).unwrap_or(Value::Null),
        };
        if !self.store.record_event(&rec).await? {
            return Ok(HandleOutcome::Duplicate);
        }
        Ok(HandleOutcome::Applied)
    }

    async fn apply(&self, ev: &LedgerEvent) -> Result<(), ReconcileError> {
        let store = &self.store;
        match &ev.body {
            EventBody::CouncilProposed {
                proposer,
                proposal_index,
                motion_hash,
                threshold,
            } => {
                store
                    .upsert_motion(&CouncilMotion {
                        motion_hash: motion_hash.clone(),
                        proposal_index: *proposal_index,
                        proposer: proposer.clone(),
                        threshold: *threshold,
                        status: MotionStatus::Proposed,
                        yes: 0,
                        no: 0,
                        proposed_height: ev.height,
                    })
                    .await?;
                match store.link_request_to_motion(motion_hash, *proposal_index).await? {
                    Some(id) => info!(request_id = %id, %motion_hash, "treasury request in voting"),
                    None => debug!(%motion_hash, "motion carries no known treasury request"),
                }
            }
            EventBody::CouncilVoted {
                voter,
                motion_hash,
                approve,
                ..
            } => {
                let vote = CouncilVote {
                    motion_hash: motion_hash.clone(),
                    voter: voter.clone(),
                    approve: *approve,
                    height: ev.height,
                };
                if !store.record_vote(&vote).await? {
                    debug!(%motion_hash, %voter, "duplicate council vote");
                }
            }
            EventBody::CouncilClosed {
                motion_hash,
                yes,
                no,
            } => {
                let (motion, request) = if yes > no {
                    (MotionStatus::Approved, RequestStatus::Approved)
                } else {
                    (MotionStatus::Rejected, RequestStatus::Rejected)
                };
                if !store
                    .set_motion_status(motion_hash, motion, Some((*yes, *no)))
                    .await?
                {
                    warn!(%motion_hash, "close for unknown motion");
                }
                if let Some(id) = store
                    .set_request_status_by_motion(motion_hash, &[RequestStatus::InVoting], request)
                    .await?
                {
                    info!(request_id = %id, status = %request, "treasury request decided");
                }
            }
            EventBody::CouncilExecuted {
                motion_hash,
                ok,
                error,
            } => {
                let status = if *ok {
                    MotionStatus::Executed
                } else {
                    MotionStatus::ExecutionFailed
                };
                store.set_motion_status(motion_hash, status, None).await?;
                if *ok {
                    if let Some(id) = store
                        .set_request_status_by_motion(
                            motion_hash,
                            &[RequestStatus::Approved],
                            RequestStatus::PaidOut,
                        )
                        .await?
                    {
                        info!(request_id = %id, %motion_hash, "treasury request paid out");
                    }
                } else {
                    warn!(%motion_hash, error = error.as_deref().unwrap_or("unknown"), "motion execution failed");
                }
            }
            EventBody::DemocracyProposed {
                proposal_index,
                proposer,
                deposit,
            } => {
                store
                    .upsert_proposal(&DemocracyProposal {
                        proposal_index: *proposal_index,
                        proposer: proposer.clone(),
                        deposit: *deposit,
                        height: ev.height,
                    })
                    .await?;
            }
            EventBody::DemocracyStarted {
                ref_index,
                threshold,
                preimage_hash,
            } => {
                let meta = match preimage_hash {
                    Some(h) => self.load_preimage(h).await?,
                    None => None,
                };
                let (title, description, proposer) = match meta {
                    Some(m) => (Some(m.title), Some(m.description), Some(m.proposer)),
                    None => (None, None, None),
                };
                store
                    .upsert_referendum(&Referendum {
                        ref_index: *ref_index,
                        status: ReferendumStatus::Started,
                        threshold: threshold.clone(),
                        preimage_hash: preimage_hash.clone(),
                        title,
                        description,
                        proposer,
                        started_height: ev.height,
                    })
                    .await?;
            }
            EventBody::DemocracyVoted {
                voter,
                ref_index,
                aye,
                balance,
            } => {
                let vote = ReferendumVote {
                    ref_index: *ref_index,
                    voter: voter.clone(),
                    aye: *aye,
                    balance: *balance,
                    height: ev.height,
                };
                if !store.record_referendum_vote(&vote).await? {
                    debug!(ref_index, %voter, "duplicate referendum vote");
                }
            }
            EventBody::DemocracyPassed { ref_index } => {
                self.set_referendum(*ref_index, ReferendumStatus::Passed).await?;
            }
            EventBody::DemocracyNotPassed { ref_index } => {
                self.set_referendum(*ref_index, ReferendumStatus::NotPassed).await?;
            }
            EventBody::DemocracyExecuted { ref_index, ok } => {
                let status = if *ok {
                    ReferendumStatus::Executed
                } else {
                    ReferendumStatus::ExecutionFailed
                };
                self.set_referendum(*ref_index, status).await?;
            }
            EventBody::BalanceTransfer { to, amount, .. } => {
                match store.pay_out_by_transfer(to, *amount, &ev.tx_ref).await? {
                    Some(id) => info!(request_id = %id, tx_ref = %ev.tx_ref, "treasury payout matched"),
                    None => debug!(tx_ref = %ev.tx_ref, "treasury transfer matches no approved request"),
                }
            }
            EventBody::TreasurySpending { budget_remaining } => {
                info!(height = ev.height, %budget_remaining, "treasury spend period");
            }
        }
        Ok(())
    }

    async fn set_referendum(
        &self,
        ref_index: u32,
        status: ReferendumStatus,
    ) -> Result<(), ReconcileError> {
        if !self.store.set_referendum_status(ref_index, status).await? {
            warn!(ref_index, %status, "status for unknown referendum");
        }
        Ok(())
    }

    /// Missing or malformed preimages leave the referendum without metadata.
    async fn load_preimage(&self, hash: &str) -> Result<Option<PreimageMeta>, LedgerError> {
        let Some(raw) = self.ledger.query_storage_value(PREIMAGE_STORAGE, hash).await? else {
            warn!(preimage_hash = hash, "preimage not found");
            return Ok(None);
        };
        match decode_preimage(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(preimage_hash = hash, error = %e, "preimage rejected");
                Ok(None)
            }
        }
    }

    /// Resume after the last recorded event; otherwise `configured`, otherwise
    /// the current head.
    pub async fn start_height(&self, configured: Option<u64>) -> Result<u64, ReconcileError> {
        if let Some(last) = self.store.last_event_height().await? {
            return Ok(last + 1);
        }
        match configured {
            Some(h) => Ok(h),
            None => Ok(self.ledger.current_height().await?),
        }
    }

    /// Follow the event stream forever. A failed event is retried per the
    /// policy, then logged and skipped.
    pub async fn run(self: Arc<Self>, configured_start: Option<u64>, poll: Duration) {
        let from = loop {
            match with_retry(&self.retry, "governance:start", ReconcileError::is_transient, || {
                self.start_height(configured_start)
            })
            .await
            {
                Ok(h) => break h,
                Err(e) => {
                    error!(error = %e, "governance start height unavailable");
                    tokio::time::sleep(poll).await;
                }
            }
        };
        info!(from_height = from, "governance sync started");

        let mut events = subscribe_events(Arc::clone(&self.ledger), &GOVERNANCE_KINDS, from, poll);
        while let Some(ev) = events.next().await {
            let label = format!("governance:{}", ev.kind().as_str());
            let res = with_retry(&self.retry, &label, ReconcileError::is_transient, || {
                self.handle_event(&ev)
            })
            .await;
            if let Err(e) = res {
                error!(height = ev.height, tx_ref = %ev.tx_ref, error = %e, "governance event skipped");
            }
        }
    }
}

pub fn spawn_governance_loop(
    worker: Arc<GovernanceWorker>,
    start_height: Option<u64>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(worker.run(start_height, poll))
}
