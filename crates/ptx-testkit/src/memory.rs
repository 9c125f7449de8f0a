//! In-memory store for tests and paper mode.
//!
//! Implements every store trait with the same contracts as the Postgres
//! store: status compare-and-swap on orders, unique `(order, author)`
//! reviews, capped phase reservations, idempotent governance projection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptx_audit::OrderEventRecord;
use ptx_ledger::EventKind;
use ptx_orders::{OfferStore, OrderStore};
use ptx_phase::{AdvanceOutcome, PhaseStore};
use ptx_reconcile::governance::{
    CouncilMotion, CouncilVote, DemocracyProposal, GovernanceEventRecord, GovernanceStore,
    MotionStatus, Referendum, ReferendumStatus, ReferendumVote, RequestStatus, TreasuryRequest,
};
use ptx_reconcile::{CounterpartTruth, ReputationSource};
use ptx_schemas::{
    AssetKind, MinorUnits, Offer, Order, OrderStatus, PhaseConfig, PhaseReservation,
    ReservationState, Review, SettlementClaim, SettlementLeg,
};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    offers: HashMap<Uuid, Offer>,
    orders: HashMap<Uuid, Order>,
    events: HashMap<Uuid, Vec<OrderEventRecord>>,
    reviews: BTreeMap<(Uuid, String), Review>,
    phases: Vec<PhaseConfig>,
    reservations: HashMap<Uuid, PhaseReservation>,
    settlement_claims: HashMap<(Uuid, SettlementLeg), SettlementClaim>,

    governance_events: Vec<GovernanceEventRecord>,
    seen: HashSet<(String, EventKind)>,
    requests: Vec<TreasuryRequest>,
    motions: HashMap<String, CouncilMotion>,
    council_votes: HashMap<(String, String), CouncilVote>,
    proposals: HashMap<u32, DemocracyProposal>,
    referendums: HashMap<u32, Referendum>,
    referendum_votes: HashMap<(u32, String), ReferendumVote>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- seeding / inspection ---------------------------------------------

    pub fn insert_offer(&self, offer: Offer) {
        self.state().offers.insert(offer.id, offer);
    }

    /// Insert or replace a phase by label; keeps the list in `seq` order.
    pub fn upsert_phase(&self, phase: PhaseConfig) {
        let mut st = self.state();
        st.phases.retain(|p| p.label != phase.label);
        st.phases.push(phase);
        st.phases.sort_by_key(|p| p.seq);
    }

    /// Overwrite a stored order, bypassing the status check.
    pub fn put_order(&self, order: Order) {
        self.state().orders.insert(order.id, order);
    }

    pub fn settlement_claim(&self, order_id: Uuid, leg: SettlementLeg) -> Option<SettlementClaim> {
        self.state().settlement_claims.get(&(order_id, leg)).cloned()
    }

    pub fn reviews(&self) -> Vec<Review> {
        self.state().reviews.values().cloned().collect()
    }

    pub fn governance_events(&self) -> Vec<GovernanceEventRecord> {
        self.state().governance_events.clone()
    }

    pub fn council_votes(&self, motion_hash: &str) -> Vec<CouncilVote> {
        let mut votes: Vec<CouncilVote> = self
            .state()
            .council_votes
            .values()
            .filter(|v| v.motion_hash == motion_hash)
            .cloned()
            .collect();
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        votes
    }

    pub fn proposal(&self, proposal_index: u32) -> Option<DemocracyProposal> {
        self.state().proposals.get(&proposal_index).cloned()
    }

    fn held_in(st: &MemoryState, phase: &str) -> MinorUnits {
        st.reservations
            .values()
            .filter(|r| r.phase == phase && r.state == ReservationState::Held)
            .fold(MinorUnits::ZERO, |acc, r| acc.saturating_add(r.amount))
    }
}

// ---------------------------------------------------------------------------
// orders
// ---------------------------------------------------------------------------

#[async_trait]
impl OfferStore for MemoryStore {
    async fn fetch_offer(&self, id: Uuid) -> Result<Option<Offer>> {
        Ok(self.state().offers.get(&id).cloned())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &Order, event: &OrderEventRecord) -> Result<()> {
        let mut st = self.state();
        if st.orders.contains_key(&order.id) {
            bail!("order {} already exists", order.id);
        }
        st.orders.insert(order.id, order.clone());
        st.events.insert(order.id, vec![event.clone()]);
        Ok(())
    }

    async fn fetch_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state().orders.get(&id).cloned())
    }

    async fn update_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
        event: &OrderEventRecord,
    ) -> Result<bool> {
        let mut st = self.state();
        match st.orders.get(&order.id) {
            Some(cur) if cur.status == expected => {}
            _ => return Ok(false),
        }
        if let Some(tx_ref) = &order.escrow_tx_ref {
            let taken = st
                .orders
                .values()
                .any(|o| o.id != order.id && o.escrow_tx_ref.as_deref() == Some(tx_ref.as_str()));
            if taken {
                bail!("escrow tx_ref {tx_ref} already bound to another order");
            }
        }
        let trail = st.events.entry(order.id).or_default();
        if trail.iter().any(|e| e.seq == event.seq) {
            bail!("order {} already has event seq {}", order.id, event.seq);
        }
        trail.push(event.clone());
        st.orders.insert(order.id, order.clone());
        Ok(true)
    }

    async fn last_event(&self, order_id: Uuid) -> Result<Option<OrderEventRecord>> {
        Ok(self
            .state()
            .events
            .get(&order_id)
            .and_then(|t| t.last().cloned()))
    }

    async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEventRecord>> {
        Ok(self.state().events.get(&order_id).cloned().unwrap_or_default())
    }

    async fn escrow_ref_in_use(&self, tx_ref: &str) -> Result<bool> {
        Ok(self
            .state()
            .orders
            .values()
            .any(|o| o.escrow_tx_ref.as_deref() == Some(tx_ref)))
    }

    async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        statuses: &[OrderStatus],
        limit: i64,
    ) -> Result<Vec<Order>> {
        let mut due: Vec<Order> = self
            .state()
            .orders
            .values()
            .filter(|o| statuses.contains(&o.status) && o.expires_at < now)
            .cloned()
            .collect();
        due.sort_by_key(|o| o.expires_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn insert_review(&self, review: &Review) -> Result<bool> {
        let mut st = self.state();
        let key = (review.order_id, review.author_id.clone());
        if st.reviews.contains_key(&key) {
            return Ok(false);
        }
        st.reviews.insert(key, review.clone());
        Ok(true)
    }

    async fn claim_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<SettlementClaim>> {
        let mut st = self.state();
        let attempt = match st.settlement_claims.get(&(order_id, leg)) {
            Some(live) if live.claimed_until > now => return Ok(None),
            Some(expired) => expired.attempt + 1,
            None => 1,
        };
        let claim = SettlementClaim {
            order_id,
            leg,
            memo: leg.memo(order_id),
            holder: holder.to_string(),
            attempt,
            claimed_until: lease_until,
        };
        st.settlement_claims.insert((order_id, leg), claim.clone());
        Ok(Some(claim))
    }

    async fn release_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(claim) = self.state().settlement_claims.get_mut(&(order_id, leg)) {
            if claim.holder == holder {
                claim.claimed_until = now;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// phases
// ---------------------------------------------------------------------------

#[async_trait]
impl PhaseStore for MemoryStore {
    async fn phases(&self) -> Result<Vec<PhaseConfig>> {
        Ok(self.state().phases.clone())
    }

    async fn active_phase(&self) -> Result<Option<PhaseConfig>> {
        Ok(self.state().phases.iter().find(|p| p.active).cloned())
    }

    async fn held_total(&self, phase: &str) -> Result<MinorUnits> {
        Ok(Self::held_in(&self.state(), phase))
    }

    async fn try_reserve(&self, r: &PhaseReservation, limit: MinorUnits) -> Result<bool> {
        let mut st = self.state();
        if !st.phases.iter().any(|p| p.active && p.label == r.phase) {
            return Ok(false);
        }
        if st.reservations.contains_key(&r.order_id) {
            bail!("order {} already has a reservation", r.order_id);
        }
        let fits = Self::held_in(&st, &r.phase)
            .checked_add(r.amount)
            .is_some_and(|total| total <= limit);
        if !fits {
            return Ok(false);
        }
        let mut held = r.clone();
        held.state = ReservationState::Held;
        st.reservations.insert(r.order_id, held);
        Ok(true)
    }

    async fn reservation(&self, order_id: Uuid) -> Result<Option<PhaseReservation>> {
        Ok(self.state().reservations.get(&order_id).cloned())
    }

    async fn finish_reservation(&self, order_id: Uuid, to: ReservationState) -> Result<bool> {
        if to == ReservationState::Held {
            bail!("finish_reservation: target must not be HELD");
        }
        let mut st = self.state();
        match st.reservations.get_mut(&order_id) {
            Some(r) if r.state == ReservationState::Held => {
                r.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance(&self, height: Option<u64>) -> Result<AdvanceOutcome> {
        let mut st = self.state();
        let current = st.phases.iter().position(|p| p.active);
        let next = match current {
            Some(i) => {
                let seq = st.phases[i].seq;
                st.phases.iter().position(|p| p.seq > seq)
            }
            None => st.phases.iter().position(|p| p.end_height.is_none()),
        };
        let Some(next) = next else {
            return Ok(AdvanceOutcome::NoNext);
        };

        let from = current.map(|i| {
            let cur = &mut st.phases[i];
            cur.active = false;
            cur.end_height = height;
            cur.label.clone()
        });
        let to = &mut st.phases[next];
        to.active = true;
        to.start_height = height;
        Ok(AdvanceOutcome::Advanced {
            from,
            to: to.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// reputation truth
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    trades: u64,
    volume: MinorUnits,
    account: Option<(DateTime<Utc>, String)>,
}

impl MemoryStore {
    fn truths(&self, only: Option<&str>) -> Result<Vec<CounterpartTruth>> {
        let st = self.state();
        let mut by_user: BTreeMap<String, Tally> = BTreeMap::new();

        for o in st.orders.values().filter(|o| o.status == OrderStatus::Released) {
            let volume = match o.asset {
                AssetKind::Native => o.amount_minor()?,
                AssetKind::Secondary => MinorUnits::ZERO,
            };
            let released_at = o.released_at.unwrap_or(o.updated_at);
            for (user, account) in [
                (&o.maker_id, &o.maker_account),
                (&o.taker_id, &o.taker_account),
            ] {
                if only.is_some_and(|u| u != user.as_str()) {
                    continue;
                }
                let t = by_user.entry(user.clone()).or_default();
                t.trades += 1;
                t.volume = t
                    .volume
                    .checked_add(volume)
                    .ok_or_else(|| anyhow!("volume overflow for {user}"))?;
                if !account.trim().is_empty()
                    && t.account.as_ref().map_or(true, |(at, _)| released_at > *at)
                {
                    t.account = Some((released_at, account.clone()));
                }
            }
        }

        let mut out = Vec::with_capacity(by_user.len());
        for (user_id, t) in by_user {
            let stars: Vec<u8> = st
                .reviews
                .values()
                .filter(|r| r.target_id == user_id)
                .map(|r| r.stars)
                .collect();
            let rating_count = stars.len() as u64;
            let rating_avg = if rating_count == 0 {
                Decimal::ZERO
            } else {
                let sum: u64 = stars.iter().map(|s| u64::from(*s)).sum();
                (Decimal::from(sum) / Decimal::from(rating_count)).round_dp(6)
            };
            out.push(CounterpartTruth {
                user_id,
                account: t.account.map(|(_, a)| a),
                released_trades: t.trades,
                volume: t.volume,
                rating_avg,
                rating_count,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ReputationSource for MemoryStore {
    async fn counterparts(&self) -> Result<Vec<CounterpartTruth>> {
        self.truths(None)
    }

    async fn counterpart(&self, user_id: &str) -> Result<Option<CounterpartTruth>> {
        Ok(self.truths(Some(user_id))?.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// governance
// ---------------------------------------------------------------------------

#[async_trait]
impl GovernanceStore for MemoryStore {
    async fn event_seen(&self, subject: &str, kind: EventKind) -> Result<bool> {
        Ok(self.state().seen.contains(&(subject.to_string(), kind)))
    }

    async fn record_event(&self, rec: &GovernanceEventRecord) -> Result<bool> {
        let mut st = self.state();
        if !st.seen.insert((rec.subject.clone(), rec.kind)) {
            return Ok(false);
        }
        st.governance_events.push(rec.clone());
        Ok(true)
    }

    async fn last_event_height(&self) -> Result<Option<u64>> {
        Ok(self.state().governance_events.iter().map(|e| e.height).max())
    }

    async fn insert_request(&self, req: &TreasuryRequest) -> Result<()> {
        let mut st = self.state();
        if st.requests.iter().any(|r| r.id == req.id) {
            bail!("treasury request {} already exists", req.id);
        }
        st.requests.push(req.clone());
        Ok(())
    }

    async fn fetch_request(&self, id: Uuid) -> Result<Option<TreasuryRequest>> {
        Ok(self.state().requests.iter().find(|r| r.id == id).cloned())
    }

    async fn upsert_motion(&self, motion: &CouncilMotion) -> Result<()> {
        self.state()
            .motions
            .entry(motion.motion_hash.clone())
            .or_insert_with(|| motion.clone());
        Ok(())
    }

    async fn fetch_motion(&self, motion_hash: &str) -> Result<Option<CouncilMotion>> {
        Ok(self.state().motions.get(motion_hash).cloned())
    }

    async fn set_motion_status(
        &self,
        motion_hash: &str,
        status: MotionStatus,
        tally: Option<(u32, u32)>,
    ) -> Result<bool> {
        let mut st = self.state();
        let Some(m) = st.motions.get_mut(motion_hash) else {
            return Ok(false);
        };
        m.status = status;
        if let Some((yes, no)) = tally {
            m.yes = yes;
            m.no = no;
        }
        Ok(true)
    }

    async fn record_vote(&self, vote: &CouncilVote) -> Result<bool> {
        let mut st = self.state();
        let key = (vote.motion_hash.clone(), vote.voter.clone());
        if st.council_votes.contains_key(&key) {
            return Ok(false);
        }
        st.council_votes.insert(key, vote.clone());
        Ok(true)
    }

    async fn link_request_to_motion(
        &self,
        motion_hash: &str,
        proposal_index: u32,
    ) -> Result<Option<Uuid>> {
        let mut st = self.state();
        let req = st
            .requests
            .iter_mut()
            .filter(|r| r.content_hash == motion_hash && r.status == RequestStatus::Submitted)
            .min_by_key(|r| r.created_at);
        Ok(req.map(|r| {
            r.status = RequestStatus::InVoting;
            r.motion_hash = Some(motion_hash.to_string());
            r.proposal_index = Some(proposal_index);
            r.updated_at = Utc::now();
            r.id
        }))
    }

    async fn set_request_status_by_motion(
        &self,
        motion_hash: &str,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<Option<Uuid>> {
        let mut st = self.state();
        let req = st
            .requests
            .iter_mut()
            .find(|r| r.motion_hash.as_deref() == Some(motion_hash) && from.contains(&r.status));
        Ok(req.map(|r| {
            r.status = to;
            r.updated_at = Utc::now();
            r.id
        }))
    }

    async fn pay_out_by_transfer(
        &self,
        beneficiary: &str,
        amount: MinorUnits,
        tx_ref: &str,
    ) -> Result<Option<Uuid>> {
        let mut st = self.state();
        if let Some(paid) = st
            .requests
            .iter()
            .find(|r| r.paid_tx_ref.as_deref() == Some(tx_ref))
        {
            return Ok(Some(paid.id));
        }
        let req = st
            .requests
            .iter_mut()
            .filter(|r| {
                r.beneficiary == beneficiary
                    && r.amount == amount
                    && r.status == RequestStatus::Approved
            })
            .min_by_key(|r| r.created_at);
        Ok(req.map(|r| {
            r.status = RequestStatus::PaidOut;
            r.paid_tx_ref = Some(tx_ref.to_string());
            r.updated_at = Utc::now();
            r.id
        }))
    }

    async fn upsert_proposal(&self, proposal: &DemocracyProposal) -> Result<()> {
        self.state()
            .proposals
            .entry(proposal.proposal_index)
            .or_insert_with(|| proposal.clone());
        Ok(())
    }

    async fn upsert_referendum(&self, referendum: &Referendum) -> Result<()> {
        let mut st = self.state();
        match st.referendums.get_mut(&referendum.ref_index) {
            None => {
                st.referendums.insert(referendum.ref_index, referendum.clone());
            }
            Some(cur) => {
                cur.threshold = referendum.threshold.clone();
                if referendum.preimage_hash.is_some() {
                    cur.preimage_hash = referendum.preimage_hash.clone();
                }
                if referendum.title.is_some() {
                    cur.title = referendum.title.clone();
                }
                if referendum.description.is_some() {
                    cur.description = referendum.description.clone();
                }
                if referendum.proposer.is_some() {
                    cur.proposer = referendum.proposer.clone();
                }
            }
        }
        Ok(())
    }

    async fn fetch_referendum(&self, ref_index: u32) -> Result<Option<Referendum>> {
        Ok(self.state().referendums.get(&ref_index).cloned())
    }

    async fn set_referendum_status(&self, ref_index: u32, status: ReferendumStatus) -> Result<bool> {
        let mut st = self.state();
        let Some(r) = st.referendums.get_mut(&ref_index) else {
            return Ok(false);
        };
        if r.status.rank() < status.rank() {
            r.status = status;
        }
        Ok(true)
    }

    async fn record_referendum_vote(&self, vote: &ReferendumVote) -> Result<bool> {
        let mut st = self.state();
        let key = (vote.ref_index, vote.voter.clone());
        if st.referendum_votes.contains_key(&key) {
            return Ok(false);
        }
        st.referendum_votes.insert(key, vote.clone());
        Ok(true)
    }

    async fn referendum_tally(&self, ref_index: u32) -> Result<(MinorUnits, MinorUnits)> {
        let st = self.state();
        let mut ayes = MinorUnits::ZERO;
        let mut nays = MinorUnits::ZERO;
        for v in st.referendum_votes.values().filter(|v| v.ref_index == ref_index) {
            if v.aye {
                ayes = ayes.saturating_add(v.balance);
            } else {
                nays = nays.saturating_add(v.balance);
            }
        }
        Ok((ayes, nays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(label: &str, seq: i32) -> PhaseConfig {
        PhaseConfig {
            label: label.into(),
            seq,
            price_per_unit: Decimal::ONE,
            supply_cap: MinorUnits::from_units(10),
            active: false,
            start_height: None,
            end_height: None,
        }
    }

    #[tokio::test]
    async fn advance_walks_phases_in_seq_order() {
        let store = MemoryStore::new();
        store.upsert_phase(phase("b", 2));
        store.upsert_phase(phase("a", 1));

        match store.advance(Some(5)).await.unwrap() {
            AdvanceOutcome::Advanced { from, to } => {
                assert_eq!(from, None);
                assert_eq!(to.label, "a");
                assert_eq!(to.start_height, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        store.advance(Some(9)).await.unwrap();
        let phases = store.phases().await.unwrap();
        assert_eq!(phases[0].end_height, Some(9));
        assert!(phases[1].active);
        assert_eq!(store.advance(None).await.unwrap(), AdvanceOutcome::NoNext);
    }

    #[tokio::test]
    async fn reservations_respect_limit_and_finish_once() {
        let store = MemoryStore::new();
        let mut p = phase("a", 1);
        p.active = true;
        store.upsert_phase(p);

        let r = |amount: u64| PhaseReservation {
            order_id: Uuid::new_v4(),
            phase: "a".into(),
            amount: MinorUnits::from_units(amount),
            state: ReservationState::Held,
        };
        let first = r(6);
        let limit = MinorUnits::from_units(10);
        assert!(store.try_reserve(&first, limit).await.unwrap());
        assert!(!store.try_reserve(&r(5), limit).await.unwrap());
        assert!(store.try_reserve(&r(4), limit).await.unwrap());

        assert!(store
            .finish_reservation(first.order_id, ReservationState::Released)
            .await
            .unwrap());
        assert!(!store
            .finish_reservation(first.order_id, ReservationState::Settled)
            .await
            .unwrap());
        assert_eq!(store.held_total("a").await.unwrap(), MinorUnits::from_units(4));
    }
}
