use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ptx_audit::{EventChain, OrderEventRecord, SYSTEM_AUTHOR};
use ptx_escrow::{EscrowError, EscrowFunding, EscrowService};
use ptx_phase::PhaseController;
use ptx_schemas::{
    round_asset, round_fiat, AssetKind, MinorUnits, Offer, Order, OrderStatus, Review,
    SettlementClaim, SettlementLeg,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{CODE_ESCROW_PENDING, CODE_INVALID_STATE};
use crate::inflight::{InFlight, InFlightGuard};
use crate::state_machine::{describe_sources, next_status, Actor, Transition};
use crate::{OfferStore, OrderError, OrderStore, ReleaseHook};

const MAX_PROOF_REFS: usize = 10;
const MAX_COMMENT_LEN: usize = 1_000;
const MAX_REASON_LEN: usize = 2_000;
const EXPIRY_BATCH: i64 = 500;
/// Open statuses with the asset leg in custody.
const FUNDED_OPEN: [OrderStatus; 3] = [
    OrderStatus::AwaitingFiatPayment,
    OrderStatus::AwaitingConfirmation,
    OrderStatus::DisputeOpen,
];

/// Size of the requested trade, in whichever leg the taker chose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "leg", content = "value", rename_all = "snake_case")]
pub enum OrderAmount {
    Fiat(Decimal),
    Asset(Decimal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub offer_id: Uuid,
    pub taker_account: String,
    pub amount: OrderAmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderServiceConfig {
    pub order_ttl: Duration,
    pub secondary_asset_id: u32,
    /// Lifetime of a settlement claim. An instance that dies mid-transfer
    /// blocks that leg for this long.
    pub settlement_lease: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySweep {
    pub expired: Vec<Uuid>,
    /// Claimed by a concurrent transition or moved on before the write.
    pub skipped: Vec<Uuid>,
    /// Past their deadline with funds in custody. Left as they are and
    /// reported on every sweep until someone settles or resolves them.
    #[serde(default)]
    pub stranded: Vec<StrandedOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandedOrder {
    pub id: Uuid,
    pub status: OrderStatus,
    pub expires_at: DateTime<Utc>,
    pub escrow_tx_ref: Option<String>,
}

/// Authoritative lifecycle of a trade.
///
/// Every operation checks caller authorization first, then the status
/// precondition, then does its ledger work, and finally writes the new state
/// with a compare-and-swap on the status it started from. A ledger failure
/// leaves the stored order untouched.
///
/// Ledger transfers the service signs run under a persisted settlement
/// claim and carry a per-leg memo. A retry after a failed write finds the
/// transfer already on the ledger and only redoes the write.
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    offers: Arc<dyn OfferStore>,
    escrow: Arc<EscrowService>,
    phases: Arc<PhaseController>,
    release_hook: Option<Arc<dyn ReleaseHook>>,
    cfg: OrderServiceConfig,
    inflight: InFlight,
    /// Identifies this instance on settlement claims.
    holder: String,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        offers: Arc<dyn OfferStore>,
        escrow: Arc<EscrowService>,
        phases: Arc<PhaseController>,
        cfg: OrderServiceConfig,
    ) -> Self {
        Self {
            orders,
            offers,
            escrow,
            phases,
            release_hook: None,
            cfg,
            inflight: InFlight::default(),
            holder: format!("orders-{}", Uuid::new_v4()),
        }
    }

    pub fn with_release_hook(mut self, hook: Arc<dyn ReleaseHook>) -> Self {
        self.release_hook = Some(hook);
        self
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    pub async fn create_order(&self, caller: &str, req: CreateOrder) -> Result<Order, OrderError> {
        let offer = self
            .offers
            .fetch_offer(req.offer_id)
            .await?
            .ok_or(OrderError::OfferNotFound(req.offer_id))?;

        if !offer.active {
            return Err(OrderError::validation("offer is not active"));
        }
        if caller == offer.maker_id {
            return Err(OrderError::validation("cannot take your own offer"));
        }
        if req.taker_account.trim().is_empty() {
            return Err(OrderError::validation("taker_account is required"));
        }

        let id = Uuid::new_v4();

        // Secondary-asset orders are priced and supply-gated by the active phase.
        let (price, asset_id, phase_label) = match offer.asset {
            AssetKind::Native => (offer.price_per_unit, None, None),
            AssetKind::Secondary => {
                let active = self
                    .phases
                    .get_active_phase()
                    .await?
                    .ok_or(ptx_phase::PhaseError::PhaseInactive)?;
                (
                    active.price_per_unit,
                    Some(self.cfg.secondary_asset_id),
                    Some(active.label),
                )
            }
        };

        let (amount_asset, amount_fiat) = size_order(&offer, price, req.amount)?;
        let minor = MinorUnits::from_decimal(amount_asset)
            .map_err(|e| OrderError::validation(e.to_string()))?;

        let reserved = if offer.asset == AssetKind::Secondary {
            let (active, _r) = self.phases.reserve(id, minor).await?;
            if Some(&active.label) != phase_label.as_ref() {
                // Phase advanced between pricing and reservation.
                self.phases.release_reservation(id).await?;
                return Err(OrderError::validation("sale phase changed, retry"));
            }
            true
        } else {
            false
        };

        let now = Utc::now();
        let order = Order {
            id,
            offer_id: offer.id,
            maker_id: offer.maker_id.clone(),
            taker_id: caller.to_string(),
            maker_account: offer.maker_account.clone(),
            taker_account: req.taker_account.trim().to_string(),
            asset: offer.asset,
            asset_id,
            amount_asset,
            amount_fiat,
            price_per_unit: price,
            phase: phase_label,
            side: offer.side,
            status: next_status(OrderStatus::Draft, Transition::Create)
                .map_err(|e| OrderError::validation(e.to_string()))?,
            escrow_tx_ref: None,
            escrow_at: None,
            payer_declared_at: None,
            proof_refs: Vec::new(),
            released_tx_ref: None,
            released_at: None,
            expires_at: now + self.cfg.order_ttl,
            created_at: now,
            updated_at: now,
        };

        let payload = json!({
            "asset": order.asset.as_str(),
            "side": order.side.as_str(),
            "amount_asset": order.amount_asset.to_string(),
            "amount_fiat": order.amount_fiat.to_string(),
            "price_per_unit": order.price_per_unit.to_string(),
            "phase": order.phase,
        });
        let event = EventChain::new(id).append(
            Transition::Create.event_kind(),
            caller,
            None,
            payload,
            now,
        )?;

        if let Err(e) = self.orders.insert_order(&order, &event).await {
            if reserved {
                if let Err(re) = self.phases.release_reservation(id).await {
                    error!(order_id = %id, error = %re, "failed to return reservation after insert failure");
                }
            }
            return Err(e.into());
        }

        info!(
            order_id = %id,
            offer_id = %offer.id,
            asset = order.asset.as_str(),
            amount_asset = %order.amount_asset,
            amount_fiat = %order.amount_fiat,
            "order created"
        );
        Ok(order)
    }

    // -----------------------------------------------------------------------
    // transitions
    // -----------------------------------------------------------------------

    pub async fn confirm_escrow(
        &self,
        id: Uuid,
        caller: &str,
        funding: EscrowFunding,
    ) -> Result<Order, OrderError> {
        let _claim = self.claim(id)?;
        let order = self.load_for(id, caller, Transition::ConfirmEscrow).await?;
        let target = require(&order, Transition::ConfirmEscrow)?;

        match &funding {
            // Only verified; nothing is signed.
            EscrowFunding::Deposit { tx_ref } => {
                if self.orders.escrow_ref_in_use(tx_ref).await? {
                    return Err(OrderError::validation(format!(
                        "deposit {tx_ref} is already bound to an order"
                    )));
                }
                self.lock_and_commit(&order, target, caller, &funding).await
            }
            EscrowFunding::Allowance | EscrowFunding::Direct => {
                self.claim_settlement(id, SettlementLeg::Lock).await?;
                let res = self.lock_and_commit(&order, target, caller, &funding).await;
                self.end_settlement(id, SettlementLeg::Lock, &res).await;
                res
            }
        }
    }

    async fn lock_and_commit(
        &self,
        order: &Order,
        target: OrderStatus,
        caller: &str,
        funding: &EscrowFunding,
    ) -> Result<Order, OrderError> {
        let receipt = self
            .escrow
            .lock(order, order.escrower_account(), funding)
            .await?;

        let now = Utc::now();
        let mut next = order.clone();
        next.status = target;
        next.escrow_tx_ref = Some(receipt.tx_ref.clone());
        next.escrow_at = Some(now);
        next.updated_at = now;

        let payload = json!({
            "amount_minor": receipt.amount,
            "height": receipt.height,
            "funding": funding,
        });
        match self
            .commit(
                order,
                next,
                Transition::ConfirmEscrow,
                caller,
                Some(&receipt.tx_ref),
                payload,
            )
            .await
        {
            Ok(o) => Ok(o),
            Err(e) => {
                error!(order_id = %order.id, tx_ref = %receipt.tx_ref, error = %e, "escrow locked but order update failed");
                Err(e)
            }
        }
    }

    pub async fn mark_paid(
        &self,
        id: Uuid,
        caller: &str,
        proof_refs: Vec<String>,
    ) -> Result<Order, OrderError> {
        let _claim = self.claim(id)?;
        let order = self.load_for(id, caller, Transition::MarkPaid).await?;

        if order.status == OrderStatus::AwaitingEscrow {
            return Err(OrderError::InvalidState {
                expected: describe_sources(Transition::MarkPaid),
                actual: order.status,
                code: CODE_ESCROW_PENDING,
            });
        }
        let target = require(&order, Transition::MarkPaid)?;

        let proof_refs: Vec<String> = proof_refs
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if proof_refs.len() > MAX_PROOF_REFS {
            return Err(OrderError::validation(format!(
                "at most {MAX_PROOF_REFS} proof refs"
            )));
        }

        let now = Utc::now();
        let mut next = order.clone();
        next.status = target;
        next.proof_refs = proof_refs.clone();
        next.payer_declared_at = Some(now);
        next.updated_at = now;

        self.commit(
            &order,
            next,
            Transition::MarkPaid,
            caller,
            None,
            json!({ "proof_refs": proof_refs }),
        )
        .await
    }

    pub async fn confirm_received(&self, id: Uuid, caller: &str) -> Result<Order, OrderError> {
        let _claim = self.claim(id)?;
        let order = self.load_for(id, caller, Transition::ConfirmReceived).await?;
        let target = require(&order, Transition::ConfirmReceived)?;

        self.claim_settlement(id, SettlementLeg::Release).await?;
        let res = self.release_and_commit(&order, target, caller).await;
        self.end_settlement(id, SettlementLeg::Release, &res).await;
        let released = res?;

        if released.asset == AssetKind::Secondary {
            if let Err(e) = self.phases.settle_reservation(id).await {
                warn!(order_id = %id, error = %e, "phase reservation not settled");
            }
        }
        if let Some(hook) = &self.release_hook {
            hook.order_released(&released);
        }
        Ok(released)
    }

    async fn release_and_commit(
        &self,
        order: &Order,
        target: OrderStatus,
        caller: &str,
    ) -> Result<Order, OrderError> {
        let receipt = self.escrow.release(order, order.payer_account()).await?;

        let now = Utc::now();
        let mut next = order.clone();
        next.status = target;
        next.released_tx_ref = Some(receipt.tx_ref.clone());
        next.released_at = Some(now);
        next.updated_at = now;

        let payload = json!({ "amount_minor": receipt.amount, "height": receipt.height });
        match self
            .commit(
                order,
                next,
                Transition::ConfirmReceived,
                caller,
                Some(&receipt.tx_ref),
                payload,
            )
            .await
        {
            Ok(o) => Ok(o),
            Err(e) => {
                error!(order_id = %order.id, tx_ref = %receipt.tx_ref, error = %e, "escrow released but order update failed");
                Err(e)
            }
        }
    }

    pub async fn cancel_order(&self, id: Uuid, caller: &str) -> Result<Order, OrderError> {
        let _claim = self.claim(id)?;
        let order = self.load_for(id, caller, Transition::Cancel).await?;
        let target = require(&order, Transition::Cancel)?;

        let now = Utc::now();
        let mut next = order.clone();
        next.status = target;
        next.updated_at = now;

        let cancelled = self
            .commit(&order, next, Transition::Cancel, caller, None, json!({}))
            .await?;
        self.return_reservation(&cancelled).await;
        Ok(cancelled)
    }

    pub async fn open_dispute(
        &self,
        id: Uuid,
        caller: &str,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let _claim = self.claim(id)?;
        let order = self.load_for(id, caller, Transition::OpenDispute).await?;
        let target = require(&order, Transition::OpenDispute)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OrderError::validation("dispute reason is required"));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(OrderError::validation("dispute reason too long"));
        }

        let mut next = order.clone();
        next.status = target;
        next.updated_at = Utc::now();

        let disputed = self
            .commit(
                &order,
                next,
                Transition::OpenDispute,
                caller,
                None,
                json!({ "reason": reason }),
            )
            .await?;
        warn!(order_id = %id, by = caller, "dispute opened");
        Ok(disputed)
    }

    /// Expire overdue orders that never reached custody. Overdue orders with
    /// funds in escrow are left for dispute handling and listed in
    /// [`ExpirySweep::stranded`].
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<ExpirySweep, OrderError> {
        let overdue = self
            .orders
            .overdue_orders(
                now,
                &[OrderStatus::Draft, OrderStatus::AwaitingEscrow],
                EXPIRY_BATCH,
            )
            .await?;

        let mut sweep = ExpirySweep::default();
        for order in overdue {
            let Some(_claim) = self.inflight.try_claim(order.id) else {
                sweep.skipped.push(order.id);
                continue;
            };
            let Ok(target) = next_status(order.status, Transition::Expire) else {
                sweep.skipped.push(order.id);
                continue;
            };

            let mut next = order.clone();
            next.status = target;
            next.updated_at = now;

            let payload = json!({ "expires_at": order.expires_at });
            match self
                .commit(&order, next, Transition::Expire, SYSTEM_AUTHOR, None, payload)
                .await
            {
                Ok(expired) => {
                    self.return_reservation(&expired).await;
                    sweep.expired.push(order.id);
                }
                Err(OrderError::InvalidState { .. }) => sweep.skipped.push(order.id),
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "expiry failed");
                    sweep.skipped.push(order.id);
                }
            }
        }

        sweep.stranded = self
            .orders
            .overdue_orders(now, &FUNDED_OPEN, EXPIRY_BATCH)
            .await?
            .into_iter()
            .map(|o| StrandedOrder {
                id: o.id,
                status: o.status,
                expires_at: o.expires_at,
                escrow_tx_ref: o.escrow_tx_ref,
            })
            .collect();

        if !sweep.expired.is_empty() {
            info!(expired = sweep.expired.len(), skipped = sweep.skipped.len(), "expiry sweep");
        }
        if let Some(oldest) = sweep.stranded.first() {
            warn!(
                stranded = sweep.stranded.len(),
                oldest_order_id = %oldest.id,
                oldest_status = oldest.status.as_str(),
                oldest_expires_at = %oldest.expires_at,
                "overdue orders with funds in escrow need operator action"
            );
        }
        Ok(sweep)
    }

    // -----------------------------------------------------------------------
    // reads
    // -----------------------------------------------------------------------

    pub async fn get_order(&self, id: Uuid, caller: &str) -> Result<Order, OrderError> {
        let order = self.fetch(id).await?;
        if order.party_of(caller).is_none() {
            return Err(forbidden(caller, Actor::EitherParty));
        }
        Ok(order)
    }

    pub async fn get_order_events(
        &self,
        id: Uuid,
        caller: &str,
    ) -> Result<Vec<OrderEventRecord>, OrderError> {
        self.get_order(id, caller).await?;
        Ok(self.orders.events(id).await?)
    }

    // -----------------------------------------------------------------------
    // reviews
    // -----------------------------------------------------------------------

    pub async fn submit_review(
        &self,
        id: Uuid,
        caller: &str,
        stars: u8,
        comment: Option<String>,
    ) -> Result<Review, OrderError> {
        let order = self.fetch(id).await?;
        let party = order
            .party_of(caller)
            .ok_or_else(|| forbidden(caller, Actor::EitherParty))?;

        if order.status != OrderStatus::Released {
            return Err(OrderError::InvalidState {
                expected: OrderStatus::Released.as_str().to_string(),
                actual: order.status,
                code: CODE_INVALID_STATE,
            });
        }
        if !(1..=5).contains(&stars) {
            return Err(OrderError::validation("stars must be between 1 and 5"));
        }
        let comment = comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if comment.as_ref().is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
            return Err(OrderError::validation("comment too long"));
        }

        let review = Review {
            order_id: id,
            author_id: caller.to_string(),
            target_id: order.party_id(party.counterparty()).to_string(),
            stars,
            comment,
            created_at: Utc::now(),
        };
        if !self.orders.insert_review(&review).await? {
            return Err(OrderError::validation("order already reviewed by caller"));
        }
        info!(order_id = %id, author = caller, stars, "review recorded");
        Ok(review)
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    fn claim(&self, id: Uuid) -> Result<InFlightGuard<'_>, OrderError> {
        self.inflight.try_claim(id).ok_or(OrderError::Busy(id))
    }

    /// Persist this instance's intent to sign `leg` of order `id`. Another
    /// live claim means the transfer may be in flight elsewhere.
    async fn claim_settlement(
        &self,
        id: Uuid,
        leg: SettlementLeg,
    ) -> Result<SettlementClaim, OrderError> {
        let now = Utc::now();
        let claimed = self
            .orders
            .claim_settlement(id, leg, &self.holder, now, now + self.cfg.settlement_lease)
            .await?;
        match claimed {
            Some(claim) => {
                if claim.attempt > 1 {
                    warn!(order_id = %id, leg = leg.as_str(), attempt = claim.attempt, memo = %claim.memo, "settlement retried after earlier attempt");
                }
                Ok(claim)
            }
            None => {
                warn!(order_id = %id, leg = leg.as_str(), "settlement claim held by another attempt");
                Err(OrderError::Busy(id))
            }
        }
    }

    /// Drop the claim unless the ledger outcome is unknown; then it is held
    /// until the lease runs out.
    async fn end_settlement(
        &self,
        id: Uuid,
        leg: SettlementLeg,
        res: &Result<Order, OrderError>,
    ) {
        if let Err(OrderError::Escrow(EscrowError::Ledger(e))) = res {
            if e.is_transient() {
                warn!(order_id = %id, leg = leg.as_str(), error = %e, "settlement outcome unknown; claim held until lease expiry");
                return;
            }
        }
        if let Err(e) = self
            .orders
            .release_settlement(id, leg, &self.holder, Utc::now())
            .await
        {
            warn!(order_id = %id, leg = leg.as_str(), error = %e, "settlement claim not released");
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Order, OrderError> {
        self.orders
            .fetch_order(id)
            .await?
            .ok_or(OrderError::NotFound(id))
    }

    /// Fetch and authorize. Authorization never depends on status.
    async fn load_for(&self, id: Uuid, caller: &str, t: Transition) -> Result<Order, OrderError> {
        let order = self.fetch(id).await?;
        let actor = t.actor();
        let allowed = match actor {
            Actor::Escrower => caller == order.escrower_id(),
            Actor::Payer => caller == order.payer_id(),
            Actor::EitherParty => order.party_of(caller).is_some(),
            Actor::System | Actor::Operator => false,
        };
        if !allowed {
            warn!(order_id = %id, caller, transition = t.as_str(), "forbidden order transition");
            return Err(forbidden(caller, actor));
        }
        Ok(order)
    }

    /// Append the audit event and CAS the row from `before.status`. A miss
    /// re-reads the row and reports what it found.
    async fn commit(
        &self,
        before: &Order,
        next: Order,
        t: Transition,
        triggered_by: &str,
        tx_ref: Option<&str>,
        payload: Value,
    ) -> Result<Order, OrderError> {
        let last = self.orders.last_event(before.id).await?;
        let event = EventChain::resume(before.id, last.as_ref()).append(
            t.event_kind(),
            triggered_by,
            tx_ref,
            payload,
            next.updated_at,
        )?;

        if !self
            .orders
            .update_if_status(&next, before.status, &event)
            .await?
        {
            let actual = self
                .orders
                .fetch_order(before.id)
                .await?
                .map(|o| o.status)
                .unwrap_or(before.status);
            return Err(OrderError::InvalidState {
                expected: before.status.as_str().to_string(),
                actual,
                code: CODE_INVALID_STATE,
            });
        }

        info!(
            order_id = %next.id,
            from = before.status.as_str(),
            to = next.status.as_str(),
            by = triggered_by,
            "order transition"
        );
        Ok(next)
    }

    async fn return_reservation(&self, order: &Order) {
        if order.asset != AssetKind::Secondary {
            return;
        }
        if let Err(e) = self.phases.release_reservation(order.id).await {
            warn!(order_id = %order.id, error = %e, "phase reservation not returned");
        }
    }
}

fn forbidden(caller: &str, actor: Actor) -> OrderError {
    OrderError::Forbidden {
        caller: caller.to_string(),
        required: actor.as_str(),
    }
}

fn require(order: &Order, t: Transition) -> Result<OrderStatus, OrderError> {
    next_status(order.status, t).map_err(|_| OrderError::InvalidState {
        expected: describe_sources(t),
        actual: order.status,
        code: CODE_INVALID_STATE,
    })
}

/// `(amount_asset, amount_fiat)` for a request against `offer` at `price`.
fn size_order(
    offer: &Offer,
    price: Decimal,
    amount: OrderAmount,
) -> Result<(Decimal, Decimal), OrderError> {
    if price <= Decimal::ZERO {
        return Err(OrderError::validation("offer has no usable price"));
    }

    let (asset, fiat) = match amount {
        OrderAmount::Fiat(fiat) => {
            let fiat = round_fiat(fiat);
            let asset = fiat
                .checked_div(price)
                .map(round_asset)
                .ok_or_else(|| OrderError::validation("amount out of range"))?;
            (asset, fiat)
        }
        OrderAmount::Asset(asset) => {
            if asset.normalize().scale() > ptx_schemas::MINOR_SCALE {
                return Err(OrderError::validation(
                    "asset amount has more than 12 fractional digits",
                ));
            }
            let fiat = asset
                .checked_mul(price)
                .map(round_fiat)
                .ok_or_else(|| OrderError::validation("amount out of range"))?;
            (asset, fiat)
        }
    };

    if asset <= Decimal::ZERO || fiat <= Decimal::ZERO {
        return Err(OrderError::validation("amount must be positive"));
    }
    if fiat < offer.min_fiat || fiat > offer.max_fiat {
        return Err(OrderError::validation(format!(
            "fiat amount {fiat} outside offer bounds [{}, {}]",
            offer.min_fiat, offer.max_fiat
        )));
    }
    Ok((asset, fiat))
}
