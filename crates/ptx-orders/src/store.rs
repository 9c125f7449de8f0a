use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptx_audit::OrderEventRecord;
use ptx_schemas::{Offer, Order, OrderStatus, Review, SettlementClaim, SettlementLeg};
use uuid::Uuid;

/// Order persistence. Every state change is written together with its audit
/// event, and only if the row still has the expected status.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &Order, event: &OrderEventRecord) -> anyhow::Result<()>;

    async fn fetch_order(&self, id: Uuid) -> anyhow::Result<Option<Order>>;

    /// Replace the row with `order` iff its stored status is `expected`,
    /// appending `event` in the same transaction. Returns whether a row
    /// matched.
    async fn update_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
        event: &OrderEventRecord,
    ) -> anyhow::Result<bool>;

    async fn last_event(&self, order_id: Uuid) -> anyhow::Result<Option<OrderEventRecord>>;

    /// Full audit trail, ascending `seq`.
    async fn events(&self, order_id: Uuid) -> anyhow::Result<Vec<OrderEventRecord>>;

    /// Whether any order already recorded `tx_ref` as its escrow lock.
    async fn escrow_ref_in_use(&self, tx_ref: &str) -> anyhow::Result<bool>;

    /// Orders in one of `statuses` with `expires_at < now`, oldest first.
    async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        statuses: &[OrderStatus],
        limit: i64,
    ) -> anyhow::Result<Vec<Order>>;

    /// `false` when `(order_id, author_id)` already has a review.
    async fn insert_review(&self, review: &Review) -> anyhow::Result<bool>;

    /// Take the claim on `(order_id, leg)` for `holder` until `lease_until`.
    /// `None` while any lease on it is still live; an expired lease is taken
    /// over with `attempt` bumped.
    async fn claim_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<SettlementClaim>>;

    /// End `holder`'s lease at `now`. No-op if someone else holds it.
    async fn release_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn fetch_offer(&self, id: Uuid) -> anyhow::Result<Option<Offer>>;
}

/// Notified after an order is released. Must not block; failures stay
/// inside the hook.
pub trait ReleaseHook: Send + Sync {
    fn order_released(&self, order: &Order);
}
