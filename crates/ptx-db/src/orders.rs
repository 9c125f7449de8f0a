use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptx_audit::OrderEventRecord;
use ptx_orders::{OfferStore, OrderStore};
use ptx_schemas::{
    AssetKind, Offer, Order, OrderStatus, Review, SettlementClaim, SettlementLeg, TradeSide,
};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{is_unique_violation, PgStore};

const ORDER_COLUMNS: &str = r#"
    id, offer_id, maker_id, taker_id, maker_account, taker_account,
    asset, asset_id, amount_asset, amount_fiat, price_per_unit, phase, side,
    status, escrow_tx_ref, escrow_at, payer_declared_at, proof_refs,
    released_tx_ref, released_at, expires_at, created_at, updated_at
"#;

fn order_from_row(row: &PgRow) -> Result<Order> {
    let asset_id: Option<i32> = row.try_get("asset_id")?;
    let proof_refs: serde_json::Value = row.try_get("proof_refs")?;
    Ok(Order {
        id: row.try_get("id")?,
        offer_id: row.try_get("offer_id")?,
        maker_id: row.try_get("maker_id")?,
        taker_id: row.try_get("taker_id")?,
        maker_account: row.try_get("maker_account")?,
        taker_account: row.try_get("taker_account")?,
        asset: AssetKind::parse(&row.try_get::<String, _>("asset")?)?,
        asset_id: asset_id
            .map(|v| u32::try_from(v).map_err(|_| anyhow!("negative asset_id {v}")))
            .transpose()?,
        amount_asset: row.try_get("amount_asset")?,
        amount_fiat: row.try_get("amount_fiat")?,
        price_per_unit: row.try_get("price_per_unit")?,
        phase: row.try_get("phase")?,
        side: TradeSide::parse(&row.try_get::<String, _>("side")?)?,
        status: OrderStatus::parse(&row.try_get::<String, _>("status")?)?,
        escrow_tx_ref: row.try_get("escrow_tx_ref")?,
        escrow_at: row.try_get("escrow_at")?,
        payer_declared_at: row.try_get("payer_declared_at")?,
        proof_refs: serde_json::from_value(proof_refs).context("orders.proof_refs")?,
        released_tx_ref: row.try_get("released_tx_ref")?,
        released_at: row.try_get("released_at")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<OrderEventRecord> {
    let seq: i64 = row.try_get("seq")?;
    Ok(OrderEventRecord {
        event_id: row.try_get("event_id")?,
        order_id: row.try_get("order_id")?,
        seq: u64::try_from(seq).map_err(|_| anyhow!("negative event seq {seq}"))?,
        ts_utc: row.try_get("ts_utc")?,
        author: row.try_get("author")?,
        triggered_by: row.try_get("triggered_by")?,
        kind: row.try_get("kind")?,
        tx_ref: row.try_get("tx_ref")?,
        payload: row.try_get("payload")?,
        hash_prev: row.try_get("hash_prev")?,
        hash_self: row.try_get("hash_self")?,
    })
}

fn claim_from_row(row: &PgRow) -> Result<SettlementClaim> {
    let attempt: i32 = row.try_get("attempt")?;
    Ok(SettlementClaim {
        order_id: row.try_get("order_id")?,
        leg: SettlementLeg::parse(&row.try_get::<String, _>("leg")?)?,
        memo: row.try_get("memo")?,
        holder: row.try_get("holder")?,
        attempt: u32::try_from(attempt).map_err(|_| anyhow!("negative claim attempt {attempt}"))?,
        claimed_until: row.try_get("claimed_until")?,
    })
}

async fn insert_event(tx: &mut Transaction<'_, Postgres>, ev: &OrderEventRecord) -> Result<()> {
    let seq = i64::try_from(ev.seq).map_err(|_| anyhow!("event seq {} out of range", ev.seq))?;
    sqlx::query(
        r#"
        insert into order_events (
          event_id, order_id, seq, ts_utc, author, triggered_by, kind, tx_ref,
          payload, hash_prev, hash_self
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(ev.event_id)
    .bind(ev.order_id)
    .bind(seq)
    .bind(ev.ts_utc)
    .bind(&ev.author)
    .bind(&ev.triggered_by)
    .bind(&ev.kind)
    .bind(&ev.tx_ref)
    .bind(&ev.payload)
    .bind(&ev.hash_prev)
    .bind(&ev.hash_self)
    .execute(&mut **tx)
    .await
    .context("insert order_event failed")?;
    Ok(())
}

impl PgStore {
    /// Offers are owned by the listing side; this exists for seeding.
    pub async fn insert_offer(&self, offer: &Offer) -> Result<()> {
        sqlx::query(
            r#"
            insert into offers (
              id, maker_id, maker_account, asset, side, price_per_unit,
              min_fiat, max_fiat, active
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(offer.id)
        .bind(&offer.maker_id)
        .bind(&offer.maker_account)
        .bind(offer.asset.as_str())
        .bind(offer.side.as_str())
        .bind(offer.price_per_unit)
        .bind(offer.min_fiat)
        .bind(offer.max_fiat)
        .bind(offer.active)
        .execute(&self.pool)
        .await
        .context("insert_offer failed")?;
        Ok(())
    }
}

#[async_trait]
impl OfferStore for PgStore {
    async fn fetch_offer(&self, id: Uuid) -> Result<Option<Offer>> {
        let row = sqlx::query(
            r#"
            select id, maker_id, maker_account, asset, side, price_per_unit,
                   min_fiat, max_fiat, active
            from offers
            where id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_offer failed")?;

        row.map(|row| {
            Ok(Offer {
                id: row.try_get("id")?,
                maker_id: row.try_get("maker_id")?,
                maker_account: row.try_get("maker_account")?,
                asset: AssetKind::parse(&row.try_get::<String, _>("asset")?)?,
                side: TradeSide::parse(&row.try_get::<String, _>("side")?)?,
                price_per_unit: row.try_get("price_per_unit")?,
                min_fiat: row.try_get("min_fiat")?,
                max_fiat: row.try_get("max_fiat")?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, order: &Order, event: &OrderEventRecord) -> Result<()> {
        let asset_id = order
            .asset_id
            .map(i32::try_from)
            .transpose()
            .map_err(|_| anyhow!("asset_id out of range"))?;
        let mut tx = self.pool.begin().await.context("begin insert_order")?;
        sqlx::query(&format!(
            "insert into orders ({ORDER_COLUMNS}) values \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)"
        ))
        .bind(order.id)
        .bind(order.offer_id)
        .bind(&order.maker_id)
        .bind(&order.taker_id)
        .bind(&order.maker_account)
        .bind(&order.taker_account)
        .bind(order.asset.as_str())
        .bind(asset_id)
        .bind(order.amount_asset)
        .bind(order.amount_fiat)
        .bind(order.price_per_unit)
        .bind(&order.phase)
        .bind(order.side.as_str())
        .bind(order.status.as_str())
        .bind(&order.escrow_tx_ref)
        .bind(order.escrow_at)
        .bind(order.payer_declared_at)
        .bind(serde_json::to_value(&order.proof_refs)?)
        .bind(&order.released_tx_ref)
        .bind(order.released_at)
        .bind(order.expires_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .context("insert order failed")?;
        insert_event(&mut tx, event).await?;
        tx.commit().await.context("commit insert_order")?;
        Ok(())
    }

    async fn fetch_order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("select {ORDER_COLUMNS} from orders where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_order failed")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn update_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
        event: &OrderEventRecord,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin update_if_status")?;
        let res = sqlx::query(
            r#"
            update orders
            set status = $3,
                escrow_tx_ref = $4,
                escrow_at = $5,
                payer_declared_at = $6,
                proof_refs = $7,
                released_tx_ref = $8,
                released_at = $9,
                updated_at = $10
            where id = $1
              and status = $2
            "#,
        )
        .bind(order.id)
        .bind(expected.as_str())
        .bind(order.status.as_str())
        .bind(&order.escrow_tx_ref)
        .bind(order.escrow_at)
        .bind(order.payer_declared_at)
        .bind(serde_json::to_value(&order.proof_refs)?)
        .bind(&order.released_tx_ref)
        .bind(order.released_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await;

        let res = match res {
            Ok(r) => r,
            // A second order claiming the same escrow lock.
            Err(e) if is_unique_violation(&e) => {
                return Err(anyhow!("escrow reference already bound to another order"));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("update_if_status failed")),
        };
        if res.rows_affected() != 1 {
            tx.rollback().await.context("rollback update_if_status")?;
            return Ok(false);
        }
        insert_event(&mut tx, event).await?;
        tx.commit().await.context("commit update_if_status")?;
        Ok(true)
    }

    async fn last_event(&self, order_id: Uuid) -> Result<Option<OrderEventRecord>> {
        let row = sqlx::query(
            r#"
            select event_id, order_id, seq, ts_utc, author, triggered_by, kind,
                   tx_ref, payload, hash_prev, hash_self
            from order_events
            where order_id = $1
            order by seq desc
            limit 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("last_event failed")?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEventRecord>> {
        let rows = sqlx::query(
            r#"
            select event_id, order_id, seq, ts_utc, author, triggered_by, kind,
                   tx_ref, payload, hash_prev, hash_self
            from order_events
            where order_id = $1
            order by seq asc
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .context("events failed")?;
        rows.iter().map(event_from_row).collect()
    }

    async fn escrow_ref_in_use(&self, tx_ref: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("select exists (select 1 from orders where escrow_tx_ref = $1)")
                .bind(tx_ref)
                .fetch_one(&self.pool)
                .await
                .context("escrow_ref_in_use failed")?;
        Ok(exists)
    }

    async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        statuses: &[OrderStatus],
        limit: i64,
    ) -> Result<Vec<Order>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders \
             where status = any($1) and expires_at < $2 \
             order by expires_at asc limit $3"
        ))
        .bind(&statuses)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("overdue_orders failed")?;
        rows.iter().map(order_from_row).collect()
    }

    async fn insert_review(&self, review: &Review) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into reviews (order_id, author_id, target_id, stars, comment, created_at)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (order_id, author_id) do nothing
            "#,
        )
        .bind(review.order_id)
        .bind(&review.author_id)
        .bind(&review.target_id)
        .bind(i16::from(review.stars))
        .bind(&review.comment)
        .bind(review.created_at)
        .execute(&self.pool)
        .await
        .context("insert_review failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn claim_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<SettlementClaim>> {
        // The conflict branch only fires on an expired lease; a live one
        // returns no row.
        let row = sqlx::query(
            r#"
            insert into settlement_claims (order_id, leg, memo, holder, attempt, claimed_until)
            values ($1, $2, $3, $4, 1, $6)
            on conflict (order_id, leg) do update
              set holder = excluded.holder,
                  attempt = settlement_claims.attempt + 1,
                  claimed_until = excluded.claimed_until
              where settlement_claims.claimed_until <= $5
            returning order_id, leg, memo, holder, attempt, claimed_until
            "#,
        )
        .bind(order_id)
        .bind(leg.as_str())
        .bind(leg.memo(order_id))
        .bind(holder)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await
        .context("claim_settlement failed")?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn release_settlement(
        &self,
        order_id: Uuid,
        leg: SettlementLeg,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update settlement_claims
            set claimed_until = $4
            where order_id = $1 and leg = $2 and holder = $3
            "#,
        )
        .bind(order_id)
        .bind(leg.as_str())
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("release_settlement failed")?;
        Ok(())
    }
}
