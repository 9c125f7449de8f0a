use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ptx_phase::{AdvanceOutcome, PhaseStore};
use ptx_schemas::{MinorUnits, PhaseConfig, PhaseReservation, ReservationState};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{height_col, height_to_db, minor_col, PgStore};

const PHASE_COLUMNS: &str = r#"
    label, seq, price_per_unit, supply_cap::text as supply_cap, active,
    start_height, end_height
"#;

fn phase_from_row(row: &PgRow) -> Result<PhaseConfig> {
    Ok(PhaseConfig {
        label: row.try_get("label")?,
        seq: row.try_get("seq")?,
        price_per_unit: row.try_get("price_per_unit")?,
        supply_cap: minor_col(row, "supply_cap")?,
        active: row.try_get("active")?,
        start_height: height_col(row, "start_height")?,
        end_height: height_col(row, "end_height")?,
    })
}

async fn held_total_in(
    tx: &mut Transaction<'_, Postgres>,
    phase: &str,
) -> Result<MinorUnits> {
    let row = sqlx::query(
        r#"
        select coalesce(sum(amount), 0)::text as held
        from phase_reservations
        where phase = $1 and state = 'HELD'
        "#,
    )
    .bind(phase)
    .fetch_one(&mut **tx)
    .await
    .context("held_total failed")?;
    minor_col(&row, "held")
}

impl PgStore {
    /// Insert or update a phase definition by label. Activation state is
    /// left to [`PhaseStore::advance`].
    pub async fn upsert_phase(&self, phase: &PhaseConfig) -> Result<()> {
        sqlx::query(
            r#"
            insert into phase_configs (label, seq, price_per_unit, supply_cap)
            values ($1, $2, $3, $4::numeric)
            on conflict (label) do update
            set seq = excluded.seq,
                price_per_unit = excluded.price_per_unit,
                supply_cap = excluded.supply_cap
            "#,
        )
        .bind(&phase.label)
        .bind(phase.seq)
        .bind(phase.price_per_unit)
        .bind(phase.supply_cap.to_string())
        .execute(&self.pool)
        .await
        .context("upsert_phase failed")?;
        Ok(())
    }
}

#[async_trait]
impl PhaseStore for PgStore {
    async fn phases(&self) -> Result<Vec<PhaseConfig>> {
        let rows = sqlx::query(&format!("select {PHASE_COLUMNS} from phase_configs order by seq asc"))
            .fetch_all(&self.pool)
            .await
            .context("phases failed")?;
        rows.iter().map(phase_from_row).collect()
    }

    async fn active_phase(&self) -> Result<Option<PhaseConfig>> {
        let row = sqlx::query(&format!("select {PHASE_COLUMNS} from phase_configs where active"))
            .fetch_optional(&self.pool)
            .await
            .context("active_phase failed")?;
        row.as_ref().map(phase_from_row).transpose()
    }

    async fn held_total(&self, phase: &str) -> Result<MinorUnits> {
        let mut tx = self.pool.begin().await.context("begin held_total")?;
        let held = held_total_in(&mut tx, phase).await?;
        tx.commit().await.context("commit held_total")?;
        Ok(held)
    }

    async fn try_reserve(&self, r: &PhaseReservation, limit: MinorUnits) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin try_reserve")?;
        // Serializes reservations against the same phase and against advance().
        let locked = sqlx::query("select label from phase_configs where label = $1 and active for update")
            .bind(&r.phase)
            .fetch_optional(&mut *tx)
            .await
            .context("lock phase failed")?;
        if locked.is_none() {
            tx.rollback().await.context("rollback try_reserve")?;
            return Ok(false);
        }

        let held = held_total_in(&mut tx, &r.phase).await?;
        let fits = held
            .checked_add(r.amount)
            .map(|total| total <= limit)
            .unwrap_or(false);
        if !fits {
            tx.rollback().await.context("rollback try_reserve")?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            insert into phase_reservations (order_id, phase, amount, state)
            values ($1, $2, $3::numeric, 'HELD')
            "#,
        )
        .bind(r.order_id)
        .bind(&r.phase)
        .bind(r.amount.to_string())
        .execute(&mut *tx)
        .await
        .context("insert reservation failed")?;
        tx.commit().await.context("commit try_reserve")?;
        Ok(true)
    }

    async fn reservation(&self, order_id: Uuid) -> Result<Option<PhaseReservation>> {
        let row = sqlx::query(
            r#"
            select order_id, phase, amount::text as amount, state
            from phase_reservations
            where order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("reservation failed")?;
        row.map(|row| {
            Ok(PhaseReservation {
                order_id: row.try_get("order_id")?,
                phase: row.try_get("phase")?,
                amount: minor_col(&row, "amount")?,
                state: ReservationState::parse(&row.try_get::<String, _>("state")?)?,
            })
        })
        .transpose()
    }

    async fn finish_reservation(&self, order_id: Uuid, to: ReservationState) -> Result<bool> {
        if to == ReservationState::Held {
            return Err(anyhow!("finish_reservation: target must not be HELD"));
        }
        let res = sqlx::query(
            r#"
            update phase_reservations
            set state = $2, updated_at = now()
            where order_id = $1 and state = 'HELD'
            "#,
        )
        .bind(order_id)
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .context("finish_reservation failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn advance(&self, height: Option<u64>) -> Result<AdvanceOutcome> {
        let height_db = height.map(height_to_db).transpose()?;
        let mut tx = self.pool.begin().await.context("begin advance")?;
        let rows = sqlx::query(&format!(
            "select {PHASE_COLUMNS} from phase_configs order by seq asc for update"
        ))
        .fetch_all(&mut *tx)
        .await
        .context("lock phases failed")?;
        let phases = rows.iter().map(phase_from_row).collect::<Result<Vec<_>>>()?;

        let current = phases.iter().find(|p| p.active);
        let next = match current {
            Some(cur) => phases.iter().find(|p| p.seq > cur.seq),
            None => phases.iter().find(|p| p.end_height.is_none()),
        };
        let Some(next) = next else {
            tx.rollback().await.context("rollback advance")?;
            return Ok(AdvanceOutcome::NoNext);
        };

        if let Some(cur) = current {
            sqlx::query("update phase_configs set active = false, end_height = $2 where label = $1")
                .bind(&cur.label)
                .bind(height_db)
                .execute(&mut *tx)
                .await
                .context("deactivate phase failed")?;
        }
        sqlx::query("update phase_configs set active = true, start_height = $2 where label = $1")
            .bind(&next.label)
            .bind(height_db)
            .execute(&mut *tx)
            .await
            .context("activate phase failed")?;
        tx.commit().await.context("commit advance")?;

        let mut to = next.clone();
        to.active = true;
        to.start_height = height;
        Ok(AdvanceOutcome::Advanced {
            from: current.map(|c| c.label.clone()),
            to,
        })
    }
}
