use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ptx_reconcile::{CounterpartTruth, ReputationSource};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::{minor_col, PgStore};

/// Per-user truth over released orders. `$1` filters to one user when set.
/// Native volume is converted to minor units in SQL (scale 10^12); the
/// account is the one used on the user's most recent release.
const COUNTERPART_SQL: &str = r#"
    with parties as (
        select maker_id as user_id, maker_account as account, asset, amount_asset, released_at
        from orders where status = 'RELEASED'
        union all
        select taker_id, taker_account, asset, amount_asset, released_at
        from orders where status = 'RELEASED'
    ),
    agg as (
        select user_id,
               count(*)::bigint as trades,
               coalesce(sum(case when asset = 'NATIVE'
                                 then amount_asset * 1000000000000
                                 else 0 end), 0)::numeric(40,0)::text as volume,
               (array_agg(nullif(account, '') order by released_at desc nulls last))[1] as account
        from parties
        where ($1::text is null or user_id = $1)
        group by user_id
    ),
    ratings as (
        select target_id, round(avg(stars), 6) as rating_avg, count(*)::bigint as rating_count
        from reviews
        group by target_id
    )
    select a.user_id, a.account, a.trades, a.volume,
           coalesce(r.rating_avg, 0) as rating_avg,
           coalesce(r.rating_count, 0) as rating_count
    from agg a
    left join ratings r on r.target_id = a.user_id
    order by a.user_id
"#;

fn truth_from_row(row: &PgRow) -> Result<CounterpartTruth> {
    let trades: i64 = row.try_get("trades")?;
    let rating_count: i64 = row.try_get("rating_count")?;
    let rating_avg: Decimal = row.try_get("rating_avg")?;
    Ok(CounterpartTruth {
        user_id: row.try_get("user_id")?,
        account: row.try_get("account")?,
        released_trades: u64::try_from(trades).map_err(|_| anyhow!("negative trade count"))?,
        volume: minor_col(row, "volume")?,
        rating_avg,
        rating_count: u64::try_from(rating_count).map_err(|_| anyhow!("negative rating count"))?,
    })
}

#[async_trait]
impl ReputationSource for PgStore {
    async fn counterparts(&self) -> Result<Vec<CounterpartTruth>> {
        let rows = sqlx::query(COUNTERPART_SQL)
            .bind(Option::<String>::None)
            .fetch_all(&self.pool)
            .await
            .context("reputation counterparts query failed")?;
        rows.iter().map(truth_from_row).collect()
    }

    async fn counterpart(&self, user_id: &str) -> Result<Option<CounterpartTruth>> {
        let row = sqlx::query(COUNTERPART_SQL)
            .bind(Some(user_id))
            .fetch_optional(&self.pool)
            .await
            .context("reputation counterpart query failed")?;
        row.as_ref().map(truth_from_row).transpose()
    }
}
