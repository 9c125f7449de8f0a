use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ptx_ledger::EventKind;
use ptx_reconcile::governance::{
    CouncilMotion, CouncilVote, DemocracyProposal, GovernanceEventRecord, GovernanceStore,
    MotionStatus, Referendum, ReferendumStatus, ReferendumVote, RequestStatus, TreasuryRequest,
};
use ptx_schemas::MinorUnits;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::{height_col, height_to_db, index_col, index_to_db, minor_col, PgStore};

fn request_from_row(row: &PgRow) -> Result<TreasuryRequest> {
    let status: String = row.try_get("status")?;
    let proposal_index: Option<i32> = row.try_get("proposal_index")?;
    let proposal_index = proposal_index
        .map(|i| u32::try_from(i).map_err(|_| anyhow!("negative proposal_index {i}")))
        .transpose()?;
    Ok(TreasuryRequest {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        beneficiary: row.try_get("beneficiary")?,
        amount: minor_col(row, "amount")?,
        content_hash: row.try_get("content_hash")?,
        status: RequestStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad treasury request status {status:?}"))?,
        motion_hash: row.try_get("motion_hash")?,
        proposal_index,
        paid_tx_ref: row.try_get("paid_tx_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn motion_from_row(row: &PgRow) -> Result<CouncilMotion> {
    let status: String = row.try_get("status")?;
    let threshold: i32 = row.try_get("threshold")?;
    let yes: i32 = row.try_get("yes_votes")?;
    let no: i32 = row.try_get("no_votes")?;
    Ok(CouncilMotion {
        motion_hash: row.try_get("motion_hash")?,
        proposal_index: index_col(row, "proposal_index")?,
        proposer: row.try_get("proposer")?,
        threshold: threshold.max(0) as u32,
        status: MotionStatus::parse(&status).ok_or_else(|| anyhow!("bad motion status {status:?}"))?,
        yes: yes.max(0) as u32,
        no: no.max(0) as u32,
        proposed_height: height_col(row, "proposed_height")?.unwrap_or(0),
    })
}

fn referendum_from_row(row: &PgRow) -> Result<Referendum> {
    let status: String = row.try_get("status")?;
    Ok(Referendum {
        ref_index: index_col(row, "ref_index")?,
        status: ReferendumStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad referendum status {status:?}"))?,
        threshold: row.try_get("threshold")?,
        preimage_hash: row.try_get("preimage_hash")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        proposer: row.try_get("proposer")?,
        started_height: height_col(row, "started_height")?.unwrap_or(0),
    })
}

const REQUEST_COLUMNS: &str = r#"
    id, title, beneficiary, amount::text as amount, content_hash, status,
    motion_hash, proposal_index, paid_tx_ref, created_at, updated_at
"#;

fn u32_to_db(v: u32) -> Result<i32> {
    i32::try_from(v).map_err(|_| anyhow!("value {v} out of range"))
}

#[async_trait]
impl GovernanceStore for PgStore {
    async fn event_seen(&self, subject: &str, kind: EventKind) -> Result<bool> {
        let (seen,): (bool,) = sqlx::query_as(
            "select exists (select 1 from governance_events where subject = $1 and kind = $2)",
        )
        .bind(subject)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .context("event_seen failed")?;
        Ok(seen)
    }

    async fn record_event(&self, rec: &GovernanceEventRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into governance_events (subject, kind, height, tx_ref, payload)
            values ($1, $2, $3, $4, $5)
            on conflict (subject, kind) do nothing
            "#,
        )
        .bind(&rec.subject)
        .bind(rec.kind.as_str())
        .bind(height_to_db(rec.height)?)
        .bind(&rec.tx_ref)
        .bind(&rec.payload)
        .execute(&self.pool)
        .await
        .context("record_event failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn last_event_height(&self) -> Result<Option<u64>> {
        let row = sqlx::query("select max(height) as h from governance_events")
            .fetch_one(&self.pool)
            .await
            .context("last_event_height failed")?;
        height_col(&row, "h")
    }

    async fn insert_request(&self, req: &TreasuryRequest) -> Result<()> {
        sqlx::query(
            r#"
            insert into treasury_requests (
              id, title, beneficiary, amount, content_hash, status, motion_hash,
              proposal_index, paid_tx_ref, created_at, updated_at
            ) values ($1, $2, $3, $4::numeric, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(req.id)
        .bind(&req.title)
        .bind(&req.beneficiary)
        .bind(req.amount.to_string())
        .bind(&req.content_hash)
        .bind(req.status.as_str())
        .bind(&req.motion_hash)
        .bind(req.proposal_index.map(u32_to_db).transpose()?)
        .bind(&req.paid_tx_ref)
        .bind(req.created_at)
        .bind(req.updated_at)
        .execute(&self.pool)
        .await
        .context("insert_request failed")?;
        Ok(())
    }

    async fn fetch_request(&self, id: Uuid) -> Result<Option<TreasuryRequest>> {
        let row = sqlx::query(&format!("select {REQUEST_COLUMNS} from treasury_requests where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_request failed")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn upsert_motion(&self, m: &CouncilMotion) -> Result<()> {
        sqlx::query(
            r#"
            insert into council_motions (
              motion_hash, proposal_index, proposer, threshold, status, yes_votes, no_votes, proposed_height
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (motion_hash) do nothing
            "#,
        )
        .bind(&m.motion_hash)
        .bind(index_to_db(m.proposal_index)?)
        .bind(&m.proposer)
        .bind(u32_to_db(m.threshold)?)
        .bind(m.status.as_str())
        .bind(u32_to_db(m.yes)?)
        .bind(u32_to_db(m.no)?)
        .bind(height_to_db(m.proposed_height)?)
        .execute(&self.pool)
        .await
        .context("upsert_motion failed")?;
        Ok(())
    }

    async fn fetch_motion(&self, motion_hash: &str) -> Result<Option<CouncilMotion>> {
        let row = sqlx::query(
            r#"
            select motion_hash, proposal_index, proposer, threshold, status, yes_votes, no_votes, proposed_height
            from council_motions
            where motion_hash = $1
            "#,
        )
        .bind(motion_hash)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_motion failed")?;
        row.as_ref().map(motion_from_row).transpose()
    }

    async fn set_motion_status(
        &self,
        motion_hash: &str,
        status: MotionStatus,
        tally: Option<(u32, u32)>,
    ) -> Result<bool> {
        let (yes, no) = match tally {
            Some((y, n)) => (Some(u32_to_db(y)?), Some(u32_to_db(n)?)),
            None => (None, None),
        };
        let res = sqlx::query(
            r#"
            update council_motions
            set status = $2,
                yes_votes = coalesce($3, yes_votes),
                no_votes = coalesce($4, no_votes)
            where motion_hash = $1
            "#,
        )
        .bind(motion_hash)
        .bind(status.as_str())
        .bind(yes)
        .bind(no)
        .execute(&self.pool)
        .await
        .context("set_motion_status failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_vote(&self, v: &CouncilVote) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into council_votes (motion_hash, voter, approve, height)
            values ($1, $2, $3, $4)
            on conflict (motion_hash, voter) do nothing
            "#,
        )
        .bind(&v.motion_hash)
        .bind(&v.voter)
        .bind(v.approve)
        .bind(height_to_db(v.height)?)
        .execute(&self.pool)
        .await
        .context("record_vote failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn link_request_to_motion(
        &self,
        motion_hash: &str,
        proposal_index: u32,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            update treasury_requests
            set status = 'IN_VOTING',
                motion_hash = $1,
                proposal_index = $2,
                updated_at = $3
            where id = (
                select id from treasury_requests
                where content_hash = $1 and status = 'SUBMITTED'
                order by created_at asc
                limit 1
                for update
            )
            returning id
            "#,
        )
        .bind(motion_hash)
        .bind(index_to_db(proposal_index)?)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .context("link_request_to_motion failed")?;
        row.map(|r| r.try_get("id").map_err(anyhow::Error::from)).transpose()
    }

    async fn set_request_status_by_motion(
        &self,
        motion_hash: &str,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<Option<Uuid>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(
            r#"
            update treasury_requests
            set status = $3, updated_at = $4
            where motion_hash = $1 and status = any($2)
            returning id
            "#,
        )
        .bind(motion_hash)
        .bind(&from)
        .bind(to.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .context("set_request_status_by_motion failed")?;
        row.map(|r| r.try_get("id").map_err(anyhow::Error::from)).transpose()
    }

    async fn pay_out_by_transfer(
        &self,
        beneficiary: &str,
        amount: MinorUnits,
        tx_ref: &str,
    ) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.context("begin pay_out_by_transfer")?;
        let already = sqlx::query("select id from treasury_requests where paid_tx_ref = $1")
            .bind(tx_ref)
            .fetch_optional(&mut *tx)
            .await
            .context("paid_tx_ref lookup failed")?;
        if let Some(row) = already {
            tx.commit().await.context("commit pay_out_by_transfer")?;
            return Ok(Some(row.try_get("id")?));
        }
        let row = sqlx::query(
            r#"
            update treasury_requests
            set status = 'PAID_OUT', paid_tx_ref = $3, updated_at = $4
            where id = (
                select id from treasury_requests
                where beneficiary = $1 and amount = $2::numeric and status = 'APPROVED'
                order by created_at asc
                limit 1
                for update
            )
            returning id
            "#,
        )
        .bind(beneficiary)
        .bind(amount.to_string())
        .bind(tx_ref)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .context("pay_out_by_transfer failed")?;
        tx.commit().await.context("commit pay_out_by_transfer")?;
        row.map(|r| r.try_get("id").map_err(anyhow::Error::from)).transpose()
    }

    async fn upsert_proposal(&self, p: &DemocracyProposal) -> Result<()> {
        sqlx::query(
            r#"
            insert into democracy_proposals (proposal_index, proposer, deposit, height)
            values ($1, $2, $3::numeric, $4)
            on conflict (proposal_index) do nothing
            "#,
        )
        .bind(index_to_db(p.proposal_index)?)
        .bind(&p.proposer)
        .bind(p.deposit.to_string())
        .bind(height_to_db(p.height)?)
        .execute(&self.pool)
        .await
        .context("upsert_proposal failed")?;
        Ok(())
    }

    async fn upsert_referendum(&self, r: &Referendum) -> Result<()> {
        // Status only moves forward on conflict; metadata is refreshed.
        sqlx::query(
            r#"
            insert into referendums (
              ref_index, status, threshold, preimage_hash, title, description,
              proposer, started_height
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (ref_index) do update
            set threshold = excluded.threshold,
                preimage_hash = coalesce(excluded.preimage_hash, referendums.preimage_hash),
                title = coalesce(excluded.title, referendums.title),
                description = coalesce(excluded.description, referendums.description),
                proposer = coalesce(excluded.proposer, referendums.proposer)
            "#,
        )
        .bind(index_to_db(r.ref_index)?)
        .bind(r.status.as_str())
        .bind(&r.threshold)
        .bind(&r.preimage_hash)
        .bind(&r.title)
        .bind(&r.description)
        .bind(&r.proposer)
        .bind(height_to_db(r.started_height)?)
        .execute(&self.pool)
        .await
        .context("upsert_referendum failed")?;
        Ok(())
    }

    async fn fetch_referendum(&self, ref_index: u32) -> Result<Option<Referendum>> {
        let row = sqlx::query(
            r#"
            select ref_index, status, threshold, preimage_hash, title, description,
                   proposer, started_height
            from referendums
            where ref_index = $1
            "#,
        )
        .bind(index_to_db(ref_index)?)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_referendum failed")?;
        row.as_ref().map(referendum_from_row).transpose()
    }

    async fn set_referendum_status(&self, ref_index: u32, status: ReferendumStatus) -> Result<bool> {
        let Some(current) = self.fetch_referendum(ref_index).await? else {
            return Ok(false);
        };
        if current.status.rank() >= status.rank() {
            return Ok(true);
        }
        sqlx::query("update referendums set status = $2 where ref_index = $1")
            .bind(index_to_db(ref_index)?)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("set_referendum_status failed")?;
        Ok(true)
    }

    async fn record_referendum_vote(&self, v: &ReferendumVote) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into referendum_votes (ref_index, voter, aye, balance, height)
            values ($1, $2, $3, $4::numeric, $5)
            on conflict (ref_index, voter) do nothing
            "#,
        )
        .bind(index_to_db(v.ref_index)?)
        .bind(&v.voter)
        .bind(v.aye)
        .bind(v.balance.to_string())
        .bind(height_to_db(v.height)?)
        .execute(&self.pool)
        .await
        .context("record_referendum_vote failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn referendum_tally(&self, ref_index: u32) -> Result<(MinorUnits, MinorUnits)> {
        let row = sqlx::query(
            r#"
            select coalesce(sum(balance) filter (where aye), 0)::text as ayes,
                   coalesce(sum(balance) filter (where not aye), 0)::text as nays
            from referendum_votes
            where ref_index = $1
            "#,
        )
        .bind(index_to_db(ref_index)?)
        .fetch_one(&self.pool)
        .await
        .context("referendum_tally failed")?;
        Ok((minor_col(&row, "ayes")?, minor_col(&row, "nays")?))
    }
}
