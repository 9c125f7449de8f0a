//! Postgres implementations of the settlement store traits.

use anyhow::{anyhow, Context, Result};
use ptx_schemas::MinorUnits;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

mod governance;
mod orders;
mod phases;
mod reputation;

pub const ENV_DB_URL: &str = "PTX_DATABASE_URL";

/// Connect to Postgres using PTX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists,
    })
}

/// All store traits over one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Postgres unique_violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn minor_col(row: &PgRow, col: &str) -> Result<MinorUnits> {
    let s: String = row.try_get(col)?;
    s.parse()
        .map_err(|e| anyhow!("column {col}: bad minor-unit amount {s:?}: {e}"))
}

fn height_to_db(h: u64) -> Result<i64> {
    i64::try_from(h).map_err(|_| anyhow!("height {h} out of range"))
}

fn height_col(row: &PgRow, col: &str) -> Result<Option<u64>> {
    let v: Option<i64> = row.try_get(col)?;
    v.map(|h| u64::try_from(h).map_err(|_| anyhow!("column {col}: negative height {h}")))
        .transpose()
}

fn index_to_db(i: u32) -> Result<i32> {
    i32::try_from(i).map_err(|_| anyhow!("index {i} out of range"))
}

fn index_col(row: &PgRow, col: &str) -> Result<u32> {
    let v: i32 = row.try_get(col)?;
    u32::try_from(v).map_err(|_| anyhow!("column {col}: negative index {v}"))
}
