//! Reputation reconciliation: local trade history is the truth, the ledger's
//! `stores.reputation` record is brought up to it with one `bump_reputation`
//! call per counterpart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ptx_ledger::{Ledger, LedgerCall, LedgerError};
use ptx_schemas::MinorUnits;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::delta::{estimate_feedback_buckets, ReputationSnapshot};
use crate::retry::{with_retry, RetryPolicy};
use crate::ReconcileError;

pub const REPUTATION_SECTION: &str = "stores";
pub const REPUTATION_STORAGE: &str = "reputation";
pub const BUMP_METHOD: &str = "bump_reputation";

pub const SKIP_MISSING_ACCOUNT: &str = "missing_account";
pub const SKIP_NOT_ON_LEDGER: &str = "not_on_ledger";
pub const SKIP_UNKNOWN_USER: &str = "unknown_user";
pub const NOOP_UP_TO_DATE: &str = "up_to_date";
pub const NOOP_DRY_RUN: &str = "dry_run";

/// Aggregated local history of one counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartTruth {
    pub user_id: String,
    /// Ledger account; `None` until the user has linked one.
    pub account: Option<String>,
    pub released_trades: u64,
    /// Native-asset volume over released orders.
    pub volume: MinorUnits,
    pub rating_avg: Decimal,
    pub rating_count: u64,
}

impl CounterpartTruth {
    pub fn snapshot(&self) -> ReputationSnapshot {
        let (positive, negative) = estimate_feedback_buckets(self.rating_avg, self.rating_count);
        ReputationSnapshot {
            sales: u128::from(self.released_trades),
            positive,
            negative,
            volume: self.volume.get(),
        }
    }
}

#[async_trait]
pub trait ReputationSource: Send + Sync {
    /// Every user that took part in at least one released order.
    async fn counterparts(&self) -> anyhow::Result<Vec<CounterpartTruth>>;

    async fn counterpart(&self, user_id: &str) -> anyhow::Result<Option<CounterpartTruth>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Updated {
        delta: ReputationSnapshot,
        tx_ref: String,
    },
    Noop {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<ReputationSnapshot>,
    },
    Skipped {
        reason: String,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryReport {
    pub user_id: String,
    pub account: Option<String>,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationReport {
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub noops: usize,
    pub errors: usize,
    pub details: Vec<EntryReport>,
}

impl ReputationReport {
    fn push(&mut self, entry: EntryReport) {
        self.processed += 1;
        match entry.outcome {
            EntryOutcome::Updated { .. } => self.updated += 1,
            EntryOutcome::Noop { .. } => self.noops += 1,
            EntryOutcome::Skipped { .. } => self.skipped += 1,
            EntryOutcome::Error { .. } => self.errors += 1,
        }
        self.details.push(entry);
    }
}

pub struct ReputationWorker {
    source: Arc<dyn ReputationSource>,
    ledger: Arc<dyn Ledger>,
    signer: String,
    retry: RetryPolicy,
    pass: Mutex<()>,
}

impl ReputationWorker {
    /// `signer` is the account authorized to call `stores.bump_reputation`.
    pub fn new(
        source: Arc<dyn ReputationSource>,
        ledger: Arc<dyn Ledger>,
        signer: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            ledger,
            signer: signer.into(),
            retry,
            pass: Mutex::new(()),
        }
    }

    /// Full pass over every counterpart. Waits for a running pass to finish.
    pub async fn run_pass(&self, dry_run: bool) -> Result<ReputationReport, ReconcileError> {
        let _pass = self.pass.lock().await;
        self.pass_locked(dry_run).await
    }

    /// Like [`run_pass`](Self::run_pass) but returns `None` instead of
    /// waiting when a pass is already running.
    pub async fn try_run_pass(
        &self,
        dry_run: bool,
    ) -> Option<Result<ReputationReport, ReconcileError>> {
        let _pass = self.pass.try_lock().ok()?;
        Some(self.pass_locked(dry_run).await)
    }

    /// Reconcile only the named users, e.g. both parties of a just-released
    /// order.
    pub async fn reconcile_users(
        &self,
        user_ids: &[String],
    ) -> Result<ReputationReport, ReconcileError> {
        let _pass = self.pass.lock().await;
        let mut report = ReputationReport::default();
        for user_id in user_ids {
            let entry = match self.source.counterpart(user_id).await? {
                Some(truth) => self.reconcile_entry(&truth, false).await,
                None => EntryReport {
                    user_id: user_id.clone(),
                    account: None,
                    outcome: EntryOutcome::Skipped {
                        reason: SKIP_UNKNOWN_USER.to_string(),
                    },
                },
            };
            report.push(entry);
        }
        Ok(report)
    }

    async fn pass_locked(&self, dry_run: bool) -> Result<ReputationReport, ReconcileError> {
        let counterparts = self.source.counterparts().await?;
        let mut report = ReputationReport::default();
        for truth in &counterparts {
            report.push(self.reconcile_entry(truth, dry_run).await);
        }
        info!(
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            noops = report.noops,
            errors = report.errors,
            dry_run,
            "reputation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_entry(&self, truth: &CounterpartTruth, dry_run: bool) -> EntryReport {
        let outcome = match truth.account.as_deref() {
            None => EntryOutcome::Skipped {
                reason: SKIP_MISSING_ACCOUNT.to_string(),
            },
            Some(account) => {
                let target = truth.snapshot();
                let label = format!("reputation:{}", truth.user_id);
                let res = with_retry(&self.retry, &label, LedgerError::is_transient, || {
                    self.converge(account, &target, dry_run)
                })
                .await;
                match res {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(user_id = %truth.user_id, account, error = %e, "reputation entry failed");
                        EntryOutcome::Error {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };
        EntryReport {
            user_id: truth.user_id.clone(),
            account: truth.account.clone(),
            outcome,
        }
    }

    /// Read-diff-bump for one account. Re-reading on every attempt keeps a
    /// retried submission from double-counting a bump that did land.
    async fn converge(
        &self,
        account: &str,
        target: &ReputationSnapshot,
        dry_run: bool,
    ) -> Result<EntryOutcome, LedgerError> {
        let path = format!("{REPUTATION_SECTION}.{REPUTATION_STORAGE}");
        let Some(stored) = self.ledger.query_storage_value(&path, account).await? else {
            return Ok(EntryOutcome::Skipped {
                reason: SKIP_NOT_ON_LEDGER.to_string(),
            });
        };
        let current = ReputationSnapshot::from_storage(&stored)?;
        let delta = target.delta_from(&current);
        if delta.is_zero() {
            return Ok(EntryOutcome::Noop {
                reason: NOOP_UP_TO_DATE.to_string(),
                delta: None,
            });
        }
        if dry_run {
            return Ok(EntryOutcome::Noop {
                reason: NOOP_DRY_RUN.to_string(),
                delta: Some(delta),
            });
        }
        let call = LedgerCall {
            section: REPUTATION_SECTION.to_string(),
            method: BUMP_METHOD.to_string(),
            signer: self.signer.clone(),
            args: json!({ "key": account, "delta": delta.to_bump_args() }),
        };
        let inc = self.ledger.submit_call(&call).await?.into_included()?;
        info!(account, tx_ref = %inc.tx_ref, height = inc.height, ?delta, "reputation bumped");
        Ok(EntryOutcome::Updated {
            delta,
            tx_ref: inc.tx_ref,
        })
    }
}

/// Periodic full pass. A tick that lands while the previous pass is still
/// running is skipped.
pub fn spawn_reputation_loop(worker: Arc<ReputationWorker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let w = Arc::clone(&worker);
            // Detached so a slow pass does not hold back the ticker.
            tokio::spawn(async move {
                match w.try_run_pass(false).await {
                    None => debug!("reputation pass still running; tick skipped"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(error = %e, "reputation pass failed"),
                }
            });
        }
    })
}
