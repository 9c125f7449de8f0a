use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ptx_ledger::{LedgerError, PaperLedger};
use ptx_reconcile::{
    CounterpartTruth, EntryOutcome, ReputationSource, ReputationWorker, RetryPolicy,
    NOOP_DRY_RUN, NOOP_UP_TO_DATE, SKIP_MISSING_ACCOUNT, SKIP_NOT_ON_LEDGER,
};
use ptx_schemas::MinorUnits;
use rust_decimal::Decimal;
use serde_json::json;

const STORAGE: &str = "stores.reputation";

struct FixedSource(Vec<CounterpartTruth>);

#[async_trait]
impl ReputationSource for FixedSource {
    async fn counterparts(&self) -> anyhow::Result<Vec<CounterpartTruth>> {
        Ok(self.0.clone())
    }

    async fn counterpart(&self, user_id: &str) -> anyhow::Result<Option<CounterpartTruth>> {
        Ok(self.0.iter().find(|c| c.user_id == user_id).cloned())
    }
}

fn truth(user: &str, account: Option<&str>, sales: u64) -> CounterpartTruth {
    CounterpartTruth {
        user_id: user.to_string(),
        account: account.map(str::to_string),
        released_trades: sales,
        volume: MinorUnits::ZERO,
        rating_avg: Decimal::ZERO,
        rating_count: 0,
    }
}

fn worker(ledger: &Arc<PaperLedger>, source: Vec<CounterpartTruth>) -> ReputationWorker {
    ReputationWorker::new(
        Arc::new(FixedSource(source)),
        ledger.clone(),
        "registrar",
        RetryPolicy::new(3, Duration::from_millis(1)),
    )
}

#[tokio::test]
async fn bumps_the_difference_once_then_converges() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-alice", json!({"sales": 3}));
    let w = worker(&ledger, vec![truth("alice", Some("acct-alice"), 5)]);

    let first = w.run_pass(false).await.unwrap();
    assert_eq!(first.updated, 1);
    let calls = ledger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name(), "stores.bump_reputation");
    assert_eq!(calls[0].args, json!({"key": "acct-alice", "delta": {"sales": "2"}}));

    let second = w.run_pass(false).await.unwrap();
    assert_eq!(second.updated, 0);
    assert_eq!(second.noops, 1);
    assert_eq!(ledger.calls().len(), 1);
    assert!(matches!(
        &second.details[0].outcome,
        EntryOutcome::Noop { reason, .. } if reason == NOOP_UP_TO_DATE
    ));
}

#[tokio::test]
async fn ledger_ahead_of_truth_is_left_alone() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-bob", json!({"sales": "9"}));
    let w = worker(&ledger, vec![truth("bob", Some("acct-bob"), 4)]);

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.noops, 1);
    assert!(ledger.calls().is_empty());
}

#[tokio::test]
async fn hex_and_wide_counters_are_read_before_diffing() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(
        STORAGE,
        "acct-jo",
        json!({"sales": "0x5", "volume": 100_000_000_000_000_000_000.0}),
    );
    let w = worker(&ledger, vec![truth("jo", Some("acct-jo"), 1)]);

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.noops, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(ledger.submission_count(), 0);
}

#[tokio::test]
async fn unreadable_counter_is_an_entry_error_not_a_bump() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-kai", json!({"sales": "many"}));
    ledger.set_storage(STORAGE, "acct-lou", json!({}));
    let w = worker(
        &ledger,
        vec![truth("kai", Some("acct-kai"), 2), truth("lou", Some("acct-lou"), 1)],
    );

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.updated, 1);
    assert!(matches!(
        &report.details[0].outcome,
        EntryOutcome::Error { reason } if reason.contains("reputation.sales")
    ));
    assert_eq!(ledger.calls().len(), 1);
    assert_eq!(ledger.calls()[0].args["key"], json!("acct-lou"));
}

#[tokio::test]
async fn skips_users_without_account_or_ledger_record() {
    let ledger = Arc::new(PaperLedger::new());
    let w = worker(
        &ledger,
        vec![truth("carol", None, 2), truth("dave", Some("acct-dave"), 2)],
    );

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.skipped, 2);
    let reasons: Vec<_> = report
        .details
        .iter()
        .map(|d| match &d.outcome {
            EntryOutcome::Skipped { reason } => reason.as_str(),
            _ => "",
        })
        .collect();
    assert_eq!(reasons, vec![SKIP_MISSING_ACCOUNT, SKIP_NOT_ON_LEDGER]);
    assert_eq!(ledger.submission_count(), 0);
}

#[tokio::test]
async fn dry_run_reports_delta_without_submitting() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-erin", json!({}));
    let w = worker(&ledger, vec![truth("erin", Some("acct-erin"), 1)]);

    let report = w.run_pass(true).await.unwrap();
    assert_eq!(report.noops, 1);
    match &report.details[0].outcome {
        EntryOutcome::Noop { reason, delta } => {
            assert_eq!(reason, NOOP_DRY_RUN);
            assert_eq!(delta.map(|d| d.sales), Some(1));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(ledger.calls().is_empty());
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-finn", json!({"sales": 0}));
    ledger.fail_next(LedgerError::Transport("connection reset".into()));
    let w = worker(&ledger, vec![truth("finn", Some("acct-finn"), 1)]);

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(ledger.calls().len(), 1);
}

#[tokio::test]
async fn rejected_bump_counts_as_error_and_pass_continues() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-gus", json!({}));
    ledger.set_storage(STORAGE, "acct-hal", json!({}));
    ledger.fail_next(LedgerError::Rejected {
        reason: "stores.BadOrigin".into(),
    });
    let w = worker(
        &ledger,
        vec![truth("gus", Some("acct-gus"), 1), truth("hal", Some("acct-hal"), 1)],
    );

    let report = w.run_pass(false).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.updated, 1);
    assert!(matches!(
        &report.details[0].outcome,
        EntryOutcome::Error { reason } if reason.contains("stores.BadOrigin")
    ));
}

#[tokio::test]
async fn targeted_reconcile_reports_unknown_users() {
    let ledger = Arc::new(PaperLedger::new());
    ledger.set_storage(STORAGE, "acct-ivy", json!({}));
    let w = worker(&ledger, vec![truth("ivy", Some("acct-ivy"), 3)]);

    let report = w
        .reconcile_users(&["ivy".to_string(), "ghost".to_string()])
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        ledger.calls()[0].args["delta"],
        json!({"sales": "3"})
    );
}
