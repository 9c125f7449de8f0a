//! Scenario: council, democracy and treasury events are projected into the
//! local store once, in any replay order the stream may produce.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ptx_ledger::{EventBody, LedgerEvent};
use ptx_reconcile::governance::{
    GovernanceStore, HandleOutcome, MotionStatus, ReferendumStatus, RequestStatus,
    TreasuryRequest, PREIMAGE_STORAGE,
};
use ptx_schemas::MinorUnits;
use ptx_testkit::{Harness, TREASURY};
use serde_json::json;
use uuid::Uuid;

const MOTION: &str = "0xmotion01";
const BENEFICIARY: &str = "5Grantee";

fn ev(height: u64, tx_ref: &str, body: EventBody) -> LedgerEvent {
    LedgerEvent {
        height,
        tx_ref: tx_ref.to_string(),
        body,
    }
}

fn request(amount: MinorUnits) -> TreasuryRequest {
    let now = Utc::now();
    TreasuryRequest {
        id: Uuid::new_v4(),
        title: "Translate the docs".into(),
        beneficiary: BENEFICIARY.into(),
        amount,
        content_hash: MOTION.into(),
        status: RequestStatus::Submitted,
        motion_hash: None,
        proposal_index: None,
        paid_tx_ref: None,
        created_at: now,
        updated_at: now,
    }
}

fn council_events(yes: u32, no: u32) -> Vec<LedgerEvent> {
    vec![
        ev(
            10,
            "0xa",
            EventBody::CouncilProposed {
                proposer: "5Alice".into(),
                proposal_index: 3,
                motion_hash: MOTION.into(),
                threshold: 2,
            },
        ),
        ev(
            11,
            "0xb",
            EventBody::CouncilVoted {
                voter: "5Alice".into(),
                motion_hash: MOTION.into(),
                approve: true,
                yes: 1,
                no: 0,
            },
        ),
        ev(
            12,
            "0xc",
            EventBody::CouncilVoted {
                voter: "5Bob".into(),
                motion_hash: MOTION.into(),
                approve: yes > 1,
                yes,
                no,
            },
        ),
        ev(
            13,
            "0xd",
            EventBody::CouncilClosed {
                motion_hash: MOTION.into(),
                yes,
                no,
            },
        ),
    ]
}

#[tokio::test]
async fn approved_motion_pays_out_the_linked_request() {
    let h = Harness::default();
    let amount = MinorUnits::from_units(250);
    let req = request(amount);
    h.store.insert_request(&req).await.unwrap();

    for e in council_events(2, 0) {
        assert_eq!(h.governance.handle_event(&e).await.unwrap(), HandleOutcome::Applied);
    }
    let stored = h.store.fetch_request(req.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Approved);
    assert_eq!(stored.motion_hash.as_deref(), Some(MOTION));
    assert_eq!(stored.proposal_index, Some(3));

    let motion = h.store.fetch_motion(MOTION).await.unwrap().unwrap();
    assert_eq!(motion.status, MotionStatus::Approved);
    assert_eq!((motion.yes, motion.no), (2, 0));
    assert_eq!(h.store.council_votes(MOTION).len(), 2);

    // A transfer out of some other account is not a payout.
    let stray = ev(
        14,
        "0xe",
        EventBody::BalanceTransfer {
            from: "5Someone".into(),
            to: BENEFICIARY.into(),
            amount,
        },
    );
    assert_eq!(h.governance.handle_event(&stray).await.unwrap(), HandleOutcome::Ignored);

    let payout = ev(
        15,
        "0xf",
        EventBody::BalanceTransfer {
            from: TREASURY.into(),
            to: BENEFICIARY.into(),
            amount,
        },
    );
    assert_eq!(h.governance.handle_event(&payout).await.unwrap(), HandleOutcome::Applied);
    let paid = h.store.fetch_request(req.id).await.unwrap().unwrap();
    assert_eq!(paid.status, RequestStatus::PaidOut);
    assert_eq!(paid.paid_tx_ref.as_deref(), Some("0xf"));
}

#[tokio::test]
async fn replayed_events_are_duplicates_and_change_nothing() {
    let h = Harness::default();
    let req = request(MinorUnits::from_units(10));
    h.store.insert_request(&req).await.unwrap();

    let events = council_events(1, 1);
    for e in &events {
        h.governance.handle_event(e).await.unwrap();
    }
    let after_first = h.store.fetch_request(req.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, RequestStatus::Rejected);
    let recorded = h.store.governance_events().len();

    for e in &events {
        assert_eq!(h.governance.handle_event(e).await.unwrap(), HandleOutcome::Duplicate);
    }
    assert_eq!(h.store.governance_events().len(), recorded);
    assert_eq!(h.store.fetch_request(req.id).await.unwrap().unwrap(), after_first);
    assert_eq!(
        h.store.fetch_motion(MOTION).await.unwrap().unwrap().status,
        MotionStatus::Rejected
    );
}

#[tokio::test]
async fn executed_motion_marks_the_request_paid() {
    let h = Harness::default();
    let req = request(MinorUnits::from_units(10));
    h.store.insert_request(&req).await.unwrap();
    for e in council_events(2, 0) {
        h.governance.handle_event(&e).await.unwrap();
    }

    let executed = ev(
        20,
        "0x20",
        EventBody::CouncilExecuted {
            motion_hash: MOTION.into(),
            ok: true,
            error: None,
        },
    );
    h.governance.handle_event(&executed).await.unwrap();

    assert_eq!(
        h.store.fetch_request(req.id).await.unwrap().unwrap().status,
        RequestStatus::PaidOut
    );
    assert_eq!(
        h.store.fetch_motion(MOTION).await.unwrap().unwrap().status,
        MotionStatus::Executed
    );
}

#[tokio::test]
async fn referendum_carries_preimage_metadata_and_never_regresses() {
    let h = Harness::default();
    h.ledger.set_storage(
        PREIMAGE_STORAGE,
        "0xpre",
        json!({"v": 1, "title": "Lower fees", "description": "Halve the fee", "proposer": "5Carol"}),
    );

    let events = [
        ev(
            30,
            "0x30",
            EventBody::DemocracyProposed {
                proposal_index: 1,
                proposer: "5Carol".into(),
                deposit: MinorUnits::from_units(5),
            },
        ),
        ev(
            31,
            "0x31",
            EventBody::DemocracyStarted {
                ref_index: 4,
                threshold: "SuperMajorityApprove".into(),
                preimage_hash: Some("0xpre".into()),
            },
        ),
        ev(
            32,
            "0x32",
            EventBody::DemocracyVoted {
                voter: "5Dave".into(),
                ref_index: 4,
                aye: true,
                balance: MinorUnits::from_units(70),
            },
        ),
        ev(
            33,
            "0x33",
            EventBody::DemocracyVoted {
                voter: "5Erin".into(),
                ref_index: 4,
                aye: false,
                balance: MinorUnits::from_units(30),
            },
        ),
        ev(34, "0x34", EventBody::DemocracyPassed { ref_index: 4 }),
        ev(35, "0x35", EventBody::DemocracyExecuted { ref_index: 4, ok: true }),
    ];
    for e in &events {
        h.governance.handle_event(e).await.unwrap();
    }

    let r = h.store.fetch_referendum(4).await.unwrap().unwrap();
    assert_eq!(r.status, ReferendumStatus::Executed);
    assert_eq!(r.title.as_deref(), Some("Lower fees"));
    assert_eq!(r.proposer.as_deref(), Some("5Carol"));
    assert_eq!(
        h.store.referendum_tally(4).await.unwrap(),
        (MinorUnits::from_units(70), MinorUnits::from_units(30))
    );
    assert_eq!(h.store.proposal(1).unwrap().deposit, MinorUnits::from_units(5));

    // A late NotPassed for the same referendum is a new (subject, kind) but
    // must not move the status backwards.
    let late = ev(36, "0x36", EventBody::DemocracyNotPassed { ref_index: 4 });
    h.governance.handle_event(&late).await.unwrap();
    assert_eq!(
        h.store.fetch_referendum(4).await.unwrap().unwrap().status,
        ReferendumStatus::Executed
    );
}

#[tokio::test]
async fn malformed_preimage_leaves_metadata_empty() {
    let h = Harness::default();
    h.ledger
        .set_storage(PREIMAGE_STORAGE, "0xbad", json!({"v": 2, "title": "x"}));

    let started = ev(
        40,
        "0x40",
        EventBody::DemocracyStarted {
            ref_index: 9,
            threshold: "SimpleMajority".into(),
            preimage_hash: Some("0xbad".into()),
        },
    );
    h.governance.handle_event(&started).await.unwrap();
    let r = h.store.fetch_referendum(9).await.unwrap().unwrap();
    assert_eq!(r.status, ReferendumStatus::Started);
    assert_eq!(r.title, None);
    assert_eq!(r.preimage_hash.as_deref(), Some("0xbad"));
}

#[tokio::test]
async fn sync_loop_resumes_after_the_last_recorded_height() {
    let h = Harness::default();
    let req = request(MinorUnits::from_units(10));
    h.store.insert_request(&req).await.unwrap();

    for e in council_events(2, 0) {
        let LedgerEvent { height, tx_ref, body } = e;
        h.ledger.push_event(height, &tx_ref, body);
    }
    assert_eq!(h.governance.start_height(Some(1)).await.unwrap(), 1);

    let task = tokio::spawn(Arc::clone(&h.governance).run(Some(1), Duration::from_millis(5)));
    let mut waited = 0;
    while h.store.governance_events().len() < 4 && waited < 400 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }
    task.abort();

    assert_eq!(h.store.governance_events().len(), 4);
    assert_eq!(h.governance.start_height(Some(1)).await.unwrap(), 14);
    assert_eq!(
        h.store.fetch_request(req.id).await.unwrap().unwrap().status,
        RequestStatus::Approved
    );
}
