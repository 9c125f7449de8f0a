//! An order's event chain verifies when untouched and pinpoints tampering.

use chrono::{TimeZone, Utc};
use ptx_audit::{verify_chain, EventChain, OrderEventRecord, VerifyResult, SYSTEM_AUTHOR};
use serde_json::json;
use uuid::Uuid;

fn build_chain(order_id: Uuid) -> Vec<OrderEventRecord> {
    let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let mut chain = EventChain::new(order_id);
    vec![
        chain
            .append("CREATED", "taker-1", None, json!({"amount_asset": "100"}), ts)
            .unwrap(),
        chain
            .append("ESCROW_CONFIRMED", "maker-1", Some("0xaaa"), json!({}), ts)
            .unwrap(),
        chain
            .append("PAID_MARKED", "taker-1", None, json!({"proof_refs": ["r1"]}), ts)
            .unwrap(),
        chain
            .append("RELEASED", "maker-1", Some("0xbbb"), json!({}), ts)
            .unwrap(),
    ]
}

#[test]
fn untampered_chain_verifies() {
    let events = build_chain(Uuid::new_v4());
    assert_eq!(verify_chain(&events).unwrap(), VerifyResult::Valid { events: 4 });
    assert!(events.iter().all(|e| e.author == SYSTEM_AUTHOR));
    assert_eq!(events[1].hash_prev, events[0].hash_self);
}

#[test]
fn edited_payload_is_detected_at_its_seq() {
    let mut events = build_chain(Uuid::new_v4());
    events[2].payload = json!({"proof_refs": ["forged"]});

    match verify_chain(&events).unwrap() {
        VerifyResult::Broken { seq, reason } => {
            assert_eq!(seq, 2);
            assert!(reason.contains("hash_self"), "got: {reason}");
        }
        other => panic!("expected Broken, got {other:?}"),
    }
}

#[test]
fn removed_event_is_detected() {
    let mut events = build_chain(Uuid::new_v4());
    events.remove(1);
    assert!(matches!(
        verify_chain(&events).unwrap(),
        VerifyResult::Broken { seq: 2, .. }
    ));
}

#[test]
fn resumed_chain_continues_and_ids_are_deterministic() {
    let order_id = Uuid::new_v4();
    let a = build_chain(order_id);
    let b = build_chain(order_id);
    assert_eq!(
        a.iter().map(|e| e.event_id).collect::<Vec<_>>(),
        b.iter().map(|e| e.event_id).collect::<Vec<_>>()
    );

    let mut resumed = EventChain::resume(order_id, a.last());
    assert_eq!(resumed.seq(), 4);
    let next = resumed
        .append("REVIEWED", "taker-1", None, json!({"stars": 5}), Utc::now())
        .unwrap();

    let mut all = a.clone();
    all.push(next);
    assert_eq!(verify_chain(&all).unwrap(), VerifyResult::Valid { events: 5 });
}
