//! Scenario: order guards.
//!
//! Authorization is checked before state, so a stranger gets `Forbidden`
//! whatever the order's status. Transitions outside the lifecycle graph are
//! `InvalidState` and write nothing. Expiry only touches orders that never
//! reached custody; overdue funded orders are reported instead.

use ptx_escrow::EscrowFunding;
use ptx_orders::{CreateOrder, OrderAmount, OrderError, CODE_INVALID_STATE};
use ptx_schemas::{OrderStatus, TradeSide};
use ptx_testkit::{minutes_from_now, Harness, MAKER, MAKER_ACCOUNT, TAKER, TAKER_ACCOUNT};
use rust_decimal::Decimal;
use uuid::Uuid;

const STRANGER: &str = "mallory";

async fn open_order(h: &Harness, fiat: i64) -> Uuid {
    let offer_id = h.native_offer(TradeSide::SellAsset, Decimal::from(2));
    h.orders
        .create_order(
            TAKER,
            CreateOrder {
                offer_id,
                taker_account: TAKER_ACCOUNT.into(),
                amount: OrderAmount::Fiat(Decimal::from(fiat)),
            },
        )
        .await
        .unwrap()
        .id
}

async fn escrowed_order(h: &Harness) -> Uuid {
    h.fund_native(MAKER_ACCOUNT, 1_000);
    let id = open_order(h, 200).await;
    h.orders
        .confirm_escrow(id, MAKER, EscrowFunding::Direct)
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn strangers_are_forbidden_in_every_state() {
    let h = Harness::default();
    let id = escrowed_order(&h).await;

    let err = h.orders.mark_paid(id, STRANGER, vec![]).await.unwrap_err();
    assert!(matches!(err, OrderError::Forbidden { .. }), "{err:?}");
    assert_eq!(err.code(), "FORBIDDEN");

    // Escrow is already confirmed, yet the answer is still Forbidden.
    let err = h
        .orders
        .confirm_escrow(id, STRANGER, EscrowFunding::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Forbidden { .. }), "{err:?}");

    let err = h.orders.get_order(id, STRANGER).await.unwrap_err();
    assert!(matches!(err, OrderError::Forbidden { .. }), "{err:?}");

    // Only the escrower (fiat receiver) may confirm receipt.
    h.orders.mark_paid(id, TAKER, vec![]).await.unwrap();
    let err = h.orders.confirm_received(id, TAKER).await.unwrap_err();
    assert!(matches!(err, OrderError::Forbidden { .. }), "{err:?}");
    assert_eq!(
        h.orders.get_order(id, TAKER).await.unwrap().status,
        OrderStatus::AwaitingConfirmation
    );
}

#[tokio::test]
async fn illegal_transitions_are_invalid_state_and_write_nothing() {
    let h = Harness::default();
    let id = open_order(&h, 200).await;

    let err = h.orders.confirm_received(id, MAKER).await.unwrap_err();
    match &err {
        OrderError::InvalidState { actual, code, .. } => {
            assert_eq!(*actual, OrderStatus::AwaitingEscrow);
            assert_eq!(*code, CODE_INVALID_STATE);
        }
        other => panic!("expected InvalidState, got {other:?}"),
    }

    let err = h.orders.open_dispute(id, TAKER, "no escrow yet").await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidState { .. }), "{err:?}");

    let cancelled = h.orders.cancel_order(id, TAKER).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    // Terminal: nothing moves it again.
    let err = h.orders.cancel_order(id, MAKER).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidState { .. }), "{err:?}");
    let events = h.orders.get_order_events(id, MAKER).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, "CANCELLED");
}

#[tokio::test]
async fn status_changed_by_another_writer_blocks_the_escrow_lock() {
    let h = Harness::default();
    h.fund_native(MAKER_ACCOUNT, 1_000);
    let id = open_order(&h, 200).await;
    let before = h.native_balance(MAKER_ACCOUNT);

    // Another process expired the order after we created it.
    let mut stale = h.orders.get_order(id, MAKER).await.unwrap();
    stale.status = OrderStatus::Expired;
    h.store.put_order(stale);

    let err = h
        .orders
        .confirm_escrow(id, MAKER, EscrowFunding::Direct)
        .await
        .unwrap_err();
    match &err {
        OrderError::InvalidState { actual, .. } => assert_eq!(*actual, OrderStatus::Expired),
        other => panic!("expected InvalidState, got {other:?}"),
    }
    assert_eq!(h.native_balance(MAKER_ACCOUNT), before);
    assert!(h.orders.get_order(id, MAKER).await.unwrap().escrow_tx_ref.is_none());
}

#[tokio::test]
async fn dispute_needs_a_reason_and_freezes_the_order() {
    let h = Harness::default();
    let id = escrowed_order(&h).await;

    let err = h.orders.open_dispute(id, TAKER, "   ").await.unwrap_err();
    assert!(matches!(err, OrderError::Validation(_)), "{err:?}");

    let disputed = h
        .orders
        .open_dispute(id, TAKER, "seller unresponsive")
        .await
        .unwrap();
    assert_eq!(disputed.status, OrderStatus::DisputeOpen);

    let err = h.orders.mark_paid(id, TAKER, vec![]).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidState { .. }), "{err:?}");

    let events = h.orders.get_order_events(id, TAKER).await.unwrap();
    assert_eq!(events.last().unwrap().payload["reason"], "seller unresponsive");
}

#[tokio::test]
async fn create_rejects_own_offer_and_out_of_bounds_amounts() {
    let h = Harness::default();
    let offer_id = h.native_offer(TradeSide::SellAsset, Decimal::from(2));

    let own = h
        .orders
        .create_order(
            MAKER,
            CreateOrder {
                offer_id,
                taker_account: MAKER_ACCOUNT.into(),
                amount: OrderAmount::Fiat(Decimal::from(10)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(own, OrderError::Validation(_)), "{own:?}");

    let too_big = h
        .orders
        .create_order(
            TAKER,
            CreateOrder {
                offer_id,
                taker_account: TAKER_ACCOUNT.into(),
                amount: OrderAmount::Fiat(Decimal::from(2_000_000)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(too_big, OrderError::Validation(_)), "{too_big:?}");

    let missing = h
        .orders
        .create_order(
            TAKER,
            CreateOrder {
                offer_id: Uuid::new_v4(),
                taker_account: TAKER_ACCOUNT.into(),
                amount: OrderAmount::Fiat(Decimal::from(10)),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "NOT_FOUND");
}

#[tokio::test]
async fn expiry_sweep_skips_orders_with_funds_in_escrow() {
    let h = Harness::default();
    let waiting = open_order(&h, 100).await;
    let escrowed = escrowed_order(&h).await;

    // Nothing is overdue yet.
    let sweep = h.orders.expire_overdue(chrono::Utc::now()).await.unwrap();
    assert!(sweep.expired.is_empty());

    let sweep = h.orders.expire_overdue(minutes_from_now(60)).await.unwrap();
    assert_eq!(sweep.expired, vec![waiting]);

    let expired = h.orders.get_order(waiting, TAKER).await.unwrap();
    assert_eq!(expired.status, OrderStatus::Expired);
    let events = h.orders.get_order_events(waiting, TAKER).await.unwrap();
    assert_eq!(events.last().unwrap().triggered_by, ptx_audit::SYSTEM_AUTHOR);

    assert_eq!(
        h.orders.get_order(escrowed, TAKER).await.unwrap().status,
        OrderStatus::AwaitingFiatPayment
    );

    // A second sweep finds nothing left to expire.
    let again = h.orders.expire_overdue(minutes_from_now(60)).await.unwrap();
    assert!(again.expired.is_empty());
}

#[tokio::test]
async fn overdue_escrowed_and_disputed_orders_are_reported_as_stranded() {
    let h = Harness::default();
    let escrowed = escrowed_order(&h).await;
    let disputed = escrowed_order(&h).await;
    h.orders
        .open_dispute(disputed, TAKER, "bank transfer bounced")
        .await
        .unwrap();
    let released = escrowed_order(&h).await;
    h.orders.mark_paid(released, TAKER, vec![]).await.unwrap();
    h.orders.confirm_received(released, MAKER).await.unwrap();

    let sweep = h.orders.expire_overdue(chrono::Utc::now()).await.unwrap();
    assert!(sweep.stranded.is_empty());

    let sweep = h.orders.expire_overdue(minutes_from_now(60)).await.unwrap();
    assert!(sweep.expired.is_empty());
    let mut stranded: Vec<(Uuid, OrderStatus)> =
        sweep.stranded.iter().map(|s| (s.id, s.status)).collect();
    stranded.sort_by_key(|(id, _)| *id);
    let mut want = vec![
        (escrowed, OrderStatus::AwaitingFiatPayment),
        (disputed, OrderStatus::DisputeOpen),
    ];
    want.sort_by_key(|(id, _)| *id);
    assert_eq!(stranded, want);
    assert!(sweep.stranded.iter().all(|s| s.escrow_tx_ref.is_some()));

    // Reported, never moved.
    assert_eq!(
        h.orders.get_order(disputed, TAKER).await.unwrap().status,
        OrderStatus::DisputeOpen
    );
}

#[tokio::test]
async fn reviews_require_release_and_are_one_per_author() {
    let h = Harness::default();
    let id = escrowed_order(&h).await;

    let early = h
        .orders
        .submit_review(id, TAKER, 5, None)
        .await
        .unwrap_err();
    assert!(matches!(early, OrderError::InvalidState { .. }), "{early:?}");

    h.orders.mark_paid(id, TAKER, vec![]).await.unwrap();
    h.orders.confirm_received(id, MAKER).await.unwrap();

    let bad_stars = h.orders.submit_review(id, TAKER, 6, None).await.unwrap_err();
    assert!(matches!(bad_stars, OrderError::Validation(_)), "{bad_stars:?}");

    let review = h
        .orders
        .submit_review(id, TAKER, 4, Some(" smooth trade ".into()))
        .await
        .unwrap();
    assert_eq!(review.target_id, MAKER);
    assert_eq!(review.comment.as_deref(), Some("smooth trade"));

    let dup = h.orders.submit_review(id, TAKER, 5, None).await.unwrap_err();
    assert!(matches!(dup, OrderError::Validation(_)), "{dup:?}");

    h.orders.submit_review(id, MAKER, 5, None).await.unwrap();
    assert_eq!(h.store.reviews().len(), 2);

    let stranger = h.orders.submit_review(id, STRANGER, 1, None).await.unwrap_err();
    assert!(matches!(stranger, OrderError::Forbidden { .. }), "{stranger:?}");
}
