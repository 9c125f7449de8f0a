//! Scenario: a native-asset trade walks create → escrow → paid → released.
//!
//! The taker buys 100 units at 2 per unit. The maker locks the asset in
//! custody, the taker declares the fiat payment, the maker confirms receipt
//! and custody pays the taker. Every step is recorded in a hash-linked trail.

use ptx_escrow::EscrowFunding;
use ptx_ledger::AssetRef;
use ptx_orders::{CreateOrder, OrderAmount, OrderError, CODE_ESCROW_PENDING};
use ptx_schemas::{MinorUnits, OrderStatus, TradeSide};
use ptx_testkit::{Harness, CUSTODY, MAKER, MAKER_ACCOUNT, TAKER, TAKER_ACCOUNT};
use rust_decimal::Decimal;

fn buy_100(offer_id: uuid::Uuid) -> CreateOrder {
    CreateOrder {
        offer_id,
        taker_account: TAKER_ACCOUNT.to_string(),
        amount: OrderAmount::Asset(Decimal::from(100)),
    }
}

#[tokio::test]
async fn native_trade_settles_to_released_with_release_tx_ref() {
    let h = Harness::default();
    h.fund_native(MAKER_ACCOUNT, 1_000);
    let offer_id = h.native_offer(TradeSide::SellAsset, Decimal::from(2));

    let order = h.orders.create_order(TAKER, buy_100(offer_id)).await.unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingEscrow);
    assert_eq!(order.amount_asset, Decimal::from(100));
    assert_eq!(order.amount_fiat, Decimal::from(200));
    assert_eq!(order.maker_id, MAKER);
    assert_eq!(order.taker_id, TAKER);

    let order = h
        .orders
        .confirm_escrow(order.id, MAKER, EscrowFunding::Direct)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingFiatPayment);
    assert!(order.escrow_tx_ref.is_some());
    assert_eq!(
        h.ledger.balance_of(AssetRef::Native, CUSTODY),
        MinorUnits::from_units(100)
    );

    let order = h
        .orders
        .mark_paid(order.id, TAKER, vec!["bank-ref-1".into(), "  ".into()])
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingConfirmation);
    assert_eq!(order.proof_refs, vec!["bank-ref-1".to_string()]);
    assert!(order.payer_declared_at.is_some());

    let order = h.orders.confirm_received(order.id, MAKER).await.unwrap();
    assert_eq!(order.status, OrderStatus::Released);
    assert!(order.released_tx_ref.is_some());
    assert_ne!(order.released_tx_ref, order.escrow_tx_ref);

    // Lock and release move the same minor-unit amount.
    assert_eq!(h.native_balance(CUSTODY), MinorUnits::ZERO);
    assert_eq!(h.native_balance(TAKER_ACCOUNT), MinorUnits::from_units(100));
    assert_eq!(h.native_balance(MAKER_ACCOUNT), MinorUnits::from_units(900));

    let events = h.orders.get_order_events(order.id, TAKER).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["CREATED", "ESCROW_CONFIRMED", "PAID_MARKED", "RELEASED"]
    );
    for (i, w) in events.windows(2).enumerate() {
        assert_eq!(w[1].seq, i as u64 + 1);
        assert!(w[0].hash_self.is_some());
        assert_eq!(w[1].hash_prev, w[0].hash_self);
    }
    assert_eq!(events[3].tx_ref, order.released_tx_ref);
}

#[tokio::test]
async fn mark_paid_before_escrow_is_escrow_pending_and_changes_nothing() {
    let h = Harness::default();
    let offer_id = h.native_offer(TradeSide::SellAsset, Decimal::from(2));
    let order = h.orders.create_order(TAKER, buy_100(offer_id)).await.unwrap();

    let err = h
        .orders
        .mark_paid(order.id, TAKER, vec!["bank-ref-1".into()])
        .await
        .unwrap_err();
    match err {
        OrderError::InvalidState { actual, code, .. } => {
            assert_eq!(actual, OrderStatus::AwaitingEscrow);
            assert_eq!(code, CODE_ESCROW_PENDING);
        }
        other => panic!("expected InvalidState, got {other:?}"),
    }

    let stored = h.orders.get_order(order.id, TAKER).await.unwrap();
    assert_eq!(stored, order);
    assert_eq!(h.orders.get_order_events(order.id, TAKER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_escrow_lock_leaves_order_awaiting_escrow() {
    let h = Harness::default();
    // Maker holds less than the order amount.
    h.fund_native(MAKER_ACCOUNT, 10);
    let offer_id = h.native_offer(TradeSide::SellAsset, Decimal::from(2));
    let order = h.orders.create_order(TAKER, buy_100(offer_id)).await.unwrap();

    let err = h
        .orders
        .confirm_escrow(order.id, MAKER, EscrowFunding::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Escrow(_)), "{err:?}");

    let stored = h.orders.get_order(order.id, MAKER).await.unwrap();
    assert_eq!(stored.status, OrderStatus::AwaitingEscrow);
    assert_eq!(stored.escrow_tx_ref, None);
    assert_eq!(h.native_balance(CUSTODY), MinorUnits::ZERO);
}

#[tokio::test]
async fn buy_side_offer_makes_the_taker_escrow() {
    let h = Harness::default();
    h.fund_native(TAKER_ACCOUNT, 500);
    let offer_id = h.native_offer(TradeSide::BuyAsset, Decimal::from(2));
    let order = h.orders.create_order(TAKER, buy_100(offer_id)).await.unwrap();

    // The maker is the fiat payer here and may not lock escrow.
    let err = h
        .orders
        .confirm_escrow(order.id, MAKER, EscrowFunding::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Forbidden { .. }), "{err:?}");

    let order = h
        .orders
        .confirm_escrow(order.id, TAKER, EscrowFunding::Direct)
        .await
        .unwrap();
    let order = h.orders.mark_paid(order.id, MAKER, vec![]).await.unwrap();
    let order = h.orders.confirm_received(order.id, TAKER).await.unwrap();

    assert_eq!(order.status, OrderStatus::Released);
    assert_eq!(h.native_balance(MAKER_ACCOUNT), MinorUnits::from_units(100));
    assert_eq!(h.native_balance(TAKER_ACCOUNT), MinorUnits::from_units(400));
}
