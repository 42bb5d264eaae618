//! Integration tests for the hedge lifecycle state machine.
//!
//! Covers open sizing, idempotency, partial-fill reconciliation, the
//! monitor exits (take-profit, stop-loss, spread collapse, max hold), and
//! close failure escalation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use hedge_bot::config::HedgeParams;
use hedge_bot::detector::ArbOpportunity;
use hedge_bot::events::{EngineEvent, EventBus};
use hedge_bot::hedge::{hedge_key, CloseReason, HedgeManager, HedgeState, OpenOutcome};
use hedge_bot::risk::PnlTracker;
use hedge_bot::state::ControlFlags;
use hedge_bot::store::MarketStore;
use hedge_bot::venue::{MockVenue, MockVenueConfig, VenueAdapter, VenueError};
use hedge_common::{FundingObservation, Side};

// ============================================================================
// Fixtures
// ============================================================================

struct Rig {
    manager: HedgeManager,
    x: Arc<MockVenue>,
    y: Arc<MockVenue>,
    flags: Arc<ControlFlags>,
    bus: EventBus,
    pnl: Arc<PnlTracker>,
}

fn rig_with_params(params: HedgeParams) -> Rig {
    let x = Arc::new(MockVenue::new(MockVenueConfig::new("x")));
    let y = Arc::new(MockVenue::new(MockVenueConfig::new("y")));
    x.set_balances(dec!(1000), dec!(1000));
    y.set_balances(dec!(1000), dec!(1000));
    x.set_mark_price("BTCUSDT", dec!(50000));
    y.set_mark_price("BTCUSDT", dec!(50000));

    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    venues.insert("x".to_string(), x.clone());
    venues.insert("y".to_string(), y.clone());

    let bus = EventBus::new(256);
    let flags = Arc::new(ControlFlags::new(true));
    let pnl = Arc::new(PnlTracker::new(bus.clone()));
    let manager = HedgeManager::new(
        venues,
        params,
        dec!(0.0005),
        flags.clone(),
        bus.clone(),
        pnl.clone(),
    );

    Rig {
        manager,
        x,
        y,
        flags,
        bus,
        pnl,
    }
}

fn rig() -> Rig {
    rig_with_params(HedgeParams::default())
}

fn btc_opportunity() -> ArbOpportunity {
    ArbOpportunity {
        symbol: "BTCUSDT".to_string(),
        long_venue: "x".to_string(),
        short_venue: "y".to_string(),
        long_rate: dec!(-0.001),
        short_rate: dec!(0.0015),
        spread: dec!(0.0025),
        detected_at: Utc::now(),
    }
}

fn store_with_wide_spread() -> MarketStore {
    let store = MarketStore::default();
    store.ingest_funding(FundingObservation::new("x", "BTCUSDT", dec!(-0.001), Utc::now()));
    store.ingest_funding(FundingObservation::new("y", "BTCUSDT", dec!(0.0015), Utc::now()));
    store
}

// ============================================================================
// Open
// ============================================================================

#[tokio::test]
async fn open_sizes_both_legs_from_min_balance() {
    let rig = rig();
    let outcome = rig.manager.try_open(&btc_opportunity()).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Opened);

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Active);
    // min(1000, 1000) * 0.5 = 500 USD; 500 / 50000 = 0.01 per leg.
    assert_eq!(hedge.size, dec!(0.01));
    assert_eq!(hedge.long_qty, dec!(0.01));
    assert_eq!(hedge.short_qty, dec!(0.01));
    assert_eq!(hedge.entry_long_price, dec!(50000));
    assert_eq!(hedge.entry_short_price, dec!(50000));

    let x_orders = rig.x.orders();
    let y_orders = rig.y.orders();
    assert_eq!(x_orders.len(), 1);
    assert_eq!(x_orders[0].side, Side::Buy);
    assert_eq!(x_orders[0].qty, dec!(0.01));
    assert_eq!(y_orders.len(), 1);
    assert_eq!(y_orders[0].side, Side::Sell);
    assert_eq!(y_orders[0].qty, dec!(0.01));
}

#[tokio::test]
async fn open_emits_hedge_opened_event() {
    let rig = rig();
    let mut events = rig.bus.subscribe();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    let mut opened = false;
    while let Some(event) = events.try_recv() {
        if let EngineEvent::HedgeOpened { size, long_venue, short_venue, .. } = event {
            assert_eq!(size, dec!(0.01));
            assert_eq!(long_venue, "x");
            assert_eq!(short_venue, "y");
            opened = true;
        }
    }
    assert!(opened);
}

#[tokio::test]
async fn second_open_for_same_key_is_noop() {
    let rig = rig();
    assert_eq!(
        rig.manager.try_open(&btc_opportunity()).await.unwrap(),
        OpenOutcome::Opened
    );
    assert_eq!(
        rig.manager.try_open(&btc_opportunity()).await.unwrap(),
        OpenOutcome::Duplicate
    );

    // No new orders on either venue.
    assert_eq!(rig.x.orders().len(), 1);
    assert_eq!(rig.y.orders().len(), 1);
}

#[tokio::test]
async fn concurrent_opens_race_to_one_winner() {
    let rig = rig();
    let opp = btc_opportunity();

    let (a, b) = tokio::join!(rig.manager.try_open(&opp), rig.manager.try_open(&opp));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&OpenOutcome::Opened));
    assert!(outcomes.contains(&OpenOutcome::Duplicate));
    assert_eq!(rig.x.orders().len(), 1);
}

#[tokio::test]
async fn open_disabled_reverts_to_no_state() {
    let rig = rig();
    rig.flags.disable_hedging();

    let outcome = rig.manager.try_open(&btc_opportunity()).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Disabled);
    assert!(rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).is_none());
    assert!(rig.x.orders().is_empty());
    assert!(rig.y.orders().is_empty());
}

#[tokio::test]
async fn no_orders_after_emergency_stop() {
    let rig = rig();
    rig.flags.set_emergency_stop();

    let outcome = rig.manager.try_open(&btc_opportunity()).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Disabled);
    assert!(rig.x.orders().is_empty());
    assert!(rig.y.orders().is_empty());
}

#[tokio::test]
async fn zero_balance_fails_with_insufficient_funds() {
    let rig = rig();
    rig.y.set_balances(dec!(1000), dec!(0));

    let err = rig.manager.try_open(&btc_opportunity()).await.unwrap_err();
    assert!(err.to_string().contains("insufficient funds"));
    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Failed);
    assert!(rig.x.orders().is_empty());
}

// ============================================================================
// Partial fill reconciliation
// ============================================================================

#[tokio::test]
async fn partial_fill_is_reconciled_and_failed() {
    let rig = rig();
    rig.y.fail_orders(
        "BTCUSDT",
        Side::Sell,
        VenueError::Exchange {
            code: -2010,
            msg: "rejected".into(),
        },
    );
    let mut events = rig.bus.subscribe();

    let outcome = rig.manager.try_open(&btc_opportunity()).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Failed { partial_fill: true });

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Failed);

    // The filled long leg was unwound: buy 0.01 then close-sell 0.01.
    let x_orders = rig.x.orders();
    assert_eq!(x_orders.len(), 2);
    assert_eq!(x_orders[0].side, Side::Buy);
    assert_eq!(x_orders[1].side, Side::Sell);
    assert_eq!(x_orders[1].qty, dec!(0.01));
    assert!(x_orders[1].is_close);
    // The mock netted the position back to flat.
    assert!(rig.x.get_positions().await.unwrap().is_empty());

    let mut failed = false;
    while let Some(event) = events.try_recv() {
        if let EngineEvent::HedgeFailed { partial_fill, .. } = event {
            assert!(partial_fill);
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn both_legs_failing_is_failed_without_reconcile() {
    let rig = rig();
    let reject = VenueError::Exchange {
        code: -2010,
        msg: "rejected".into(),
    };
    rig.x.fail_orders("BTCUSDT", Side::Buy, reject.clone());
    rig.y.fail_orders("BTCUSDT", Side::Sell, reject);

    let outcome = rig.manager.try_open(&btc_opportunity()).await.unwrap();
    assert_eq!(
        outcome,
        OpenOutcome::Failed {
            partial_fill: false
        }
    );
    assert!(rig.x.orders().is_empty());
    assert!(rig.y.orders().is_empty());
}

// ============================================================================
// Monitor exits
// ============================================================================

#[tokio::test]
async fn take_profit_closes_both_legs() {
    let rig = rig_with_params(HedgeParams {
        take_profit: dec!(0.01),
        ..HedgeParams::default()
    });
    let store = store_with_wide_spread();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    // Long leg rallies: ratio_change ~= 0.0099 >= 0.01 * 0.5.
    rig.x.set_mark_price("BTCUSDT", dec!(50500));
    rig.y.set_mark_price("BTCUSDT", dec!(50000));
    rig.manager.monitor_once(&store).await;

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Closed);
    assert_eq!(hedge.close_reason, Some(CloseReason::TakeProfit));
    // (50500 - 50000 + 50000 - 50000) * 0.01 = 5
    assert_eq!(hedge.realized_pnl, Some(dec!(5.00)));
    assert_eq!(rig.pnl.snapshot().daily, dec!(5.00));

    // Leg symmetry: a close order on each venue.
    let x_close: Vec<_> = rig.x.orders().into_iter().filter(|o| o.is_close).collect();
    let y_close: Vec<_> = rig.y.orders().into_iter().filter(|o| o.is_close).collect();
    assert_eq!(x_close.len(), 1);
    assert_eq!(x_close[0].side, Side::Sell);
    assert_eq!(y_close.len(), 1);
    assert_eq!(y_close[0].side, Side::Buy);
}

#[tokio::test]
async fn stop_loss_closes_when_spread_moves_against() {
    let rig = rig();
    let store = store_with_wide_spread();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    // Short leg rallies 6%: ratio_change = -0.06 <= -0.05.
    rig.y.set_mark_price("BTCUSDT", dec!(53000));
    rig.manager.monitor_once(&store).await;

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Closed);
    assert_eq!(hedge.close_reason, Some(CloseReason::StopLoss));
}

#[tokio::test]
async fn collapsed_funding_spread_closes_hedge() {
    let rig = rig();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    // Rates converge below the warning threshold.
    let store = MarketStore::default();
    store.ingest_funding(FundingObservation::new("x", "BTCUSDT", dec!(0.0001), Utc::now()));
    store.ingest_funding(FundingObservation::new("y", "BTCUSDT", dec!(0.0002), Utc::now()));
    rig.manager.monitor_once(&store).await;

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Closed);
    assert_eq!(hedge.close_reason, Some(CloseReason::SpreadCollapsed));
}

#[tokio::test]
async fn quiet_market_only_updates_estimates() {
    let rig = rig();
    let store = store_with_wide_spread();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    rig.x.set_mark_price("BTCUSDT", dec!(50050));
    rig.manager.monitor_once(&store).await;

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Active);
    // (50050 - 50000 + 50000 - 50000) * 0.01 = 0.5
    assert_eq!(hedge.unrealized_pnl, dec!(0.5000));
}

#[tokio::test]
async fn max_hold_forces_close() {
    let rig = rig_with_params(HedgeParams {
        max_hold: Duration::from_millis(50),
        ..HedgeParams::default()
    });
    let store = store_with_wide_spread();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    rig.manager.monitor_once(&store).await;

    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Closed);
    assert_eq!(hedge.close_reason, Some(CloseReason::MaxHold));
}

// ============================================================================
// Close failure escalation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn close_leg_failure_escalates_to_close_failed() {
    let rig = rig();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();
    let key = hedge_key("BTCUSDT", "x", "y");

    // The short venue rejects its close leg persistently.
    rig.y.fail_orders(
        "BTCUSDT",
        Side::Buy,
        VenueError::Network("venue down".into()),
    );
    let mut events = rig.bus.subscribe();

    rig.manager.close(&key, CloseReason::StopLoss).await.unwrap();

    let hedge = rig.manager.get(&key).unwrap();
    assert_eq!(hedge.state, HedgeState::CloseFailed);

    // The long close went through; the short close was retried then gave up.
    let x_close: Vec<_> = rig.x.orders().into_iter().filter(|o| o.is_close).collect();
    assert_eq!(x_close.len(), 1);

    let mut alerted = false;
    while let Some(event) = events.try_recv() {
        if let EngineEvent::HedgeCloseFailed { error, .. } = event {
            assert!(error.contains("short leg"));
            alerted = true;
        }
    }
    assert!(alerted);
}

#[tokio::test]
async fn close_is_idempotent_per_key() {
    let rig = rig();
    rig.manager.try_open(&btc_opportunity()).await.unwrap();
    let key = hedge_key("BTCUSDT", "x", "y");

    rig.manager.close(&key, CloseReason::TakeProfit).await.unwrap();
    let closes_after_first = rig.x.orders().into_iter().filter(|o| o.is_close).count();

    // Second close on a terminal record: no further orders.
    rig.manager.close(&key, CloseReason::StopLoss).await.unwrap();
    let closes_after_second = rig.x.orders().into_iter().filter(|o| o.is_close).count();
    assert_eq!(closes_after_first, closes_after_second);
}

// ============================================================================
// Terminal keys can be reopened
// ============================================================================

#[tokio::test]
async fn failed_key_can_be_retried_later() {
    let rig = rig();
    rig.y.fail_orders(
        "BTCUSDT",
        Side::Sell,
        VenueError::Exchange {
            code: -2010,
            msg: "rejected".into(),
        },
    );
    assert_eq!(
        rig.manager.try_open(&btc_opportunity()).await.unwrap(),
        OpenOutcome::Failed { partial_fill: true }
    );

    // Venue recovers; the terminal record is superseded by a fresh open.
    rig.y.clear_order_failures();
    assert_eq!(
        rig.manager.try_open(&btc_opportunity()).await.unwrap(),
        OpenOutcome::Opened
    );
    let hedge = rig.manager.get(&hedge_key("BTCUSDT", "x", "y")).unwrap();
    assert_eq!(hedge.state, HedgeState::Active);
}
