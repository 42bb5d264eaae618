//! Integration tests for the risk engine.
//!
//! Covers exposure computation, the volatility EWMA, de-risk ordering and
//! monotonicity, the zero-total guard, and emergency shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use hedge_bot::config::{HedgeParams, RiskParamsConfig};
use hedge_bot::detector::ArbOpportunity;
use hedge_bot::events::{EngineEvent, EventBus};
use hedge_bot::hedge::{HedgeManager, OpenOutcome};
use hedge_bot::risk::{PnlTracker, RiskEngine};
use hedge_bot::state::ControlFlags;
use hedge_bot::venue::{MockVenue, MockVenueConfig, VenueAdapter};
use hedge_common::{PositionInfo, Side};

// ============================================================================
// Fixtures
// ============================================================================

struct Rig {
    risk: RiskEngine,
    hedges: Arc<HedgeManager>,
    venues: Vec<Arc<MockVenue>>,
    flags: Arc<ControlFlags>,
    bus: EventBus,
}

fn rig(venue_names: &[&str]) -> Rig {
    let venues: Vec<Arc<MockVenue>> = venue_names
        .iter()
        .map(|name| Arc::new(MockVenue::new(MockVenueConfig::new(*name))))
        .collect();
    let venue_map: HashMap<String, Arc<dyn VenueAdapter>> = venues
        .iter()
        .map(|v| (v.name().to_string(), v.clone() as Arc<dyn VenueAdapter>))
        .collect();

    let bus = EventBus::new(256);
    let flags = Arc::new(ControlFlags::new(true));
    let pnl = Arc::new(PnlTracker::new(bus.clone()));
    let hedges = Arc::new(HedgeManager::new(
        venue_map.clone(),
        HedgeParams::default(),
        dec!(0.0005),
        flags.clone(),
        bus.clone(),
        pnl,
    ));
    let risk = RiskEngine::new(
        venue_map,
        RiskParamsConfig::default(),
        HashMap::new(),
        hedges.clone(),
        flags.clone(),
        bus.clone(),
    );

    Rig {
        risk,
        hedges,
        venues,
        flags,
        bus,
    }
}

fn long_position(symbol: &str, size: Decimal, entry: Decimal, mark: Decimal) -> PositionInfo {
    PositionInfo {
        symbol: symbol.to_string(),
        side: Side::Buy,
        size,
        entry_price: entry,
        mark_price: mark,
        unrealized_pnl: (mark - entry) * size,
    }
}

// ============================================================================
// Exposure computation
// ============================================================================

#[tokio::test]
async fn balanced_book_has_zero_ratio() {
    let rig = rig(&["x", "y"]);
    rig.venues[0].set_balances(dec!(500), dec!(500));
    rig.venues[1].set_balances(dec!(500), dec!(500));
    rig.venues[0].set_position(long_position("BTCUSDT", dec!(1), dec!(100), dec!(100)));
    rig.venues[1].set_position(PositionInfo {
        symbol: "ETHUSDT".to_string(),
        side: Side::Sell,
        size: dec!(2),
        entry_price: dec!(50),
        mark_price: dec!(50),
        unrealized_pnl: Decimal::ZERO,
    });

    let snapshot = rig.risk.tick().await;
    // +100 long, -100 short.
    assert_eq!(snapshot.net_value, Decimal::ZERO);
    assert_eq!(snapshot.total_portfolio_value, dec!(1000));
    assert_eq!(snapshot.ratio, Decimal::ZERO);
}

#[tokio::test]
async fn zero_total_value_skips_de_risk() {
    let rig = rig(&["x"]);
    rig.venues[0].set_balances(Decimal::ZERO, Decimal::ZERO);
    rig.venues[0].set_position(long_position("BTCUSDT", dec!(1), dec!(100), dec!(100)));

    let snapshot = rig.risk.tick().await;
    assert_eq!(snapshot.ratio, Decimal::ZERO);
    // No close orders: the mandated zero-total guard.
    assert!(rig.venues[0].orders().is_empty());
}

#[tokio::test]
async fn volatility_ewma_tracks_ratio_changes() {
    let rig = rig(&["x"]);
    rig.venues[0].set_balances(dec!(1000), dec!(1000));
    rig.venues[0].set_position(long_position("AUSDT", dec!(1), dec!(100), dec!(100)));

    // First tick: no previous ratio, instant volatility is zero.
    rig.risk.tick().await;
    assert_eq!(rig.risk.params().volatility, Decimal::ZERO);

    // Position grows: ratio moves 0.1 -> 0.2; EWMA picks up 10% of it.
    rig.venues[0].set_position(long_position("AUSDT", dec!(2), dec!(100), dec!(100)));
    rig.risk.tick().await;
    assert_eq!(rig.risk.params().volatility, dec!(0.01));
}

// ============================================================================
// De-risk
// ============================================================================

#[tokio::test]
async fn de_risk_closes_worst_pnl_first_until_target() {
    let rig = rig(&["x"]);
    rig.venues[0].set_balances(dec!(1000), dec!(1000));
    // Three longs, same notional, distinct unrealized PnL:
    // A: -50, B: +30, C: -10.
    rig.venues[0].set_position(long_position("AUSDT", dec!(1), dec!(150), dec!(100)));
    rig.venues[0].set_position(long_position("BUSDT", dec!(1), dec!(70), dec!(100)));
    rig.venues[0].set_position(long_position("CUSDT", dec!(1), dec!(110), dec!(100)));

    let mut events = rig.bus.subscribe();
    let snapshot = rig.risk.tick().await;
    // net 300 / total 1000 = 0.3 > 0.1.
    assert_eq!(snapshot.ratio, dec!(0.3));

    let mut exceeded = false;
    while let Some(event) = events.try_recv() {
        if let EngineEvent::RiskExceeded { exposure, .. } = event {
            assert_eq!(exposure, dec!(0.3));
            exceeded = true;
        }
    }
    assert!(exceeded);

    // target = (0.3 - 0.8 * 0.1) * 1000 = 220 USD to reduce.
    // Ascending PnL: A (-50) fully, C (-10) fully, B (+30) partially.
    let orders = rig.venues[0].orders();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[0].symbol, "AUSDT");
    assert_eq!(orders[0].qty, dec!(1));
    assert_eq!(orders[0].side, Side::Sell);
    assert_eq!(orders[1].symbol, "CUSDT");
    assert_eq!(orders[1].qty, dec!(1));
    assert_eq!(orders[2].symbol, "BUSDT");
    assert_eq!(orders[2].qty, dec!(0.2));
}

#[tokio::test]
async fn de_risk_brings_exposure_under_target_then_stops() {
    let rig = rig(&["x"]);
    rig.venues[0].set_balances(dec!(1000), dec!(1000));
    rig.venues[0].set_position(long_position("AUSDT", dec!(1), dec!(150), dec!(100)));
    rig.venues[0].set_position(long_position("BUSDT", dec!(1), dec!(70), dec!(100)));
    rig.venues[0].set_position(long_position("CUSDT", dec!(1), dec!(110), dec!(100)));

    rig.risk.tick().await;
    let orders_after_first = rig.venues[0].orders().len();

    // Exposure is now 80 / 1000 = 0.08 <= max_exposure: no further closes.
    let snapshot = rig.risk.tick().await;
    assert_eq!(snapshot.ratio, dec!(0.08));
    assert_eq!(rig.venues[0].orders().len(), orders_after_first);
}

#[tokio::test]
async fn de_risk_only_touches_overweight_side() {
    let rig = rig(&["x"]);
    rig.venues[0].set_balances(dec!(1000), dec!(1000));
    rig.venues[0].set_position(long_position("AUSDT", dec!(3), dec!(100), dec!(100)));
    rig.venues[0].set_position(PositionInfo {
        symbol: "SUSDT".to_string(),
        side: Side::Sell,
        size: dec!(1),
        entry_price: dec!(100),
        mark_price: dec!(100),
        unrealized_pnl: Decimal::ZERO,
    });

    // net = 300 - 100 = 200, ratio 0.2: longs are overweight.
    rig.risk.tick().await;
    let orders = rig.venues[0].orders();
    assert!(!orders.is_empty());
    assert!(orders.iter().all(|o| o.symbol == "AUSDT" && o.side == Side::Sell));
}

// ============================================================================
// Emergency shutdown
// ============================================================================

#[tokio::test]
async fn emergency_shutdown_flattens_everything_and_blocks_opens() {
    let rig = rig(&["x", "y"]);
    for venue in &rig.venues {
        venue.set_balances(dec!(1000), dec!(1000));
        venue.set_mark_price("BTCUSDT", dec!(50000));
    }
    rig.venues[0].set_position(long_position("BTCUSDT", dec!(0.5), dec!(50000), dec!(50000)));

    let mut events = rig.bus.subscribe();
    rig.risk.emergency_shutdown().await;

    assert!(rig.flags.is_emergency_stopped());
    assert!(rig.venues[0].get_positions().await.unwrap().is_empty());

    let mut announced = false;
    while let Some(event) = events.try_recv() {
        if matches!(event, EngineEvent::EmergencyShutdown { .. }) {
            announced = true;
        }
    }
    assert!(announced);

    // Invariant: no new opens after the stop flag.
    let opp = ArbOpportunity {
        symbol: "BTCUSDT".to_string(),
        long_venue: "x".to_string(),
        short_venue: "y".to_string(),
        long_rate: dec!(-0.001),
        short_rate: dec!(0.0015),
        spread: dec!(0.0025),
        detected_at: chrono::Utc::now(),
    };
    let outcome = rig.hedges.try_open(&opp).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Disabled);
    // Only the emergency close order exists on x, nothing new afterwards.
    let non_close: Vec<_> = rig.venues[0]
        .orders()
        .into_iter()
        .filter(|o| !o.is_close)
        .collect();
    assert!(non_close.is_empty());
}
