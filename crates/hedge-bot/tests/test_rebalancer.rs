//! Integration tests for the cross-venue rebalancer.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal_macros::dec;

use hedge_bot::config::RebalanceParams;
use hedge_bot::rebalance::Rebalancer;
use hedge_bot::venue::{MockVenue, MockVenueConfig, VenueAdapter};

fn rebalancer(venues: &[Arc<MockVenue>]) -> Rebalancer {
    let map: HashMap<String, Arc<dyn VenueAdapter>> = venues
        .iter()
        .map(|v| (v.name().to_string(), v.clone() as Arc<dyn VenueAdapter>))
        .collect();
    Rebalancer::new(map, RebalanceParams::default(), "USDT".to_string())
}

fn venue(name: &str, total: rust_decimal::Decimal) -> Arc<MockVenue> {
    let v = Arc::new(MockVenue::new(MockVenueConfig::new(name)));
    v.set_balances(total, total);
    v
}

#[tokio::test]
async fn donor_tops_up_needy_venue() {
    let x = venue("x", dec!(1300));
    let y = venue("y", dec!(700));
    let rebalancer = rebalancer(&[x.clone(), y.clone()]);

    let transfers = rebalancer.tick().await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].from, "x");
    assert_eq!(transfers[0].to, "y");
    // avg = 1000; donor excess = recipient deficit = 300.
    assert_eq!(transfers[0].amount, dec!(300));

    let recorded = x.transfers();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].dest_venue, "y");
    assert_eq!(recorded[0].amount, dec!(300));
    assert_eq!(recorded[0].asset, "USDT");
}

#[tokio::test]
async fn deviation_below_threshold_is_left_alone() {
    let x = venue("x", dec!(1010));
    let y = venue("y", dec!(990));
    let rebalancer = rebalancer(&[x.clone(), y]);

    // |1010 - 1000| / 2000 = 0.005 < 0.03.
    let transfers = rebalancer.tick().await;
    assert!(transfers.is_empty());
    assert!(x.transfers().is_empty());
}

#[tokio::test]
async fn one_donor_fills_multiple_recipients_worst_first() {
    let x = venue("x", dec!(1500));
    let y = venue("y", dec!(900));
    let z = venue("z", dec!(600));
    let rebalancer = rebalancer(&[x.clone(), y, z]);

    let transfers = rebalancer.tick().await;
    // avg = 1000; x excess 500; deficits: z 400, y 100, largest first.
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[0].to, "z");
    assert_eq!(transfers[0].amount, dec!(400));
    assert_eq!(transfers[1].to, "y");
    assert_eq!(transfers[1].amount, dec!(100));
}

#[tokio::test]
async fn unsupported_transfer_is_skipped() {
    let x = Arc::new(MockVenue::new(
        MockVenueConfig::new("x").with_transfer_supported(false),
    ));
    x.set_balances(dec!(1300), dec!(1300));
    let y = venue("y", dec!(700));
    let rebalancer = rebalancer(&[x.clone(), y.clone()]);

    let transfers = rebalancer.tick().await;
    assert!(transfers.is_empty());
    assert!(x.transfers().is_empty());
    assert!(y.transfers().is_empty());
}

#[tokio::test]
async fn single_venue_is_a_noop() {
    let x = venue("x", dec!(1300));
    let rebalancer = rebalancer(&[x.clone()]);
    assert!(rebalancer.tick().await.is_empty());
}
