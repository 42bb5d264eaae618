//! In-memory venue for tests and paper runs.
//!
//! `MockVenue` implements the full `VenueAdapter` capability set against
//! scripted state: tests set funding rates, mark prices, and balances, then
//! assert on the orders and transfers the engine produced. Failures can be
//! injected per operation to exercise reconciliation paths.
//!
//! Symbol naming follows the adapter contract: the trait surface speaks the
//! engine's canonical symbols, translated through the configured
//! `symbol_map`; the scripting and inspection API speaks the venue-native
//! names, the way real venue data would. With an empty map the two coincide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

use hedge_common::{FundingObservation, OrderRef, PositionInfo, Side, StreamEvent};

use super::{VenueAdapter, VenueError};

/// Configuration for a mock venue.
#[derive(Debug, Clone)]
pub struct MockVenueConfig {
    /// Venue identifier (e.g. "binance").
    pub name: String,
    /// Reported total balance in the quote asset.
    pub total_balance: Decimal,
    /// Reported available balance in the quote asset.
    pub available_balance: Decimal,
    /// Whether `transfer_to` succeeds or fails with `Unsupported`.
    pub transfer_supported: bool,
    /// Canonical engine symbol -> venue-native symbol.
    pub symbol_map: HashMap<String, String>,
}

impl MockVenueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_balance: Decimal::new(10_000, 0),
            available_balance: Decimal::new(10_000, 0),
            transfer_supported: true,
            symbol_map: HashMap::new(),
        }
    }

    pub fn with_symbol_map(mut self, symbol_map: HashMap<String, String>) -> Self {
        self.symbol_map = symbol_map;
        self
    }

    pub fn with_transfer_supported(mut self, supported: bool) -> Self {
        self.transfer_supported = supported;
        self
    }
}

/// A market order recorded by the mock venue, in venue-native terms.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    /// Venue-native symbol the order hit.
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    /// True when the order came in through `close_position`.
    pub is_close: bool,
}

/// A transfer recorded by the mock venue.
#[derive(Debug, Clone)]
pub struct RecordedTransfer {
    pub dest_venue: String,
    pub amount: Decimal,
    pub asset: String,
}

#[derive(Default)]
struct MockState {
    /// Current funding rate per venue-native symbol.
    funding: HashMap<String, Decimal>,
    /// Past observations, already in engine (canonical) terms.
    funding_history: Vec<FundingObservation>,
    /// Mark prices per venue-native symbol.
    marks: HashMap<String, Decimal>,
    /// Open positions per venue-native symbol.
    positions: HashMap<String, PositionInfo>,
    orders: Vec<RecordedOrder>,
    transfers: Vec<RecordedTransfer>,
    /// Injected failures keyed by `"<native symbol>:<side>"`.
    order_failures: HashMap<String, VenueError>,
    fetch_failure: Option<VenueError>,
    stream_events: Vec<StreamEvent>,
}

/// Scriptable in-memory venue.
pub struct MockVenue {
    config: RwLock<MockVenueConfig>,
    state: RwLock<MockState>,
    name: String,
    /// Canonical -> native, from the configured symbol map.
    to_native: HashMap<String, String>,
    /// Native -> canonical, the reverse of the map.
    to_canonical: HashMap<String, String>,
    order_seq: AtomicU64,
}

impl MockVenue {
    pub fn new(config: MockVenueConfig) -> Self {
        let name = config.name.clone();
        let to_native = config.symbol_map.clone();
        let to_canonical = to_native
            .iter()
            .map(|(canonical, native)| (native.clone(), canonical.clone()))
            .collect();
        Self {
            config: RwLock::new(config),
            state: RwLock::new(MockState::default()),
            name,
            to_native,
            to_canonical,
            order_seq: AtomicU64::new(1),
        }
    }

    /// Translate a canonical symbol to the venue-native name. Unmapped
    /// symbols pass through unchanged.
    fn native(&self, symbol: &str) -> String {
        self.to_native
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    /// Translate a venue-native name back to the canonical symbol.
    fn canonical(&self, native: &str) -> String {
        self.to_canonical
            .get(native)
            .cloned()
            .unwrap_or_else(|| native.to_string())
    }

    /// Set the current funding rate for a venue-native symbol; also appended
    /// (in canonical terms) to the history behind `get_avg_funding_rate`.
    pub fn set_funding(&self, symbol: &str, rate: Decimal) {
        let canonical = self.canonical(symbol);
        let mut state = self.state.write();
        state.funding.insert(symbol.to_string(), rate);
        state.funding_history.push(FundingObservation::new(
            self.name.clone(),
            canonical,
            rate,
            Utc::now(),
        ));
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.write().marks.insert(symbol.to_string(), price);
    }

    pub fn set_balances(&self, total: Decimal, available: Decimal) {
        let mut config = self.config.write();
        config.total_balance = total;
        config.available_balance = available;
    }

    /// Install a position directly (for risk-engine tests), keyed by the
    /// position's venue-native symbol.
    pub fn set_position(&self, position: PositionInfo) {
        let mut state = self.state.write();
        state.marks.insert(position.symbol.clone(), position.mark_price);
        state.positions.insert(position.symbol.clone(), position);
    }

    /// Make the next orders for the venue-native `(symbol, side)` fail.
    pub fn fail_orders(&self, symbol: &str, side: Side, error: VenueError) {
        self.state
            .write()
            .order_failures
            .insert(order_failure_key(symbol, side), error);
    }

    /// Make `fetch_funding_rates` fail with `error`.
    pub fn fail_fetch(&self, error: VenueError) {
        self.state.write().fetch_failure = Some(error);
    }

    /// Remove all injected order failures.
    pub fn clear_order_failures(&self) {
        self.state.write().order_failures.clear();
    }

    /// Queue an event for delivery when the engine subscribes.
    pub fn push_stream_event(&self, event: StreamEvent) {
        self.state.write().stream_events.push(event);
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.state.read().orders.clone()
    }

    pub fn orders_for(&self, symbol: &str) -> Vec<RecordedOrder> {
        self.state
            .read()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.state.read().transfers.clone()
    }

    fn next_order_id(&self) -> String {
        format!(
            "{}-{}",
            self.name,
            self.order_seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Apply a fill to the netted position book, in native terms.
    fn apply_fill(state: &mut MockState, native: &str, side: Side, qty: Decimal, price: Decimal) {
        let signed = side.sign() * qty;
        match state.positions.get_mut(native) {
            Some(pos) => {
                let net = pos.side.sign() * pos.size + signed;
                if net.is_zero() {
                    state.positions.remove(native);
                } else {
                    pos.side = if net > Decimal::ZERO { Side::Buy } else { Side::Sell };
                    pos.size = net.abs();
                    pos.mark_price = price;
                }
            }
            None => {
                state.positions.insert(
                    native.to_string(),
                    PositionInfo {
                        symbol: native.to_string(),
                        side,
                        size: qty,
                        entry_price: price,
                        mark_price: price,
                        unrealized_pnl: Decimal::ZERO,
                    },
                );
            }
        }
    }

    fn submit_order(
        &self,
        native: &str,
        side: Side,
        qty: Decimal,
        is_close: bool,
    ) -> Result<OrderRef, VenueError> {
        let mut state = self.state.write();
        if let Some(error) = state.order_failures.get(&order_failure_key(native, side)) {
            return Err(error.clone());
        }
        let price = *state
            .marks
            .get(native)
            .ok_or_else(|| VenueError::BadSymbol(native.to_string()))?;

        state.orders.push(RecordedOrder {
            symbol: native.to_string(),
            side,
            qty,
            price,
            is_close,
        });
        Self::apply_fill(&mut state, native, side, qty, price);

        Ok(OrderRef {
            order_id: self.next_order_id(),
            symbol: self.canonical(native),
            side,
            executed_qty: qty,
            avg_price: price,
        })
    }
}

fn order_failure_key(symbol: &str, side: Side) -> String {
    format!("{symbol}:{side}")
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingObservation>, VenueError> {
        let mut state = self.state.write();
        if let Some(error) = state.fetch_failure.take() {
            return Err(error);
        }
        let now = Utc::now();
        let mut observations: Vec<FundingObservation> = state
            .funding
            .iter()
            .map(|(native, rate)| {
                FundingObservation::new(self.name.clone(), self.canonical(native), *rate, now)
            })
            .collect();
        observations.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(observations)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Decimal, VenueError> {
        self.state
            .read()
            .funding
            .get(&self.native(symbol))
            .copied()
            .ok_or_else(|| VenueError::BadSymbol(symbol.to_string()))
    }

    async fn get_avg_funding_rate(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, VenueError> {
        let state = self.state.read();
        let rates: Vec<Decimal> = state
            .funding_history
            .iter()
            .filter(|o| o.symbol == symbol && o.observed_at >= since)
            .map(|o| o.rate)
            .collect();
        if rates.is_empty() {
            return Ok(Decimal::ZERO);
        }
        let sum: Decimal = rates.iter().copied().sum();
        Ok(sum / Decimal::from(rates.len() as u64))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        self.state
            .read()
            .marks
            .get(&self.native(symbol))
            .copied()
            .ok_or_else(|| VenueError::BadSymbol(symbol.to_string()))
    }

    async fn get_positions(&self) -> Result<HashMap<String, PositionInfo>, VenueError> {
        let state = self.state.read();
        let mut positions = HashMap::new();
        for (native, pos) in &state.positions {
            let mark = state.marks.get(native).copied().unwrap_or(pos.mark_price);
            let mut pos = pos.clone();
            pos.symbol = self.canonical(native);
            pos.unrealized_pnl = pos.side.sign() * (mark - pos.entry_price) * pos.size;
            pos.mark_price = mark;
            positions.insert(pos.symbol.clone(), pos);
        }
        Ok(positions)
    }

    async fn get_total_balance(&self) -> Result<Decimal, VenueError> {
        Ok(self.config.read().total_balance)
    }

    async fn get_available_balance(&self) -> Result<Decimal, VenueError> {
        Ok(self.config.read().available_balance)
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<OrderRef, VenueError> {
        debug!(venue = %self.name, symbol, %side, %qty, "mock market order");
        self.submit_order(&self.native(symbol), side, qty, false)
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Option<Side>,
        qty: Option<Decimal>,
    ) -> Result<OrderRef, VenueError> {
        let native = self.native(symbol);
        match (side, qty) {
            (Some(side), Some(qty)) => self.submit_order(&native, side, qty, true),
            _ => {
                let (close_side, size) = {
                    let state = self.state.read();
                    let pos = state
                        .positions
                        .get(&native)
                        .ok_or_else(|| VenueError::NotFound(symbol.to_string()))?;
                    (pos.side.opposite(), pos.size)
                };
                self.submit_order(&native, close_side, size, true)
            }
        }
    }

    async fn transfer_to(
        &self,
        dest_venue: &str,
        amount: Decimal,
        asset: &str,
    ) -> Result<(), VenueError> {
        if !self.config.read().transfer_supported {
            return Err(VenueError::Unsupported(format!(
                "{} does not support transfers",
                self.name
            )));
        }
        self.state.write().transfers.push(RecordedTransfer {
            dest_venue: dest_venue.to_string(),
            amount,
            asset: asset.to_string(),
        });
        Ok(())
    }

    async fn subscribe_stream(&self, tx: mpsc::Sender<StreamEvent>) -> Result<(), VenueError> {
        let events: Vec<StreamEvent> = std::mem::take(&mut self.state.write().stream_events);
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn orders_net_into_positions() {
        let venue = MockVenue::new(MockVenueConfig::new("x"));
        venue.set_mark_price("BTCUSDT", dec!(50000));

        venue
            .create_market_order("BTCUSDT", Side::Buy, dec!(0.02))
            .await
            .unwrap();
        venue
            .create_market_order("BTCUSDT", Side::Sell, dec!(0.01))
            .await
            .unwrap();

        let positions = venue.get_positions().await.unwrap();
        let pos = &positions["BTCUSDT"];
        assert_eq!(pos.side, Side::Buy);
        assert_eq!(pos.size, dec!(0.01));
    }

    #[tokio::test]
    async fn full_close_uses_live_position() {
        let venue = MockVenue::new(MockVenueConfig::new("x"));
        venue.set_mark_price("ETHUSDT", dec!(3000));
        venue
            .create_market_order("ETHUSDT", Side::Sell, dec!(2))
            .await
            .unwrap();

        let close = venue.close_position("ETHUSDT", None, None).await.unwrap();
        assert_eq!(close.side, Side::Buy);
        assert_eq!(close.executed_qty, dec!(2));
        assert!(venue.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn avg_funding_rate_is_mean_since() {
        let venue = MockVenue::new(MockVenueConfig::new("x"));
        let since = Utc::now();
        venue.set_funding("BTCUSDT", dec!(0.0001));
        venue.set_funding("BTCUSDT", dec!(0.0003));

        let avg = venue.get_avg_funding_rate("BTCUSDT", since).await.unwrap();
        assert_eq!(avg, dec!(0.0002));

        let empty = venue.get_avg_funding_rate("XRPUSDT", since).await.unwrap();
        assert_eq!(empty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn injected_order_failure_is_returned() {
        let venue = MockVenue::new(MockVenueConfig::new("x"));
        venue.set_mark_price("BTCUSDT", dec!(50000));
        venue.fail_orders(
            "BTCUSDT",
            Side::Sell,
            VenueError::Exchange { code: -2010, msg: "rejected".into() },
        );

        let err = venue
            .create_market_order("BTCUSDT", Side::Sell, dec!(0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::Exchange { .. }));

        // Buy side unaffected.
        assert!(venue
            .create_market_order("BTCUSDT", Side::Buy, dec!(0.01))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn symbol_map_translates_at_the_boundary() {
        let map = HashMap::from([("BTCUSDT".to_string(), "BTC-USDT-SWAP".to_string())]);
        let venue = MockVenue::new(MockVenueConfig::new("okx").with_symbol_map(map));
        venue.set_funding("BTC-USDT-SWAP", dec!(0.0001));
        venue.set_mark_price("BTC-USDT-SWAP", dec!(50000));

        // The trait surface speaks canonical names.
        assert_eq!(
            venue.get_funding_rate("BTCUSDT").await.unwrap(),
            dec!(0.0001)
        );
        assert_eq!(venue.get_mark_price("BTCUSDT").await.unwrap(), dec!(50000));
        assert!(venue.get_mark_price("ETHUSDT").await.is_err());

        let observations = venue.fetch_funding_rates().await.unwrap();
        assert_eq!(observations[0].symbol, "BTCUSDT");
        assert_eq!(
            venue
                .get_avg_funding_rate("BTCUSDT", Utc::now() - chrono::Duration::minutes(1))
                .await
                .unwrap(),
            dec!(0.0001)
        );

        let fill = venue
            .create_market_order("BTCUSDT", Side::Buy, dec!(0.01))
            .await
            .unwrap();
        assert_eq!(fill.symbol, "BTCUSDT");
        // The venue-side record carries the native name.
        assert_eq!(venue.orders()[0].symbol, "BTC-USDT-SWAP");

        let positions = venue.get_positions().await.unwrap();
        assert_eq!(positions["BTCUSDT"].symbol, "BTCUSDT");

        let close = venue.close_position("BTCUSDT", None, None).await.unwrap();
        assert_eq!(close.symbol, "BTCUSDT");
        assert_eq!(close.executed_qty, dec!(0.01));
        assert!(venue.get_positions().await.unwrap().is_empty());
    }
}
