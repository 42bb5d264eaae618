//! Shared types for the funding-rate hedge engine.
//!
//! CRITICAL: All prices, quantities, rates, and PnL values use
//! `rust_decimal::Decimal`. NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign used in exposure math: long = +1, short = -1.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A single funding-rate observation from one venue.
///
/// Immutable once created. Rates are signed; positive means longs pay shorts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingObservation {
    /// Venue that produced the observation (e.g. "binance").
    pub venue: String,
    /// Canonical uppercase symbol (e.g. "BTCUSDT").
    pub symbol: String,
    /// Signed funding rate for the next interval.
    pub rate: Decimal,
    /// When the next funding payment occurs, if the venue reports it.
    pub next_funding_time: Option<DateTime<Utc>>,
    /// When this observation was taken.
    pub observed_at: DateTime<Utc>,
}

impl FundingObservation {
    pub fn new(
        venue: impl Into<String>,
        symbol: impl Into<String>,
        rate: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            rate,
            next_funding_time: None,
            observed_at,
        }
    }

    /// Magnitude of the rate, compared against alert thresholds.
    #[inline]
    pub fn magnitude(&self) -> Decimal {
        self.rate.abs()
    }
}

/// Latest mark price for a (venue, symbol) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub venue: String,
    pub symbol: String,
    /// Mark price used for PnL and sizing.
    pub mark_price: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl MarketQuote {
    pub fn new(
        venue: impl Into<String>,
        symbol: impl Into<String>,
        mark_price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            mark_price,
            observed_at,
        }
    }
}

/// Reference to a filled (or partially filled) order on a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    /// Venue-assigned order id.
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Quantity actually executed.
    pub executed_qty: Decimal,
    /// Average fill price.
    pub avg_price: Decimal,
}

impl OrderRef {
    /// Executed notional (qty * avg price).
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.executed_qty * self.avg_price
    }
}

/// A non-zero position as reported by a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Buy = long, Sell = short.
    pub side: Side,
    /// Position size in base units, always positive.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl PositionInfo {
    /// Signed notional value (long positive, short negative).
    #[inline]
    pub fn signed_notional(&self) -> Decimal {
        self.side.sign() * self.size * self.mark_price
    }
}

/// Push-based update delivered by a venue stream subscription.
///
/// Callbacks are delivered sequentially per stream; ordering across venues
/// is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Funding-rate update.
    Funding(FundingObservation),
    /// Mark-price update.
    Ticker(MarketQuote),
    /// Position change (fill, liquidation, manual action on the venue).
    Position {
        venue: String,
        symbol: String,
        position: PositionInfo,
    },
}

impl StreamEvent {
    /// The venue this event originated from.
    pub fn venue(&self) -> &str {
        match self {
            StreamEvent::Funding(o) => &o.venue,
            StreamEvent::Ticker(q) => &q.venue,
            StreamEvent::Position { venue, .. } => venue,
        }
    }

    /// The symbol this event refers to.
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::Funding(o) => &o.symbol,
            StreamEvent::Ticker(q) => &q.symbol,
            StreamEvent::Position { symbol, .. } => symbol,
        }
    }
}
