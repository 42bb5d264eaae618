//! Hedge lifecycle: state machine, sizing, monitoring, close.
//!
//! A hedge is a delta-neutral pair: long the venue with the lower funding
//! rate, short the venue with the higher one, harvesting the spread. Each
//! hedge is identified by the deterministic key
//! `symbol|long_venue|short_venue`, which doubles as the idempotency token
//! for open attempts.

pub mod manager;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use hedge_common::OrderRef;

use crate::venue::VenueError;

pub use manager::{HedgeManager, OpenOutcome};

/// Errors from hedge operations.
#[derive(Debug, Error)]
pub enum HedgeError {
    #[error("insufficient funds: computed size {size}")]
    InsufficientFunds { size: Decimal },

    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    #[error("non-positive mark price for {symbol}")]
    InvalidMark { symbol: String },

    #[error("venue error: {0}")]
    Venue(#[from] VenueError),
}

/// Hedge lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeState {
    /// Legs submitted, fills pending.
    Opening,
    /// Both legs filled; under monitoring.
    Active,
    /// Close legs submitted.
    Closing,
    /// Both legs closed.
    Closed,
    /// Open failed (including reconciled partial fills).
    Failed,
    /// A close leg kept failing; operator intervention required.
    CloseFailed,
}

impl HedgeState {
    /// Terminal states. A terminal record stays in the table for audit
    /// until a fresh open for the same key supersedes it; only non-terminal
    /// records block a new open.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HedgeState::Closed | HedgeState::Failed | HedgeState::CloseFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeState::Opening => "opening",
            HedgeState::Active => "active",
            HedgeState::Closing => "closing",
            HedgeState::Closed => "closed",
            HedgeState::Failed => "failed",
            HedgeState::CloseFailed => "close_failed",
        }
    }
}

impl std::fmt::Display for HedgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a hedge was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    /// The funding edge collapsed below the warning threshold.
    SpreadCollapsed,
    /// Maximum holding time exceeded.
    MaxHold,
    Emergency,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::SpreadCollapsed => "spread_collapsed",
            CloseReason::MaxHold => "max_hold",
            CloseReason::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic hedge key: `symbol|long_venue|short_venue`.
pub fn hedge_key(symbol: &str, long_venue: &str, short_venue: &str) -> String {
    format!("{symbol}|{long_venue}|{short_venue}")
}

/// One hedge record. Owned by the `HedgeManager`; single writer per key.
#[derive(Debug, Clone, Serialize)]
pub struct Hedge {
    pub key: String,
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    pub state: HedgeState,

    /// Reported size: the smaller of the two executed leg quantities.
    pub size: Decimal,
    /// Long-leg quantity in base units.
    pub long_qty: Decimal,
    /// Short-leg quantity in base units.
    pub short_qty: Decimal,

    pub entry_long_price: Decimal,
    pub entry_short_price: Decimal,
    /// `(short_price - long_price) / long_price` at entry.
    pub entry_ratio: Decimal,
    /// Funding spread at entry.
    pub entry_spread: Decimal,

    pub long_order: Option<OrderRef>,
    pub short_order: Option<OrderRef>,

    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,

    /// Realized PnL once closed.
    pub realized_pnl: Option<Decimal>,
    /// Live mark-to-market estimate on the price legs.
    pub unrealized_pnl: Decimal,
    /// Live funding-delta estimate, reported separately from the price PnL.
    pub funding_pnl: Decimal,
}

impl Hedge {
    /// Fresh record in `Opening` state, before sizing is known.
    pub fn opening(
        key: String,
        symbol: String,
        long_venue: String,
        short_venue: String,
        entry_spread: Decimal,
    ) -> Self {
        Self {
            key,
            symbol,
            long_venue,
            short_venue,
            state: HedgeState::Opening,
            size: Decimal::ZERO,
            long_qty: Decimal::ZERO,
            short_qty: Decimal::ZERO,
            entry_long_price: Decimal::ZERO,
            entry_short_price: Decimal::ZERO,
            entry_ratio: Decimal::ZERO,
            entry_spread,
            long_order: None,
            short_order: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            realized_pnl: None,
            unrealized_pnl: Decimal::ZERO,
            funding_pnl: Decimal::ZERO,
        }
    }

    /// Mark-to-market PnL on the price legs:
    /// `(long_now - long_entry + short_entry - short_now) * size`.
    pub fn price_pnl(&self, long_now: Decimal, short_now: Decimal) -> Decimal {
        (long_now - self.entry_long_price + self.entry_short_price - short_now) * self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn key_is_deterministic() {
        assert_eq!(hedge_key("BTCUSDT", "x", "y"), "BTCUSDT|x|y");
    }

    #[test]
    fn terminal_states() {
        assert!(HedgeState::Closed.is_terminal());
        assert!(HedgeState::Failed.is_terminal());
        assert!(HedgeState::CloseFailed.is_terminal());
        assert!(!HedgeState::Opening.is_terminal());
        assert!(!HedgeState::Active.is_terminal());
        assert!(!HedgeState::Closing.is_terminal());
    }

    #[test]
    fn price_pnl_gains_when_spread_converges() {
        let mut hedge = Hedge::opening(
            hedge_key("BTCUSDT", "x", "y"),
            "BTCUSDT".into(),
            "x".into(),
            "y".into(),
            dec!(0.0025),
        );
        hedge.size = dec!(0.01);
        hedge.entry_long_price = dec!(50000);
        hedge.entry_short_price = dec!(50000);

        // Long leg up, short leg flat: profit on the long.
        assert_eq!(hedge.price_pnl(dec!(50500), dec!(50000)), dec!(5.00));
        // Both legs up equally: delta-neutral, flat.
        assert_eq!(hedge.price_pnl(dec!(50500), dec!(50500)), Decimal::ZERO);
    }
}
