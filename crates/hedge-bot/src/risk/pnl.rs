//! Daily and lifetime PnL tracking.
//!
//! Realized PnL from closed hedges accumulates into a daily and a total
//! bucket. The daily bucket resets exactly once when the wall clock enters
//! the first ten minutes of a new local day; a date latch prevents a double
//! reset inside the window.

use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::events::{EngineEvent, EventBus};

/// Minutes past local midnight during which the daily reset may fire.
const RESET_WINDOW_MINUTES: u32 = 10;

/// PnL snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pnl {
    pub daily: Decimal,
    pub total: Decimal,
}

#[derive(Debug)]
struct PnlState {
    daily: Decimal,
    total: Decimal,
    /// Local date of the last daily reset (the latch).
    last_reset_day: NaiveDate,
}

/// Tracker for realized PnL.
#[derive(Debug)]
pub struct PnlTracker {
    state: RwLock<PnlState>,
    bus: EventBus,
}

impl PnlTracker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: RwLock::new(PnlState {
                daily: Decimal::ZERO,
                total: Decimal::ZERO,
                last_reset_day: Local::now().date_naive(),
            }),
            bus,
        }
    }

    /// Add realized PnL from a closed hedge.
    pub fn record_realized(&self, pnl: Decimal) {
        let mut state = self.state.write();
        state.daily += pnl;
        state.total += pnl;
    }

    pub fn snapshot(&self) -> Pnl {
        let state = self.state.read();
        Pnl {
            daily: state.daily,
            total: state.total,
        }
    }

    /// Reset the daily bucket if the clock just entered a new local day.
    /// Called from a periodic loop with the current local time; returns the
    /// value that was reset, if a reset happened.
    pub fn maybe_reset_daily(&self, now: DateTime<Local>) -> Option<Decimal> {
        let today = now.date_naive();
        let in_window = now.hour() == 0 && now.minute() < RESET_WINDOW_MINUTES;

        let mut state = self.state.write();
        if !in_window || state.last_reset_day == today {
            return None;
        }

        let value = state.daily;
        state.daily = Decimal::ZERO;
        state.last_reset_day = today;
        drop(state);

        info!(%value, "daily PnL reset");
        self.bus.publish(EngineEvent::DailyPnl {
            value,
            ts: Utc::now(),
        });
        Some(value)
    }
}
