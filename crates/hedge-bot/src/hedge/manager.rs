//! Hedge lifecycle manager.
//!
//! Owns the hedge table (single writer per key) and drives every state
//! transition: idempotent open, periodic monitoring with TP/SL/collapse
//! exits, and the two-leg close with bounded retries. Leg placement is
//! concurrent; a one-leg fill is reconciled by closing the filled leg.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use hedge_common::{OrderRef, Side};

use crate::config::{HedgeParams, LegSizing};
use crate::detector::ArbOpportunity;
use crate::events::{EngineEvent, EventBus};
use crate::risk::PnlTracker;
use crate::state::ControlFlags;
use crate::store::MarketStore;
use crate::venue::VenueAdapter;

use super::{hedge_key, CloseReason, Hedge, HedgeError, HedgeState};

/// Retries per failing leg (in addition to the initial attempt).
const MAX_LEG_RETRIES: u32 = 3;

/// Base delay between leg retries; doubles per attempt.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Decimal places for order quantities.
const QTY_SCALE: u32 = 8;

/// Result of an open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Both legs filled; hedge is Active.
    Opened,
    /// Key already present in a non-terminal state; nothing done.
    Duplicate,
    /// auto_hedge off, emergency stop, or shutdown; record reverted.
    Disabled,
    /// Leg submission failed; record is Failed (reconciled if one leg filled).
    Failed { partial_fill: bool },
}

/// Per-key hedge state machine over the venue adapters.
pub struct HedgeManager {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    hedges: DashMap<String, Hedge>,
    params: HedgeParams,
    /// Funding spread below this magnitude means the edge has collapsed.
    warning_threshold: Decimal,
    flags: Arc<ControlFlags>,
    bus: EventBus,
    pnl: Arc<PnlTracker>,
}

impl HedgeManager {
    pub fn new(
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        params: HedgeParams,
        warning_threshold: Decimal,
        flags: Arc<ControlFlags>,
        bus: EventBus,
        pnl: Arc<PnlTracker>,
    ) -> Self {
        Self {
            venues,
            hedges: DashMap::new(),
            params,
            warning_threshold,
            flags,
            bus,
            pnl,
        }
    }

    /// Snapshot of all hedge records, sorted by key.
    pub fn hedges(&self) -> Vec<Hedge> {
        let mut all: Vec<Hedge> = self.hedges.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn get(&self, key: &str) -> Option<Hedge> {
        self.hedges.get(key).map(|e| e.value().clone())
    }

    /// Number of hedges currently Active.
    pub fn active_count(&self) -> usize {
        self.hedges
            .iter()
            .filter(|e| e.value().state == HedgeState::Active)
            .count()
    }

    /// Attempt to open a hedge for an arbitrage opportunity.
    ///
    /// The key insert is an atomic compare-and-set: a concurrent second
    /// attempt for the same key sees the Opening record and returns
    /// `Duplicate` without touching any venue. Terminal records are
    /// superseded; their transitions stay on the event log.
    pub async fn try_open(&self, opp: &ArbOpportunity) -> Result<OpenOutcome, HedgeError> {
        let key = hedge_key(&opp.symbol, &opp.long_venue, &opp.short_venue);

        match self.hedges.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state.is_terminal() {
                    entry.insert(self.opening_record(&key, opp));
                } else {
                    return Ok(OpenOutcome::Duplicate);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.opening_record(&key, opp));
            }
        }
        self.emit_state_change(&key, "none", HedgeState::Opening.as_str());

        if !self.flags.can_open() {
            // Revert to no-state: the attempt never reached a venue.
            self.hedges.remove(&key);
            self.emit_state_change(&key, HedgeState::Opening.as_str(), "none");
            return Ok(OpenOutcome::Disabled);
        }

        let long = match self.adapter(&opp.long_venue) {
            Some(v) => v,
            None => {
                self.hedges.remove(&key);
                return Err(HedgeError::UnknownVenue(opp.long_venue.clone()));
            }
        };
        let short = match self.adapter(&opp.short_venue) {
            Some(v) => v,
            None => {
                self.hedges.remove(&key);
                return Err(HedgeError::UnknownVenue(opp.short_venue.clone()));
            }
        };

        // Sizing inputs fetched concurrently.
        let (long_avail, short_avail) =
            tokio::join!(long.get_available_balance(), short.get_available_balance());
        let (long_avail, short_avail) = match (long_avail, short_avail) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                self.fail_open(&key, false, &format!("balance fetch failed: {e}"));
                return Err(e.into());
            }
        };

        let size_usd = long_avail.min(short_avail) * self.params.size_ratio;
        if size_usd <= Decimal::ZERO {
            self.fail_open(&key, false, "no free balance on at least one venue");
            return Err(HedgeError::InsufficientFunds { size: size_usd });
        }

        let (long_mark, short_mark) = tokio::join!(
            long.get_mark_price(&opp.symbol),
            short.get_mark_price(&opp.symbol)
        );
        let (long_mark, short_mark) = match (long_mark, short_mark) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                self.fail_open(&key, false, &format!("mark price fetch failed: {e}"));
                return Err(e.into());
            }
        };
        if long_mark <= Decimal::ZERO || short_mark <= Decimal::ZERO {
            self.fail_open(&key, false, "non-positive mark price");
            return Err(HedgeError::InvalidMark {
                symbol: opp.symbol.clone(),
            });
        }

        let mut long_qty =
            (size_usd / long_mark).round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);
        let mut short_qty =
            (size_usd / short_mark).round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);
        if self.params.leg_sizing == LegSizing::EqualQty {
            let qty = long_qty.min(short_qty);
            long_qty = qty;
            short_qty = qty;
        }
        if long_qty <= Decimal::ZERO || short_qty <= Decimal::ZERO {
            self.fail_open(&key, false, "sized quantity rounds to zero");
            return Err(HedgeError::InsufficientFunds { size: size_usd });
        }

        info!(
            key = %key,
            size_usd = %size_usd,
            long_qty = %long_qty,
            short_qty = %short_qty,
            "opening hedge"
        );

        // Both legs concurrently. Orders are never auto-retried.
        let (long_res, short_res) = tokio::join!(
            long.create_market_order(&opp.symbol, Side::Buy, long_qty),
            short.create_market_order(&opp.symbol, Side::Sell, short_qty)
        );

        match (long_res, short_res) {
            (Ok(long_fill), Ok(short_fill)) => {
                self.activate(&key, opp, long_fill, short_fill);
                Ok(OpenOutcome::Opened)
            }
            (Err(long_err), Err(short_err)) => {
                self.fail_open(
                    &key,
                    false,
                    &format!("long leg: {long_err}; short leg: {short_err}"),
                );
                Ok(OpenOutcome::Failed {
                    partial_fill: false,
                })
            }
            (Ok(long_fill), Err(short_err)) => {
                self.reconcile_leg(long.as_ref(), &opp.symbol, &long_fill).await;
                self.fail_open(&key, true, &format!("short leg: {short_err}"));
                Ok(OpenOutcome::Failed { partial_fill: true })
            }
            (Err(long_err), Ok(short_fill)) => {
                self.reconcile_leg(short.as_ref(), &opp.symbol, &short_fill).await;
                self.fail_open(&key, true, &format!("long leg: {long_err}"));
                Ok(OpenOutcome::Failed { partial_fill: true })
            }
        }
    }

    /// Evaluate every Active hedge once: exits first, PnL refresh otherwise.
    pub async fn monitor_once(&self, store: &MarketStore) {
        let active: Vec<String> = self
            .hedges
            .iter()
            .filter(|e| e.value().state == HedgeState::Active)
            .map(|e| e.key().clone())
            .collect();

        for key in active {
            if let Err(e) = self.monitor_one(&key, store).await {
                warn!(key = %key, error = %e, "hedge monitor pass failed");
            }
        }
    }

    async fn monitor_one(&self, key: &str, store: &MarketStore) -> Result<(), HedgeError> {
        let hedge = match self.get(key) {
            Some(h) if h.state == HedgeState::Active => h,
            _ => return Ok(()),
        };

        let max_hold = self.params.max_hold;
        if !max_hold.is_zero() {
            let age = Utc::now().signed_duration_since(hedge.opened_at);
            if age.num_milliseconds() >= max_hold.as_millis() as i64 {
                return self.close(key, CloseReason::MaxHold).await;
            }
        }

        let long = self
            .adapter(&hedge.long_venue)
            .ok_or_else(|| HedgeError::UnknownVenue(hedge.long_venue.clone()))?;
        let short = self
            .adapter(&hedge.short_venue)
            .ok_or_else(|| HedgeError::UnknownVenue(hedge.short_venue.clone()))?;

        let (long_now, short_now) = tokio::join!(
            long.get_mark_price(&hedge.symbol),
            short.get_mark_price(&hedge.symbol)
        );
        // Read-path failure: keep the hedge, try again next tick.
        let (long_now, short_now) = (long_now?, short_now?);
        if long_now <= Decimal::ZERO {
            return Err(HedgeError::InvalidMark {
                symbol: hedge.symbol.clone(),
            });
        }

        let current_ratio = (short_now - long_now) / long_now;
        let ratio_change = hedge.entry_ratio - current_ratio;

        if ratio_change >= self.params.take_profit * dec!(0.5) {
            return self.close(key, CloseReason::TakeProfit).await;
        }
        if ratio_change <= -self.params.stop_loss {
            return self.close(key, CloseReason::StopLoss).await;
        }

        // Funding edge check against the latest store snapshot.
        if let (Some(long_funding), Some(short_funding)) = (
            store.funding(&hedge.long_venue, &hedge.symbol),
            store.funding(&hedge.short_venue, &hedge.symbol),
        ) {
            let spread = short_funding.rate - long_funding.rate;
            if spread.abs() < self.warning_threshold {
                return self.close(key, CloseReason::SpreadCollapsed).await;
            }
        }

        // No exit: refresh the live estimates.
        let price_pnl = hedge.price_pnl(long_now, short_now);
        let funding_pnl = self.funding_pnl_estimate(&hedge, long.as_ref(), short.as_ref()).await;
        if let Some(mut entry) = self.hedges.get_mut(key) {
            entry.unrealized_pnl = price_pnl;
            if let Some(funding_pnl) = funding_pnl {
                entry.funding_pnl = funding_pnl;
            }
        }
        Ok(())
    }

    /// Funding-delta PnL: `(avg_short - avg_long) * size * duration_hours`.
    /// Reported separately from the price-leg estimate.
    async fn funding_pnl_estimate(
        &self,
        hedge: &Hedge,
        long: &dyn VenueAdapter,
        short: &dyn VenueAdapter,
    ) -> Option<Decimal> {
        let (avg_long, avg_short) = tokio::join!(
            long.get_avg_funding_rate(&hedge.symbol, hedge.opened_at),
            short.get_avg_funding_rate(&hedge.symbol, hedge.opened_at)
        );
        let (avg_long, avg_short) = (avg_long.ok()?, avg_short.ok()?);
        let seconds = Utc::now()
            .signed_duration_since(hedge.opened_at)
            .num_seconds()
            .max(0);
        let duration_hours = Decimal::from(seconds) / dec!(3600);
        Some((avg_short - avg_long) * hedge.size * duration_hours)
    }

    /// Close an Active hedge: both legs concurrently, bounded retries per
    /// failing leg. The Active -> Closing transition doubles as the per-key
    /// in-flight marker, so concurrent close calls are no-ops.
    pub async fn close(&self, key: &str, reason: CloseReason) -> Result<(), HedgeError> {
        let snapshot = {
            let mut entry = match self.hedges.get_mut(key) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if entry.state != HedgeState::Active {
                return Ok(());
            }
            entry.state = HedgeState::Closing;
            entry.clone()
        };
        self.emit_state_change(key, HedgeState::Active.as_str(), HedgeState::Closing.as_str());
        info!(key = %key, reason = %reason, "closing hedge");

        let long = self
            .adapter(&snapshot.long_venue)
            .ok_or_else(|| HedgeError::UnknownVenue(snapshot.long_venue.clone()))?;
        let short = self
            .adapter(&snapshot.short_venue)
            .ok_or_else(|| HedgeError::UnknownVenue(snapshot.short_venue.clone()))?;

        let (long_close, short_close) = tokio::join!(
            self.submit_close_with_retry(
                long.as_ref(),
                &snapshot.symbol,
                Side::Sell,
                snapshot.long_qty
            ),
            self.submit_close_with_retry(
                short.as_ref(),
                &snapshot.symbol,
                Side::Buy,
                snapshot.short_qty
            )
        );

        match (long_close, short_close) {
            (Ok(long_fill), Ok(short_fill)) => {
                let realized = (long_fill.avg_price - snapshot.entry_long_price
                    + snapshot.entry_short_price
                    - short_fill.avg_price)
                    * snapshot.size;
                let now = Utc::now();
                if let Some(mut entry) = self.hedges.get_mut(key) {
                    entry.state = HedgeState::Closed;
                    entry.closed_at = Some(now);
                    entry.close_reason = Some(reason);
                    entry.realized_pnl = Some(realized);
                }
                self.pnl.record_realized(realized);
                self.emit_state_change(
                    key,
                    HedgeState::Closing.as_str(),
                    HedgeState::Closed.as_str(),
                );
                info!(key = %key, reason = %reason, pnl = %realized, "hedge closed");
                self.bus.publish(EngineEvent::HedgeClosed {
                    key: key.to_string(),
                    reason,
                    realized_pnl: realized,
                    ts: now,
                });
                Ok(())
            }
            (long_res, short_res) => {
                let mut errors = Vec::new();
                if let Err(e) = long_res {
                    errors.push(format!("long leg: {e}"));
                }
                if let Err(e) = short_res {
                    errors.push(format!("short leg: {e}"));
                }
                let error = errors.join("; ");
                if let Some(mut entry) = self.hedges.get_mut(key) {
                    entry.state = HedgeState::CloseFailed;
                    entry.close_reason = Some(reason);
                }
                self.emit_state_change(
                    key,
                    HedgeState::Closing.as_str(),
                    HedgeState::CloseFailed.as_str(),
                );
                error!(key = %key, error = %error, "hedge close failed, operator intervention required");
                self.bus.publish(EngineEvent::HedgeCloseFailed {
                    key: key.to_string(),
                    error,
                    ts: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Close every Active hedge concurrently (emergency path).
    pub async fn close_all(&self, reason: CloseReason) {
        let active: Vec<String> = self
            .hedges
            .iter()
            .filter(|e| e.value().state == HedgeState::Active)
            .map(|e| e.key().clone())
            .collect();

        let results = join_all(active.iter().map(|key| self.close(key, reason))).await;
        for (key, result) in active.iter().zip(results) {
            if let Err(e) = result {
                error!(key = %key, error = %e, "close_all: hedge close errored");
            }
        }
    }

    fn opening_record(&self, key: &str, opp: &ArbOpportunity) -> Hedge {
        Hedge::opening(
            key.to_string(),
            opp.symbol.clone(),
            opp.long_venue.clone(),
            opp.short_venue.clone(),
            opp.spread,
        )
    }

    fn adapter(&self, venue: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.venues.get(venue).cloned()
    }

    fn activate(&self, key: &str, opp: &ArbOpportunity, long_fill: OrderRef, short_fill: OrderRef) {
        let entry_ratio = if long_fill.avg_price > Decimal::ZERO {
            (short_fill.avg_price - long_fill.avg_price) / long_fill.avg_price
        } else {
            Decimal::ZERO
        };
        let size = long_fill.executed_qty.min(short_fill.executed_qty);

        if let Some(mut entry) = self.hedges.get_mut(key) {
            entry.state = HedgeState::Active;
            entry.size = size;
            entry.long_qty = long_fill.executed_qty;
            entry.short_qty = short_fill.executed_qty;
            entry.entry_long_price = long_fill.avg_price;
            entry.entry_short_price = short_fill.avg_price;
            entry.entry_ratio = entry_ratio;
            entry.long_order = Some(long_fill.clone());
            entry.short_order = Some(short_fill.clone());
        }

        self.emit_state_change(key, HedgeState::Opening.as_str(), HedgeState::Active.as_str());
        info!(
            key = %key,
            size = %size,
            entry_ratio = %entry_ratio,
            "hedge opened"
        );
        self.bus.publish(EngineEvent::HedgeOpened {
            key: key.to_string(),
            symbol: opp.symbol.clone(),
            long_venue: opp.long_venue.clone(),
            short_venue: opp.short_venue.clone(),
            size,
            entry_ratio,
            ts: Utc::now(),
        });
    }

    fn fail_open(&self, key: &str, partial_fill: bool, error: &str) {
        let now = Utc::now();
        if let Some(mut entry) = self.hedges.get_mut(key) {
            entry.state = HedgeState::Failed;
            entry.closed_at = Some(now);
        }
        self.emit_state_change(key, HedgeState::Opening.as_str(), HedgeState::Failed.as_str());
        warn!(key = %key, partial_fill, error, "hedge open failed");
        self.bus.publish(EngineEvent::HedgeFailed {
            key: key.to_string(),
            partial_fill,
            error: error.to_string(),
            ts: now,
        });
    }

    /// Unwind a filled leg after the other leg failed: submit the opposite
    /// market order for the filled quantity, with bounded retries.
    async fn reconcile_leg(&self, venue: &dyn VenueAdapter, symbol: &str, fill: &OrderRef) {
        let side = fill.side.opposite();
        match self
            .submit_close_with_retry(venue, symbol, side, fill.executed_qty)
            .await
        {
            Ok(_) => {
                info!(venue = venue.name(), symbol, %side, qty = %fill.executed_qty,
                    "partial fill reconciled");
            }
            Err(e) => {
                error!(venue = venue.name(), symbol, error = %e,
                    "partial fill reconciliation failed, position may be naked");
            }
        }
    }

    async fn submit_close_with_retry(
        &self,
        venue: &dyn VenueAdapter,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<OrderRef, crate::venue::VenueError> {
        let mut attempt: u32 = 0;
        loop {
            match venue.close_position(symbol, Some(side), Some(qty)).await {
                Ok(fill) => return Ok(fill),
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_LEG_RETRIES {
                        return Err(e);
                    }
                    let delay = RETRY_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        venue = venue.name(),
                        symbol,
                        attempt,
                        error = %e,
                        ?delay,
                        "close leg failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn emit_state_change(&self, key: &str, from: &str, to: &str) {
        self.bus.publish(EngineEvent::StateChange {
            key: key.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            ts: Utc::now(),
        });
    }
}
