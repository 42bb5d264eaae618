//! Portfolio risk engine.
//!
//! Each tick collects positions and balances from every venue (all-settled,
//! one slow or failing venue never blocks the rest), computes the signed net
//! exposure ratio, updates the volatility EWMA, and de-risks when the ratio
//! breaches the configured ceiling. Also hosts the emergency shutdown path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{error, info, warn};

use hedge_common::PositionInfo;

use crate::config::RiskParamsConfig;
use crate::events::{EngineEvent, EventBus};
use crate::hedge::{CloseReason, HedgeManager};
use crate::state::ControlFlags;
use crate::venue::{retry_read, VenueAdapter};

/// EWMA weight on the previous volatility value.
const EWMA_DECAY: Decimal = dec!(0.9);

/// De-risk targets this fraction of the exposure ceiling.
const DERISK_TARGET_RATIO: Decimal = dec!(0.8);

/// Point-in-time portfolio exposure. Rebuilt each tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExposureSnapshot {
    /// Signed sum of position notionals (long positive).
    pub net_value: Decimal,
    /// Sum of total balances across venues.
    pub total_portfolio_value: Decimal,
    /// `net_value / total_portfolio_value`, zero when the total is zero.
    pub ratio: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Slow-moving risk parameters.
#[derive(Debug, Clone, Serialize)]
pub struct RiskParams {
    /// EWMA of the instantaneous exposure-ratio change.
    pub volatility: Decimal,
    /// Static symbol correlation map from configuration.
    pub correlations: HashMap<String, Decimal>,
}

/// One flattened position with its venue, the de-risk working set.
#[derive(Debug, Clone)]
struct VenuePosition {
    venue: String,
    position: PositionInfo,
}

/// Portfolio-wide risk engine.
pub struct RiskEngine {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    config: RiskParamsConfig,
    params: RwLock<RiskParams>,
    last_ratio: RwLock<Option<Decimal>>,
    latest: RwLock<Option<ExposureSnapshot>>,
    hedges: Arc<HedgeManager>,
    flags: Arc<ControlFlags>,
    bus: EventBus,
}

impl RiskEngine {
    pub fn new(
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        config: RiskParamsConfig,
        correlations: HashMap<String, Decimal>,
        hedges: Arc<HedgeManager>,
        flags: Arc<ControlFlags>,
        bus: EventBus,
    ) -> Self {
        Self {
            venues,
            config,
            params: RwLock::new(RiskParams {
                volatility: Decimal::ZERO,
                correlations,
            }),
            last_ratio: RwLock::new(None),
            latest: RwLock::new(None),
            hedges,
            flags,
            bus,
        }
    }

    /// Latest exposure snapshot, if a tick has completed.
    pub fn latest_snapshot(&self) -> Option<ExposureSnapshot> {
        *self.latest.read()
    }

    pub fn params(&self) -> RiskParams {
        self.params.read().clone()
    }

    /// One risk tick: rebuild exposure, update the EWMA, de-risk on breach.
    pub async fn tick(&self) -> ExposureSnapshot {
        let positions = self.collect_positions().await;
        let total = self.collect_total_balance().await;

        let net_value: Decimal = positions
            .iter()
            .map(|vp| vp.position.signed_notional())
            .sum();
        let ratio = if total.is_zero() {
            Decimal::ZERO
        } else {
            net_value / total
        };

        self.update_volatility(ratio);

        let snapshot = ExposureSnapshot {
            net_value,
            total_portfolio_value: total,
            ratio,
            observed_at: Utc::now(),
        };
        *self.latest.write() = Some(snapshot);

        if ratio.abs() > self.config.max_exposure && !total.is_zero() {
            warn!(ratio = %ratio, max = %self.config.max_exposure, "exposure ceiling breached");
            self.bus.publish(EngineEvent::RiskExceeded {
                exposure: ratio,
                ts: snapshot.observed_at,
            });
            self.de_risk(&snapshot, positions).await;
        }

        snapshot
    }

    /// Close worst-PnL positions on the overweight side until the exposure
    /// target is met or candidates run out. Best-effort per position.
    async fn de_risk(&self, snapshot: &ExposureSnapshot, positions: Vec<VenuePosition>) {
        let target = snapshot.ratio.abs() - DERISK_TARGET_RATIO * self.config.max_exposure;
        let mut remaining_usd = target * snapshot.total_portfolio_value;
        if remaining_usd <= Decimal::ZERO {
            return;
        }

        let overweight_sign = if snapshot.ratio > Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };

        // Worst unrealized PnL goes first.
        let mut candidates: Vec<VenuePosition> = positions
            .into_iter()
            .filter(|vp| vp.position.side.sign() == overweight_sign)
            .collect();
        candidates.sort_by(|a, b| a.position.unrealized_pnl.cmp(&b.position.unrealized_pnl));

        for vp in candidates {
            if remaining_usd <= Decimal::ZERO {
                break;
            }
            let position = &vp.position;
            if position.mark_price <= Decimal::ZERO {
                continue;
            }

            let close_qty = position
                .size
                .min(remaining_usd / position.mark_price)
                .round_dp_with_strategy(8, RoundingStrategy::ToZero);
            if close_qty <= Decimal::ZERO {
                continue;
            }

            let Some(venue) = self.venues.get(&vp.venue) else {
                continue;
            };
            match venue
                .close_position(
                    &position.symbol,
                    Some(position.side.opposite()),
                    Some(close_qty),
                )
                .await
            {
                Ok(fill) => {
                    let closed_notional = fill.executed_qty * fill.avg_price;
                    remaining_usd -= closed_notional;
                    info!(
                        venue = %vp.venue,
                        symbol = %position.symbol,
                        qty = %fill.executed_qty,
                        notional = %closed_notional,
                        "de-risk close"
                    );
                }
                Err(e) => {
                    warn!(
                        venue = %vp.venue,
                        symbol = %position.symbol,
                        error = %e,
                        "de-risk close failed"
                    );
                }
            }
        }
    }

    /// Disable opens, close every hedge and every remaining position across
    /// all venues, swallowing individual errors. Emits `EmergencyShutdown`
    /// once complete.
    pub async fn emergency_shutdown(&self) {
        warn!("emergency shutdown initiated");
        self.flags.disable_hedging();
        self.flags.set_emergency_stop();

        self.hedges.close_all(CloseReason::Emergency).await;

        let sweeps = self.venues.iter().map(|(name, venue)| async move {
            match venue.get_positions().await {
                Ok(positions) => {
                    for symbol in positions.keys() {
                        if let Err(e) = venue.close_position(symbol, None, None).await {
                            error!(venue = %name, symbol = %symbol, error = %e,
                                "emergency close failed");
                        }
                    }
                }
                Err(e) => {
                    error!(venue = %name, error = %e, "emergency position fetch failed");
                }
            }
        });
        join_all(sweeps).await;

        self.bus.publish(EngineEvent::EmergencyShutdown { ts: Utc::now() });
        warn!("emergency shutdown complete");
    }

    fn update_volatility(&self, ratio: Decimal) {
        let mut last = self.last_ratio.write();
        let instant = match *last {
            Some(previous) => (ratio - previous).abs(),
            None => Decimal::ZERO,
        };
        *last = Some(ratio);
        drop(last);

        let mut params = self.params.write();
        params.volatility =
            EWMA_DECAY * params.volatility + (Decimal::ONE - EWMA_DECAY) * instant;
    }

    /// All-settled position collection; failures are logged and emitted but
    /// never abort the tick.
    async fn collect_positions(&self) -> Vec<VenuePosition> {
        let fetches = self.venues.iter().map(|(name, venue)| async move {
            (name.clone(), retry_read(|| venue.get_positions()).await)
        });

        let mut flattened = Vec::new();
        for (venue, result) in join_all(fetches).await {
            match result {
                Ok(positions) => {
                    for (_, position) in positions {
                        flattened.push(VenuePosition {
                            venue: venue.clone(),
                            position,
                        });
                    }
                }
                Err(e) => {
                    warn!(venue = %venue, error = %e, "position fetch failed");
                    self.bus.publish(EngineEvent::FetchFailed {
                        venue,
                        error: e.to_string(),
                        ts: Utc::now(),
                    });
                }
            }
        }
        flattened
    }

    async fn collect_total_balance(&self) -> Decimal {
        let fetches = self.venues.iter().map(|(name, venue)| async move {
            (name.clone(), retry_read(|| venue.get_total_balance()).await)
        });

        let mut total = Decimal::ZERO;
        for (venue, result) in join_all(fetches).await {
            match result {
                Ok(balance) => total += balance,
                Err(e) => {
                    warn!(venue = %venue, error = %e, "balance fetch failed");
                }
            }
        }
        total
    }
}
