//! Funding alert and cross-venue arbitrage detection.
//!
//! Every funding observation is evaluated against the warning/critical
//! thresholds; after each full snapshot cycle the detector scans the common
//! symbol set across venues for funding spreads wide enough to hedge.

pub mod extreme;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use hedge_common::FundingObservation;

use crate::config::Thresholds;
use crate::events::{AlertLevel, EngineEvent, EventBus};
use crate::store::MarketStore;

pub use extreme::{ExtremeDetector, ExtremeKind};

/// A cross-venue funding spread above the arbitrage threshold.
///
/// Long the venue with the lower (more negative) funding, short the venue
/// with the higher funding; the position collects the spread each interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbOpportunity {
    pub symbol: String,
    /// Venue to go long (minimum funding rate).
    pub long_venue: String,
    /// Venue to go short (maximum funding rate).
    pub short_venue: String,
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    /// `short_rate - long_rate`, always positive.
    pub spread: Decimal,
    pub detected_at: DateTime<Utc>,
}

/// Consecutive above-warning observation counters per (venue, symbol).
///
/// Incremented on each warning-or-above observation, reset to zero on any
/// observation at or below the warning threshold.
#[derive(Debug, Default)]
pub struct AlertCounters {
    counts: DashMap<(String, String), u32>,
}

impl AlertCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, venue: &str, symbol: &str) -> u32 {
        let mut entry = self
            .counts
            .entry((venue.to_string(), symbol.to_string()))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    fn reset(&self, venue: &str, symbol: &str) {
        if let Some(mut entry) = self
            .counts
            .get_mut(&(venue.to_string(), symbol.to_string()))
        {
            *entry = 0;
        }
    }

    pub fn get(&self, venue: &str, symbol: &str) -> u32 {
        self.counts
            .get(&(venue.to_string(), symbol.to_string()))
            .map(|e| *e)
            .unwrap_or(0)
    }
}

/// Threshold evaluator and arbitrage scanner.
pub struct Detector {
    thresholds: Thresholds,
    counters: AlertCounters,
    bus: EventBus,
}

impl Detector {
    pub fn new(thresholds: Thresholds, bus: EventBus) -> Self {
        Self {
            thresholds,
            counters: AlertCounters::new(),
            bus,
        }
    }

    pub fn counters(&self) -> &AlertCounters {
        &self.counters
    }

    /// Evaluate one observation. Returns the alert level crossed, if any;
    /// `Critical` signals the caller to run a hedge re-evaluation pass.
    pub fn evaluate(&self, obs: &FundingObservation) -> Option<AlertLevel> {
        let magnitude = obs.magnitude();

        let level = if magnitude > self.thresholds.critical {
            Some(AlertLevel::Critical)
        } else if magnitude > self.thresholds.warning {
            Some(AlertLevel::Warning)
        } else {
            None
        };

        match level {
            Some(level) => {
                let streak = self.counters.increment(&obs.venue, &obs.symbol);
                let message = format!(
                    "{} {} funding rate {} above {} threshold (streak {})",
                    obs.venue, obs.symbol, obs.rate, level, streak
                );
                match level {
                    AlertLevel::Critical => warn!(
                        venue = %obs.venue,
                        symbol = %obs.symbol,
                        rate = %obs.rate,
                        "critical funding rate"
                    ),
                    AlertLevel::Warning => info!(
                        venue = %obs.venue,
                        symbol = %obs.symbol,
                        rate = %obs.rate,
                        "funding rate warning"
                    ),
                }
                self.bus.publish(EngineEvent::Alert {
                    level,
                    venue: obs.venue.clone(),
                    symbol: obs.symbol.clone(),
                    rate: obs.rate,
                    message,
                    ts: obs.observed_at,
                });
            }
            None => self.counters.reset(&obs.venue, &obs.symbol),
        }

        level
    }

    /// Scan the store for cross-venue arbitrage opportunities.
    ///
    /// Only symbols present on every venue currently in the store are
    /// considered; with fewer than two venues the scan is skipped. Ties on
    /// equal rates resolve to the lexicographically smaller venue id.
    pub fn scan_arbitrage(&self, store: &MarketStore) -> Vec<ArbOpportunity> {
        let venue_count = store.venues_with_funding().len();
        if venue_count < 2 {
            return Vec::new();
        }

        let now = Utc::now();
        let mut opportunities = Vec::new();

        for (symbol, rates) in store.rates_by_symbol() {
            // Common symbol set: every venue must quote this symbol.
            if rates.len() < venue_count {
                continue;
            }

            // Rates are sorted by venue id, so strict comparisons keep the
            // lexicographically smaller venue on ties.
            let mut min = &rates[0];
            let mut max = &rates[0];
            for entry in &rates[1..] {
                if entry.1 < min.1 {
                    min = entry;
                }
                if entry.1 > max.1 {
                    max = entry;
                }
            }

            let spread = max.1 - min.1;
            if spread > self.thresholds.arbitrage {
                let opportunity = ArbOpportunity {
                    symbol: symbol.clone(),
                    long_venue: min.0.clone(),
                    short_venue: max.0.clone(),
                    long_rate: min.1,
                    short_rate: max.1,
                    spread,
                    detected_at: now,
                };
                info!(
                    symbol = %opportunity.symbol,
                    long = %opportunity.long_venue,
                    short = %opportunity.short_venue,
                    spread = %spread,
                    "arbitrage opportunity"
                );
                self.bus.publish(EngineEvent::Arbitrage {
                    symbol: opportunity.symbol.clone(),
                    long_venue: opportunity.long_venue.clone(),
                    short_venue: opportunity.short_venue.clone(),
                    long_rate: opportunity.long_rate,
                    short_rate: opportunity.short_rate,
                    spread,
                    ts: now,
                });
                opportunities.push(opportunity);
            }
        }

        opportunities.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        opportunities
    }
}
