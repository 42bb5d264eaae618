//! Extreme market event detection.
//!
//! Flags abnormal behavior in the per-symbol price/volume series:
//! - `price_surge` / `price_crash`: single-interval return beyond the limit
//! - `liquidity_drop`: latest volume far below the window mean
//! - `volatility_spike`: instantaneous volatility above a multiple of the
//!   realized volatility over the window (stdev of log returns)
//!
//! Flagged events are published on the bus; the risk engine may latch them
//! as a guard against opening into a dislocated market. Volatility stats use
//! f64 internally; no monetary value ever leaves the Decimal domain.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ExtremeParams;
use crate::events::{EngineEvent, EventBus};

/// Kinds of extreme market events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremeKind {
    /// Single-interval return above the limit.
    PriceSurge,
    /// Single-interval return below the negative limit.
    PriceCrash,
    /// Latest volume below the configured share of the window mean.
    LiquidityDrop,
    /// Instantaneous volatility above the multiple of window volatility.
    VolatilitySpike,
}

impl ExtremeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtremeKind::PriceSurge => "price_surge",
            ExtremeKind::PriceCrash => "price_crash",
            ExtremeKind::LiquidityDrop => "liquidity_drop",
            ExtremeKind::VolatilitySpike => "volatility_spike",
        }
    }
}

impl std::fmt::Display for ExtremeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Default)]
struct SymbolWindow {
    last_price: Option<Decimal>,
    volumes: VecDeque<Decimal>,
    log_returns: VecDeque<f64>,
}

/// Rolling per-symbol extreme-event detector.
pub struct ExtremeDetector {
    params: ExtremeParams,
    windows: DashMap<String, SymbolWindow>,
    bus: EventBus,
}

impl ExtremeDetector {
    pub fn new(params: ExtremeParams, bus: EventBus) -> Self {
        Self {
            params,
            windows: DashMap::new(),
            bus,
        }
    }

    /// Record a price (and optionally volume) sample for `symbol` and return
    /// any extreme events it triggered. Events are also published on the bus.
    pub fn observe(
        &self,
        symbol: &str,
        price: Decimal,
        volume: Option<Decimal>,
        ts: DateTime<Utc>,
    ) -> Vec<ExtremeKind> {
        let mut triggered = Vec::new();
        let mut window = self.windows.entry(symbol.to_string()).or_default();

        if let Some(previous) = window.last_price {
            if previous > Decimal::ZERO {
                let ret = (price - previous) / previous;
                if ret >= self.params.return_limit {
                    self.flag(&mut triggered, ExtremeKind::PriceSurge, symbol, ret, ts);
                } else if ret <= -self.params.return_limit {
                    self.flag(&mut triggered, ExtremeKind::PriceCrash, symbol, ret, ts);
                }

                if let (Some(p), Some(q)) = (price.to_f64(), previous.to_f64()) {
                    if p > 0.0 && q > 0.0 {
                        let log_return = (p / q).ln();
                        self.check_volatility(
                            &mut triggered,
                            &mut window,
                            symbol,
                            log_return,
                            ts,
                        );
                    }
                }
            }
        }
        window.last_price = Some(price);

        if let Some(volume) = volume {
            self.check_liquidity(&mut triggered, &mut window, symbol, volume, ts);
        }

        triggered
    }

    fn check_volatility(
        &self,
        triggered: &mut Vec<ExtremeKind>,
        window: &mut SymbolWindow,
        symbol: &str,
        log_return: f64,
        ts: DateTime<Utc>,
    ) {
        // Compare the new return against the realized volatility of the
        // prior window, then roll the window forward.
        if window.log_returns.len() >= self.params.window {
            let window_vol = stdev(window.log_returns.iter().copied());
            let instantaneous = log_return.abs();
            if window_vol > 0.0 && instantaneous > self.params.vol_multiplier * window_vol {
                let value = Decimal::try_from(instantaneous).unwrap_or(Decimal::ZERO);
                self.flag(triggered, ExtremeKind::VolatilitySpike, symbol, value, ts);
            }
        }

        window.log_returns.push_back(log_return);
        if window.log_returns.len() > self.params.window {
            window.log_returns.pop_front();
        }
    }

    fn check_liquidity(
        &self,
        triggered: &mut Vec<ExtremeKind>,
        window: &mut SymbolWindow,
        symbol: &str,
        volume: Decimal,
        ts: DateTime<Utc>,
    ) {
        if !window.volumes.is_empty() {
            let sum: Decimal = window.volumes.iter().copied().sum();
            let mean = sum / Decimal::from(window.volumes.len() as u64);
            if mean > Decimal::ZERO && volume < self.params.liquidity_ratio * mean {
                let ratio = volume / mean;
                self.flag(triggered, ExtremeKind::LiquidityDrop, symbol, ratio, ts);
            }
        }

        window.volumes.push_back(volume);
        if window.volumes.len() > self.params.window {
            window.volumes.pop_front();
        }
    }

    fn flag(
        &self,
        triggered: &mut Vec<ExtremeKind>,
        kind: ExtremeKind,
        symbol: &str,
        value: Decimal,
        ts: DateTime<Utc>,
    ) {
        warn!(symbol, %kind, %value, "extreme market event");
        self.bus.publish(EngineEvent::ExtremeEvent {
            kind,
            symbol: symbol.to_string(),
            value,
            ts,
        });
        triggered.push(kind);
    }
}

/// Sample standard deviation.
fn stdev(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}
