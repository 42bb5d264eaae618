//! Configuration for the hedge engine.
//!
//! Supports loading from a TOML file with environment variable overrides for
//! credentials. Defaults match the engine's documented thresholds, so an
//! empty file yields a runnable (paper) configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Logging level.
    pub log_level: String,

    /// Whether detected opportunities open hedges automatically.
    pub auto_hedge: bool,

    /// Quote asset all balances and sizes are denominated in.
    pub trade_asset: String,

    /// Funding alert and arbitrage thresholds.
    pub thresholds: Thresholds,

    /// Loop intervals.
    pub intervals: Intervals,

    /// Hedge sizing and exit parameters.
    pub hedge: HedgeParams,

    /// Risk engine parameters.
    pub risk: RiskParamsConfig,

    /// Cross-venue rebalancer parameters.
    pub rebalance: RebalanceParams,

    /// Extreme-event detector parameters.
    pub extreme: ExtremeParams,

    /// Bound on per-(venue, symbol) funding history.
    pub history_cap: usize,

    /// Optional REST endpoint for funding-history preload.
    pub history_endpoint: Option<String>,

    /// Static symbol correlation map consumed by the risk engine.
    pub correlations: HashMap<String, Decimal>,

    /// Per-venue credentials and symbol mapping.
    pub venues: HashMap<String, VenueCredentials>,

    /// Notification delivery endpoints.
    pub notification: NotificationParams,
}

/// Funding-rate thresholds (magnitudes).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Warning alert above this magnitude.
    pub warning: Decimal,
    /// Critical alert above this magnitude.
    pub critical: Decimal,
    /// Cross-venue spread that opens a hedge.
    pub arbitrage: Decimal,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: Decimal::new(5, 4),    // 0.0005
            critical: Decimal::new(1, 3),   // 0.001
            arbitrage: Decimal::new(2, 3),  // 0.002
        }
    }
}

/// Periodic loop intervals.
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    /// Funding snapshot poll.
    pub polling: Duration,
    /// Active-hedge monitor.
    pub monitor: Duration,
    /// Risk engine tick.
    pub risk: Duration,
    /// Rebalancer tick.
    pub rebalance: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            polling: Duration::from_millis(30_000),
            monitor: Duration::from_millis(10_000),
            risk: Duration::from_millis(10_000),
            rebalance: Duration::from_millis(60_000),
        }
    }
}

/// Per-leg sizing policy.
///
/// The source formulation sizes each leg from the same USD notional, which
/// yields different quantities when marks differ (`EqualNotional`).
/// `EqualQty` uses the smaller of the two computed quantities on both legs
/// for a strict delta-neutral hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegSizing {
    EqualNotional,
    EqualQty,
}

impl std::str::FromStr for LegSizing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "equal_notional" => Ok(LegSizing::EqualNotional),
            "equal_qty" => Ok(LegSizing::EqualQty),
            _ => Err(format!("unknown leg sizing policy: {}", s)),
        }
    }
}

/// Hedge sizing and exit parameters.
#[derive(Debug, Clone)]
pub struct HedgeParams {
    /// Fraction of the smaller available balance committed per hedge.
    pub size_ratio: Decimal,
    /// Leg sizing policy.
    pub leg_sizing: LegSizing,
    /// Stop-loss on the spread ratio move.
    pub stop_loss: Decimal,
    /// Take-profit target; triggered at half of it.
    pub take_profit: Decimal,
    /// Force-close hedges older than this. Zero disables.
    pub max_hold: Duration,
}

impl Default for HedgeParams {
    fn default() -> Self {
        Self {
            size_ratio: Decimal::new(5, 1),  // 0.5
            leg_sizing: LegSizing::EqualNotional,
            stop_loss: Decimal::new(5, 2),   // 0.05
            take_profit: Decimal::new(10, 2), // 0.10
            max_hold: Duration::from_secs(1800),
        }
    }
}

/// Risk engine parameters.
#[derive(Debug, Clone, Copy)]
pub struct RiskParamsConfig {
    /// Maximum |net exposure| / total portfolio value.
    pub max_exposure: Decimal,
}

impl Default for RiskParamsConfig {
    fn default() -> Self {
        Self {
            max_exposure: Decimal::new(10, 2), // 0.10
        }
    }
}

/// Rebalancer parameters.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceParams {
    /// Deviation from the mean balance (as a share of total) that makes a
    /// venue a rebalance candidate.
    pub threshold: Decimal,
}

impl Default for RebalanceParams {
    fn default() -> Self {
        Self {
            threshold: Decimal::new(3, 2), // 0.03
        }
    }
}

/// Extreme-event detector parameters.
#[derive(Debug, Clone)]
pub struct ExtremeParams {
    /// Single-interval return flagged as surge/crash.
    pub return_limit: Decimal,
    /// Latest volume below this share of the window mean is a liquidity drop.
    pub liquidity_ratio: Decimal,
    /// Instantaneous volatility above this multiple of the window mean.
    pub vol_multiplier: f64,
    /// Log-return window length.
    pub window: usize,
}

impl Default for ExtremeParams {
    fn default() -> Self {
        Self {
            return_limit: Decimal::new(5, 2),    // 0.05
            liquidity_ratio: Decimal::new(30, 2), // 0.30
            vol_multiplier: 3.0,
            window: 20,
        }
    }
}

/// Per-venue credentials and symbol mapping.
#[derive(Debug, Clone, Default)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub proxy: Option<String>,
    /// Canonical symbol -> venue-native symbol (e.g. BTCUSDT -> BTC-USDT-SWAP).
    pub symbol_map: HashMap<String, String>,
}

/// Notification delivery endpoints.
#[derive(Debug, Clone, Default)]
pub struct NotificationParams {
    pub webhook: Option<String>,
    pub chat: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            auto_hedge: false,
            trade_asset: "USDT".to_string(),
            thresholds: Thresholds::default(),
            intervals: Intervals::default(),
            hedge: HedgeParams::default(),
            risk: RiskParamsConfig::default(),
            rebalance: RebalanceParams::default(),
            extreme: ExtremeParams::default(),
            history_cap: 200,
            history_endpoint: None,
            correlations: HashMap::new(),
            venues: HashMap::new(),
            notification: NotificationParams::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let toml_config: BotToml =
            toml::from_str(&contents).with_context(|| format!("failed to parse {:?}", path))?;
        let config = toml_config.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides for secrets:
    /// `HEDGE_<VENUE>_API_KEY`, `HEDGE_<VENUE>_API_SECRET`,
    /// `HEDGE_WEBHOOK_URL`.
    pub fn apply_env_overrides(&mut self) {
        for (name, creds) in self.venues.iter_mut() {
            let prefix = format!("HEDGE_{}", name.to_uppercase());
            if let Ok(key) = std::env::var(format!("{prefix}_API_KEY")) {
                creds.api_key = key;
            }
            if let Ok(secret) = std::env::var(format!("{prefix}_API_SECRET")) {
                creds.api_secret = secret;
            }
        }
        if let Ok(url) = std::env::var("HEDGE_WEBHOOK_URL") {
            self.notification.webhook = Some(url);
        }
    }

    /// Reject configurations the engine cannot run with. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.warning <= Decimal::ZERO {
            bail!("thresholds.warning must be positive");
        }
        if self.thresholds.critical < self.thresholds.warning {
            bail!("thresholds.critical must be >= thresholds.warning");
        }
        if self.thresholds.arbitrage <= Decimal::ZERO {
            bail!("thresholds.arbitrage must be positive");
        }
        if self.hedge.size_ratio <= Decimal::ZERO || self.hedge.size_ratio > Decimal::ONE {
            bail!("hedge.size_ratio must be in (0, 1]");
        }
        if self.risk.max_exposure <= Decimal::ZERO {
            bail!("risk.max_exposure must be positive");
        }
        if self.history_cap == 0 {
            bail!("history_cap must be at least 1");
        }
        if self.extreme.window < 2 {
            bail!("extreme.window must be at least 2");
        }
        Ok(())
    }
}

// ============================================================================
// TOML mirror structs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BotToml {
    log_level: Option<String>,
    auto_hedge: Option<bool>,
    trade_asset: Option<String>,
    polling_interval_ms: Option<u64>,
    monitor_interval_ms: Option<u64>,
    risk_interval_ms: Option<u64>,
    rebalance_interval_ms: Option<u64>,
    history_cap: Option<usize>,
    history_endpoint: Option<String>,
    thresholds: ThresholdsToml,
    hedge: HedgeToml,
    risk: RiskToml,
    rebalance: RebalanceToml,
    extreme: ExtremeToml,
    correlations: HashMap<String, f64>,
    venues: HashMap<String, VenueToml>,
    notification: NotificationToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ThresholdsToml {
    warning: f64,
    critical: f64,
    arbitrage: f64,
}

impl Default for ThresholdsToml {
    fn default() -> Self {
        Self {
            warning: 0.0005,
            critical: 0.001,
            arbitrage: 0.002,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HedgeToml {
    size_ratio: f64,
    leg_sizing: String,
    stop_loss: f64,
    take_profit: f64,
    max_hold_secs: u64,
}

impl Default for HedgeToml {
    fn default() -> Self {
        Self {
            size_ratio: 0.5,
            leg_sizing: "equal_notional".to_string(),
            stop_loss: 0.05,
            take_profit: 0.10,
            max_hold_secs: 1800,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RiskToml {
    max_exposure: f64,
}

impl Default for RiskToml {
    fn default() -> Self {
        Self { max_exposure: 0.10 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RebalanceToml {
    threshold: f64,
}

impl Default for RebalanceToml {
    fn default() -> Self {
        Self { threshold: 0.03 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ExtremeToml {
    return_limit: f64,
    liquidity_ratio: f64,
    vol_multiplier: f64,
    window: usize,
}

impl Default for ExtremeToml {
    fn default() -> Self {
        Self {
            return_limit: 0.05,
            liquidity_ratio: 0.30,
            vol_multiplier: 3.0,
            window: 20,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VenueToml {
    api_key: String,
    api_secret: String,
    proxy: Option<String>,
    symbol_map: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NotificationToml {
    webhook: Option<String>,
    chat: Option<String>,
}

/// Convert an f64 ratio from TOML to Decimal.
fn ratio_to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

impl BotToml {
    fn into_config(self) -> Result<BotConfig> {
        let defaults = BotConfig::default();
        let default_intervals = Intervals::default();

        let leg_sizing = self
            .hedge
            .leg_sizing
            .parse::<LegSizing>()
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(BotConfig {
            log_level: self.log_level.unwrap_or(defaults.log_level),
            auto_hedge: self.auto_hedge.unwrap_or(defaults.auto_hedge),
            trade_asset: self.trade_asset.unwrap_or(defaults.trade_asset),
            thresholds: Thresholds {
                warning: ratio_to_decimal(self.thresholds.warning),
                critical: ratio_to_decimal(self.thresholds.critical),
                arbitrage: ratio_to_decimal(self.thresholds.arbitrage),
            },
            intervals: Intervals {
                polling: self
                    .polling_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_intervals.polling),
                monitor: self
                    .monitor_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_intervals.monitor),
                risk: self
                    .risk_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_intervals.risk),
                rebalance: self
                    .rebalance_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_intervals.rebalance),
            },
            hedge: HedgeParams {
                size_ratio: ratio_to_decimal(self.hedge.size_ratio),
                leg_sizing,
                stop_loss: ratio_to_decimal(self.hedge.stop_loss),
                take_profit: ratio_to_decimal(self.hedge.take_profit),
                max_hold: Duration::from_secs(self.hedge.max_hold_secs),
            },
            risk: RiskParamsConfig {
                max_exposure: ratio_to_decimal(self.risk.max_exposure),
            },
            rebalance: RebalanceParams {
                threshold: ratio_to_decimal(self.rebalance.threshold),
            },
            extreme: ExtremeParams {
                return_limit: ratio_to_decimal(self.extreme.return_limit),
                liquidity_ratio: ratio_to_decimal(self.extreme.liquidity_ratio),
                vol_multiplier: self.extreme.vol_multiplier,
                window: self.extreme.window,
            },
            history_cap: self.history_cap.unwrap_or(defaults.history_cap),
            history_endpoint: self.history_endpoint,
            correlations: self
                .correlations
                .into_iter()
                .map(|(symbol, value)| (symbol, ratio_to_decimal(value)))
                .collect(),
            venues: self
                .venues
                .into_iter()
                .map(|(name, v)| {
                    (
                        name,
                        VenueCredentials {
                            api_key: v.api_key,
                            api_secret: v.api_secret,
                            proxy: v.proxy,
                            symbol_map: v.symbol_map,
                        },
                    )
                })
                .collect(),
            notification: NotificationParams {
                webhook: self.notification.webhook,
                chat: self.notification.chat,
            },
        })
    }
}
