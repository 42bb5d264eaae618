//! Multi-venue funding-rate arbitrage and hedge engine.
//!
//! Continuously ingests perpetual-futures funding rates and mark prices
//! from several venues, detects cross-venue funding spreads worth hedging,
//! opens delta-neutral long/short pairs to harvest the spread, and manages
//! the resulting positions (monitoring, TP/SL, emergency unwind, capital
//! rebalancing).
//!
//! ## Architecture
//!
//! - `venue`: the adapter trait every exchange implements, plus the
//!   reconnecting stream helper and the scriptable mock venue
//! - `store`: per-(venue, symbol) latest state with bounded history
//! - `poller`: periodic snapshot fan-out and stream ingest
//! - `detector`: funding alerts, arbitrage scan, extreme-event detection
//! - `hedge`: the per-key hedge state machine
//! - `risk`: exposure tracking, de-risking, emergency shutdown, PnL
//! - `rebalance`: cross-venue balance equalization
//! - `engine`: loop lifecycle and the operator surface

pub mod config;
pub mod detector;
pub mod engine;
pub mod events;
pub mod hedge;
pub mod notify;
pub mod poller;
pub mod rebalance;
pub mod risk;
pub mod state;
pub mod store;
pub mod venue;

pub use config::{BotConfig, HedgeParams, Intervals, LegSizing, Thresholds};
pub use detector::{ArbOpportunity, Detector, ExtremeDetector, ExtremeKind};
pub use engine::{Engine, EngineStatus};
pub use events::{AlertLevel, EngineEvent, EventBus, EventSubscription};
pub use hedge::{hedge_key, CloseReason, Hedge, HedgeError, HedgeManager, HedgeState, OpenOutcome};
pub use notify::{Notifier, NotifyError, WebhookNotifier};
pub use poller::Poller;
pub use rebalance::{Rebalancer, Transfer};
pub use risk::{ExposureSnapshot, Pnl, PnlTracker, RiskEngine, RiskParams};
pub use state::ControlFlags;
pub use store::MarketStore;
pub use venue::{MockVenue, MockVenueConfig, StreamBackoff, VenueAdapter, VenueError};
