//! Engine orchestrator.
//!
//! Wires the store, detector, hedge manager, risk engine, and rebalancer
//! together, runs the long-lived loops, and exposes the operator surface:
//! `start_hedging`, `stop_hedging`, `emergency_shutdown`, `status`.
//!
//! Every loop multiplexes its ticker against the shutdown broadcast; on
//! shutdown no new ticks start, in-flight work drains under a grace
//! deadline, and open hedges stay on their venues (closing them is the
//! operator's `emergency_shutdown`, never an automatic cancel consequence).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, warn};

use hedge_common::{HistoryClient, HistoryConfig, StreamEvent};

use crate::config::BotConfig;
use crate::detector::{ArbOpportunity, Detector, ExtremeDetector};
use crate::events::EventBus;
use crate::hedge::{Hedge, HedgeManager};
use crate::notify::{spawn_notifier, Notifier, WebhookNotifier};
use crate::poller::Poller;
use crate::rebalance::Rebalancer;
use crate::risk::{ExposureSnapshot, Pnl, PnlTracker, RiskEngine, RiskParams};
use crate::state::ControlFlags;
use crate::store::MarketStore;
use crate::venue::VenueAdapter;

/// Grace deadline for in-flight work after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared open path for polled and stream-surfaced opportunities.
async fn open_opportunities(
    hedges: &HedgeManager,
    flags: &ControlFlags,
    opportunities: Vec<ArbOpportunity>,
) {
    for opp in opportunities {
        if !flags.can_open() {
            continue;
        }
        match hedges.try_open(&opp).await {
            Ok(outcome) => {
                info!(symbol = %opp.symbol, ?outcome, "open attempt");
            }
            Err(e) => {
                warn!(symbol = %opp.symbol, error = %e, "open attempt failed");
            }
        }
    }
}

/// Stream ingest channel depth.
const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Serializable operator status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub auto_hedge: bool,
    pub emergency_stop: bool,
    pub active_hedges: usize,
    pub hedges: Vec<Hedge>,
    pub exposure: Option<ExposureSnapshot>,
    pub risk: RiskParams,
    pub pnl: Pnl,
    /// Number of (venue, symbol) funding rows in the store.
    pub funding_rows: usize,
}

/// The coordination brain: owns every component and the loop lifecycle.
pub struct Engine {
    config: BotConfig,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    store: Arc<MarketStore>,
    bus: EventBus,
    flags: Arc<ControlFlags>,
    poller: Arc<Poller>,
    hedges: Arc<HedgeManager>,
    risk: Arc<RiskEngine>,
    rebalancer: Arc<Rebalancer>,
    pnl: Arc<PnlTracker>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(config: BotConfig, venues: HashMap<String, Arc<dyn VenueAdapter>>) -> Self {
        let bus = EventBus::default();
        let flags = Arc::new(ControlFlags::new(config.auto_hedge));
        let store = Arc::new(MarketStore::new(config.history_cap));
        let detector = Arc::new(Detector::new(config.thresholds, bus.clone()));
        let extreme = Arc::new(ExtremeDetector::new(config.extreme.clone(), bus.clone()));
        let pnl = Arc::new(PnlTracker::new(bus.clone()));

        let poller = Arc::new(Poller::new(
            venues.clone(),
            store.clone(),
            detector,
            extreme,
            bus.clone(),
            config.intervals.polling,
        ));
        let hedges = Arc::new(HedgeManager::new(
            venues.clone(),
            config.hedge.clone(),
            config.thresholds.warning,
            flags.clone(),
            bus.clone(),
            pnl.clone(),
        ));
        let risk = Arc::new(RiskEngine::new(
            venues.clone(),
            config.risk,
            config.correlations.clone(),
            hedges.clone(),
            flags.clone(),
            bus.clone(),
        ));
        let rebalancer = Arc::new(Rebalancer::new(
            venues.clone(),
            config.rebalance,
            config.trade_asset.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            venues,
            store,
            bus,
            flags,
            poller,
            hedges,
            risk,
            rebalancer,
            pnl,
            shutdown_tx,
        }
    }

    /// The event bus, for collaborator subscriptions.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Enable automatic hedge opens.
    pub fn start_hedging(&self) {
        info!("auto hedging enabled");
        self.flags.enable_hedging();
    }

    /// Disable automatic hedge opens. Active hedges keep being monitored.
    pub fn stop_hedging(&self) {
        info!("auto hedging disabled");
        self.flags.disable_hedging();
    }

    /// Disable opens, close every hedge and position, emit the event.
    pub async fn emergency_shutdown(&self) {
        self.risk.emergency_shutdown().await;
    }

    /// Operator status snapshot.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            auto_hedge: self.flags.is_hedging_enabled(),
            emergency_stop: self.flags.is_emergency_stopped(),
            active_hedges: self.hedges.active_count(),
            hedges: self.hedges.hedges(),
            exposure: self.risk.latest_snapshot(),
            risk: self.risk.params(),
            pnl: self.pnl.snapshot(),
            funding_rows: self.store.funding_row_count(),
        }
    }

    /// Request graceful shutdown: loops stop ticking, streams close, no new
    /// orders. Open hedges remain on the venues.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.flags.request_shutdown();
        let _ = self.shutdown_tx.send(());
    }

    /// Run all loops until shutdown, then drain under the grace deadline.
    pub async fn run(&self) {
        let mut tasks = JoinSet::new();

        // Optional history preload; failure tolerated.
        if let Some(endpoint) = self.config.history_endpoint.clone() {
            let client = HistoryClient::new(HistoryConfig {
                endpoint,
                limit: self.config.history_cap,
            });
            self.poller.preload_history(&client).await;
        }

        self.spawn_stream_tasks(&mut tasks);
        self.spawn_poll_loop(&mut tasks);
        self.spawn_monitor_loop(&mut tasks);
        self.spawn_risk_loop(&mut tasks);
        self.spawn_rebalance_loop(&mut tasks);

        if let Some(url) = self.config.notification.webhook.clone() {
            let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(url));
            let _notifier_task = spawn_notifier(&self.bus, notifier, self.shutdown_tx.subscribe());
        }

        info!(
            venues = self.venues.len(),
            auto_hedge = self.config.auto_hedge,
            "engine running"
        );

        // Wait for shutdown, then give in-flight work the grace period.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(grace = ?SHUTDOWN_GRACE, "grace deadline hit, aborting remaining tasks");
            tasks.shutdown().await;
        }
        info!("engine stopped");
    }

    /// Per-venue stream subscriptions plus the single ingest consumer.
    fn spawn_stream_tasks(&self, tasks: &mut JoinSet<()>) {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);

        for (name, venue) in &self.venues {
            let name = name.clone();
            let venue = venue.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Err(e) = venue.subscribe_stream(tx).await {
                    warn!(venue = %name, error = %e, "stream subscription ended");
                }
            });
        }
        drop(tx);

        let poller = self.poller.clone();
        let hedges = self.hedges.clone();
        let flags = self.flags.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            // A critical streamed rate can surface
                            // opportunities ahead of the poll cadence.
                            let opportunities = poller.ingest_stream_event(event);
                            open_opportunities(&hedges, &flags, opportunities).await;
                        }
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_poll_loop(&self, tasks: &mut JoinSet<()>) {
        let poller = self.poller.clone();
        let hedges = self.hedges.clone();
        let flags = self.flags.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.config.intervals.polling;

        tasks.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let opportunities = poller.poll_once().await;
                        open_opportunities(&hedges, &flags, opportunities).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_monitor_loop(&self, tasks: &mut JoinSet<()>) {
        let hedges = self.hedges.clone();
        let store = self.store.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.config.intervals.monitor;

        tasks.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => hedges.monitor_once(&store).await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_risk_loop(&self, tasks: &mut JoinSet<()>) {
        let risk = self.risk.clone();
        let pnl = self.pnl.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.config.intervals.risk;

        tasks.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        risk.tick().await;
                        pnl.maybe_reset_daily(Local::now());
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_rebalance_loop(&self, tasks: &mut JoinSet<()>) {
        let rebalancer = self.rebalancer.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.config.intervals.rebalance;

        tasks.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        rebalancer.tick().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
