//! Engine event bus.
//!
//! Every user-visible occurrence (alerts, opportunities, hedge transitions,
//! risk breaches, daily PnL) is published as a tagged `EngineEvent`. The bus
//! delivers over two paths with different loss guarantees:
//!
//! - **Lossless**: hedge lifecycle transitions and risk events go through a
//!   per-subscriber unbounded queue and are never dropped.
//! - **Drop-oldest**: market telemetry (alerts, fetch failures, arbitrage
//!   signals, extreme events) rides a bounded broadcast channel; a lagging
//!   subscriber loses the oldest telemetry, never a hedge transition.
//!
//! Subscribers must not block the publisher; `publish` never waits.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::detector::ExtremeKind;
use crate::hedge::CloseReason;

/// Default capacity of the drop-oldest telemetry channel.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Funding alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tagged engine event, JSON-serializable for the notification collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Funding magnitude crossed the warning or critical threshold.
    Alert {
        level: AlertLevel,
        venue: String,
        symbol: String,
        rate: Decimal,
        message: String,
        ts: DateTime<Utc>,
    },
    /// A venue's snapshot fetch failed; the poll cycle continued without it.
    FetchFailed {
        venue: String,
        error: String,
        ts: DateTime<Utc>,
    },
    /// Cross-venue funding spread above the arbitrage threshold.
    Arbitrage {
        symbol: String,
        long_venue: String,
        short_venue: String,
        long_rate: Decimal,
        short_rate: Decimal,
        spread: Decimal,
        ts: DateTime<Utc>,
    },
    /// Abnormal market behavior flagged by the extreme-event detector.
    ExtremeEvent {
        kind: ExtremeKind,
        symbol: String,
        value: Decimal,
        ts: DateTime<Utc>,
    },
    /// Both hedge legs filled.
    HedgeOpened {
        key: String,
        symbol: String,
        long_venue: String,
        short_venue: String,
        size: Decimal,
        entry_ratio: Decimal,
        ts: DateTime<Utc>,
    },
    /// Hedge fully closed on both venues.
    HedgeClosed {
        key: String,
        reason: CloseReason,
        realized_pnl: Decimal,
        ts: DateTime<Utc>,
    },
    /// Hedge open failed; `partial_fill` marks a reconciled one-leg fill.
    HedgeFailed {
        key: String,
        partial_fill: bool,
        error: String,
        ts: DateTime<Utc>,
    },
    /// A close leg kept failing after bounded retries. Operator action needed.
    HedgeCloseFailed {
        key: String,
        error: String,
        ts: DateTime<Utc>,
    },
    /// Hedge state transition (audit trail).
    StateChange {
        key: String,
        from: String,
        to: String,
        ts: DateTime<Utc>,
    },
    /// Portfolio exposure ratio breached the configured ceiling.
    RiskExceeded {
        exposure: Decimal,
        ts: DateTime<Utc>,
    },
    /// Daily PnL at the day rollover, before the reset.
    DailyPnl {
        value: Decimal,
        ts: DateTime<Utc>,
    },
    /// Emergency shutdown completed.
    EmergencyShutdown { ts: DateTime<Utc> },
}

impl EngineEvent {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Alert { .. } => "alert",
            EngineEvent::FetchFailed { .. } => "fetch_failed",
            EngineEvent::Arbitrage { .. } => "arbitrage",
            EngineEvent::ExtremeEvent { .. } => "extreme_event",
            EngineEvent::HedgeOpened { .. } => "hedge_opened",
            EngineEvent::HedgeClosed { .. } => "hedge_closed",
            EngineEvent::HedgeFailed { .. } => "hedge_failed",
            EngineEvent::HedgeCloseFailed { .. } => "hedge_close_failed",
            EngineEvent::StateChange { .. } => "state_change",
            EngineEvent::RiskExceeded { .. } => "risk_exceeded",
            EngineEvent::DailyPnl { .. } => "daily_pnl",
            EngineEvent::EmergencyShutdown { .. } => "emergency_shutdown",
        }
    }

    /// Whether this event rides the lossless path. Hedge lifecycle, risk,
    /// and PnL events are never dropped; market telemetry may be.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            EngineEvent::Alert { .. }
                | EngineEvent::FetchFailed { .. }
                | EngineEvent::Arbitrage { .. }
                | EngineEvent::ExtremeEvent { .. }
        )
    }
}

/// Many-to-many event bus with a lossless path for critical events and a
/// bounded drop-oldest path for telemetry.
#[derive(Debug, Clone)]
pub struct EventBus {
    lossy: broadcast::Sender<EngineEvent>,
    critical: Arc<RwLock<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (lossy, _) = broadcast::channel(capacity);
        Self {
            lossy,
            critical: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Publish an event. Publishing never blocks and never fails; telemetry
    /// with no live subscribers is simply dropped, critical events are
    /// queued for every live subscription.
    pub fn publish(&self, event: EngineEvent) {
        debug!(kind = event.kind(), "event published");
        if event.is_critical() {
            let mut senders = self.critical.write();
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        } else {
            let _ = self.lossy.send(event);
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.critical.write().push(tx);
        EventSubscription {
            lossy: self.lossy.subscribe(),
            critical: rx,
            lossy_closed: false,
            critical_closed: false,
        }
    }

    /// Number of live telemetry subscribers (diagnostics only).
    pub fn subscriber_count(&self) -> usize {
        self.lossy.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// One subscriber's view of both delivery paths.
///
/// Critical events are drained first. A lag on the telemetry side is logged
/// and skipped; it never affects the critical queue.
pub struct EventSubscription {
    lossy: broadcast::Receiver<EngineEvent>,
    critical: mpsc::UnboundedReceiver<EngineEvent>,
    lossy_closed: bool,
    critical_closed: bool,
}

impl EventSubscription {
    /// Next event from either path. Returns `None` once the bus is gone and
    /// both queues are drained.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            if self.lossy_closed && self.critical_closed {
                return None;
            }
            tokio::select! {
                biased;
                event = self.critical.recv(), if !self.critical_closed => match event {
                    Some(event) => return Some(event),
                    None => self.critical_closed = true,
                },
                result = self.lossy.recv(), if !self.lossy_closed => match result {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscriber lagged, telemetry events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.lossy_closed = true,
                },
            }
        }
    }

    /// Non-blocking variant of `recv`, critical events first.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        if let Ok(event) = self.critical.try_recv() {
            return Some(event);
        }
        loop {
            match self.lossy.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, telemetry events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
