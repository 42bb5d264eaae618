//! Market data aggregation: periodic snapshots plus stream ingest.
//!
//! On each tick every venue's funding snapshot is fetched concurrently with
//! a per-call timeout of half the polling interval. The strategy is
//! all-settled: a failing venue is logged and emitted as `FetchFailed`, the
//! others proceed. Observations write through to the store and feed the
//! detector; after a full cycle the cross-venue arbitrage scan runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hedge_common::{FundingObservation, HistoryClient, StreamEvent};

use crate::detector::{ArbOpportunity, Detector, ExtremeDetector};
use crate::events::{AlertLevel, EngineEvent, EventBus};
use crate::store::MarketStore;
use crate::venue::{retry_read, VenueAdapter};

/// Snapshot poller and stream ingest front-end for the market store.
pub struct Poller {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    store: Arc<MarketStore>,
    detector: Arc<Detector>,
    extreme: Arc<ExtremeDetector>,
    bus: EventBus,
    /// Per-venue fetch timeout; half the polling interval.
    fetch_timeout: Duration,
}

impl Poller {
    pub fn new(
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        store: Arc<MarketStore>,
        detector: Arc<Detector>,
        extreme: Arc<ExtremeDetector>,
        bus: EventBus,
        polling_interval: Duration,
    ) -> Self {
        Self {
            venues,
            store,
            detector,
            extreme,
            bus,
            fetch_timeout: polling_interval / 2,
        }
    }

    /// One full snapshot cycle across all venues, then the arbitrage scan.
    /// Returns the opportunities found this cycle.
    pub async fn poll_once(&self) -> Vec<ArbOpportunity> {
        let fetches = self.venues.iter().map(|(name, venue)| async move {
            let result = timeout(
                self.fetch_timeout,
                retry_read(|| venue.fetch_funding_rates()),
            )
            .await;
            (name.clone(), result)
        });

        for (venue, result) in join_all(fetches).await {
            match result {
                Ok(Ok(observations)) => {
                    debug!(venue = %venue, count = observations.len(), "funding snapshot");
                    for obs in observations {
                        self.ingest_funding(obs);
                    }
                }
                Ok(Err(e)) => {
                    warn!(venue = %venue, error = %e, "funding fetch failed");
                    self.bus.publish(EngineEvent::FetchFailed {
                        venue,
                        error: e.to_string(),
                        ts: chrono::Utc::now(),
                    });
                }
                Err(_) => {
                    warn!(venue = %venue, timeout = ?self.fetch_timeout, "funding fetch timed out");
                    self.bus.publish(EngineEvent::FetchFailed {
                        venue,
                        error: format!("timed out after {:?}", self.fetch_timeout),
                        ts: chrono::Utc::now(),
                    });
                }
            }
        }

        self.detector.scan_arbitrage(&self.store)
    }

    /// Ingest one push-based stream event. A critical funding rate triggers
    /// an immediate arbitrage re-evaluation instead of waiting for the next
    /// snapshot cycle; any opportunities it finds are returned to the caller.
    pub fn ingest_stream_event(&self, event: StreamEvent) -> Vec<ArbOpportunity> {
        match event {
            StreamEvent::Funding(obs) => {
                if self.ingest_funding(obs) == Some(AlertLevel::Critical) {
                    return self.detector.scan_arbitrage(&self.store);
                }
            }
            StreamEvent::Ticker(quote) => {
                self.extreme
                    .observe(&quote.symbol, quote.mark_price, None, quote.observed_at);
                self.store.ingest_quote(quote);
            }
            StreamEvent::Position { venue, symbol, .. } => {
                // Position truth lives on the venue; the risk engine reads it
                // directly each tick.
                debug!(venue = %venue, symbol = %symbol, "position stream event");
            }
        }
        Vec::new()
    }

    /// Write-through plus detector evaluation for one funding observation.
    fn ingest_funding(&self, obs: FundingObservation) -> Option<AlertLevel> {
        self.store.ingest_funding(obs.clone());
        self.detector.evaluate(&obs)
    }

    /// Best-effort history preload at startup. The engine continues with an
    /// empty history on any failure.
    pub async fn preload_history(&self, client: &HistoryClient) {
        match client.fetch().await {
            Ok(observations) => {
                info!(count = observations.len(), "funding history preloaded");
                for obs in observations {
                    self.store.ingest_funding(obs);
                }
            }
            Err(e) => {
                warn!(error = %e, "history preload failed, continuing with empty history");
            }
        }
    }
}
