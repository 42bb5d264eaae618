//! Notification delivery.
//!
//! The engine publishes events on the bus; delivery is a collaborator
//! concern behind the `Notifier` trait. The shipped `WebhookNotifier` posts
//! each event as JSON. Delivery is strictly best-effort: failures are logged
//! and never block or fail the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventBus};

/// Request timeout for webhook deliveries.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from notification delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {0}")]
    Status(u16),
}

/// Delivery endpoint for engine events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError>;
}

/// Posts events as JSON to a configured webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Forward bus events to a notifier until shutdown. The subscription keeps
/// every hedge-lifecycle event and may drop lagged telemetry; delivery
/// failures are logged and skipped.
pub fn spawn_notifier(
    bus: &EventBus,
    notifier: Arc<dyn Notifier>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = notifier.notify(&event).await {
                            warn!(kind = event.kind(), error = %e, "notification delivery failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => {
                    debug!("notifier shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct RecordingNotifier {
        kinds: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError> {
            self.kinds.lock().push(event.kind());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_are_forwarded_until_shutdown() {
        let bus = EventBus::new(16);
        let notifier = Arc::new(RecordingNotifier {
            kinds: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_notifier(&bus, notifier.clone(), shutdown_rx);
        bus.publish(EngineEvent::EmergencyShutdown { ts: Utc::now() });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(*notifier.kinds.lock(), vec!["emergency_shutdown"]);
    }
}
