//! Reconnecting stream support for venue adapters.
//!
//! Adapters own their WebSocket framing, but every one of them needs the
//! same outer loop: run a session until it drops, then reconnect with
//! bounded exponential backoff, aborting promptly on shutdown. This module
//! provides that loop plus a timeout-guarded connect helper.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::VenueError;

/// Initial reconnect delay.
const INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Reconnect delay ceiling.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Connect timeout for a single WebSocket dial.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A WebSocket stream as produced by `ws_connect`.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bounded exponential backoff: 5s, 10s, 20s, 40s, 60s, 60s, ...
///
/// Reset after any successful session so a healthy stream that drops once
/// reconnects quickly.
#[derive(Debug, Clone)]
pub struct StreamBackoff {
    delay: Duration,
}

impl StreamBackoff {
    pub fn new() -> Self {
        Self { delay: INITIAL_DELAY }
    }

    /// Current delay, then advance to the next step.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        current
    }

    /// Reset to the initial delay.
    pub fn reset(&mut self) {
        self.delay = INITIAL_DELAY;
    }
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial a WebSocket endpoint with a connect timeout.
pub async fn ws_connect(url: &str) -> Result<WsStream, VenueError> {
    match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(VenueError::Network(e.to_string())),
        Err(_) => Err(VenueError::Network(format!("connect timeout: {url}"))),
    }
}

/// Drive `session` until shutdown, reconnecting on error with backoff.
///
/// `session` runs one connection to completion: `Ok(())` means a clean end
/// (shutdown observed inside the session) and stops the loop; `Err` triggers
/// a backoff sleep and a fresh session. The sleep itself is interrupted by
/// shutdown.
pub async fn run_with_reconnect<F, Fut>(
    venue: &str,
    mut shutdown: broadcast::Receiver<()>,
    mut session: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), VenueError>>,
{
    let mut backoff = StreamBackoff::new();

    loop {
        if shutdown.try_recv().is_ok() {
            info!(venue, "stream: shutdown signal received");
            return;
        }

        match session().await {
            Ok(()) => {
                info!(venue, "stream: clean shutdown");
                return;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(venue, error = %e, ?delay, "stream error, reconnecting");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!(venue, "stream: shutdown during reconnect");
                        return;
                    }
                }
            }
        }
    }
}
