//! Venue adapter abstraction.
//!
//! This module defines the `VenueAdapter` trait that abstracts a derivatives
//! exchange. The engine only ever talks to venues through this trait, so the
//! same coordination code works against:
//! - Real exchange SDKs (REST + WebSocket, implemented out of tree)
//! - `MockVenue` for tests and paper runs
//!
//! ## Contract
//!
//! - Symbols crossing this boundary are canonical uppercase (e.g. `BTCUSDT`);
//!   per-venue naming is translated inside the adapter using the configured
//!   symbol map.
//! - Every operation fails with a `VenueError`; adapters never panic the
//!   process.
//! - Stream subscriptions deliver events sequentially per venue and must
//!   auto-reconnect with bounded exponential backoff (see `stream`).

pub mod mock;
pub mod stream;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use hedge_common::{FundingObservation, OrderRef, PositionInfo, Side, StreamEvent};

pub use mock::{MockVenue, MockVenueConfig};
pub use stream::{run_with_reconnect, ws_connect, StreamBackoff, WsStream};

/// Errors surfaced by venue adapters.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("bad symbol: {0}")]
    BadSymbol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("exchange error {code}: {msg}")]
    Exchange { code: i64, msg: String },
}

impl VenueError {
    /// Whether a read-path call may be retried (bounded, with backoff).
    ///
    /// Order placement is never auto-retried, regardless of this flag.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, VenueError::Network(_) | VenueError::RateLimited)
    }
}

/// Attempts for retriable read-path calls.
const READ_ATTEMPTS: u32 = 3;

/// Base delay between read retries; doubles per attempt.
const READ_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

/// Run a read-path call with bounded retries on retriable errors.
///
/// Up to three attempts with doubling backoff, for `Network` and
/// `RateLimited` only. Order placement must never go through this.
pub async fn retry_read<T, F, Fut>(mut op: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, VenueError>>,
{
    let mut delay = READ_RETRY_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < READ_ATTEMPTS => {
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Uniform capability set every venue must provide.
///
/// All monetary values are denominated in the configured quote asset
/// (default USDT). `transfer_to` may fail with `Unsupported` on venues
/// without an internal transfer API.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable venue identifier used in keys, events, and logs.
    fn name(&self) -> &str;

    /// Current funding rates for all tradable perpetual symbols.
    async fn fetch_funding_rates(&self) -> Result<Vec<FundingObservation>, VenueError>;

    /// Current funding rate for one symbol.
    async fn get_funding_rate(&self, symbol: &str) -> Result<Decimal, VenueError>;

    /// Arithmetic mean of historical funding rates at or after `since`.
    /// Returns 0 when the venue has no rows in the window.
    async fn get_avg_funding_rate(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, VenueError>;

    /// Current mark price for one symbol.
    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, VenueError>;

    /// All non-zero positions, keyed by symbol.
    async fn get_positions(&self) -> Result<HashMap<String, PositionInfo>, VenueError>;

    /// Total balance in the quote asset (including margin in use).
    async fn get_total_balance(&self) -> Result<Decimal, VenueError>;

    /// Balance available for new positions.
    async fn get_available_balance(&self) -> Result<Decimal, VenueError>;

    /// Submit a market order. Never auto-retried by the engine.
    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<OrderRef, VenueError>;

    /// Close (part of) a position with a market order.
    ///
    /// With `side`/`qty` given, submits a market order of that side and
    /// quantity. With both omitted, looks up the live position and closes it
    /// in full.
    async fn close_position(
        &self,
        symbol: &str,
        side: Option<Side>,
        qty: Option<Decimal>,
    ) -> Result<OrderRef, VenueError>;

    /// Transfer `amount` of `asset` to another venue.
    async fn transfer_to(
        &self,
        dest_venue: &str,
        amount: Decimal,
        asset: &str,
    ) -> Result<(), VenueError>;

    /// Start the push-based stream, delivering events into `tx` until the
    /// engine shuts down. The adapter owns reconnection (see
    /// `stream::StreamBackoff`); events for one venue arrive in source order.
    async fn subscribe_stream(&self, tx: mpsc::Sender<StreamEvent>) -> Result<(), VenueError>;
}
