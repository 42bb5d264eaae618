//! Funding-history preload client.
//!
//! At startup the engine may preload a bounded funding-rate history from a
//! REST collaborator so spread averages are meaningful from the first tick.
//! The endpoint returns a JSON array of rows:
//!
//! ```json
//! [{"venue": "binance", "symbol": "BTCUSDT", "rate": "0.0001",
//!   "timestamp": 1717000000000, "next_time": 1717028800000}]
//! ```
//!
//! Preload is best-effort: any failure is reported to the caller, who is
//! expected to log it and continue with empty history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::FundingObservation;

/// Request timeout for history preload calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while preloading history.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error status.
    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    /// A row carried a timestamp outside the representable range.
    #[error("invalid timestamp in history row: {0}")]
    InvalidTimestamp(i64),
}

/// Configuration for the history preload client.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Endpoint returning the JSON row array.
    pub endpoint: String,
    /// Maximum number of rows to keep (newest wins).
    pub limit: usize,
}

/// One row of the history endpoint's response.
#[derive(Debug, Deserialize)]
struct HistoryRow {
    venue: String,
    symbol: String,
    rate: Decimal,
    /// Milliseconds since epoch.
    timestamp: i64,
    /// Next funding time, milliseconds since epoch.
    #[serde(default)]
    next_time: Option<i64>,
}

/// REST client for the optional funding-history collaborator.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    client: Client,
    config: HistoryConfig,
}

impl HistoryClient {
    pub fn new(config: HistoryConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Fetch up to `limit` historical observations, oldest first.
    pub async fn fetch(&self) -> Result<Vec<FundingObservation>, HistoryError> {
        let response = self.client.get(&self.config.endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<HistoryRow> = response.json().await?;
        debug!(rows = rows.len(), "history preload fetched");

        let mut observations = Vec::with_capacity(rows.len().min(self.config.limit));
        for row in rows {
            let observed_at = millis_to_datetime(row.timestamp)?;
            let next_funding_time = match row.next_time {
                Some(ms) => Some(millis_to_datetime(ms)?),
                None => None,
            };
            observations.push(FundingObservation {
                venue: row.venue,
                symbol: row.symbol,
                rate: row.rate,
                next_funding_time,
                observed_at,
            });
        }

        observations.sort_by_key(|o| o.observed_at);
        if observations.len() > self.config.limit {
            let excess = observations.len() - self.config.limit;
            observations.drain(..excess);
        }
        Ok(observations)
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(HistoryError::InvalidTimestamp(ms))
}
