//! In-memory market state store.
//!
//! Latest funding rate and mark price per (venue, symbol), plus a bounded
//! per-row funding history. The aggregator is the only writer; every other
//! component reads point-in-time row snapshots. Cross-row reads are not a
//! consistent cut and do not need to be.

use std::collections::{HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use rust_decimal::Decimal;

use hedge_common::{FundingObservation, MarketQuote};

/// Default bound on per-(venue, symbol) funding history.
pub const DEFAULT_HISTORY_CAP: usize = 200;

type RowKey = (String, String);

/// Per-venue, per-symbol latest market state with bounded funding history.
#[derive(Debug)]
pub struct MarketStore {
    history_cap: usize,
    funding: DashMap<RowKey, FundingObservation>,
    quotes: DashMap<RowKey, MarketQuote>,
    history: DashMap<RowKey, VecDeque<FundingObservation>>,
}

impl MarketStore {
    pub fn new(history_cap: usize) -> Self {
        Self {
            history_cap: history_cap.max(1),
            funding: DashMap::new(),
            quotes: DashMap::new(),
            history: DashMap::new(),
        }
    }

    /// Ingest a funding observation: overwrite the latest slot, append to
    /// history (evicting the oldest past the cap), and return the previous
    /// latest value for deduplication by the caller.
    pub fn ingest_funding(&self, obs: FundingObservation) -> Option<FundingObservation> {
        let key = (obs.venue.clone(), obs.symbol.clone());

        let mut row = self.history.entry(key.clone()).or_default();
        row.push_back(obs.clone());
        if row.len() > self.history_cap {
            row.pop_front();
        }
        drop(row);

        self.funding.insert(key, obs)
    }

    /// Ingest a mark-price quote, returning the previous value.
    pub fn ingest_quote(&self, quote: MarketQuote) -> Option<MarketQuote> {
        self.quotes
            .insert((quote.venue.clone(), quote.symbol.clone()), quote)
    }

    /// Latest funding observation for one row.
    pub fn funding(&self, venue: &str, symbol: &str) -> Option<FundingObservation> {
        self.funding
            .get(&(venue.to_string(), symbol.to_string()))
            .map(|r| r.value().clone())
    }

    /// Latest mark price quote for one row.
    pub fn quote(&self, venue: &str, symbol: &str) -> Option<MarketQuote> {
        self.quotes
            .get(&(venue.to_string(), symbol.to_string()))
            .map(|r| r.value().clone())
    }

    /// Snapshot of the funding history for one row, oldest first.
    pub fn history(&self, venue: &str, symbol: &str) -> Vec<FundingObservation> {
        self.history
            .get(&(venue.to_string(), symbol.to_string()))
            .map(|r| r.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Venues that currently have at least one funding row.
    pub fn venues_with_funding(&self) -> HashSet<String> {
        self.funding
            .iter()
            .map(|r| r.key().0.clone())
            .collect()
    }

    /// Latest rates grouped by symbol: symbol -> [(venue, rate)].
    ///
    /// The inner vectors are sorted by venue id so consumers get a
    /// deterministic iteration order.
    pub fn rates_by_symbol(&self) -> HashMap<String, Vec<(String, Decimal)>> {
        let mut by_symbol: HashMap<String, Vec<(String, Decimal)>> = HashMap::new();
        for row in self.funding.iter() {
            let (venue, symbol) = row.key();
            by_symbol
                .entry(symbol.clone())
                .or_default()
                .push((venue.clone(), row.value().rate));
        }
        for rates in by_symbol.values_mut() {
            rates.sort_by(|a, b| a.0.cmp(&b.0));
        }
        by_symbol
    }

    /// Number of funding rows currently held.
    pub fn funding_row_count(&self) -> usize {
        self.funding.len()
    }
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}
