//! Cross-venue capital rebalancer.
//!
//! Periodically equalizes working capital: venues far enough above the mean
//! balance donate to venues below it. Transfers are best-effort; a venue
//! without an internal transfer API fails with `Unsupported` and is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::RebalanceParams;
use crate::venue::{retry_read, VenueAdapter, VenueError};

/// A transfer executed (or attempted) during one rebalance pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
}

/// Periodic balance equalizer.
pub struct Rebalancer {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    params: RebalanceParams,
    trade_asset: String,
}

impl Rebalancer {
    pub fn new(
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        params: RebalanceParams,
        trade_asset: String,
    ) -> Self {
        Self {
            venues,
            params,
            trade_asset,
        }
    }

    /// One rebalance pass. Returns the transfers that were completed.
    pub async fn tick(&self) -> Vec<Transfer> {
        let balances = self.collect_balances().await;
        if balances.len() < 2 {
            return Vec::new();
        }

        let total: Decimal = balances.iter().map(|(_, bal)| *bal).sum();
        if total <= Decimal::ZERO {
            return Vec::new();
        }
        let avg = total / Decimal::from(balances.len() as u64);

        // Candidates deviate from the mean by more than the threshold share
        // of total capital.
        let mut donors: Vec<(String, Decimal)> = Vec::new();
        let mut recipients: Vec<(String, Decimal)> = Vec::new();
        for (venue, balance) in &balances {
            let deviation = (*balance - avg).abs() / total;
            if *balance > avg && deviation > self.params.threshold {
                donors.push((venue.clone(), *balance - avg));
            } else if *balance < avg {
                recipients.push((venue.clone(), avg - *balance));
            }
        }
        if donors.is_empty() || recipients.is_empty() {
            debug!("rebalance: nothing to do");
            return Vec::new();
        }

        donors.sort_by(|a, b| b.1.cmp(&a.1));
        recipients.sort_by(|a, b| b.1.cmp(&a.1));

        let mut completed = Vec::new();

        for (donor, mut excess) in donors {
            for (recipient, deficit) in recipients.iter_mut() {
                if excess <= Decimal::ZERO {
                    break;
                }
                if *deficit <= Decimal::ZERO {
                    continue;
                }
                let amount = excess.min(*deficit);

                let Some(adapter) = self.venues.get(&donor) else {
                    continue;
                };
                match adapter
                    .transfer_to(recipient, amount, &self.trade_asset)
                    .await
                {
                    Ok(()) => {
                        info!(from = %donor, to = %recipient, %amount, asset = %self.trade_asset,
                            "rebalance transfer");
                        excess -= amount;
                        *deficit -= amount;
                        completed.push(Transfer {
                            from: donor.clone(),
                            to: recipient.clone(),
                            amount,
                        });
                    }
                    Err(VenueError::Unsupported(msg)) => {
                        debug!(from = %donor, to = %recipient, %msg, "transfer unsupported, skipped");
                    }
                    Err(e) => {
                        warn!(from = %donor, to = %recipient, error = %e, "transfer failed");
                    }
                }
            }
        }
        completed
    }

    async fn collect_balances(&self) -> Vec<(String, Decimal)> {
        let fetches = self.venues.iter().map(|(name, venue)| async move {
            (name.clone(), retry_read(|| venue.get_total_balance()).await)
        });

        let mut balances = Vec::new();
        for (venue, result) in join_all(fetches).await {
            match result {
                Ok(balance) => balances.push((venue, balance)),
                Err(e) => warn!(venue = %venue, error = %e, "balance fetch failed"),
            }
        }
        balances.sort_by(|a, b| a.0.cmp(&b.0));
        balances
    }
}
