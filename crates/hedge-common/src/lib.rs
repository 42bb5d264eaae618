//! Shared types for the funding-rate hedge engine.
//!
//! This crate contains:
//! - Common types (Side, FundingObservation, MarketQuote, OrderRef, PositionInfo)
//! - The optional funding-history preload client

pub mod history;
pub mod types;

pub use history::{HistoryClient, HistoryConfig, HistoryError};
pub use types::*;
