//! Risk management: portfolio exposure, de-risking, and PnL accounting.

pub mod engine;
pub mod pnl;

pub use engine::{ExposureSnapshot, RiskEngine, RiskParams};
pub use pnl::{Pnl, PnlTracker};
