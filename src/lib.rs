//! # Spot Hedger
//!
//! Automated hedging of spot holdings with perpetuals and options.
//!
//! ## Architecture
//!
//! - `market`: Market data aggregation into versioned snapshots
//! - `ledger`: Authoritative positions, updated only from confirmed fills
//! - `risk`: Greeks aggregation, parametric VaR and threshold alerts
//! - `strategy`: Delta-neutral, protective put, covered call and dynamic hedging
//! - `execution`: Venue abstraction, paper venue and the order router
//! - `coordinator`: Per-group control loops, commands and suspension
//! - `events`: Broadcast of control loop events
//! - `audit`: Append-only record of metrics and hedge executions
//! - `config`: Configuration management and validation
//! - `simulation`: Deterministic simulated market feed
//! - `utils`: Shared utilities and decimal arithmetic

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod execution;
pub mod ledger;
pub mod market;
pub mod risk;
pub mod simulation;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{HedgeError, VenueError};
