//! Hedge execution.
//!
//! - `venue`: the `ExecutionVenue` trait implemented per exchange
//! - `paper`: simulated venue for paper hedging and tests
//! - `router`: priority routing, liquidity split, retry and fallback

mod paper;
mod router;
mod types;
mod venue;

pub use paper::{PaperVenue, PaperVenueState};
pub use router::{CancelToken, OrderRouter, RouterConfig};
pub use types::{ExecutionReport, ExecutionStatus, OrderIntent, OrderResult, OrderStatus};
pub use venue::ExecutionVenue;
