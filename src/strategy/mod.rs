//! Hedging strategies.
//!
//! Contains the core logic for:
//! - Delta-neutral perpetual hedging
//! - Protective put and covered call overlays
//! - Cost-ranked dynamic hedge selection
//! - The per-group hedging state machine

mod delta_neutral;
mod dynamic;
mod engine;
mod options;
mod policy;
mod state;
mod types;

pub use delta_neutral::{linear_hedge, HedgeProposal, MarketView};
pub use dynamic::{cheapest_hedge, FeeAndPremiumCost, HedgeCostModel};
pub use engine::{ManualHedge, StrategyEngine};
pub use options::{held_options, option_overlay, select_option};
pub use policy::HedgePolicy;
pub use state::{HedgePhase, ProtectionLeg, StrategyState};
pub use types::{HedgeInstruction, Rationale, StrategyKind, Urgency};
