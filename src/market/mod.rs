//! Market data normalization.
//!
//! - `types`: instruments, venues, sides and raw update tuples
//! - `snapshot`: immutable versioned market snapshots
//! - `aggregator`: dedup, venue merge and snapshot promotion

mod aggregator;
mod snapshot;
mod types;

pub use aggregator::{AggregatorConfig, MarketDataAggregator, PartialPolicy, UpdateOutcome};
pub use snapshot::{Greeks, MarketSnapshot, Quote};
pub use types::{
    AssetClass, ContractSpec, Instrument, InstrumentId, MarketField, MarketUpdate, OptionKind,
    OptionTerms, Side, VenueId,
};
