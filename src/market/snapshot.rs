//! Immutable, versioned market snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::{Instrument, InstrumentId, OptionKind};

/// Per-unit option sensitivities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Greeks {
    pub delta: Decimal,
    pub gamma: Decimal,
    pub theta: Decimal,
    pub vega: Decimal,
}

impl Greeks {
    /// Greeks of a linear instrument (delta one, no convexity).
    pub fn linear() -> Self {
        Self {
            delta: Decimal::ONE,
            ..Default::default()
        }
    }
}

/// Fully-formed quote for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub instrument: Arc<Instrument>,
    pub mid: Decimal,
    pub implied_vol: Option<Decimal>,
    pub greeks: Greeks,
    /// Liquidity score 0-100 when the venue publishes one
    pub liquidity: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of every fully observed instrument.
///
/// A new snapshot replaces the prior one wholesale; quotes of different
/// vintages are never merged into one snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketSnapshot {
    pub version: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub quotes: BTreeMap<InstrumentId, Quote>,
    /// Set when some instrument carried a stale quote into this version
    pub partial: bool,
    pub incomplete: Vec<InstrumentId>,
}

impl MarketSnapshot {
    /// Empty version-0 snapshot published before any data arrives.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn quote(&self, instrument: &InstrumentId) -> Option<&Quote> {
        self.quotes.get(instrument)
    }

    pub fn mid(&self, instrument: &InstrumentId) -> Option<Decimal> {
        self.quotes.get(instrument).map(|q| q.mid)
    }

    /// Quotes for every instrument on the given underlying.
    pub fn for_underlying<'a>(&'a self, underlying: &'a str) -> impl Iterator<Item = &'a Quote> + 'a {
        self.quotes
            .values()
            .filter(move |q| q.instrument.underlying == underlying)
    }

    /// Option quotes of one kind on an underlying, expiring after `not_before`.
    pub fn options<'a>(
        &'a self,
        underlying: &'a str,
        kind: OptionKind,
        not_before: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a Quote> + 'a {
        self.for_underlying(underlying).filter(move |q| {
            q.instrument.option_kind() == Some(kind)
                && q.instrument.expiry().is_some_and(|e| e > not_before)
        })
    }

    /// Whether the instrument is among those carried over from an older version.
    pub fn is_stale(&self, instrument: &InstrumentId) -> bool {
        self.incomplete.contains(instrument)
    }
}
