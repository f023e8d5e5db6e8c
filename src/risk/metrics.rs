//! Derived risk metrics, replaced wholesale every cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::market::InstrumentId;

/// Value-at-Risk estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarEstimate {
    /// Loss in quote currency
    pub value: Decimal,
    pub confidence: Decimal,
    pub horizon_days: u32,
    /// Daily returns used for the volatility estimate
    pub observations: usize,
    /// Advisory only: insufficient history or partial market data
    pub degraded: bool,
    pub partial_penalty_applied: bool,
}

/// Risk metrics of one instrument group, tagged with the snapshot version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub group: String,
    pub underlying: String,
    /// Net delta in underlying units
    pub net_delta: Decimal,
    pub net_gamma: Decimal,
    pub net_theta: Decimal,
    pub net_vega: Decimal,
    pub var: VarEstimate,
    /// Spot holding in underlying units
    pub spot_exposure: Decimal,
    pub underlying_price: Decimal,
    pub implied_vol: Option<Decimal>,
    pub liquidity: Option<Decimal>,
    /// Held instruments without a usable quote
    pub missing_quotes: Vec<InstrumentId>,
    pub timestamp: DateTime<Utc>,
    pub snapshot_version: u64,
}

impl RiskMetrics {
    /// Spot exposure notional in quote currency.
    pub fn spot_notional(&self) -> Decimal {
        self.spot_exposure.abs() * self.underlying_price
    }

    /// Delta as a fraction of spot exposure (0 when flat).
    pub fn delta_ratio(&self) -> Decimal {
        if self.spot_exposure == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (self.net_delta / self.spot_exposure).abs()
        }
    }

    /// VaR as a fraction of spot notional.
    pub fn var_ratio(&self) -> Decimal {
        let notional = self.spot_notional();
        if notional == Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.var.value / notional
        }
    }

    /// Whether these metrics were derived from an older snapshot than `version`.
    pub fn is_stale(&self, version: u64) -> bool {
        self.snapshot_version < version
    }
}
