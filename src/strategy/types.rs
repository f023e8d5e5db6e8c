//! Hedge instructions and strategy identifiers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::market::{Instrument, Side};
use crate::risk::RiskMetrics;

/// Selectable hedging strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DeltaNeutral,
    ProtectivePut,
    CoveredCall,
    Dynamic,
    /// Operator-sized hedge
    Manual,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::DeltaNeutral => "delta_neutral",
            StrategyKind::ProtectivePut => "protective_put",
            StrategyKind::CoveredCall => "covered_call",
            StrategyKind::Dynamic => "dynamic",
            StrategyKind::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delta_neutral" => Ok(StrategyKind::DeltaNeutral),
            "protective_put" | "protective_puts" => Ok(StrategyKind::ProtectivePut),
            "covered_call" | "covered_calls" => Ok(StrategyKind::CoveredCall),
            "dynamic" => Ok(StrategyKind::Dynamic),
            other => Err(format!(
                "unknown strategy '{}', choose from delta_neutral, protective_put, covered_call, dynamic",
                other
            )),
        }
    }
}

/// How quickly the router should work the hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Urgency {
    /// Urgency from how far delta sits outside its band.
    pub fn from_band_ratio(ratio: Decimal) -> Self {
        if ratio <= Decimal::TWO {
            Urgency::Normal
        } else if ratio <= Decimal::new(5, 0) {
            Urgency::High
        } else {
            Urgency::Critical
        }
    }
}

/// Risk figures that justified an instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rationale {
    pub net_delta: Decimal,
    pub var: Decimal,
    pub spot_exposure: Decimal,
    pub underlying_price: Decimal,
    pub snapshot_version: u64,
    /// Expected post-hedge net delta
    pub residual_delta: Decimal,
    pub expected_cost: Option<Decimal>,
    pub reason: String,
}

impl Rationale {
    pub fn from_metrics(metrics: &RiskMetrics, residual_delta: Decimal, reason: impl Into<String>) -> Self {
        Self {
            net_delta: metrics.net_delta,
            var: metrics.var.value,
            spot_exposure: metrics.spot_exposure,
            underlying_price: metrics.underlying_price,
            snapshot_version: metrics.snapshot_version,
            residual_delta,
            expected_cost: None,
            reason: reason.into(),
        }
    }
}

/// A single hedge adjustment, consumed at most once by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeInstruction {
    pub id: Uuid,
    pub group: String,
    pub instrument: Arc<Instrument>,
    pub side: Side,
    /// Unsigned, lot-rounded quantity in instrument units
    pub quantity: Decimal,
    pub urgency: Urgency,
    pub strategy: StrategyKind,
    pub rationale: Rationale,
    pub created_at: DateTime<Utc>,
}

impl HedgeInstruction {
    pub fn new(
        group: impl Into<String>,
        instrument: Arc<Instrument>,
        side: Side,
        quantity: Decimal,
        urgency: Urgency,
        strategy: StrategyKind,
        rationale: Rationale,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group: group.into(),
            instrument,
            side,
            quantity,
            urgency,
            strategy,
            rationale,
            created_at: Utc::now(),
        }
    }

    /// Size in underlying units.
    pub fn underlying_quantity(&self) -> Decimal {
        self.quantity * self.instrument.spec.multiplier
    }

    /// Underlying notional of the hedge.
    pub fn notional(&self) -> Decimal {
        self.underlying_quantity() * self.rationale.underlying_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_strategy_parsing_accepts_plural_aliases() {
        assert_eq!("protective_puts".parse::<StrategyKind>(), Ok(StrategyKind::ProtectivePut));
        assert_eq!("Dynamic".parse::<StrategyKind>(), Ok(StrategyKind::Dynamic));
        assert!("straddle".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_urgency_bands() {
        assert_eq!(Urgency::from_band_ratio(dec!(1.5)), Urgency::Normal);
        assert_eq!(Urgency::from_band_ratio(dec!(4)), Urgency::High);
        assert_eq!(Urgency::from_band_ratio(dec!(200)), Urgency::Critical);
    }
}
