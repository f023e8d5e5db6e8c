//! Linear delta hedge through a perpetual.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::policy::HedgePolicy;
use crate::error::HedgeError;
use crate::ledger::Holdings;
use crate::market::{Greeks, Instrument, MarketSnapshot, Side};
use crate::risk::RiskMetrics;
use crate::utils::decimal::round_down_to_lot;

/// Market inputs a strategy may consult besides the metrics.
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub holdings: &'a Holdings,
    pub now: DateTime<Utc>,
}

/// Sized hedge candidate, before policy caps and state gating.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeProposal {
    pub instrument: Arc<Instrument>,
    /// Signed, lot-rounded quantity in instrument units
    pub quantity: Decimal,
    pub price: Decimal,
    pub greeks: Greeks,
    pub residual_delta: Decimal,
    pub expected_cost: Option<Decimal>,
    /// Maintenance adjustments (option rolls) rather than risk reduction
    pub routine: bool,
    pub reason: String,
}

impl HedgeProposal {
    pub fn side(&self) -> Side {
        Side::for_signed(self.quantity)
    }

    /// Delta added per instrument unit.
    pub fn unit_delta(&self) -> Decimal {
        self.greeks.delta * self.instrument.spec.multiplier
    }
}

/// Size a perpetual trade that brings net delta to (near) zero.
pub fn linear_hedge(
    metrics: &RiskMetrics,
    policy: &HedgePolicy,
    view: &MarketView<'_>,
) -> Result<Option<HedgeProposal>, HedgeError> {
    let quote = view
        .snapshot
        .quote(&policy.hedge_instrument)
        .ok_or_else(|| HedgeError::DataIncomplete {
            instrument: policy.hedge_instrument.clone(),
            missing: "quote".to_string(),
        })?;

    let instrument = quote.instrument.clone();
    let greeks = match instrument.linear_delta() {
        Some(delta) => Greeks {
            delta,
            ..Greeks::default()
        },
        None => quote.greeks,
    };
    let unit_delta = greeks.delta * instrument.spec.multiplier;
    if unit_delta == Decimal::ZERO {
        return Err(HedgeError::DataIncomplete {
            instrument: instrument.id.clone(),
            missing: "delta".to_string(),
        });
    }

    let quantity = round_down_to_lot(-metrics.net_delta / unit_delta, instrument.spec.lot_size);
    if quantity == Decimal::ZERO {
        return Ok(None);
    }

    let residual_delta = metrics.net_delta + quantity * unit_delta;
    Ok(Some(HedgeProposal {
        reason: format!(
            "net delta {} {} outside band {}",
            metrics.net_delta, metrics.underlying, policy.delta_band
        ),
        instrument,
        quantity,
        price: quote.mid,
        greeks,
        residual_delta,
        expected_cost: None,
        routine: false,
    }))
}
