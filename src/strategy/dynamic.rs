//! Cost-ranked hedge selection.
//!
//! Every candidate must bring net delta inside the band on its own; the
//! cheapest under the configured [`HedgeCostModel`] wins.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::delta_neutral::{linear_hedge, HedgeProposal, MarketView};
use super::options::{held_options, select_option};
use super::policy::HedgePolicy;
use crate::error::HedgeError;
use crate::market::{OptionKind, Side};
use crate::risk::RiskMetrics;
use crate::utils::decimal::{from_f64, round_down_to_lot, safe_div, to_f64};

/// Expected cost of carrying out a hedge, in quote currency.
pub trait HedgeCostModel: Send + Sync + fmt::Debug {
    fn expected_cost(&self, proposal: &HedgeProposal, metrics: &RiskMetrics) -> Decimal;
}

/// Fees plus carry: funding for perps, decay for long options and
/// short-gamma exposure for written options, over `horizon_days`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeAndPremiumCost {
    #[serde(default = "default_perp_fee_rate")]
    pub perp_fee_rate: Decimal,
    /// Expected daily funding paid by the hedge side
    #[serde(default = "default_funding_rate_daily")]
    pub funding_rate_daily: Decimal,
    /// Fee as a fraction of option premium
    #[serde(default = "default_option_fee_rate")]
    pub option_fee_rate: Decimal,
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
}

fn default_perp_fee_rate() -> Decimal {
    dec!(0.0005)
}

fn default_funding_rate_daily() -> Decimal {
    dec!(0.0003)
}

fn default_option_fee_rate() -> Decimal {
    dec!(0.03)
}

fn default_horizon_days() -> u32 {
    7
}

impl Default for FeeAndPremiumCost {
    fn default() -> Self {
        Self {
            perp_fee_rate: default_perp_fee_rate(),
            funding_rate_daily: default_funding_rate_daily(),
            option_fee_rate: default_option_fee_rate(),
            horizon_days: default_horizon_days(),
        }
    }
}

impl HedgeCostModel for FeeAndPremiumCost {
    fn expected_cost(&self, proposal: &HedgeProposal, metrics: &RiskMetrics) -> Decimal {
        let units = proposal.quantity.abs() * proposal.instrument.spec.multiplier;
        let horizon = Decimal::from(self.horizon_days);

        if !proposal.instrument.is_option() {
            let notional = units * proposal.price;
            return notional * (self.perp_fee_rate + self.funding_rate_daily * horizon);
        }

        let fees = units * proposal.price * self.option_fee_rate;
        match proposal.side() {
            Side::Buy => fees + proposal.greeks.theta.abs() * units * horizon,
            Side::Sell => {
                // 0.5 * gamma * move^2 over the horizon
                let vol = to_f64(metrics.implied_vol.unwrap_or_default());
                let spot = to_f64(metrics.underlying_price);
                let expected_move = spot * vol * (f64::from(self.horizon_days) / 365.0).sqrt();
                let gamma_cost = from_f64(0.5 * to_f64(proposal.greeks.gamma.abs()) * expected_move * expected_move);
                fees + gamma_cost * units
            }
        }
    }
}

/// Evaluate perp, put and call hedges and return the cheapest admissible one.
pub fn cheapest_hedge(
    metrics: &RiskMetrics,
    policy: &HedgePolicy,
    view: &MarketView<'_>,
    cost_model: &dyn HedgeCostModel,
) -> Result<Option<HedgeProposal>, HedgeError> {
    let mut candidates = Vec::new();
    let mut first_error = None;

    match linear_hedge(metrics, policy, view) {
        Ok(Some(p)) => candidates.push(p),
        Ok(None) => {}
        Err(e) => first_error = Some(e),
    }

    let kinds: &[OptionKind] = if metrics.net_delta > Decimal::ZERO {
        &[OptionKind::Put, OptionKind::Call]
    } else {
        &[OptionKind::Call]
    };
    let not_before = view.now + policy.roll_window();
    let written: Decimal = held_options(view.holdings, &metrics.underlying, OptionKind::Call, view.now)
        .iter()
        .filter(|(_, qty)| *qty < Decimal::ZERO)
        .map(|(instrument, qty)| -*qty * instrument.spec.multiplier)
        .sum();
    for &kind in kinds {
        let Some(quote) = select_option(
            view.snapshot,
            &metrics.underlying,
            kind,
            metrics.underlying_price,
            policy.otm_pct,
            not_before,
        ) else {
            continue;
        };
        let unit_delta = quote.greeks.delta * quote.instrument.spec.multiplier;
        let quantity = round_down_to_lot(safe_div(-metrics.net_delta, unit_delta), quote.instrument.spec.lot_size);
        if quantity == Decimal::ZERO {
            continue;
        }
        // written calls, new and existing, must stay covered by spot
        if quantity < Decimal::ZERO
            && quantity.abs() * quote.instrument.spec.multiplier + written > metrics.spot_exposure
        {
            continue;
        }
        candidates.push(HedgeProposal {
            instrument: quote.instrument.clone(),
            quantity,
            price: quote.mid,
            greeks: quote.greeks,
            residual_delta: metrics.net_delta + quantity * unit_delta,
            expected_cost: None,
            routine: false,
            reason: format!("{:?} hedge of net delta {}", kind, metrics.net_delta),
        });
    }

    candidates.retain(|c| c.residual_delta.abs() <= policy.delta_band);
    for candidate in candidates.iter_mut() {
        candidate.expected_cost = Some(cost_model.expected_cost(candidate, metrics));
        debug!(
            group = %metrics.group,
            instrument = %candidate.instrument.id,
            quantity = %candidate.quantity,
            cost = ?candidate.expected_cost,
            "Hedge candidate"
        );
    }

    let best = candidates
        .into_iter()
        .min_by(|a, b| a.expected_cost.cmp(&b.expected_cost));

    match (best, first_error) {
        (Some(mut p), _) => {
            p.reason = format!("{} at expected cost {}", p.reason, p.expected_cost.unwrap_or_default());
            Ok(Some(p))
        }
        (None, Some(e)) => Err(e),
        (None, None) => Ok(None),
    }
}
