//! Option overlays: protective puts and covered calls on long spot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::delta_neutral::{HedgeProposal, MarketView};
use super::policy::HedgePolicy;
use super::state::StrategyState;
use crate::error::HedgeError;
use crate::ledger::Holdings;
use crate::market::{Instrument, InstrumentId, MarketSnapshot, OptionKind, Quote};
use crate::risk::RiskMetrics;
use crate::utils::decimal::{round_down_to_lot, safe_div};

/// Pick the listed option closest to the target OTM strike.
///
/// Only expiries after `not_before` qualify. Ties on strike distance go to
/// the nearer expiry, then to the instrument id.
pub fn select_option<'a>(
    snapshot: &'a MarketSnapshot,
    underlying: &'a str,
    kind: OptionKind,
    spot: Decimal,
    otm_pct: Decimal,
    not_before: DateTime<Utc>,
) -> Option<&'a Quote> {
    let target = match kind {
        OptionKind::Put => spot * (Decimal::ONE - otm_pct),
        OptionKind::Call => spot * (Decimal::ONE + otm_pct),
    };

    snapshot
        .options(underlying, kind, not_before)
        .filter_map(|q| {
            let terms = q.instrument.spec.option.as_ref()?;
            Some(((terms.strike - target).abs(), terms.expiry, q))
        })
        .min_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.instrument.id.cmp(&b.2.instrument.id))
        })
        .map(|(_, _, q)| q)
}

/// Net held options of one kind on an underlying, expired contracts excluded.
pub fn held_options(
    holdings: &Holdings,
    underlying: &str,
    kind: OptionKind,
    now: DateTime<Utc>,
) -> Vec<(Arc<Instrument>, Decimal)> {
    holdings
        .net_by_instrument(underlying)
        .into_values()
        .filter(|(instrument, qty)| {
            *qty != Decimal::ZERO
                && instrument.option_kind() == Some(kind)
                && instrument.expiry().is_some_and(|expiry| expiry > now)
        })
        .collect()
}

/// Size an option overlay against the current spot exposure.
///
/// Puts are bought and calls are sold, `protection_ratio` of exposure each,
/// netted against every live leg of the same kind already held. Existing
/// protection is only touched when exposure moved by more than
/// `exposure_change_threshold` or a leg enters its roll window. A roll opens
/// the replacement before the expiring leg is closed.
pub fn option_overlay(
    kind: OptionKind,
    metrics: &RiskMetrics,
    state: &StrategyState,
    policy: &HedgePolicy,
    view: &MarketView<'_>,
) -> Result<Option<HedgeProposal>, HedgeError> {
    let exposure = metrics.spot_exposure;
    if exposure <= Decimal::ZERO {
        debug!(group = %metrics.group, "No long spot exposure to overlay");
        return Ok(None);
    }

    let roll_cutoff = view.now + policy.roll_window();
    let (expiring, live): (Vec<_>, Vec<_>) = held_options(view.holdings, &metrics.underlying, kind, view.now)
        .into_iter()
        .partition(|(instrument, _)| instrument.expiry().is_some_and(|expiry| expiry <= roll_cutoff));

    let mut rolling = !expiring.is_empty();
    if let Some(leg) = &state.protection {
        rolling |= leg.expiry <= roll_cutoff;
        let change = safe_div((exposure - leg.covered_exposure).abs(), leg.covered_exposure);
        if !rolling && change <= policy.exposure_change_threshold {
            return Ok(None);
        }
    }

    // Underlying units: positive for puts, negative for written calls
    let desired = match kind {
        OptionKind::Put => exposure * policy.protection_ratio,
        OptionKind::Call => -exposure * policy.protection_ratio,
    };
    let covered: Decimal = live.iter().map(|(instrument, qty)| *qty * instrument.spec.multiplier).sum();
    let gap = desired - covered;
    let adds_cover = match kind {
        OptionKind::Put => gap > Decimal::ZERO,
        OptionKind::Call => gap < Decimal::ZERO,
    };

    if adds_cover {
        let quote = select_option(
            view.snapshot,
            &metrics.underlying,
            kind,
            metrics.underlying_price,
            policy.otm_pct,
            roll_cutoff,
        )
        .ok_or_else(|| HedgeError::DataIncomplete {
            instrument: InstrumentId::new(format!("{}-{:?}", metrics.underlying, kind).to_uppercase()),
            missing: "option beyond roll window".to_string(),
        })?;
        let spec = &quote.instrument.spec;
        let quantity = round_down_to_lot(safe_div(gap, spec.multiplier), spec.lot_size);
        if quantity != Decimal::ZERO {
            let reason = if rolling {
                format!("rolling {:?} protection into {}", kind, quote.instrument.id)
            } else {
                format!(
                    "{:?} overlay on {} {} spot at {}% of exposure",
                    kind,
                    exposure,
                    metrics.underlying,
                    policy.protection_ratio * Decimal::ONE_HUNDRED
                )
            };
            return Ok(Some(proposal(metrics, quote, quantity, rolling, reason)));
        }
    }

    // Replacement in place: close expiring legs while they still trade
    for (instrument, held) in &expiring {
        if let Some(quote) = view.snapshot.quote(&instrument.id) {
            let quantity = round_down_to_lot(-*held, instrument.spec.lot_size);
            if quantity != Decimal::ZERO {
                let reason = format!("closing expiring {:?} leg {}", kind, instrument.id);
                return Ok(Some(proposal(metrics, quote, quantity, true, reason)));
            }
        }
    }

    if adds_cover || gap == Decimal::ZERO {
        return Ok(None);
    }

    // Over-covered: unwind the current leg first, then the largest
    let Some((instrument, held)) = live
        .iter()
        .find(|(instrument, _)| state.protection.as_ref().is_some_and(|leg| leg.instrument == instrument.id))
        .or_else(|| live.iter().max_by_key(|(_, qty)| qty.abs()))
    else {
        return Ok(None);
    };
    let quote = view.snapshot.quote(&instrument.id).ok_or_else(|| HedgeError::DataIncomplete {
        instrument: instrument.id.clone(),
        missing: "quote for held option".to_string(),
    })?;
    let unwind = safe_div(gap, instrument.spec.multiplier);
    let unwind = if unwind.abs() > held.abs() { -*held } else { unwind };
    let quantity = round_down_to_lot(unwind, instrument.spec.lot_size);
    if quantity == Decimal::ZERO {
        return Ok(None);
    }
    let reason = format!(
        "reducing {:?} overlay to {}% of {} exposure",
        kind,
        policy.protection_ratio * Decimal::ONE_HUNDRED,
        exposure
    );
    Ok(Some(proposal(metrics, quote, quantity, rolling, reason)))
}

fn proposal(metrics: &RiskMetrics, quote: &Quote, quantity: Decimal, routine: bool, reason: String) -> HedgeProposal {
    let instrument = quote.instrument.clone();
    let residual_delta = metrics.net_delta + quantity * quote.greeks.delta * instrument.spec.multiplier;
    HedgeProposal {
        instrument,
        quantity,
        price: quote.mid,
        greeks: quote.greeks,
        residual_delta,
        expected_cost: None,
        routine,
        reason,
    }
}
