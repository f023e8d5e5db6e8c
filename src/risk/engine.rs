//! Risk engine: greeks aggregation and VaR from snapshot + holdings.
//!
//! `compute_metrics` is a pure function of its inputs. The metrics
//! timestamp is the snapshot's, so identical inputs yield identical output.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::metrics::{RiskMetrics, VarEstimate};
use super::var::{parametric_var, sample_std_dev, ReturnHistory, VarParams};
use crate::error::HedgeError;
use crate::ledger::Holdings;
use crate::market::{AssetClass, Greeks, InstrumentId, MarketSnapshot};
use crate::utils::decimal::{from_f64, to_f64};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct RiskEngineConfig {
    /// VaR multiplier applied when market data is partial
    pub partial_var_penalty: Decimal,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self {
            partial_var_penalty: Decimal::new(125, 2),
        }
    }
}

/// What one group's risk covers.
#[derive(Debug, Clone)]
pub struct RiskScope<'a> {
    pub group: &'a str,
    pub underlying: &'a str,
    /// Instrument whose mid prices the underlying (usually the spot)
    pub reference: &'a InstrumentId,
    pub var: &'a VarParams,
}

/// Computes risk metrics.
#[derive(Debug, Clone, Default)]
pub struct RiskEngine {
    config: RiskEngineConfig,
}

impl RiskEngine {
    pub fn new(config: RiskEngineConfig) -> Self {
        Self { config }
    }

    /// Compute metrics for one group.
    pub fn compute_metrics(
        &self,
        scope: &RiskScope<'_>,
        snapshot: &MarketSnapshot,
        holdings: &Holdings,
        history: &ReturnHistory,
    ) -> RiskMetrics {
        let reference = snapshot.quote(scope.reference);
        let underlying_price = reference.map(|q| q.mid).unwrap_or_default();

        let mut total = Greeks::default();
        let mut spot_exposure = Decimal::ZERO;
        let mut missing_quotes = Vec::new();

        for (id, (instrument, qty)) in holdings.net_by_instrument(scope.underlying) {
            // Expired contracts carry no greeks and are no longer quoted
            if let (Some(expiry), Some(taken_at)) = (instrument.expiry(), snapshot.taken_at) {
                if expiry <= taken_at {
                    debug!(group = scope.group, instrument = %id, %expiry, "Skipping expired option");
                    continue;
                }
            }
            let units = qty * instrument.spec.multiplier;
            if instrument.asset_class == AssetClass::Spot {
                spot_exposure += units;
            }

            let greeks = match snapshot.quote(&id) {
                Some(quote) => quote.greeks,
                None => {
                    let err = HedgeError::DataIncomplete {
                        instrument: id.clone(),
                        missing: "quote".to_string(),
                    };
                    warn!(group = scope.group, error = %err, "Degrading risk metrics");
                    missing_quotes.push(id.clone());
                    match instrument.linear_delta() {
                        Some(_) => Greeks::linear(),
                        None => continue,
                    }
                }
            };

            total.delta += units * greeks.delta;
            total.gamma += units * greeks.gamma;
            total.theta += units * greeks.theta;
            total.vega += units * greeks.vega;
        }

        let var = self.value_at_risk(
            scope,
            total.delta * underlying_price,
            reference.and_then(|q| q.implied_vol),
            history,
            snapshot.partial || !missing_quotes.is_empty() || reference.is_none(),
        );

        debug!(
            group = scope.group,
            version = snapshot.version,
            net_delta = %total.delta,
            net_gamma = %total.gamma,
            var = %var.value,
            degraded = var.degraded,
            "Risk metrics computed"
        );

        RiskMetrics {
            group: scope.group.to_string(),
            underlying: scope.underlying.to_string(),
            net_delta: total.delta,
            net_gamma: total.gamma,
            net_theta: total.theta,
            net_vega: total.vega,
            var,
            spot_exposure,
            underlying_price,
            implied_vol: reference.and_then(|q| q.implied_vol),
            liquidity: reference.and_then(|q| q.liquidity),
            missing_quotes,
            timestamp: snapshot.taken_at.unwrap_or_default(),
            snapshot_version: snapshot.version,
        }
    }

    fn value_at_risk(
        &self,
        scope: &RiskScope<'_>,
        dollar_delta: Decimal,
        implied_vol: Option<Decimal>,
        history: &ReturnHistory,
        partial: bool,
    ) -> VarEstimate {
        let returns = history.daily_returns(scope.var.lookback_days);
        let observations = returns.len();
        let mut degraded = observations < scope.var.lookback_days;

        let daily_vol = match sample_std_dev(&returns) {
            Some(sd) => sd,
            None => {
                degraded = true;
                implied_vol
                    .map(|iv| to_f64(iv) / 365f64.sqrt())
                    .unwrap_or(0.0)
            }
        };

        let mut value = from_f64(parametric_var(
            to_f64(dollar_delta),
            daily_vol,
            to_f64(scope.var.confidence),
            scope.var.horizon_days,
        ));

        if partial {
            value *= self.config.partial_var_penalty;
            degraded = true;
        }

        VarEstimate {
            value: value.round_dp(8),
            confidence: scope.var.confidence,
            horizon_days: scope.var.horizon_days,
            observations,
            degraded,
            partial_penalty_applied: partial,
        }
    }
}
