//! Parametric (variance-covariance) Value-at-Risk.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::utils::decimal::to_f64;

/// VaR settings from the group policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarParams {
    /// One-sided confidence level (e.g. 0.99)
    pub confidence: Decimal,
    /// Daily returns wanted for the volatility estimate
    pub lookback_days: usize,
    /// Holding horizon in days
    pub horizon_days: u32,
}

impl Default for VarParams {
    fn default() -> Self {
        Self {
            confidence: Decimal::new(99, 2),
            lookback_days: 30,
            horizon_days: 1,
        }
    }
}

/// Daily closing prices of one underlying.
#[derive(Debug, Clone, Default)]
pub struct ReturnHistory {
    closes: BTreeMap<NaiveDate, Decimal>,
}

impl ReturnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from (date, close) pairs.
    pub fn from_closes(closes: impl IntoIterator<Item = (NaiveDate, Decimal)>) -> Self {
        Self {
            closes: closes.into_iter().collect(),
        }
    }

    /// Record the close for a day; later observations of the same day overwrite.
    pub fn record_close(&mut self, date: NaiveDate, price: Decimal) {
        if price > Decimal::ZERO {
            self.closes.insert(date, price);
        }
    }

    /// Log returns of the most recent `lookback` day pairs.
    pub fn daily_returns(&self, lookback: usize) -> Vec<f64> {
        let prices: Vec<f64> = self.closes.values().map(|p| to_f64(*p)).collect();
        let returns: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] > 0.0 && w[1] > 0.0)
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        let skip = returns.len().saturating_sub(lookback);
        returns[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

/// Sample standard deviation; `None` below two observations.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Inverse of the standard normal CDF (Acklam's rational approximation).
///
/// Relative error below 1.15e-9 over (0, 1).
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Delta-normal VaR of a dollar exposure.
pub fn parametric_var(dollar_exposure: f64, daily_vol: f64, confidence: f64, horizon_days: u32) -> f64 {
    let z = inverse_normal_cdf(confidence);
    z * daily_vol * dollar_exposure.abs() * f64::from(horizon_days).sqrt()
}
