//! Risk measurement for hedged spot holdings.
//!
//! Provides:
//! - Net Delta, Gamma, Theta, Vega aggregation per instrument group
//! - Parametric Value-at-Risk with degraded-data marking
//! - Threshold alerts with per-group cooldown

mod alerts;
mod engine;
mod metrics;
mod var;

pub use alerts::{AlertMonitor, AlertSeverity, RiskAlert, RiskAlertType, RiskThresholds};
pub use engine::{RiskEngine, RiskEngineConfig, RiskScope};
pub use metrics::{RiskMetrics, VarEstimate};
pub use var::{inverse_normal_cdf, parametric_var, sample_std_dev, ReturnHistory, VarParams};
