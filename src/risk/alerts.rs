//! Risk alerts: threshold breaches and operational failures.
//!
//! Alerts are emitted as structured JSON on the `risk_alert` target and
//! published to subscribers of the event bus.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info, warn};

use super::metrics::RiskMetrics;

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// Get display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// Types of risk alerts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RiskAlertType {
    /// One or more risk metrics breached their thresholds
    ThresholdBreach { breaches: Vec<String> },
    /// Hedge could not be executed on any venue
    HedgeFailed { instruction_id: String },
    /// Ledger integrity violation
    InvalidFill { instrument: String },
    /// Hedge suppressed by a policy cap
    PolicyViolation { limit: String },
    /// Venue failing repeatedly
    VenueDegraded { venue: String },
    /// Group stopped hedging until resumed
    HedgingSuspended { consecutive_failures: u32 },
}

/// A unified risk alert.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub alert_type: RiskAlertType,
    pub severity: AlertSeverity,
    pub group: Option<String>,
    pub message: String,
    pub metrics: BTreeMap<String, Decimal>,
    pub suggested_action: String,
}

impl RiskAlert {
    /// Create a new risk alert.
    pub fn new(
        alert_type: RiskAlertType,
        severity: AlertSeverity,
        group: Option<String>,
        message: String,
        suggested_action: String,
    ) -> Self {
        let timestamp = Utc::now();
        let alert_id = format!(
            "risk-{}-{}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );

        Self {
            alert_id,
            timestamp,
            alert_type,
            severity,
            group,
            message,
            metrics: BTreeMap::new(),
            suggested_action,
        }
    }

    /// Add a metric to the alert.
    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Emit as structured log for workflow parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "risk_alert", "RISK_ALERT: {}", json),
        }
    }
}

/// Alert thresholds, relative to the spot exposure of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// |net delta| / spot exposure
    #[serde(default = "default_delta_threshold")]
    pub delta: Decimal,
    /// VaR / spot notional
    #[serde(default = "default_var_threshold")]
    pub var: Decimal,
    /// |net gamma| / spot exposure
    #[serde(default = "default_gamma_threshold")]
    pub gamma: Decimal,
    /// |net theta| / spot exposure
    #[serde(default = "default_theta_threshold")]
    pub theta: Decimal,
    /// |net vega| / spot exposure
    #[serde(default = "default_vega_threshold")]
    pub vega: Decimal,
}

fn default_delta_threshold() -> Decimal {
    dec!(0.10)
}

fn default_var_threshold() -> Decimal {
    dec!(0.05)
}

fn default_gamma_threshold() -> Decimal {
    dec!(0.20)
}

fn default_theta_threshold() -> Decimal {
    dec!(0.15)
}

fn default_vega_threshold() -> Decimal {
    dec!(0.25)
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            delta: default_delta_threshold(),
            var: default_var_threshold(),
            gamma: default_gamma_threshold(),
            theta: default_theta_threshold(),
            vega: default_vega_threshold(),
        }
    }
}

impl RiskThresholds {
    /// Names and values of every breached threshold.
    pub fn breaches(&self, metrics: &RiskMetrics) -> Vec<(&'static str, Decimal, Decimal)> {
        let per_unit = |value: Decimal| {
            if metrics.spot_exposure == Decimal::ZERO {
                Decimal::ZERO
            } else {
                (value / metrics.spot_exposure).abs()
            }
        };

        [
            ("delta", metrics.delta_ratio(), self.delta),
            ("var", metrics.var_ratio(), self.var),
            ("gamma", per_unit(metrics.net_gamma), self.gamma),
            ("theta", per_unit(metrics.net_theta), self.theta),
            ("vega", per_unit(metrics.net_vega), self.vega),
        ]
        .into_iter()
        .filter(|(_, value, limit)| value > limit)
        .collect()
    }
}

/// Rate-limits threshold alerts per group.
#[derive(Debug)]
pub struct AlertMonitor {
    thresholds: RiskThresholds,
    cooldown: Duration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AlertMonitor {
    pub fn new(thresholds: RiskThresholds, cooldown: Duration) -> Self {
        Self {
            thresholds,
            cooldown,
            last_alert: HashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Check metrics; returns an alert at most once per cooldown per group.
    pub fn check(&mut self, metrics: &RiskMetrics, now: DateTime<Utc>) -> Option<RiskAlert> {
        let breaches = self.thresholds.breaches(metrics);
        if breaches.is_empty() {
            return None;
        }

        if let Some(last) = self.last_alert.get(&metrics.group) {
            if now - *last < self.cooldown {
                return None;
            }
        }
        self.last_alert.insert(metrics.group.clone(), now);

        let severity = if breaches.iter().any(|(name, _, _)| *name == "var") {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        };
        let recommended_hedge = -metrics.net_delta;

        let mut alert = RiskAlert::new(
            RiskAlertType::ThresholdBreach {
                breaches: breaches.iter().map(|(n, _, _)| n.to_string()).collect(),
            },
            severity,
            Some(metrics.group.clone()),
            format!(
                "Risk alert for {}: delta exposure {:.2}%, VaR {:.2}%",
                metrics.underlying,
                metrics.delta_ratio() * dec!(100),
                metrics.var_ratio() * dec!(100)
            ),
            format!("Hedge {} {} of delta", recommended_hedge, metrics.underlying),
        )
        .with_metric("net_delta", metrics.net_delta)
        .with_metric("var", metrics.var.value)
        .with_metric("price", metrics.underlying_price)
        .with_metric("recommended_hedge", recommended_hedge);

        if let Some(iv) = metrics.implied_vol {
            alert = alert.with_metric("volatility", iv);
        }
        if let Some(liquidity) = metrics.liquidity {
            alert = alert.with_metric("liquidity", liquidity);
        }
        for (name, value, _) in &breaches {
            alert = alert.with_metric(&format!("{}_ratio", name), *value);
        }

        Some(alert)
    }
}
