//! Per-group hedging policy.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::types::StrategyKind;
use crate::error::HedgeError;
use crate::market::{InstrumentId, VenueId};
use crate::risk::VarParams;

/// Policy that drives strategy evaluation and routing for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePolicy {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Perpetual used for linear hedges
    pub hedge_instrument: InstrumentId,
    /// Net delta tolerated without hedging, in underlying units
    #[serde(default = "default_delta_band")]
    pub delta_band: Decimal,
    /// Minimum seconds between two instructions
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Seconds a pending instruction may stay unresolved
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// Share of spot exposure covered by options (0-1)
    #[serde(default = "default_protection_ratio")]
    pub protection_ratio: Decimal,
    /// Strike distance from spot as a fraction (0.05 = 5% OTM)
    #[serde(default = "default_otm_pct")]
    pub otm_pct: Decimal,
    /// Relative exposure change that triggers option re-evaluation
    #[serde(default = "default_exposure_change_threshold")]
    pub exposure_change_threshold: Decimal,
    /// Days before expiry at which protection is rolled
    #[serde(default = "default_roll_window_days")]
    pub roll_window_days: u32,
    /// Cap on a single hedge's underlying notional
    #[serde(default = "default_max_hedge_notional")]
    pub max_hedge_notional: Decimal,
    /// Cap on a single hedge's quantity in instrument units
    #[serde(default = "default_max_hedge_quantity")]
    pub max_hedge_quantity: Decimal,
    #[serde(default)]
    pub var: VarParams,
    /// Venues in routing priority order
    #[serde(default)]
    pub venue_priority: Vec<VenueId>,
    /// Attempts per venue for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::DeltaNeutral
}

fn default_delta_band() -> Decimal {
    dec!(0.05)
}

fn default_cooldown_secs() -> u64 {
    300 // 5 minutes
}

fn default_pending_timeout_secs() -> u64 {
    120
}

fn default_protection_ratio() -> Decimal {
    Decimal::ONE
}

fn default_otm_pct() -> Decimal {
    dec!(0.05)
}

fn default_exposure_change_threshold() -> Decimal {
    dec!(0.10)
}

fn default_roll_window_days() -> u32 {
    3
}

fn default_max_hedge_notional() -> Decimal {
    dec!(5_000_000)
}

fn default_max_hedge_quantity() -> Decimal {
    dec!(1_000)
}

fn default_max_retries() -> u32 {
    3
}

impl HedgePolicy {
    /// Default policy hedging with the given perpetual.
    pub fn new(hedge_instrument: impl Into<InstrumentId>) -> Self {
        Self {
            strategy: default_strategy(),
            hedge_instrument: hedge_instrument.into(),
            delta_band: default_delta_band(),
            cooldown_secs: default_cooldown_secs(),
            pending_timeout_secs: default_pending_timeout_secs(),
            protection_ratio: default_protection_ratio(),
            otm_pct: default_otm_pct(),
            exposure_change_threshold: default_exposure_change_threshold(),
            roll_window_days: default_roll_window_days(),
            max_hedge_notional: default_max_hedge_notional(),
            max_hedge_quantity: default_max_hedge_quantity(),
            var: VarParams::default(),
            venue_priority: Vec::new(),
            max_retries: default_max_retries(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::seconds(self.pending_timeout_secs as i64)
    }

    pub fn roll_window(&self) -> Duration {
        Duration::days(i64::from(self.roll_window_days))
    }

    /// Validate ranges before the policy is applied.
    pub fn validate(&self) -> Result<(), HedgeError> {
        let fail = |msg: &str| Err(HedgeError::InvalidPolicy(msg.to_string()));

        if self.delta_band < Decimal::ZERO {
            return fail("delta_band must be non-negative");
        }
        if self.protection_ratio <= Decimal::ZERO || self.protection_ratio > Decimal::ONE {
            return fail("protection_ratio must be in (0, 1]");
        }
        if self.otm_pct < Decimal::ZERO || self.otm_pct >= Decimal::ONE {
            return fail("otm_pct must be in [0, 1)");
        }
        if self.exposure_change_threshold < Decimal::ZERO {
            return fail("exposure_change_threshold must be non-negative");
        }
        if self.max_hedge_notional <= Decimal::ZERO || self.max_hedge_quantity <= Decimal::ZERO {
            return fail("hedge caps must be positive");
        }
        if self.var.confidence <= dec!(0.5) || self.var.confidence >= Decimal::ONE {
            return fail("var confidence must be in (0.5, 1)");
        }
        if self.var.lookback_days < 2 || self.var.horizon_days == 0 {
            return fail("var lookback must be >= 2 days and horizon >= 1 day");
        }
        if self.venue_priority.is_empty() {
            return fail("venue_priority must list at least one venue");
        }
        if self.max_retries == 0 {
            return fail("max_retries must be at least 1");
        }
        if self.strategy == StrategyKind::Manual {
            return fail("manual is not a selectable strategy");
        }
        Ok(())
    }
}
