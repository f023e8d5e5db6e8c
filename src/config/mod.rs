//! Configuration management for the spot hedger.
//!
//! Loads settings from an optional `config.toml` and `SPOT_HEDGER__*`
//! environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::execution::RouterConfig;
use crate::market::{InstrumentId, PartialPolicy, VenueId};
use crate::risk::RiskThresholds;
use crate::strategy::{FeeAndPremiumCost, HedgePolicy};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control loop timing and failure handling
    #[serde(default)]
    pub engine: EngineConfig,
    /// Risk alert thresholds
    #[serde(default)]
    pub thresholds: RiskThresholds,
    /// Order routing timeouts and backoff
    #[serde(default)]
    pub router: RouterConfig,
    /// Cost model used by the dynamic strategy
    #[serde(default)]
    pub cost_model: FeeAndPremiumCost,
    /// Execution venues
    #[serde(default = "default_venues")]
    pub venues: Vec<VenueConfig>,
    /// Hedged instrument groups
    #[serde(default = "default_groups")]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between monitoring cycles
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Seconds to back off after a failed cycle
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Minimum seconds between two threshold alerts of one group
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    /// Failed hedge cycles in a row before hedging is suspended
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// VaR multiplier when market data is partial
    #[serde(default = "default_partial_var_penalty")]
    pub partial_var_penalty: Decimal,
    /// Quote fields older than this are treated as missing
    #[serde(default = "default_max_quote_age_secs")]
    pub max_quote_age_secs: i64,
    #[serde(default = "default_partial_policy")]
    pub partial_policy: PartialPolicy,
    /// SQLite audit database path
    #[serde(default = "default_audit_db_path")]
    pub audit_db_path: String,
    /// Buffered events per subscriber before old ones are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Pending commands per group
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub id: VenueId,
    /// Taker fee rate on fill notional
    #[serde(default = "default_venue_fee_rate")]
    pub fee_rate: Decimal,
    /// Quantity one order may fill (paper venues)
    #[serde(default)]
    pub depth: Option<Decimal>,
    /// Simulated round-trip latency in milliseconds (paper venues)
    #[serde(default)]
    pub latency_ms: u64,
    /// Call deadline for this venue; falls back to `router.venue_timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One hedged holding and the instruments used to hedge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    /// Underlying asset, e.g. "BTC"
    pub underlying: String,
    pub spot_instrument: InstrumentId,
    #[serde(default = "default_spot_lot_size")]
    pub spot_lot_size: Decimal,
    /// Underlying units per perpetual contract
    #[serde(default = "default_contract_multiplier")]
    pub perp_multiplier: Decimal,
    #[serde(default = "default_perp_lot_size")]
    pub perp_lot_size: Decimal,
    /// Spot quantity held at start-up
    #[serde(default)]
    pub initial_spot: Decimal,
    /// Entry price of the initial spot holding
    #[serde(default)]
    pub entry_price: Decimal,
    /// Where the spot holding is kept
    #[serde(default = "default_custody_venue")]
    pub custody_venue: VenueId,
    #[serde(default)]
    pub options: OptionChainConfig,
    pub policy: HedgePolicy,
}

/// Listed options used by the protective put, covered call and dynamic strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChainConfig {
    /// Strikes as fractions of the start price (0.95 = 5% below)
    #[serde(default = "default_strike_ratios")]
    pub strike_ratios: Vec<Decimal>,
    /// Days to the listed expiries
    #[serde(default = "default_expiry_days")]
    pub expiry_days: Vec<u32>,
    #[serde(default = "default_contract_multiplier")]
    pub multiplier: Decimal,
    #[serde(default = "default_option_lot_size")]
    pub lot_size: Decimal,
    /// Price the simulated feed starts from
    #[serde(default = "default_start_price")]
    pub start_price: Decimal,
    /// Annualised volatility of the simulated feed
    #[serde(default = "default_simulated_vol")]
    pub simulated_vol: Decimal,
}

// Default value functions
fn default_tick_interval_secs() -> u64 {
    10
}

fn default_error_backoff_secs() -> u64 {
    30
}

fn default_alert_cooldown_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_partial_var_penalty() -> Decimal {
    dec!(1.25)
}

fn default_max_quote_age_secs() -> i64 {
    60
}

fn default_partial_policy() -> PartialPolicy {
    PartialPolicy::Flag
}

fn default_audit_db_path() -> String {
    "hedger.db".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_command_capacity() -> usize {
    32
}

fn default_venue_fee_rate() -> Decimal {
    dec!(0.0005)
}

fn default_spot_lot_size() -> Decimal {
    dec!(0.0001)
}

fn default_contract_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_perp_lot_size() -> Decimal {
    dec!(0.001)
}

fn default_option_lot_size() -> Decimal {
    dec!(0.01)
}

fn default_custody_venue() -> VenueId {
    VenueId::new("custody")
}

fn default_strike_ratios() -> Vec<Decimal> {
    vec![dec!(0.90), dec!(0.95), dec!(1.00), dec!(1.05), dec!(1.10)]
}

fn default_expiry_days() -> Vec<u32> {
    vec![7, 30]
}

fn default_start_price() -> Decimal {
    dec!(62000)
}

fn default_simulated_vol() -> Decimal {
    dec!(0.6)
}

fn default_venues() -> Vec<VenueConfig> {
    ["okx", "bybit"]
        .into_iter()
        .map(|id| VenueConfig {
            id: VenueId::new(id),
            fee_rate: default_venue_fee_rate(),
            depth: None,
            latency_ms: 0,
            timeout_ms: None,
        })
        .collect()
}

fn default_groups() -> Vec<GroupConfig> {
    let mut policy = HedgePolicy::new("BTC-PERP");
    policy.venue_priority = vec![VenueId::new("okx"), VenueId::new("bybit")];

    vec![GroupConfig {
        id: "btc".to_string(),
        underlying: "BTC".to_string(),
        spot_instrument: InstrumentId::new("BTC-SPOT"),
        spot_lot_size: default_spot_lot_size(),
        perp_multiplier: default_contract_multiplier(),
        perp_lot_size: default_perp_lot_size(),
        initial_spot: dec!(10),
        entry_price: default_start_price(),
        custody_venue: default_custody_venue(),
        options: OptionChainConfig::default(),
        policy,
    }]
}

impl EngineConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn error_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.error_backoff_secs)
    }

    pub fn alert_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.alert_cooldown_secs as i64)
    }
}

impl Config {
    /// Load configuration from environment and optional config file.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SPOT_HEDGER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.engine.tick_interval_secs > 0, "tick_interval_secs must be positive");

        anyhow::ensure!(
            self.engine.max_consecutive_failures >= 1,
            "max_consecutive_failures must be at least 1"
        );

        anyhow::ensure!(
            self.engine.partial_var_penalty >= Decimal::ONE,
            "partial_var_penalty must be >= 1"
        );

        anyhow::ensure!(
            self.router.venue_timeout_ms > 0 && self.router.base_backoff_ms <= self.router.max_backoff_ms,
            "router timeout must be positive and base_backoff_ms <= max_backoff_ms"
        );

        anyhow::ensure!(!self.venues.is_empty(), "at least one venue must be configured");
        anyhow::ensure!(!self.groups.is_empty(), "at least one group must be configured");

        let venue_ids: HashSet<&VenueId> = self.venues.iter().map(|v| &v.id).collect();
        anyhow::ensure!(venue_ids.len() == self.venues.len(), "venue ids must be unique");
        for venue in &self.venues {
            anyhow::ensure!(
                venue.fee_rate >= Decimal::ZERO && venue.fee_rate < dec!(0.01),
                "fee_rate of venue {} must be between 0 and 1%",
                venue.id
            );
            anyhow::ensure!(
                venue.timeout_ms != Some(0),
                "timeout_ms of venue {} must be positive",
                venue.id
            );
        }

        let mut group_ids = HashSet::new();
        for group in &self.groups {
            anyhow::ensure!(group_ids.insert(group.id.as_str()), "duplicate group id {}", group.id);
            anyhow::ensure!(
                group.perp_multiplier > Decimal::ZERO && group.perp_lot_size > Decimal::ZERO,
                "group {}: perpetual multiplier and lot size must be positive",
                group.id
            );
            anyhow::ensure!(
                group.policy.hedge_instrument != group.spot_instrument,
                "group {}: hedge instrument must differ from the spot instrument",
                group.id
            );

            group
                .policy
                .validate()
                .with_context(|| format!("group {} has an invalid policy", group.id))?;

            for venue in &group.policy.venue_priority {
                anyhow::ensure!(
                    venue_ids.contains(venue),
                    "group {} routes to unknown venue {}",
                    group.id,
                    venue
                );
            }

            let options = &group.options;
            anyhow::ensure!(
                options.strike_ratios.iter().all(|r| *r > Decimal::ZERO)
                    && options.expiry_days.iter().all(|d| *d > 0),
                "group {}: option strikes and expiries must be positive",
                group.id
            );
        }

        Ok(())
    }

    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            thresholds: RiskThresholds::default(),
            router: RouterConfig::default(),
            cost_model: FeeAndPremiumCost::default(),
            venues: default_venues(),
            groups: default_groups(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            partial_var_penalty: default_partial_var_penalty(),
            max_quote_age_secs: default_max_quote_age_secs(),
            partial_policy: default_partial_policy(),
            audit_db_path: default_audit_db_path(),
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl Default for OptionChainConfig {
    fn default() -> Self {
        Self {
            strike_ratios: default_strike_ratios(),
            expiry_days: default_expiry_days(),
            multiplier: default_contract_multiplier(),
            lot_size: default_option_lot_size(),
            start_price: default_start_price(),
            simulated_vol: default_simulated_vol(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_venue_in_priority_is_rejected() {
        let mut config = Config::default();
        config.groups[0].policy.venue_priority.push(VenueId::new("deribit"));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown venue deribit"));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut config = Config::default();
        config.groups[0].policy.delta_band = dec!(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_group_is_rejected() {
        let mut config = Config::default();
        let copy = config.groups[0].clone();
        config.groups.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_venue_timeout_override() {
        let raw = r#"{ "id": "deribit", "timeout_ms": 12000 }"#;
        let venue: VenueConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(venue.timeout_ms, Some(12_000));

        let mut config = Config::default();
        config.venues[0].timeout_ms = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms of venue okx"));
    }

    #[test]
    fn test_sections_deserialize_with_defaults() {
        let raw = r#"{
            "engine": { "tick_interval_secs": 5 },
            "venues": [{ "id": "okx" }],
            "groups": [{
                "id": "eth",
                "underlying": "ETH",
                "spot_instrument": "ETH-SPOT",
                "initial_spot": "25",
                "policy": { "hedge_instrument": "ETH-PERP", "venue_priority": ["okx"] }
            }]
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();

        assert_eq!(config.engine.tick_interval_secs, 5);
        assert_eq!(config.engine.error_backoff_secs, 30);
        assert_eq!(config.venues[0].fee_rate, dec!(0.0005));
        assert_eq!(config.venues[0].timeout_ms, None);
        assert_eq!(config.groups[0].initial_spot, dec!(25));
        assert_eq!(config.groups[0].policy.delta_band, dec!(0.05));
        assert!(config.validate().is_ok());
    }
}
