//! Instrument and market-data vocabulary shared by every component.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument identifier (e.g. "BTC-SPOT", "BTC-PERP", "BTC-20261225-55000-P").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Execution venue identifier (e.g. "okx", "bybit", "deribit").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VenueId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Asset class of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Spot,
    Perpetual,
    Option,
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

/// Option-specific contract terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionTerms {
    pub kind: OptionKind,
    pub strike: Decimal,
    pub expiry: DateTime<Utc>,
}

/// Contract specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Underlying units per contract
    pub multiplier: Decimal,
    /// Minimum tradable quantity increment
    pub lot_size: Decimal,
    /// Present for options only
    pub option: Option<OptionTerms>,
}

/// A tradable instrument. Immutable once created; shared via `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub asset_class: AssetClass,
    /// Underlying asset (e.g. "BTC")
    pub underlying: String,
    pub spec: ContractSpec,
}

impl Instrument {
    /// Spot instrument with multiplier 1.
    pub fn spot(id: impl Into<String>, underlying: impl Into<String>, lot_size: Decimal) -> Self {
        Self {
            id: InstrumentId::new(id),
            asset_class: AssetClass::Spot,
            underlying: underlying.into(),
            spec: ContractSpec {
                multiplier: Decimal::ONE,
                lot_size,
                option: None,
            },
        }
    }

    /// Linear perpetual with the given contract multiplier.
    pub fn perpetual(
        id: impl Into<String>,
        underlying: impl Into<String>,
        multiplier: Decimal,
        lot_size: Decimal,
    ) -> Self {
        Self {
            id: InstrumentId::new(id),
            asset_class: AssetClass::Perpetual,
            underlying: underlying.into(),
            spec: ContractSpec {
                multiplier,
                lot_size,
                option: None,
            },
        }
    }

    /// European option.
    pub fn option(
        id: impl Into<String>,
        underlying: impl Into<String>,
        kind: OptionKind,
        strike: Decimal,
        expiry: DateTime<Utc>,
        multiplier: Decimal,
        lot_size: Decimal,
    ) -> Self {
        Self {
            id: InstrumentId::new(id),
            asset_class: AssetClass::Option,
            underlying: underlying.into(),
            spec: ContractSpec {
                multiplier,
                lot_size,
                option: Some(OptionTerms {
                    kind,
                    strike,
                    expiry,
                }),
            },
        }
    }

    pub fn is_option(&self) -> bool {
        self.asset_class == AssetClass::Option
    }

    pub fn option_kind(&self) -> Option<OptionKind> {
        self.spec.option.as_ref().map(|o| o.kind)
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.spec.option.as_ref().map(|o| o.expiry)
    }

    /// Default per-unit delta for linear instruments; options need a quoted delta.
    pub fn linear_delta(&self) -> Option<Decimal> {
        match self.asset_class {
            AssetClass::Spot | AssetClass::Perpetual => Some(Decimal::ONE),
            AssetClass::Option => None,
        }
    }
}

/// Order / hedge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side that moves position by a signed quantity.
    pub fn for_signed(qty: Decimal) -> Self {
        if qty >= Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Field carried by a market-data update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketField {
    Mid,
    ImpliedVol,
    Delta,
    Gamma,
    Theta,
    Vega,
    /// Liquidity score 0-100
    Liquidity,
}

/// One normalized tuple from the market-data collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub instrument: InstrumentId,
    pub field: MarketField,
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
    pub venue: VenueId,
}

impl MarketUpdate {
    pub fn new(
        instrument: impl Into<InstrumentId>,
        field: MarketField,
        value: Decimal,
        timestamp: DateTime<Utc>,
        venue: impl Into<VenueId>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            field,
            value,
            timestamp,
            venue: venue.into(),
        }
    }
}
