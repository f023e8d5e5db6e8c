//! Per-venue position accounting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::market::{Instrument, InstrumentId, VenueId};

/// Holding of one instrument at one venue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub instrument: Arc<Instrument>,
    pub venue: VenueId,
    /// Signed quantity in instrument units (contracts for derivatives)
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub fill_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Flat position.
    pub fn flat(instrument: Arc<Instrument>, venue: VenueId) -> Self {
        Self {
            instrument,
            venue,
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            fill_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn instrument_id(&self) -> &InstrumentId {
        &self.instrument.id
    }

    /// Exposure in underlying units.
    pub fn underlying_quantity(&self) -> Decimal {
        self.quantity * self.instrument.spec.multiplier
    }

    /// Apply a signed fill at a price.
    ///
    /// Increasing fills move the weighted average entry; reducing fills
    /// realize PnL against it; a fill through zero re-opens at the fill price.
    pub(crate) fn apply(&mut self, signed_qty: Decimal, price: Decimal, fee: Decimal) {
        let old = self.quantity;
        let new = old + signed_qty;
        let multiplier = self.instrument.spec.multiplier;

        let same_direction = old == Decimal::ZERO
            || (old > Decimal::ZERO) == (signed_qty > Decimal::ZERO);

        if same_direction {
            let notional = old.abs() * self.avg_entry_price + signed_qty.abs() * price;
            self.avg_entry_price = if new == Decimal::ZERO {
                Decimal::ZERO
            } else {
                notional / new.abs()
            };
        } else {
            let closed = signed_qty.abs().min(old.abs());
            let direction = if old > Decimal::ZERO {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            self.realized_pnl += closed * (price - self.avg_entry_price) * direction * multiplier;

            if new == Decimal::ZERO {
                self.avg_entry_price = Decimal::ZERO;
            } else if signed_qty.abs() > old.abs() {
                self.avg_entry_price = price;
            }
        }

        self.quantity = new;
        self.fees_paid += fee;
        self.fill_count += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn perp() -> Position {
        Position::flat(
            Arc::new(Instrument::perpetual("BTC-PERP", "BTC", dec!(1), dec!(0.001))),
            VenueId::new("okx"),
        )
    }

    #[test]
    fn test_increasing_fills_average_entry() {
        let mut pos = perp();
        pos.apply(dec!(-1), dec!(100), dec!(0));
        pos.apply(dec!(-3), dec!(120), dec!(0));
        assert_eq!(pos.quantity, dec!(-4));
        assert_eq!(pos.avg_entry_price, dec!(115));
    }

    #[test]
    fn test_reducing_fill_realizes_pnl() {
        let mut pos = perp();
        pos.apply(dec!(-2), dec!(100), dec!(0));
        pos.apply(dec!(1), dec!(90), dec!(0.5));
        // Short from 100, bought back at 90
        assert_eq!(pos.realized_pnl, dec!(10));
        assert_eq!(pos.avg_entry_price, dec!(100));
        assert_eq!(pos.fees_paid, dec!(0.5));
    }

    #[test]
    fn test_flip_resets_entry() {
        let mut pos = perp();
        pos.apply(dec!(1), dec!(100), dec!(0));
        pos.apply(dec!(-3), dec!(110), dec!(0));
        assert_eq!(pos.quantity, dec!(-2));
        assert_eq!(pos.avg_entry_price, dec!(110));
        assert_eq!(pos.realized_pnl, dec!(10));
    }

    #[test]
    fn test_close_to_flat_clears_entry() {
        let mut pos = perp();
        pos.apply(dec!(2), dec!(100), dec!(0));
        pos.apply(dec!(-2), dec!(105), dec!(0));
        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        assert_eq!(pos.fill_count, 2);
    }
}
