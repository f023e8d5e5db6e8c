//! Position ledger: the single authoritative record of holdings.
//!
//! Fills for one instrument are serialized by a per-instrument mutex and
//! applied in receipt order. Fills on different instruments proceed in
//! parallel. `holdings()` takes the outer lock exclusively, so it waits for
//! in-progress fills and returns one consistent cut across instruments.

mod position;

pub use position::Position;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::HedgeError;
use crate::execution::OrderResult;
use crate::market::{Instrument, InstrumentId, Side, VenueId};
use crate::utils::bounded::BoundedMap;

#[derive(Debug)]
struct InstrumentBook {
    instrument: Arc<Instrument>,
    positions: BTreeMap<VenueId, Position>,
    /// Recently applied client order ids
    applied: BoundedMap<String, ()>,
}

/// Immutable view of all positions at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Holdings {
    pub as_of: Option<DateTime<Utc>>,
    /// Sorted by instrument, then venue
    pub positions: Vec<Position>,
}

impl Holdings {
    /// Net quantity of an instrument across venues.
    pub fn net_quantity(&self, instrument: &InstrumentId) -> Decimal {
        self.positions
            .iter()
            .filter(|p| p.instrument_id() == instrument)
            .map(|p| p.quantity)
            .sum()
    }

    /// Non-flat positions on an underlying.
    pub fn for_underlying<'a>(&'a self, underlying: &'a str) -> impl Iterator<Item = &'a Position> + 'a {
        self.positions
            .iter()
            .filter(move |p| p.instrument.underlying == underlying && p.quantity != Decimal::ZERO)
    }

    /// Net quantity per instrument on an underlying.
    pub fn net_by_instrument(&self, underlying: &str) -> BTreeMap<InstrumentId, (Arc<Instrument>, Decimal)> {
        let mut net: BTreeMap<InstrumentId, (Arc<Instrument>, Decimal)> = BTreeMap::new();
        for p in self.for_underlying(underlying) {
            net.entry(p.instrument_id().clone())
                .or_insert_with(|| (p.instrument.clone(), Decimal::ZERO))
                .1 += p.quantity;
        }
        net
    }

    pub fn is_empty(&self) -> bool {
        self.positions.iter().all(|p| p.quantity == Decimal::ZERO)
    }
}

/// Applied order ids remembered per instrument for duplicate detection
const APPLIED_HISTORY: usize = 10_000;

/// Authoritative in-memory position ledger.
#[derive(Debug)]
pub struct PositionLedger {
    books: RwLock<HashMap<InstrumentId, Arc<Mutex<InstrumentBook>>>>,
    applied_history: usize,
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::with_applied_history(APPLIED_HISTORY)
    }

    /// Ledger that remembers the last `history` applied orders per instrument.
    pub fn with_applied_history(history: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            applied_history: history,
        }
    }

    /// Register an instrument so fills for it are accepted.
    pub async fn register_instrument(&self, instrument: Arc<Instrument>) {
        let mut books = self.books.write().await;
        books.entry(instrument.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(InstrumentBook {
                instrument,
                positions: BTreeMap::new(),
                applied: BoundedMap::new(self.applied_history),
            }))
        });
    }

    /// Apply a confirmed order result and return the updated position.
    pub async fn apply_fill(&self, result: &OrderResult) -> Result<Position, HedgeError> {
        let books = self.books.read().await;
        let book = books
            .get(&result.instrument)
            .ok_or_else(|| HedgeError::InvalidFill {
                instrument: result.instrument.clone(),
                reason: "unknown instrument".to_string(),
            })?
            .clone();
        let mut book = book.lock().await;

        Self::validate(result, &book)?;

        let instrument = book.instrument.clone();
        let position = book
            .positions
            .entry(result.venue.clone())
            .or_insert_with(|| Position::flat(instrument, result.venue.clone()));

        if result.filled_qty == Decimal::ZERO {
            return Ok(position.clone());
        }

        position.apply(result.filled_qty, result.avg_price, result.fee);
        let updated = position.clone();
        book.applied.insert(result.client_order_id.clone(), ());

        info!(
            instrument = %result.instrument,
            venue = %result.venue,
            instruction_id = %result.instruction_id,
            filled_qty = %result.filled_qty,
            price = %result.avg_price,
            position = %updated.quantity,
            "Fill applied to ledger"
        );

        Ok(updated)
    }

    fn validate(result: &OrderResult, book: &InstrumentBook) -> Result<(), HedgeError> {
        let invalid = |reason: String| HedgeError::InvalidFill {
            instrument: result.instrument.clone(),
            reason,
        };

        if result.filled_qty != Decimal::ZERO && Side::for_signed(result.filled_qty) != result.side {
            warn!(
                instrument = %result.instrument,
                side = %result.side,
                filled_qty = %result.filled_qty,
                "Fill sign contradicts instruction direction"
            );
            return Err(invalid(format!(
                "filled quantity {} inconsistent with {} direction",
                result.filled_qty, result.side
            )));
        }

        if result.filled_qty.abs() > result.requested_qty {
            return Err(invalid(format!(
                "filled {} exceeds requested {}",
                result.filled_qty.abs(),
                result.requested_qty
            )));
        }

        if book.applied.contains_key(&result.client_order_id) {
            return Err(invalid(format!(
                "order {} already applied",
                result.client_order_id
            )));
        }

        Ok(())
    }

    /// Record an externally held position (e.g. the spot holding under management).
    pub async fn seed_position(
        &self,
        instrument: &InstrumentId,
        venue: VenueId,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Position, HedgeError> {
        let books = self.books.read().await;
        let book = books
            .get(instrument)
            .ok_or_else(|| HedgeError::InvalidFill {
                instrument: instrument.clone(),
                reason: "unknown instrument".to_string(),
            })?
            .clone();
        let mut book = book.lock().await;
        let inst = book.instrument.clone();

        let position = book
            .positions
            .entry(venue.clone())
            .or_insert_with(|| Position::flat(inst, venue));
        position.apply(quantity, price, Decimal::ZERO);

        debug!(%instrument, %quantity, %price, "Seeded position");
        Ok(position.clone())
    }

    /// Consistent snapshot of all positions.
    pub async fn holdings(&self) -> Holdings {
        let books = self.books.write().await;
        let mut positions = Vec::new();
        for book in books.values() {
            let book = book.lock().await;
            positions.extend(book.positions.values().cloned());
        }
        positions.sort_by(|a, b| {
            a.instrument_id()
                .cmp(b.instrument_id())
                .then_with(|| a.venue.cmp(&b.venue))
        });

        Holdings {
            as_of: Some(Utc::now()),
            positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{OrderIntent, OrderStatus};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn ledger() -> PositionLedger {
        let ledger = PositionLedger::new();
        ledger
            .register_instrument(Arc::new(Instrument::perpetual(
                "BTC-PERP",
                "BTC",
                dec!(1),
                dec!(0.001),
            )))
            .await;
        ledger
            .register_instrument(Arc::new(Instrument::perpetual(
                "ETH-PERP",
                "ETH",
                dec!(1),
                dec!(0.01),
            )))
            .await;
        ledger
    }

    fn fill(instrument: &str, venue: &str, side: Side, qty: Decimal, price: Decimal) -> OrderResult {
        let intent = OrderIntent::new(
            Uuid::new_v4(),
            0,
            0,
            VenueId::new(venue),
            InstrumentId::new(instrument),
            side,
            qty,
        );
        OrderResult::filled(&intent, price, Decimal::ZERO)
    }

    #[tokio::test]
    async fn test_apply_fill_reflects_quantity_delta() {
        let ledger = ledger().await;
        let before = ledger.holdings().await.net_quantity(&"BTC-PERP".into());

        ledger
            .apply_fill(&fill("BTC-PERP", "okx", Side::Sell, dec!(10), dec!(62000)))
            .await
            .unwrap();

        let after = ledger.holdings().await.net_quantity(&"BTC-PERP".into());
        assert_eq!(after - before, dec!(-10));
    }

    #[tokio::test]
    async fn test_n_fills_sum_signed_quantities() {
        let ledger = ledger().await;
        let fills = [
            (Side::Sell, dec!(1.5)),
            (Side::Buy, dec!(0.5)),
            (Side::Sell, dec!(3)),
            (Side::Buy, dec!(0.25)),
        ];
        for (side, qty) in fills {
            ledger
                .apply_fill(&fill("BTC-PERP", "okx", side, qty, dec!(100)))
                .await
                .unwrap();
        }
        let holdings = ledger.holdings().await;
        assert_eq!(holdings.net_quantity(&"BTC-PERP".into()), dec!(-3.75));
    }

    #[tokio::test]
    async fn test_cross_instrument_fills_are_independent() {
        let ledger = Arc::new(ledger().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let (instrument, side) = if i % 2 == 0 {
                ("BTC-PERP", Side::Sell)
            } else {
                ("ETH-PERP", Side::Buy)
            };
            handles.push(tokio::spawn(async move {
                ledger
                    .apply_fill(&fill(instrument, "okx", side, dec!(1), dec!(10)))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let holdings = ledger.holdings().await;
        assert_eq!(holdings.net_quantity(&"BTC-PERP".into()), dec!(-10));
        assert_eq!(holdings.net_quantity(&"ETH-PERP".into()), dec!(10));
    }

    #[tokio::test]
    async fn test_unknown_instrument_rejected() {
        let ledger = ledger().await;
        let err = ledger
            .apply_fill(&fill("SOL-PERP", "okx", Side::Buy, dec!(1), dec!(120)))
            .await
            .unwrap_err();
        assert!(matches!(err, HedgeError::InvalidFill { .. }));
    }

    #[tokio::test]
    async fn test_sign_inconsistent_with_direction_rejected() {
        let ledger = ledger().await;
        let mut result = fill("BTC-PERP", "okx", Side::Sell, dec!(1), dec!(100));
        result.filled_qty = dec!(1);

        let err = ledger.apply_fill(&result).await.unwrap_err();
        assert!(matches!(err, HedgeError::InvalidFill { .. }));
        assert!(ledger.holdings().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_order_cannot_apply_twice() {
        let ledger = ledger().await;
        let result = fill("BTC-PERP", "okx", Side::Buy, dec!(1), dec!(100));
        ledger.apply_fill(&result).await.unwrap();
        assert!(ledger.apply_fill(&result).await.is_err());
        assert_eq!(ledger.holdings().await.net_quantity(&"BTC-PERP".into()), dec!(1));
    }

    #[tokio::test]
    async fn test_applied_history_is_bounded() {
        let ledger = PositionLedger::with_applied_history(2);
        ledger
            .register_instrument(Arc::new(Instrument::perpetual("BTC-PERP", "BTC", dec!(1), dec!(0.001))))
            .await;

        let fills: Vec<OrderResult> = (0..3)
            .map(|_| fill("BTC-PERP", "okx", Side::Buy, dec!(1), dec!(100)))
            .collect();
        for result in &fills {
            ledger.apply_fill(result).await.unwrap();
        }

        let book = ledger.books.read().await[&InstrumentId::new("BTC-PERP")].clone();
        assert_eq!(book.lock().await.applied.len(), 2);
        assert!(ledger.apply_fill(&fills[2]).await.is_err());
        assert_eq!(ledger.holdings().await.net_quantity(&"BTC-PERP".into()), dec!(3));
    }

    #[tokio::test]
    async fn test_unfilled_result_leaves_position_unchanged() {
        let ledger = ledger().await;
        let intent = OrderIntent::new(
            Uuid::new_v4(),
            0,
            0,
            VenueId::new("okx"),
            InstrumentId::new("BTC-PERP"),
            Side::Sell,
            dec!(1),
        );
        let pos = ledger
            .apply_fill(&OrderResult::unfilled(&intent, OrderStatus::Timeout))
            .await
            .unwrap();
        assert_eq!(pos.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_holdings_net_across_venues() {
        let ledger = ledger().await;
        ledger
            .apply_fill(&fill("BTC-PERP", "okx", Side::Sell, dec!(6), dec!(100)))
            .await
            .unwrap();
        ledger
            .apply_fill(&fill("BTC-PERP", "bybit", Side::Sell, dec!(4), dec!(100)))
            .await
            .unwrap();

        let holdings = ledger.holdings().await;
        assert_eq!(holdings.positions.len(), 2);
        let net = holdings.net_by_instrument("BTC");
        assert_eq!(net[&InstrumentId::new("BTC-PERP")].1, dec!(-10));
    }
}
