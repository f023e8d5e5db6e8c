//! Order intents, per-venue results and aggregated execution reports.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::{InstrumentId, Side, VenueId};
use crate::utils::decimal::weighted_average;

/// Order submitted to one venue for (part of) a hedge instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    /// Client order id, stable across retries of a leg until the venue
    /// confirms the previous order cancelled
    pub client_order_id: String,
    /// Originating instruction, for traceability and retry dedup
    pub instruction_id: Uuid,
    pub venue: VenueId,
    pub instrument: InstrumentId,
    pub side: Side,
    /// Unsigned order quantity
    pub quantity: Decimal,
}

impl OrderIntent {
    pub fn new(
        instruction_id: Uuid,
        leg: usize,
        generation: u32,
        venue: VenueId,
        instrument: InstrumentId,
        side: Side,
        quantity: Decimal,
    ) -> Self {
        let client_order_id = format!("{}-{}-{}", instruction_id.simple(), leg, generation);
        Self {
            client_order_id,
            instruction_id,
            venue,
            instrument,
            side,
            quantity,
        }
    }
}

/// Outcome status of a single venue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    Partial,
    Rejected,
    Timeout,
    Cancelled,
}

/// Confirmed outcome of one `OrderIntent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderResult {
    pub client_order_id: String,
    pub instruction_id: Uuid,
    pub venue: VenueId,
    pub instrument: InstrumentId,
    pub side: Side,
    pub requested_qty: Decimal,
    /// Signed: positive for buys, negative for sells
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    /// Fully filled result for an intent.
    pub fn filled(intent: &OrderIntent, price: Decimal, fee: Decimal) -> Self {
        Self::partial(intent, intent.quantity, price, fee)
    }

    /// Result with an unsigned filled quantity; status follows from the fill.
    pub fn partial(intent: &OrderIntent, filled: Decimal, price: Decimal, fee: Decimal) -> Self {
        let status = if filled >= intent.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        Self {
            client_order_id: intent.client_order_id.clone(),
            instruction_id: intent.instruction_id,
            venue: intent.venue.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            requested_qty: intent.quantity,
            filled_qty: filled * intent.side.sign(),
            avg_price: price,
            fee,
            status,
            timestamp: Utc::now(),
        }
    }

    /// Result carrying no fill.
    pub fn unfilled(intent: &OrderIntent, status: OrderStatus) -> Self {
        Self {
            client_order_id: intent.client_order_id.clone(),
            instruction_id: intent.instruction_id,
            venue: intent.venue.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            requested_qty: intent.quantity,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn has_fill(&self) -> bool {
        self.filled_qty != Decimal::ZERO
    }
}

/// Terminal status of a whole instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Filled,
    Partial,
    Failed,
    Cancelled,
}

/// Aggregate of every venue order placed for one instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub instruction_id: Uuid,
    pub group: String,
    pub instrument: InstrumentId,
    pub side: Side,
    pub requested_qty: Decimal,
    pub results: Vec<OrderResult>,
    pub status: ExecutionStatus,
    /// Signed total across venues
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub total_fees: Decimal,
    pub failure_reason: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionReport {
    /// Build a report from the collected venue results.
    #[allow(clippy::too_many_arguments)]
    pub fn from_results(
        instruction_id: Uuid,
        group: String,
        instrument: InstrumentId,
        side: Side,
        requested_qty: Decimal,
        results: Vec<OrderResult>,
        cancelled: bool,
        failure_reason: Option<String>,
    ) -> Self {
        let fills: Vec<(Decimal, Decimal)> = results
            .iter()
            .filter(|r| r.has_fill())
            .map(|r| (r.avg_price, r.filled_qty.abs()))
            .collect();
        let filled_qty: Decimal = results.iter().map(|r| r.filled_qty).sum();
        let total_fees = results.iter().map(|r| r.fee).sum();

        let status = if filled_qty.abs() >= requested_qty {
            ExecutionStatus::Filled
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else if filled_qty != Decimal::ZERO {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Failed
        };

        Self {
            instruction_id,
            group,
            instrument,
            side,
            requested_qty,
            results,
            status,
            filled_qty,
            avg_price: weighted_average(&fills),
            total_fees,
            failure_reason,
            completed_at: Utc::now(),
        }
    }

    /// Results that moved a position and must reach the ledger.
    pub fn fills(&self) -> impl Iterator<Item = &OrderResult> {
        self.results.iter().filter(|r| r.has_fill())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn intent(venue: &str, side: Side, qty: Decimal) -> OrderIntent {
        OrderIntent::new(
            Uuid::new_v4(),
            0,
            0,
            VenueId::new(venue),
            InstrumentId::new("BTC-PERP"),
            side,
            qty,
        )
    }

    #[test]
    fn test_sell_fill_is_negative() {
        let result = OrderResult::filled(&intent("okx", Side::Sell, dec!(2)), dec!(62000), dec!(1));
        assert_eq!(result.filled_qty, dec!(-2));
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[test]
    fn test_report_aggregates_split_fills() {
        let id = Uuid::new_v4();
        let mut a = OrderResult::partial(&intent("okx", Side::Sell, dec!(6)), dec!(6), dec!(100), dec!(0.1));
        let mut b = OrderResult::partial(&intent("bybit", Side::Sell, dec!(4)), dec!(4), dec!(110), dec!(0.2));
        a.instruction_id = id;
        b.instruction_id = id;

        let report = ExecutionReport::from_results(
            id,
            "btc".into(),
            InstrumentId::new("BTC-PERP"),
            Side::Sell,
            dec!(10),
            vec![a, b],
            false,
            None,
        );

        assert_eq!(report.status, ExecutionStatus::Filled);
        assert_eq!(report.filled_qty, dec!(-10));
        assert_eq!(report.avg_price, dec!(104));
        assert_eq!(report.total_fees, dec!(0.3));
    }

    #[test]
    fn test_report_without_fills_is_failed() {
        let i = intent("okx", Side::Buy, dec!(1));
        let report = ExecutionReport::from_results(
            i.instruction_id,
            "btc".into(),
            i.instrument.clone(),
            Side::Buy,
            dec!(1),
            vec![OrderResult::unfilled(&i, OrderStatus::Timeout)],
            false,
            Some("all venues timed out".into()),
        );
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.fills().count(), 0);
    }
}
