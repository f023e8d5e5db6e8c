//! Paper venue for simulated hedging.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{OrderIntent, OrderResult};
use super::venue::ExecutionVenue;
use crate::error::VenueError;
use crate::market::{InstrumentId, Side, VenueId};
use crate::utils::bounded::BoundedMap;

/// Client order ids remembered for idempotent resubmission
const ORDER_HISTORY: usize = 10_000;

/// Simulated book state.
#[derive(Debug)]
pub struct PaperVenueState {
    pub prices: HashMap<InstrumentId, Decimal>,
    /// Depth per order; instruments without an entry use the default depth
    pub depth: HashMap<InstrumentId, Decimal>,
    /// Errors returned by the next submissions, in order
    pub scripted_failures: VecDeque<VenueError>,
    pub orders: BoundedMap<String, OrderResult>,
    pub order_count: u64,
    pub total_fees: Decimal,
}

impl PaperVenueState {
    fn with_order_history(history: usize) -> Self {
        Self {
            prices: HashMap::new(),
            depth: HashMap::new(),
            scripted_failures: VecDeque::new(),
            orders: BoundedMap::new(history),
            order_count: 0,
            total_fees: Decimal::ZERO,
        }
    }
}

/// Venue that fills market orders against configured prices and depth.
pub struct PaperVenue {
    id: VenueId,
    state: Arc<RwLock<PaperVenueState>>,
    order_id_counter: AtomicU64,
    /// Taker fee on fill notional (0.05% default)
    fee_rate: Decimal,
    default_depth: Decimal,
    latency: Duration,
}

impl PaperVenue {
    pub fn new(id: impl Into<VenueId>) -> Self {
        Self::with_order_history(id, ORDER_HISTORY)
    }

    /// Venue that remembers only the last `history` client order ids.
    pub fn with_order_history(id: impl Into<VenueId>, history: usize) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(RwLock::new(PaperVenueState::with_order_history(history))),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0005),
            default_depth: dec!(1_000_000),
            latency: Duration::ZERO,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_price(&self, instrument: impl Into<InstrumentId>, price: Decimal) {
        self.state.write().await.prices.insert(instrument.into(), price);
    }

    pub async fn set_depth(&self, instrument: impl Into<InstrumentId>, depth: Decimal) {
        self.state.write().await.depth.insert(instrument.into(), depth);
    }

    /// Make the next submission fail with `error`.
    pub async fn fail_next(&self, error: VenueError) {
        self.state.write().await.scripted_failures.push_back(error);
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    pub async fn total_fees(&self) -> Decimal {
        self.state.read().await.total_fees
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn id(&self) -> VenueId {
        self.id.clone()
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, VenueError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state.orders.get(&intent.client_order_id) {
            debug!(client_order_id = %intent.client_order_id, "Duplicate submission, returning original result");
            return Ok(existing.clone());
        }
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let price = state
            .prices
            .get(&intent.instrument)
            .copied()
            .ok_or_else(|| VenueError::Rejected(format!("no market for {}", intent.instrument)))?;
        let depth = state
            .depth
            .get(&intent.instrument)
            .copied()
            .unwrap_or(self.default_depth);
        let filled = intent.quantity.min(depth);
        if filled <= Decimal::ZERO {
            return Err(VenueError::Rejected("no liquidity".to_string()));
        }

        let fee = filled * price * self.fee_rate;
        let result = if filled < intent.quantity {
            OrderResult::partial(intent, filled, price, fee)
        } else {
            OrderResult::filled(intent, price, fee)
        };

        state.order_count += 1;
        state.total_fees += fee;
        state.orders.insert(intent.client_order_id.clone(), result.clone());

        info!(
            order_id = self.next_order_id(),
            venue = %self.id,
            client_order_id = %intent.client_order_id,
            instrument = %intent.instrument,
            side = %intent.side,
            quantity = %filled,
            price = %price,
            fee = %fee,
            "Paper order executed"
        );
        Ok(result)
    }

    /// Market orders fill on arrival, so only unknown orders can be cancelled.
    async fn cancel_order(&self, client_order_id: &str) -> Result<(), VenueError> {
        if self.state.read().await.orders.contains_key(client_order_id) {
            return Err(VenueError::Rejected(format!("order {} already filled", client_order_id)));
        }
        Ok(())
    }

    async fn available_liquidity(&self, instrument: &InstrumentId, _side: Side) -> Result<Decimal, VenueError> {
        let state = self.state.read().await;
        if !state.prices.contains_key(instrument) {
            return Ok(Decimal::ZERO);
        }
        Ok(state.depth.get(instrument).copied().unwrap_or(self.default_depth))
    }
}
