//! Venue abstraction used by the order router.
//!
//! Wire protocols and authentication live behind this trait; the router
//! only sees intents and confirmed results.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{OrderIntent, OrderResult};
use crate::error::VenueError;
use crate::market::{InstrumentId, Side, VenueId};

/// An execution venue capable of filling hedge orders.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    /// Venue identifier used in routing priority lists.
    fn id(&self) -> VenueId;

    /// Submit a market order. Resubmitting the same client order id must
    /// return the original result rather than trade again.
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, VenueError>;

    /// Best-effort cancel of a working order.
    async fn cancel_order(&self, client_order_id: &str) -> Result<(), VenueError>;

    /// Quantity the venue can absorb right now on one side.
    async fn available_liquidity(&self, instrument: &InstrumentId, side: Side) -> Result<Decimal, VenueError>;
}
