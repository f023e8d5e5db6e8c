//! Order router: venue selection, liquidity split, retry and fallback.
//!
//! Each instruction is executed at most once. While it is in flight a second
//! `route` call is refused with `DuplicateInstruction`; once it completes the
//! cached outcome is returned without touching any venue.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ExecutionReport, ExecutionStatus, OrderIntent, OrderResult, OrderStatus};
use super::venue::ExecutionVenue;
use crate::error::{HedgeError, VenueError};
use crate::events::{EventBus, HedgeEvent};
use crate::market::VenueId;
use crate::risk::{AlertSeverity, RiskAlert, RiskAlertType};
use crate::strategy::HedgeInstruction;
use crate::utils::bounded::BoundedMap;
use crate::utils::decimal::round_down_to_lot;

const COMPLETED_CACHE_SIZE: usize = 1024;

/// Router timing and health settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-call venue deadline, unless the venue sets its own
    #[serde(default = "default_venue_timeout_ms")]
    pub venue_timeout_ms: u64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failures before a venue is reported degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

fn default_venue_timeout_ms() -> u64 {
    5_000
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_degraded_after() -> u32 {
    3
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            venue_timeout_ms: default_venue_timeout_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            degraded_after: default_degraded_after(),
        }
    }
}

impl RouterConfig {
    pub fn venue_timeout(&self) -> Duration {
        Duration::from_millis(self.venue_timeout_ms)
    }

    /// Exponential backoff before retry `attempt + 1`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Cooperative cancellation for an in-flight instruction.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Routes hedge instructions to venues.
pub struct OrderRouter {
    venues: HashMap<VenueId, Arc<dyn ExecutionVenue>>,
    venue_timeouts: HashMap<VenueId, Duration>,
    config: RouterConfig,
    events: EventBus,
    inflight: Mutex<HashSet<Uuid>>,
    completed: RwLock<BoundedMap<Uuid, Result<ExecutionReport, HedgeError>>>,
    venue_failures: Mutex<HashMap<VenueId, u32>>,
}

impl OrderRouter {
    pub fn new(config: RouterConfig, events: EventBus) -> Self {
        Self {
            venues: HashMap::new(),
            venue_timeouts: HashMap::new(),
            config,
            events,
            inflight: Mutex::new(HashSet::new()),
            completed: RwLock::new(BoundedMap::new(COMPLETED_CACHE_SIZE)),
            venue_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_venue(mut self, venue: Arc<dyn ExecutionVenue>) -> Self {
        self.venues.insert(venue.id(), venue);
        self
    }

    /// Override the call deadline for one venue.
    pub fn with_venue_timeout(mut self, venue: impl Into<VenueId>, timeout: Duration) -> Self {
        self.venue_timeouts.insert(venue.into(), timeout);
        self
    }

    pub fn venue_timeout(&self, venue: &VenueId) -> Duration {
        self.venue_timeouts
            .get(venue)
            .copied()
            .unwrap_or_else(|| self.config.venue_timeout())
    }

    pub fn venue_ids(&self) -> Vec<VenueId> {
        let mut ids: Vec<VenueId> = self.venues.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn venue_failures(&self, venue: &VenueId) -> u32 {
        self.venue_failures.lock().await.get(venue).copied().unwrap_or(0)
    }

    /// Execute an instruction across `priority` venues.
    ///
    /// Returns the report for filled, partial or cancelled executions. When
    /// nothing filled anywhere the error is `VenueTimeout` if every venue only
    /// timed out, `HedgeRejected` otherwise.
    pub async fn route(
        &self,
        instruction: &HedgeInstruction,
        priority: &[VenueId],
        max_retries: u32,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport, HedgeError> {
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(done) = self.completed.read().await.get(&instruction.id) {
                debug!(instruction_id = %instruction.id, "Instruction already executed, returning cached outcome");
                return done.clone();
            }
            if !inflight.insert(instruction.id) {
                return Err(HedgeError::DuplicateInstruction(instruction.id));
            }
        }

        let outcome = self.execute(instruction, priority, max_retries.max(1), cancel).await;

        self.completed.write().await.insert(instruction.id, outcome.clone());
        self.inflight.lock().await.remove(&instruction.id);
        outcome
    }

    async fn execute(
        &self,
        instruction: &HedgeInstruction,
        priority: &[VenueId],
        max_retries: u32,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport, HedgeError> {
        let instrument = &instruction.instrument;
        let lot = instrument.spec.lot_size;

        let mut remaining = instruction.quantity;
        let mut results: Vec<OrderResult> = Vec::new();
        let mut cancelled = false;
        let mut last_error: Option<String> = None;
        let mut exhausted: Option<HedgeError> = None;
        let mut rejected = false;
        let mut leg = 0usize;

        'venues: for venue_id in priority {
            if remaining <= Decimal::ZERO {
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(venue) = self.venues.get(venue_id) else {
                warn!(venue = %venue_id, "Venue in priority list is not connected");
                last_error = Some(format!("unknown venue {}", venue_id));
                continue;
            };
            let venue_timeout = self.venue_timeout(venue_id);

            let depth = tokio::time::timeout(
                venue_timeout,
                venue.available_liquidity(&instrument.id, instruction.side),
            )
            .await;
            let leg_qty = match depth {
                Ok(Ok(liquidity)) => round_down_to_lot(remaining.min(liquidity), lot),
                Ok(Err(e)) => {
                    debug!(venue = %venue_id, error = %e, "Liquidity unknown, offering full remainder");
                    round_down_to_lot(remaining, lot)
                }
                Err(_) => round_down_to_lot(remaining, lot),
            };
            if leg_qty <= Decimal::ZERO {
                debug!(venue = %venue_id, instrument = %instrument.id, "No liquidity, skipping venue");
                continue;
            }

            // The client order id only changes once the venue confirmed the
            // previous order dead; otherwise a resubmission reconciles it.
            let mut generation = 0u32;
            for attempt in 0..max_retries {
                let intent = OrderIntent::new(
                    instruction.id,
                    leg,
                    generation,
                    venue_id.clone(),
                    instrument.id.clone(),
                    instruction.side,
                    leg_qty,
                );

                let submitted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    res = tokio::time::timeout(venue_timeout, venue.submit_order(&intent)) => Some(res),
                };
                let outcome = match submitted {
                    None => {
                        self.cancel_best_effort(venue.as_ref(), &intent).await;
                        results.push(OrderResult::unfilled(&intent, OrderStatus::Cancelled));
                        cancelled = true;
                        break 'venues;
                    }
                    Some(Ok(outcome)) => outcome,
                    Some(Err(_elapsed)) => {
                        if self.cancel_best_effort(venue.as_ref(), &intent).await {
                            generation += 1;
                        } else if attempt + 1 == max_retries {
                            warn!(
                                instruction_id = %instruction.id,
                                venue = %venue_id,
                                client_order_id = %intent.client_order_id,
                                "Order state unknown after last attempt, not routing remainder elsewhere"
                            );
                            results.push(OrderResult::unfilled(&intent, OrderStatus::Timeout));
                            self.record_failure(venue_id, &VenueError::Timeout).await;
                            let timeout = HedgeError::VenueTimeout {
                                venue: venue_id.to_string(),
                                attempts: max_retries,
                            };
                            last_error = Some(format!("{} unresolved: {}", intent.client_order_id, timeout));
                            exhausted = Some(timeout);
                            break 'venues;
                        }
                        Err(VenueError::Timeout)
                    }
                };

                match outcome {
                    Ok(result) => {
                        self.record_success(venue_id).await;
                        remaining -= result.filled_qty.abs();
                        info!(
                            instruction_id = %instruction.id,
                            venue = %venue_id,
                            client_order_id = %result.client_order_id,
                            filled = %result.filled_qty,
                            price = %result.avg_price,
                            remaining = %remaining,
                            "Hedge leg filled"
                        );
                        results.push(result);
                        break;
                    }
                    Err(err) => {
                        let status = match err {
                            VenueError::Timeout => OrderStatus::Timeout,
                            _ => OrderStatus::Rejected,
                        };
                        results.push(OrderResult::unfilled(&intent, status));
                        self.record_failure(venue_id, &err).await;
                        warn!(
                            instruction_id = %instruction.id,
                            venue = %venue_id,
                            attempt = attempt + 1,
                            max_retries,
                            error = %err,
                            "Hedge order attempt failed"
                        );

                        if !err.is_transient() {
                            rejected = true;
                            last_error = Some(format!("{}: {}", venue_id, err));
                            break;
                        }
                        if attempt + 1 == max_retries {
                            let timeout = HedgeError::VenueTimeout {
                                venue: venue_id.to_string(),
                                attempts: max_retries,
                            };
                            last_error = Some(timeout.to_string());
                            exhausted = Some(timeout);
                            break;
                        }

                        let delay = self.config.backoff(attempt);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                cancelled = true;
                                break 'venues;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            leg += 1;
        }

        let report = ExecutionReport::from_results(
            instruction.id,
            instruction.group.clone(),
            instrument.id.clone(),
            instruction.side,
            instruction.quantity,
            results,
            cancelled,
            last_error.clone(),
        );

        if report.status != ExecutionStatus::Failed {
            return Ok(report);
        }
        match exhausted {
            Some(timeout) if !rejected => Err(timeout),
            _ => Err(HedgeError::HedgeRejected {
                instruction_id: instruction.id,
                reason: last_error.unwrap_or_else(|| "no venue could fill".to_string()),
            }),
        }
    }

    /// True when the venue confirmed the cancel.
    async fn cancel_best_effort(&self, venue: &dyn ExecutionVenue, intent: &OrderIntent) -> bool {
        let cancel = tokio::time::timeout(
            self.venue_timeout(&intent.venue),
            venue.cancel_order(&intent.client_order_id),
        );
        let confirmed = matches!(cancel.await, Ok(Ok(())));
        if !confirmed {
            debug!(venue = %intent.venue, client_order_id = %intent.client_order_id, "Cancel not confirmed");
        }
        confirmed
    }

    async fn record_success(&self, venue: &VenueId) {
        self.venue_failures.lock().await.insert(venue.clone(), 0);
    }

    async fn record_failure(&self, venue: &VenueId, error: &VenueError) {
        let count = {
            let mut failures = self.venue_failures.lock().await;
            let count = failures.entry(venue.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if count == self.config.degraded_after {
            let alert = RiskAlert::new(
                RiskAlertType::VenueDegraded {
                    venue: venue.to_string(),
                },
                AlertSeverity::Warning,
                None,
                format!("Venue {} failed {} consecutive orders: {}", venue, count, error),
                "Check venue connectivity; orders fall back to lower-priority venues".to_string(),
            )
            .with_metric("consecutive_failures", Decimal::from(count));
            alert.emit();

            self.events.publish(HedgeEvent::VenueDegraded {
                venue: venue.clone(),
                consecutive_failures: count,
                reason: error.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::venue::MockExecutionVenue;
    use crate::execution::PaperVenue;
    use crate::market::{Instrument, InstrumentId, Side};
    use crate::strategy::{Rationale, StrategyKind, Urgency};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Venue that never answers.
    struct StallingVenue;

    #[async_trait]
    impl ExecutionVenue for StallingVenue {
        fn id(&self) -> VenueId {
            VenueId::new("primary")
        }

        async fn submit_order(&self, _intent: &OrderIntent) -> Result<OrderResult, VenueError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(VenueError::Unavailable("unreachable".into()))
        }

        async fn cancel_order(&self, _client_order_id: &str) -> Result<(), VenueError> {
            Ok(())
        }

        async fn available_liquidity(&self, _: &InstrumentId, _: Side) -> Result<Decimal, VenueError> {
            Ok(dec!(1_000))
        }
    }

    /// Venue whose first acknowledgement is lost: the order fills but the
    /// reply never arrives and the order can no longer be cancelled.
    struct LostAckVenue {
        orders: std::sync::Mutex<HashMap<String, OrderResult>>,
        filled: std::sync::Mutex<Decimal>,
        submissions: std::sync::atomic::AtomicU32,
    }

    impl LostAckVenue {
        fn new() -> Self {
            Self {
                orders: std::sync::Mutex::new(HashMap::new()),
                filled: std::sync::Mutex::new(Decimal::ZERO),
                submissions: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn filled(&self) -> Decimal {
            *self.filled.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExecutionVenue for LostAckVenue {
        fn id(&self) -> VenueId {
            VenueId::new("primary")
        }

        async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, VenueError> {
            let first = self.submissions.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0;
            let result = {
                let mut orders = self.orders.lock().unwrap();
                match orders.get(&intent.client_order_id) {
                    Some(existing) => existing.clone(),
                    None => {
                        let result = OrderResult::filled(intent, dec!(62000), dec!(1));
                        *self.filled.lock().unwrap() += intent.quantity;
                        orders.insert(intent.client_order_id.clone(), result.clone());
                        result
                    }
                }
            };
            if first {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(result)
        }

        async fn cancel_order(&self, _client_order_id: &str) -> Result<(), VenueError> {
            Err(VenueError::Rejected("order already filled".into()))
        }

        async fn available_liquidity(&self, _: &InstrumentId, _: Side) -> Result<Decimal, VenueError> {
            Ok(dec!(1_000))
        }
    }

    /// Venue that answers after a fixed delay.
    struct SlowVenue(Duration);

    #[async_trait]
    impl ExecutionVenue for SlowVenue {
        fn id(&self) -> VenueId {
            VenueId::new("slow")
        }

        async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, VenueError> {
            tokio::time::sleep(self.0).await;
            Ok(OrderResult::filled(intent, dec!(62000), dec!(1)))
        }

        async fn cancel_order(&self, _client_order_id: &str) -> Result<(), VenueError> {
            Ok(())
        }

        async fn available_liquidity(&self, _: &InstrumentId, _: Side) -> Result<Decimal, VenueError> {
            Ok(dec!(1_000))
        }
    }

    fn instruction(qty: Decimal) -> HedgeInstruction {
        HedgeInstruction::new(
            "btc",
            Arc::new(Instrument::perpetual("BTC-PERP", "BTC", dec!(1), dec!(0.001))),
            Side::Sell,
            qty,
            Urgency::High,
            StrategyKind::DeltaNeutral,
            Rationale {
                net_delta: qty,
                var: dec!(1000),
                spot_exposure: qty,
                underlying_price: dec!(62000),
                snapshot_version: 1,
                residual_delta: Decimal::ZERO,
                expected_cost: None,
                reason: "test".into(),
            },
        )
    }

    fn filling_mock(id: &'static str, times: usize) -> MockExecutionVenue {
        let mut venue = MockExecutionVenue::new();
        venue.expect_id().return_const(VenueId::new(id));
        venue
            .expect_available_liquidity()
            .returning(|_, _| Ok(dec!(1_000)));
        venue
            .expect_submit_order()
            .times(times)
            .returning(|intent| Ok(OrderResult::filled(intent, dec!(62010), dec!(1))));
        venue
    }

    fn venues(ids: &[&str]) -> Vec<VenueId> {
        ids.iter().map(|id| VenueId::new(*id)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeouts_fall_back_to_secondary() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let router = OrderRouter::new(RouterConfig::default(), events)
            .with_venue(Arc::new(StallingVenue))
            .with_venue(Arc::new(filling_mock("secondary", 1)));

        let report = router
            .route(&instruction(dec!(10)), &venues(&["primary", "secondary"]), 3, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Filled);
        assert_eq!(report.filled_qty, dec!(-10));
        assert_eq!(report.results.len(), 4);
        assert!(report.results[..3].iter().all(|r| r.status == OrderStatus::Timeout));
        assert_eq!(report.fills().count(), 1);
        assert_eq!(report.fills().next().unwrap().venue, VenueId::new("secondary"));
        assert_eq!(router.venue_failures(&VenueId::new("primary")).await, 3);

        match rx.recv().await.unwrap() {
            HedgeEvent::VenueDegraded { venue, .. } => assert_eq!(venue, VenueId::new("primary")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeat_route_returns_cached_report() {
        let router = OrderRouter::new(RouterConfig::default(), EventBus::default())
            .with_venue(Arc::new(filling_mock("okx", 1)));
        let hedge = instruction(dec!(2));
        let cancel = CancelToken::new();

        let first = router.route(&hedge, &venues(&["okx"]), 3, &cancel).await.unwrap();
        let second = router.route(&hedge, &venues(&["okx"]), 3, &cancel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_instruction_is_duplicate() {
        let router = Arc::new(
            OrderRouter::new(RouterConfig::default(), EventBus::default()).with_venue(Arc::new({
                let venue = PaperVenue::new("okx").with_latency(Duration::from_secs(1));
                venue.set_price("BTC-PERP", dec!(62000)).await;
                venue
            })),
        );
        let hedge = instruction(dec!(1));

        let first = {
            let router = router.clone();
            let hedge = hedge.clone();
            tokio::spawn(async move {
                router
                    .route(&hedge, &venues(&["okx"]), 1, &CancelToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = router
            .route(&hedge, &venues(&["okx"]), 1, &CancelToken::new())
            .await;
        assert_eq!(second, Err(HedgeError::DuplicateInstruction(hedge.id)));
        assert_eq!(first.await.unwrap().unwrap().status, ExecutionStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_venue_timing_out_is_venue_timeout() {
        let router = OrderRouter::new(RouterConfig::default(), EventBus::default()).with_venue(Arc::new(StallingVenue));

        let err = router
            .route(&instruction(dec!(10)), &venues(&["primary"]), 3, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HedgeError::VenueTimeout {
                venue: "primary".into(),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let mut venue = MockExecutionVenue::new();
        venue.expect_id().return_const(VenueId::new("okx"));
        venue
            .expect_available_liquidity()
            .returning(|_, _| Ok(dec!(1_000)));
        venue
            .expect_submit_order()
            .times(1)
            .returning(|_| Err(VenueError::Rejected("insufficient margin".into())));

        let router = OrderRouter::new(RouterConfig::default(), EventBus::default()).with_venue(Arc::new(venue));
        let hedge = instruction(dec!(1));

        let err = router
            .route(&hedge, &venues(&["okx"]), 3, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HedgeError::HedgeRejected { instruction_id, .. } if instruction_id == hedge.id));
    }

    #[tokio::test]
    async fn test_thin_primary_splits_across_venues() {
        let primary = PaperVenue::new("primary");
        primary.set_price("BTC-PERP", dec!(62000)).await;
        primary.set_depth("BTC-PERP", dec!(4)).await;
        let secondary = PaperVenue::new("secondary");
        secondary.set_price("BTC-PERP", dec!(62050)).await;

        let router = OrderRouter::new(RouterConfig::default(), EventBus::default())
            .with_venue(Arc::new(primary))
            .with_venue(Arc::new(secondary));

        let report = router
            .route(&instruction(dec!(10)), &venues(&["primary", "secondary"]), 3, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Filled);
        let legs: Vec<Decimal> = report.fills().map(|r| r.filled_qty).collect();
        assert_eq!(legs, vec![dec!(-4), dec!(-6)]);
        // (4 * 62000 + 6 * 62050) / 10
        assert_eq!(report.avg_price, dec!(62030));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_in_flight_order() {
        let router = Arc::new(OrderRouter::new(RouterConfig::default(), EventBus::default()).with_venue(Arc::new(StallingVenue)));
        let cancel = CancelToken::new();

        let handle = {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                router
                    .route(&instruction(dec!(1)), &venues(&["primary"]), 3, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, ExecutionStatus::Cancelled);
        assert_eq!(report.filled_qty, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ack_is_reconciled_without_second_fill() {
        let venue = Arc::new(LostAckVenue::new());
        let router = OrderRouter::new(RouterConfig::default(), EventBus::default())
            .with_venue(venue.clone())
            .with_venue(Arc::new(filling_mock("secondary", 0)));

        let report = router
            .route(&instruction(dec!(10)), &venues(&["primary", "secondary"]), 3, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(venue.filled(), dec!(10));
        assert_eq!(report.status, ExecutionStatus::Filled);
        assert_eq!(report.filled_qty, dec!(-10));
        assert_eq!(report.results[0].status, OrderStatus::Timeout);
        assert_eq!(report.results[0].client_order_id, report.results[1].client_order_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_order_is_not_rerouted() {
        let venue = Arc::new(LostAckVenue::new());
        let router = OrderRouter::new(RouterConfig::default(), EventBus::default())
            .with_venue(venue.clone())
            .with_venue(Arc::new(filling_mock("secondary", 0)));

        let err = router
            .route(&instruction(dec!(10)), &venues(&["primary", "secondary"]), 1, &CancelToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HedgeError::VenueTimeout {
                venue: "primary".into(),
                attempts: 1
            }
        );
        assert_eq!(venue.filled(), dec!(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_venue_timeout_overrides_default() {
        let config = RouterConfig {
            venue_timeout_ms: 1_000,
            ..RouterConfig::default()
        };
        let slow = || Arc::new(SlowVenue(Duration::from_secs(3)));

        let default_router = OrderRouter::new(config.clone(), EventBus::default()).with_venue(slow());
        let err = default_router
            .route(&instruction(dec!(1)), &venues(&["slow"]), 1, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HedgeError::VenueTimeout { .. }));

        let router = OrderRouter::new(config, EventBus::default())
            .with_venue(slow())
            .with_venue_timeout("slow", Duration::from_secs(10));
        assert_eq!(router.venue_timeout(&VenueId::new("slow")), Duration::from_secs(10));
        assert_eq!(router.venue_timeout(&VenueId::new("other")), Duration::from_secs(1));

        let report = router
            .route(&instruction(dec!(1)), &venues(&["slow"]), 1, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::Filled);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RouterConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(250));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(10), Duration::from_millis(5000));
        assert_eq!(config.backoff(80), Duration::from_millis(5000));
    }
}
