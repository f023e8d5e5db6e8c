//! Market data aggregation with immutable snapshot swap.
//!
//! Venues push `MarketUpdate` tuples in any order and possibly more than
//! once. The aggregator keeps the freshest value per
//! (instrument, venue, field), merges venues on `promote`, and publishes a
//! new `Arc<MarketSnapshot>` through a watch channel. Readers clone the
//! `Arc` and never block a promotion.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use super::snapshot::{Greeks, MarketSnapshot, Quote};
use super::types::{Instrument, InstrumentId, MarketField, MarketUpdate, VenueId};
use crate::utils::decimal::safe_div;

/// What to do with an instrument whose data went stale or incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Leave the instrument out until it is complete again.
    HoldBack,
    /// Carry the last complete quote forward and flag the snapshot partial.
    Flag,
}

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Fields older than this at promotion time count as missing
    pub max_quote_age: Duration,
    pub partial_policy: PartialPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_quote_age: Duration::seconds(60),
            partial_policy: PartialPolicy::Flag,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldValue {
    value: Decimal,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    instruments: HashMap<InstrumentId, Arc<Instrument>>,
    fields: HashMap<(InstrumentId, VenueId), HashMap<MarketField, FieldValue>>,
}

/// Outcome of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    Duplicate,
    OutOfOrder,
    UnknownInstrument,
}

/// Normalizes streaming venue data into consistent snapshots.
pub struct MarketDataAggregator {
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    tx: watch::Sender<Arc<MarketSnapshot>>,
}

impl MarketDataAggregator {
    /// Create an aggregator publishing an empty version-0 snapshot.
    pub fn new(config: AggregatorConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(MarketSnapshot::empty()));
        Self {
            config,
            state: Mutex::new(AggregatorState::default()),
            tx,
        }
    }

    /// Make an instrument known; updates for unknown instruments are dropped.
    pub async fn register(&self, instrument: Arc<Instrument>) {
        let mut state = self.state.lock().await;
        state.instruments.insert(instrument.id.clone(), instrument);
    }

    /// Look up a registered instrument.
    pub async fn instrument(&self, id: &InstrumentId) -> Option<Arc<Instrument>> {
        self.state.lock().await.instruments.get(id).cloned()
    }

    /// Apply one update, dropping duplicates and out-of-order deliveries.
    pub async fn apply(&self, update: MarketUpdate) -> UpdateOutcome {
        let mut state = self.state.lock().await;
        Self::apply_locked(&mut state, update)
    }

    /// Apply a batch and promote a new snapshot if anything was accepted.
    pub async fn apply_batch(&self, updates: Vec<MarketUpdate>) -> Option<Arc<MarketSnapshot>> {
        let accepted = {
            let mut state = self.state.lock().await;
            updates
                .into_iter()
                .map(|u| Self::apply_locked(&mut state, u))
                .filter(|o| *o == UpdateOutcome::Accepted)
                .count()
        };

        if accepted == 0 {
            return None;
        }
        Some(self.promote().await)
    }

    fn apply_locked(state: &mut AggregatorState, update: MarketUpdate) -> UpdateOutcome {
        if !state.instruments.contains_key(&update.instrument) {
            trace!(instrument = %update.instrument, "Dropping update for unknown instrument");
            return UpdateOutcome::UnknownInstrument;
        }

        let fields = state
            .fields
            .entry((update.instrument.clone(), update.venue.clone()))
            .or_default();

        if let Some(existing) = fields.get(&update.field) {
            if update.timestamp == existing.timestamp {
                return UpdateOutcome::Duplicate;
            }
            if update.timestamp < existing.timestamp {
                debug!(
                    instrument = %update.instrument,
                    venue = %update.venue,
                    field = ?update.field,
                    "Dropping out-of-order update"
                );
                return UpdateOutcome::OutOfOrder;
            }
        }

        fields.insert(
            update.field,
            FieldValue {
                value: update.value,
                timestamp: update.timestamp,
            },
        );
        UpdateOutcome::Accepted
    }

    /// Promote the current state into a new snapshot version.
    pub async fn promote(&self) -> Arc<MarketSnapshot> {
        self.promote_at(Utc::now()).await
    }

    /// Promote with a one-off partial-data policy.
    pub async fn promote_with(&self, policy: PartialPolicy) -> Arc<MarketSnapshot> {
        self.promote_inner(policy, Utc::now()).await
    }

    /// Promote using an explicit clock (deterministic in tests).
    pub async fn promote_at(&self, now: DateTime<Utc>) -> Arc<MarketSnapshot> {
        self.promote_inner(self.config.partial_policy, now).await
    }

    async fn promote_inner(&self, policy: PartialPolicy, now: DateTime<Utc>) -> Arc<MarketSnapshot> {
        let state = self.state.lock().await;
        let previous = self.tx.borrow().clone();

        let mut quotes = BTreeMap::new();
        let mut incomplete = Vec::new();

        for (id, instrument) in &state.instruments {
            match self.merge_quote(&state, instrument, now) {
                Some(quote) => {
                    quotes.insert(id.clone(), quote);
                }
                None => {
                    let carried = previous.quote(id).cloned();
                    match (policy, carried) {
                        (PartialPolicy::Flag, Some(old)) => {
                            quotes.insert(id.clone(), old);
                            incomplete.push(id.clone());
                        }
                        (_, Some(_)) => incomplete.push(id.clone()),
                        (_, None) => {}
                    }
                }
            }
        }
        incomplete.sort();

        let partial = policy == PartialPolicy::Flag && !incomplete.is_empty();
        if !incomplete.is_empty() {
            warn!(
                instruments = ?incomplete,
                partial,
                "Snapshot promoted with incomplete instruments"
            );
        }

        let snapshot = Arc::new(MarketSnapshot {
            version: previous.version + 1,
            taken_at: Some(now),
            quotes,
            partial,
            incomplete,
        });

        self.tx.send_replace(snapshot.clone());
        debug!(version = snapshot.version, quotes = snapshot.quotes.len(), "Snapshot promoted");
        snapshot
    }

    /// Merge all venues into one quote; `None` if a required field is missing.
    fn merge_quote(
        &self,
        state: &AggregatorState,
        instrument: &Arc<Instrument>,
        now: DateTime<Utc>,
    ) -> Option<Quote> {
        let oldest = now - self.config.max_quote_age;
        let venues: Vec<&HashMap<MarketField, FieldValue>> = state
            .fields
            .iter()
            .filter(|((id, _), _)| *id == instrument.id)
            .map(|(_, f)| f)
            .collect();

        let fresh = |field: MarketField| -> Vec<FieldValue> {
            venues
                .iter()
                .filter_map(|f| f.get(&field))
                .filter(|v| v.timestamp >= oldest)
                .copied()
                .collect()
        };
        let latest = |field: MarketField| -> Option<FieldValue> {
            fresh(field).into_iter().max_by_key(|v| v.timestamp)
        };

        let mids = fresh(MarketField::Mid);
        if mids.is_empty() {
            return None;
        }
        let mid_sum: Decimal = mids.iter().map(|v| v.value).sum();
        let mid = safe_div(mid_sum, Decimal::from(mids.len()));

        let implied_vol = latest(MarketField::ImpliedVol);
        let greeks = match instrument.linear_delta() {
            Some(_) => Greeks::linear(),
            None => Greeks {
                delta: latest(MarketField::Delta)?.value,
                gamma: latest(MarketField::Gamma).map(|v| v.value).unwrap_or_default(),
                theta: latest(MarketField::Theta).map(|v| v.value).unwrap_or_default(),
                vega: latest(MarketField::Vega).map(|v| v.value).unwrap_or_default(),
            },
        };
        if instrument.is_option() && implied_vol.is_none() {
            return None;
        }

        let updated_at = venues
            .iter()
            .flat_map(|f| f.values())
            .map(|v| v.timestamp)
            .max()
            .unwrap_or(now);

        Some(Quote {
            instrument: instrument.clone(),
            mid,
            implied_vol: implied_vol.map(|v| v.value),
            greeks,
            liquidity: latest(MarketField::Liquidity).map(|v| v.value),
            updated_at,
        })
    }

    /// Latest fully-merged snapshot.
    pub fn current_snapshot(&self) -> Arc<MarketSnapshot> {
        self.tx.borrow().clone()
    }

    /// Receiver that wakes on each promotion.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::OptionKind;
    use rust_decimal_macros::dec;

    async fn aggregator_with_btc(policy: PartialPolicy) -> MarketDataAggregator {
        let agg = MarketDataAggregator::new(AggregatorConfig {
            max_quote_age: Duration::seconds(30),
            partial_policy: policy,
        });
        agg.register(Arc::new(Instrument::spot("BTC-SPOT", "BTC", dec!(0.0001))))
            .await;
        agg
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_order_updates_are_dropped() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now();

        let first = MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62000), t0, "okx");
        assert_eq!(agg.apply(first.clone()).await, UpdateOutcome::Accepted);
        assert_eq!(agg.apply(first).await, UpdateOutcome::Duplicate);

        let older = MarketUpdate::new(
            "BTC-SPOT",
            MarketField::Mid,
            dec!(61000),
            t0 - Duration::seconds(1),
            "okx",
        );
        assert_eq!(agg.apply(older).await, UpdateOutcome::OutOfOrder);

        let snapshot = agg.promote_at(t0).await;
        assert_eq!(snapshot.mid(&"BTC-SPOT".into()), Some(dec!(62000)));
    }

    #[tokio::test]
    async fn test_versions_increase_monotonically() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now();
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(1), t0, "okx"))
            .await;

        let v1 = agg.promote_at(t0).await.version;
        let v2 = agg.promote_at(t0).await.version;
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
        assert_eq!(agg.current_snapshot().version, 2);
    }

    #[tokio::test]
    async fn test_mid_is_averaged_across_venues() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now();
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62000), t0, "okx"))
            .await;
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62100), t0, "bybit"))
            .await;

        let snapshot = agg.promote_at(t0).await;
        assert_eq!(snapshot.mid(&"BTC-SPOT".into()), Some(dec!(62050)));
    }

    #[tokio::test]
    async fn test_option_held_back_until_complete() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now();
        agg.register(Arc::new(Instrument::option(
            "BTC-P",
            "BTC",
            OptionKind::Put,
            dec!(55000),
            t0 + Duration::days(30),
            dec!(1),
            dec!(0.1),
        )))
        .await;
        agg.apply(MarketUpdate::new("BTC-P", MarketField::Mid, dec!(900), t0, "deribit"))
            .await;

        let snapshot = agg.promote_at(t0).await;
        assert!(snapshot.quote(&"BTC-P".into()).is_none());
        assert!(!snapshot.partial);

        agg.apply(MarketUpdate::new("BTC-P", MarketField::ImpliedVol, dec!(0.55), t0, "deribit"))
            .await;
        agg.apply(MarketUpdate::new("BTC-P", MarketField::Delta, dec!(-0.3), t0, "deribit"))
            .await;
        let snapshot = agg.promote_at(t0).await;
        let quote = snapshot.quote(&"BTC-P".into()).unwrap();
        assert_eq!(quote.greeks.delta, dec!(-0.3));
    }

    #[tokio::test]
    async fn test_stale_instrument_is_flagged_partial() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now();
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62000), t0, "okx"))
            .await;
        agg.promote_at(t0).await;

        let later = agg.promote_at(t0 + Duration::seconds(120)).await;
        assert!(later.partial);
        assert!(later.is_stale(&"BTC-SPOT".into()));
        assert_eq!(later.mid(&"BTC-SPOT".into()), Some(dec!(62000)));
    }

    #[tokio::test]
    async fn test_stale_instrument_held_back_under_hold_back_policy() {
        let agg = aggregator_with_btc(PartialPolicy::HoldBack).await;
        let t0 = Utc::now();
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62000), t0, "okx"))
            .await;
        agg.promote_at(t0).await;

        let later = agg.promote_at(t0 + Duration::seconds(120)).await;
        assert!(!later.partial);
        assert!(later.quote(&"BTC-SPOT".into()).is_none());
        assert_eq!(later.incomplete, vec![InstrumentId::new("BTC-SPOT")]);
    }

    #[tokio::test]
    async fn test_promote_with_overrides_configured_policy() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let t0 = Utc::now() - Duration::seconds(120);
        agg.apply(MarketUpdate::new("BTC-SPOT", MarketField::Mid, dec!(62000), t0, "okx"))
            .await;
        agg.promote_at(t0).await;

        let held = agg.promote_with(PartialPolicy::HoldBack).await;
        assert!(!held.partial);
        assert!(held.quote(&"BTC-SPOT".into()).is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_promotions() {
        let agg = aggregator_with_btc(PartialPolicy::Flag).await;
        let mut rx = agg.subscribe();
        let t0 = Utc::now();

        let promoted = agg
            .apply_batch(vec![MarketUpdate::new(
                "BTC-SPOT",
                MarketField::Mid,
                dec!(62000),
                t0,
                "okx",
            )])
            .await;
        assert!(promoted.is_some());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);

        assert!(agg.apply_batch(Vec::new()).await.is_none());
    }
}
