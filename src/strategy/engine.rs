//! Strategy engine: turns risk metrics into hedge instructions.
//!
//! Owns the per-group [`StrategyState`] table. Gating order is
//! pause/suspension, pending instruction, cooldown, delta band; then the
//! policy's strategy sizes a proposal which must pass the policy caps.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::delta_neutral::{linear_hedge, HedgeProposal, MarketView};
use super::dynamic::{cheapest_hedge, FeeAndPremiumCost, HedgeCostModel};
use super::options::option_overlay;
use super::policy::HedgePolicy;
use super::state::{ProtectionLeg, StrategyState};
use super::types::{HedgeInstruction, Rationale, StrategyKind, Urgency};
use crate::error::HedgeError;
use crate::execution::ExecutionReport;
use crate::market::{InstrumentId, OptionKind, Side};
use crate::risk::RiskMetrics;
use crate::utils::decimal::round_down_to_lot;

/// Operator-sized hedge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualHedge {
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Decimal,
}

/// Evaluates hedging strategies per instrument group.
#[derive(Debug)]
pub struct StrategyEngine {
    states: HashMap<String, StrategyState>,
    cost_model: Arc<dyn HedgeCostModel>,
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new(Arc::new(FeeAndPremiumCost::default()))
    }
}

impl StrategyEngine {
    pub fn new(cost_model: Arc<dyn HedgeCostModel>) -> Self {
        Self {
            states: HashMap::new(),
            cost_model,
        }
    }

    pub fn state(&self, group: &str) -> Option<&StrategyState> {
        self.states.get(group)
    }

    pub fn state_mut(&mut self, group: &str) -> &mut StrategyState {
        self.states
            .entry(group.to_string())
            .or_insert_with(|| StrategyState::new(group))
    }

    /// Apply time-driven transitions; returns a timed-out pending instruction.
    pub fn advance(&mut self, group: &str, policy: &HedgePolicy, now: DateTime<Utc>) -> Option<Uuid> {
        let timed_out = self.state_mut(group).advance(now, policy);
        if let Some(id) = timed_out {
            warn!(group, instruction_id = %id, "Pending hedge timed out, back to idle");
        }
        timed_out
    }

    /// Evaluate the group's strategy against fresh metrics.
    ///
    /// Returns `Ok(None)` when no hedge is needed or allowed right now. A
    /// returned instruction moves the group to `PendingHedge`.
    pub fn evaluate(
        &mut self,
        metrics: &RiskMetrics,
        policy: &HedgePolicy,
        view: &MarketView<'_>,
        force: bool,
    ) -> Result<Option<HedgeInstruction>, HedgeError> {
        let group = metrics.group.as_str();
        self.advance(group, policy, view.now);

        let cost_model = self.cost_model.clone();
        let state = self.state_mut(group);
        if !state.can_issue(view.now, policy, force) {
            debug!(group, phase = ?state.phase, paused = state.paused, "Hedging gated");
            return Ok(None);
        }
        if !force && metrics.net_delta.abs() <= policy.delta_band {
            return Ok(None);
        }

        let proposal = match policy.strategy {
            StrategyKind::DeltaNeutral => linear_hedge(metrics, policy, view)?,
            StrategyKind::ProtectivePut => option_overlay(OptionKind::Put, metrics, state, policy, view)?,
            StrategyKind::CoveredCall => option_overlay(OptionKind::Call, metrics, state, policy, view)?,
            StrategyKind::Dynamic => cheapest_hedge(metrics, policy, view, cost_model.as_ref())?,
            StrategyKind::Manual => None,
        };
        let Some(proposal) = proposal else {
            return Ok(None);
        };

        let urgency = if proposal.routine {
            Urgency::Low
        } else {
            let from_band = if policy.delta_band == Decimal::ZERO {
                Urgency::Critical
            } else {
                Urgency::from_band_ratio(metrics.net_delta.abs() / policy.delta_band)
            };
            if force {
                from_band.max(Urgency::High)
            } else {
                from_band
            }
        };

        let instruction = build_instruction(metrics, policy.strategy, proposal, urgency, view.now);
        enforce_caps(&instruction, policy)?;

        let state = self.state_mut(group);
        if matches!(policy.strategy, StrategyKind::ProtectivePut | StrategyKind::CoveredCall) {
            // Closing a leg inside its roll window leaves the replacement in place
            let roll_cutoff = view.now + policy.roll_window();
            state.staged_protection = instruction
                .instrument
                .expiry()
                .filter(|expiry| *expiry > roll_cutoff)
                .map(|expiry| ProtectionLeg {
                    instrument: instruction.instrument.id.clone(),
                    expiry,
                    covered_exposure: metrics.spot_exposure,
                });
        }
        state.on_issued(instruction.id, view.now);

        info!(
            group,
            instruction_id = %instruction.id,
            strategy = %instruction.strategy,
            instrument = %instruction.instrument.id,
            side = %instruction.side,
            quantity = %instruction.quantity,
            urgency = ?instruction.urgency,
            net_delta = %metrics.net_delta,
            "Hedge instruction issued"
        );
        Ok(Some(instruction))
    }

    /// Build an instruction for an operator-sized hedge.
    ///
    /// Bypasses cooldown and the delta band, but not caps, pauses or a
    /// pending instruction.
    pub fn manual_instruction(
        &mut self,
        request: &ManualHedge,
        metrics: &RiskMetrics,
        policy: &HedgePolicy,
        view: &MarketView<'_>,
    ) -> Result<HedgeInstruction, HedgeError> {
        let group = metrics.group.as_str();
        self.advance(group, policy, view.now);
        if !self.state_mut(group).can_issue(view.now, policy, true) {
            return Err(HedgeError::InvalidCommand(format!(
                "group {} cannot hedge now (paused, suspended or pending)",
                group
            )));
        }

        let quote = view
            .snapshot
            .quote(&request.instrument)
            .ok_or_else(|| HedgeError::DataIncomplete {
                instrument: request.instrument.clone(),
                missing: "quote".to_string(),
            })?;
        let instrument = quote.instrument.clone();
        let quantity = round_down_to_lot(request.quantity.abs(), instrument.spec.lot_size);
        if quantity == Decimal::ZERO {
            return Err(HedgeError::InvalidCommand(format!(
                "quantity {} is below lot size {}",
                request.quantity, instrument.spec.lot_size
            )));
        }

        let signed = quantity * request.side.sign();
        let unit_delta = instrument.linear_delta().unwrap_or(quote.greeks.delta) * instrument.spec.multiplier;
        let proposal = HedgeProposal {
            instrument,
            quantity: signed,
            price: quote.mid,
            greeks: quote.greeks,
            residual_delta: metrics.net_delta + signed * unit_delta,
            expected_cost: None,
            routine: false,
            reason: "operator requested hedge".to_string(),
        };

        let instruction = build_instruction(metrics, StrategyKind::Manual, proposal, Urgency::High, view.now);
        enforce_caps(&instruction, policy)?;
        self.state_mut(group).on_issued(instruction.id, view.now);

        info!(
            group,
            instruction_id = %instruction.id,
            instrument = %instruction.instrument.id,
            side = %instruction.side,
            quantity = %instruction.quantity,
            "Manual hedge instruction issued"
        );
        Ok(instruction)
    }

    /// Record the outcome of an instruction. Returns false for stale reports.
    pub fn on_execution(&mut self, report: &ExecutionReport, policy: &HedgePolicy, now: DateTime<Utc>) -> bool {
        self.state_mut(&report.group)
            .on_resolved(report.instruction_id, report.status, now, policy)
    }

    pub fn pause(&mut self, group: &str) {
        self.state_mut(group).paused = true;
    }

    pub fn resume(&mut self, group: &str) {
        self.state_mut(group).resume();
    }

    pub fn suspend(&mut self, group: &str, reason: impl Into<String>) {
        self.state_mut(group).suspend(reason);
    }
}

fn build_instruction(
    metrics: &RiskMetrics,
    strategy: StrategyKind,
    proposal: HedgeProposal,
    urgency: Urgency,
    now: DateTime<Utc>,
) -> HedgeInstruction {
    let side = proposal.side();
    let mut rationale = Rationale::from_metrics(metrics, proposal.residual_delta, proposal.reason);
    rationale.expected_cost = proposal.expected_cost;

    let mut instruction = HedgeInstruction::new(
        metrics.group.clone(),
        proposal.instrument,
        side,
        proposal.quantity.abs(),
        urgency,
        strategy,
        rationale,
    );
    instruction.created_at = now;
    instruction
}

fn enforce_caps(instruction: &HedgeInstruction, policy: &HedgePolicy) -> Result<(), HedgeError> {
    if instruction.quantity > policy.max_hedge_quantity {
        return Err(HedgeError::PolicyViolation {
            group: instruction.group.clone(),
            limit: "max_hedge_quantity",
            value: instruction.quantity,
            cap: policy.max_hedge_quantity,
        });
    }
    let notional = instruction.notional();
    if notional > policy.max_hedge_notional {
        return Err(HedgeError::PolicyViolation {
            group: instruction.group.clone(),
            limit: "max_hedge_notional",
            value: notional,
            cap: policy.max_hedge_notional,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionStatus, OrderResult};
    use crate::ledger::Holdings;
    use crate::strategy::delta_neutral::tests::{metrics, perp_snapshot, policy};
    use crate::strategy::state::HedgePhase;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn report(instruction: &HedgeInstruction, status: ExecutionStatus) -> ExecutionReport {
        let mut report = ExecutionReport::from_results(
            instruction.id,
            instruction.group.clone(),
            instruction.instrument.id.clone(),
            instruction.side,
            instruction.quantity,
            Vec::<OrderResult>::new(),
            false,
            None,
        );
        report.status = status;
        report
    }

    #[test]
    fn test_unhedged_spot_issues_full_perp_hedge() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let now = Utc::now();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now,
        };
        let mut engine = StrategyEngine::default();

        let instruction = engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy(), &view, false)
            .unwrap()
            .unwrap();
        assert_eq!(instruction.side, Side::Sell);
        assert_eq!(instruction.quantity, dec!(10));
        assert_eq!(instruction.urgency, Urgency::Critical);
        assert_eq!(instruction.rationale.snapshot_version, 7);
        assert!(matches!(
            engine.state("btc").unwrap().phase,
            HedgePhase::PendingHedge { .. }
        ));
    }

    #[test]
    fn test_delta_inside_band_never_hedges() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let mut engine = StrategyEngine::default();
        let policy = policy();
        let start = Utc::now();

        for (i, delta) in [dec!(0.05), dec!(-0.05), dec!(0.049), dec!(0), dec!(-0.01)]
            .into_iter()
            .enumerate()
        {
            for strategy in [
                StrategyKind::DeltaNeutral,
                StrategyKind::ProtectivePut,
                StrategyKind::CoveredCall,
                StrategyKind::Dynamic,
            ] {
                let policy = HedgePolicy {
                    strategy,
                    ..policy.clone()
                };
                let view = MarketView {
                    snapshot: &snapshot,
                    holdings: &holdings,
                    now: start + Duration::hours(i as i64),
                };
                assert!(engine
                    .evaluate(&metrics(delta, dec!(10)), &policy, &view, false)
                    .unwrap()
                    .is_none());
            }
        }
    }

    #[test]
    fn test_pending_blocks_second_instruction() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let now = Utc::now();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now,
        };
        let mut engine = StrategyEngine::default();
        let policy = policy();

        assert!(engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &view, false)
            .unwrap()
            .is_some());
        assert!(engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &view, true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cooldown_after_fill_then_force_overrides() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let now = Utc::now();
        let mut engine = StrategyEngine::default();
        let policy = policy();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now,
        };

        let first = engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &view, false)
            .unwrap()
            .unwrap();
        assert!(engine.on_execution(&report(&first, ExecutionStatus::Partial), &policy, now));

        let later = MarketView {
            now: now + Duration::seconds(30),
            ..view
        };
        assert!(engine
            .evaluate(&metrics(dec!(4), dec!(10)), &policy, &later, false)
            .unwrap()
            .is_none());

        let forced = engine
            .evaluate(&metrics(dec!(4), dec!(10)), &policy, &later, true)
            .unwrap()
            .unwrap();
        assert_eq!(forced.quantity, dec!(4));
        assert!(forced.urgency >= Urgency::High);
    }

    #[test]
    fn test_timed_out_pending_allows_fresh_instruction() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let now = Utc::now();
        let mut engine = StrategyEngine::default();
        let policy = HedgePolicy {
            cooldown_secs: 60,
            pending_timeout_secs: 60,
            ..policy()
        };
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now,
        };

        let first = engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &view, false)
            .unwrap()
            .unwrap();
        let later = MarketView {
            now: now + Duration::seconds(61),
            ..view
        };
        assert_eq!(engine.advance("btc", &policy, later.now), Some(first.id));

        let second = engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &later, false)
            .unwrap()
            .unwrap();
        assert_ne!(second.id, first.id);
        // stale report for the first instruction changes nothing
        assert!(!engine.on_execution(&report(&first, ExecutionStatus::Filled), &policy, later.now));
    }

    #[test]
    fn test_oversized_hedge_is_policy_violation() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let now = Utc::now();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now,
        };
        let mut engine = StrategyEngine::default();
        let policy = HedgePolicy {
            max_hedge_notional: dec!(100_000),
            ..policy()
        };

        let err = engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy, &view, false)
            .unwrap_err();
        assert!(matches!(
            err,
            HedgeError::PolicyViolation {
                limit: "max_hedge_notional",
                ..
            }
        ));
        // suppressed hedge leaves the group idle
        assert_eq!(engine.state("btc").unwrap().phase, HedgePhase::Idle);
    }

    #[test]
    fn test_paused_group_is_gated() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now: Utc::now(),
        };
        let mut engine = StrategyEngine::default();
        engine.pause("btc");
        assert!(engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy(), &view, true)
            .unwrap()
            .is_none());

        engine.resume("btc");
        assert!(engine
            .evaluate(&metrics(dec!(10), dec!(10)), &policy(), &view, false)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_manual_hedge_rounds_to_lot() {
        let snapshot = perp_snapshot();
        let holdings = Holdings::default();
        let view = MarketView {
            snapshot: &snapshot,
            holdings: &holdings,
            now: Utc::now(),
        };
        let mut engine = StrategyEngine::default();
        let request = ManualHedge {
            instrument: InstrumentId::new("BTC-PERP"),
            side: Side::Sell,
            quantity: dec!(2.5005),
        };

        let instruction = engine
            .manual_instruction(&request, &metrics(dec!(0.01), dec!(10)), &policy(), &view)
            .unwrap();
        assert_eq!(instruction.quantity, dec!(2.5));
        assert_eq!(instruction.strategy, StrategyKind::Manual);
        assert_eq!(instruction.rationale.residual_delta, dec!(-2.49));
    }
}
