//! Per-group hedging state machine.
//!
//! ```text
//! Idle --issue--> PendingHedge --fill--> Cooling --cooldown--> Idle
//!                      |  \--fail/cancel/timeout--> Idle
//! any --N failures--> Suspended --resume--> Idle
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::policy::HedgePolicy;
use crate::execution::ExecutionStatus;
use crate::market::InstrumentId;

/// Lifecycle phase of a group's hedging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase")]
pub enum HedgePhase {
    Idle,
    PendingHedge {
        instruction_id: Uuid,
        issued_at: DateTime<Utc>,
    },
    Cooling {
        until: DateTime<Utc>,
    },
    Suspended {
        reason: String,
    },
}

/// Option protection currently held for the group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionLeg {
    pub instrument: InstrumentId,
    pub expiry: DateTime<Utc>,
    /// Spot exposure the leg was sized against
    pub covered_exposure: Decimal,
}

/// Strategy state of one instrument group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyState {
    pub group: String,
    pub phase: HedgePhase,
    pub paused: bool,
    pub last_issued_at: Option<DateTime<Utc>>,
    pub last_instruction_id: Option<Uuid>,
    pub protection: Option<ProtectionLeg>,
    /// Leg of the pending instruction, promoted on fill
    pub staged_protection: Option<ProtectionLeg>,
    pub consecutive_failures: u32,
}

impl StrategyState {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            phase: HedgePhase::Idle,
            paused: false,
            last_issued_at: None,
            last_instruction_id: None,
            protection: None,
            staged_protection: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.phase, HedgePhase::Suspended { .. })
    }

    pub fn pending_instruction(&self) -> Option<Uuid> {
        match self.phase {
            HedgePhase::PendingHedge { instruction_id, .. } => Some(instruction_id),
            _ => None,
        }
    }

    /// Apply time-driven transitions. Returns the id of a pending
    /// instruction that timed out.
    pub fn advance(&mut self, now: DateTime<Utc>, policy: &HedgePolicy) -> Option<Uuid> {
        match self.phase {
            HedgePhase::PendingHedge {
                instruction_id,
                issued_at,
            } if now - issued_at >= policy.pending_timeout() => {
                self.phase = HedgePhase::Idle;
                self.staged_protection = None;
                Some(instruction_id)
            }
            HedgePhase::Cooling { until } if now >= until => {
                self.phase = HedgePhase::Idle;
                None
            }
            _ => None,
        }
    }

    /// Whether a new instruction may be issued now.
    ///
    /// `force` skips the cooldown but never a pending instruction, a pause
    /// or a suspension.
    pub fn can_issue(&self, now: DateTime<Utc>, policy: &HedgePolicy, force: bool) -> bool {
        if self.paused {
            return false;
        }
        match self.phase {
            HedgePhase::PendingHedge { .. } | HedgePhase::Suspended { .. } => false,
            HedgePhase::Cooling { .. } if !force => false,
            _ => {
                force
                    || self
                        .last_issued_at
                        .map_or(true, |last| now - last >= policy.cooldown())
            }
        }
    }

    pub fn on_issued(&mut self, instruction_id: Uuid, now: DateTime<Utc>) {
        self.phase = HedgePhase::PendingHedge {
            instruction_id,
            issued_at: now,
        };
        self.last_issued_at = Some(now);
        self.last_instruction_id = Some(instruction_id);
    }

    /// Resolve the pending instruction. Stale ids (already timed out) are ignored.
    pub fn on_resolved(
        &mut self,
        instruction_id: Uuid,
        status: ExecutionStatus,
        now: DateTime<Utc>,
        policy: &HedgePolicy,
    ) -> bool {
        if self.pending_instruction() != Some(instruction_id) {
            return false;
        }
        match status {
            ExecutionStatus::Filled | ExecutionStatus::Partial => {
                self.consecutive_failures = 0;
                if let Some(leg) = self.staged_protection.take() {
                    self.protection = Some(leg);
                }
                self.phase = HedgePhase::Cooling {
                    until: now + policy.cooldown(),
                };
            }
            ExecutionStatus::Failed => {
                self.consecutive_failures += 1;
                self.staged_protection = None;
                self.phase = HedgePhase::Idle;
            }
            ExecutionStatus::Cancelled => {
                self.staged_protection = None;
                self.phase = HedgePhase::Idle;
            }
        }
        true
    }

    pub fn suspend(&mut self, reason: impl Into<String>) {
        self.phase = HedgePhase::Suspended {
            reason: reason.into(),
        };
    }

    /// Clear suspension and pause; failure streak restarts.
    pub fn resume(&mut self) {
        if self.is_suspended() {
            self.phase = HedgePhase::Idle;
        }
        self.paused = false;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::VenueId;
    use chrono::Duration;

    fn policy() -> HedgePolicy {
        HedgePolicy {
            cooldown_secs: 60,
            pending_timeout_secs: 30,
            venue_priority: vec![VenueId::new("okx")],
            ..HedgePolicy::new("BTC-PERP")
        }
    }

    #[test]
    fn test_fill_moves_to_cooling_then_idle() {
        let policy = policy();
        let now = Utc::now();
        let mut state = StrategyState::new("btc");
        let id = Uuid::new_v4();

        assert!(state.can_issue(now, &policy, false));
        state.on_issued(id, now);
        assert!(!state.can_issue(now, &policy, true));

        assert!(state.on_resolved(id, ExecutionStatus::Filled, now, &policy));
        assert!(matches!(state.phase, HedgePhase::Cooling { .. }));
        assert!(!state.can_issue(now + Duration::seconds(10), &policy, false));

        state.advance(now + Duration::seconds(61), &policy);
        assert_eq!(state.phase, HedgePhase::Idle);
        assert!(state.can_issue(now + Duration::seconds(61), &policy, false));
    }

    #[test]
    fn test_pending_times_out_to_idle() {
        let policy = policy();
        let now = Utc::now();
        let mut state = StrategyState::new("btc");
        let id = Uuid::new_v4();
        state.on_issued(id, now);

        assert_eq!(state.advance(now + Duration::seconds(10), &policy), None);
        assert_eq!(state.advance(now + Duration::seconds(31), &policy), Some(id));
        assert_eq!(state.phase, HedgePhase::Idle);

        // late report for the timed-out instruction is ignored
        assert!(!state.on_resolved(id, ExecutionStatus::Filled, now, &policy));
    }

    #[test]
    fn test_force_skips_cooldown_but_not_suspension() {
        let policy = policy();
        let now = Utc::now();
        let mut state = StrategyState::new("btc");
        let id = Uuid::new_v4();
        state.on_issued(id, now);
        state.on_resolved(id, ExecutionStatus::Failed, now, &policy);

        assert!(!state.can_issue(now + Duration::seconds(5), &policy, false));
        assert!(state.can_issue(now + Duration::seconds(5), &policy, true));

        state.suspend("too many failures");
        assert!(!state.can_issue(now + Duration::hours(1), &policy, true));
        state.resume();
        assert!(state.can_issue(now + Duration::hours(1), &policy, false));
    }

    #[test]
    fn test_failures_accumulate_until_fill() {
        let policy = policy();
        let now = Utc::now();
        let mut state = StrategyState::new("btc");
        for _ in 0..2 {
            let id = Uuid::new_v4();
            state.on_issued(id, now);
            state.on_resolved(id, ExecutionStatus::Failed, now, &policy);
        }
        assert_eq!(state.consecutive_failures, 2);

        let id = Uuid::new_v4();
        state.on_issued(id, now);
        state.on_resolved(id, ExecutionStatus::Partial, now, &policy);
        assert_eq!(state.consecutive_failures, 0);
    }
}
