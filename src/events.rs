//! Hedge events published to subscribers.
//!
//! Publishing never blocks the control loop: slow subscribers lag and lose
//! the oldest events rather than applying back-pressure.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::execution::ExecutionReport;
use crate::market::VenueId;
use crate::risk::{RiskAlert, RiskMetrics};
use crate::strategy::HedgeInstruction;

/// Observable outcome of the control loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HedgeEvent {
    RiskMetricsUpdated(RiskMetrics),
    HedgeInstructionIssued(HedgeInstruction),
    HedgeExecuted(ExecutionReport),
    HedgeFailed {
        group: String,
        instruction_id: Uuid,
        reason: String,
    },
    VenueDegraded {
        venue: VenueId,
        consecutive_failures: u32,
        reason: String,
    },
    RiskAlert(RiskAlert),
    HedgingSuspended {
        group: String,
        consecutive_failures: u32,
    },
    PolicySuppressed {
        group: String,
        reason: String,
    },
}

impl HedgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HedgeEvent::RiskMetricsUpdated(_) => "risk_metrics_updated",
            HedgeEvent::HedgeInstructionIssued(_) => "hedge_instruction_issued",
            HedgeEvent::HedgeExecuted(_) => "hedge_executed",
            HedgeEvent::HedgeFailed { .. } => "hedge_failed",
            HedgeEvent::VenueDegraded { .. } => "venue_degraded",
            HedgeEvent::RiskAlert(_) => "risk_alert",
            HedgeEvent::HedgingSuspended { .. } => "hedging_suspended",
            HedgeEvent::PolicySuppressed { .. } => "policy_suppressed",
        }
    }
}

/// Fan-out channel for [`HedgeEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HedgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; dropped silently when none listen.
    pub fn publish(&self, event: HedgeEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HedgeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(HedgeEvent::PolicySuppressed {
            group: "btc".into(),
            reason: "cap".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(HedgeEvent::HedgingSuspended {
            group: "btc".into(),
            consecutive_failures: 3,
        });
        bus.publish(HedgeEvent::PolicySuppressed {
            group: "btc".into(),
            reason: "cap".into(),
        });

        assert_eq!(rx.recv().await.unwrap().name(), "hedging_suspended");
        assert_eq!(rx.recv().await.unwrap().name(), "policy_suppressed");
    }
}
