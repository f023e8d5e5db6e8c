//! Inbound commands and per-group status.

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::HedgeError;
use crate::risk::RiskMetrics;
use crate::strategy::{HedgeInstruction, HedgePhase, HedgePolicy, ManualHedge};

/// Operator command addressed to one group.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Replace the group's policy from the next cycle on
    SetPolicy(HedgePolicy),
    PauseHedging,
    /// Clear a pause or a suspension
    ResumeHedging,
    /// Evaluate now, ignoring the band and the cooldown
    ForceHedge,
    /// Hedge an explicit size
    HedgeNow(ManualHedge),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetPolicy(_) => "set_policy",
            ControlCommand::PauseHedging => "pause_hedging",
            ControlCommand::ResumeHedging => "resume_hedging",
            ControlCommand::ForceHedge => "force_hedge",
            ControlCommand::HedgeNow(_) => "hedge_now",
        }
    }
}

/// Id of the instruction a command issued, if any.
pub type CommandReply = Result<Option<Uuid>, HedgeError>;

pub(crate) struct Envelope {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Point-in-time view of a group's control loop.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub phase: HedgePhase,
    pub paused: bool,
    pub consecutive_failures: u32,
    /// Instruction currently being executed
    pub in_flight: Option<Uuid>,
    pub last_metrics: Option<RiskMetrics>,
    pub last_instruction: Option<HedgeInstruction>,
    pub last_error: Option<String>,
    pub cycles: u64,
}

impl GroupStatus {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            phase: HedgePhase::Idle,
            paused: false,
            consecutive_failures: 0,
            in_flight: None,
            last_metrics: None,
            last_instruction: None,
            last_error: None,
            cycles: 0,
        }
    }
}
