//! Control loop coordinator.
//!
//! Runs one task per instrument group. Groups proceed in parallel; within a
//! group cycles are strictly sequential and at most one hedge is in flight.
//! A cycle is triggered by the monitoring interval, by a new market
//! snapshot, or by an operator command.

mod command;
mod group;

pub use command::{CommandReply, ControlCommand, GroupStatus};
pub use group::GroupSpec;

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::error::HedgeError;
use crate::events::{EventBus, HedgeEvent};
use crate::execution::OrderRouter;
use crate::ledger::PositionLedger;
use crate::market::MarketDataAggregator;
use crate::risk::{AlertMonitor, RiskEngine, RiskEngineConfig, RiskThresholds};
use crate::strategy::StrategyEngine;
use command::Envelope;
use group::GroupWorker;

/// Loop timing and failure handling.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    /// Pause after a failed cycle
    pub error_backoff: Duration,
    /// Failed hedges in a row before a group is suspended
    pub max_consecutive_failures: u32,
    pub command_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for LoopSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            error_backoff: config.error_backoff(),
            max_consecutive_failures: config.max_consecutive_failures,
            command_capacity: config.command_capacity,
        }
    }
}

/// Components shared by every group task.
pub struct HedgeContext {
    pub aggregator: Arc<MarketDataAggregator>,
    pub ledger: Arc<PositionLedger>,
    pub router: Arc<OrderRouter>,
    pub audit: Arc<dyn AuditSink>,
    pub events: EventBus,
    pub risk: RiskEngine,
    pub strategies: Mutex<StrategyEngine>,
    pub alerts: Mutex<AlertMonitor>,
    pub settings: LoopSettings,
}

impl HedgeContext {
    pub fn new(
        aggregator: Arc<MarketDataAggregator>,
        ledger: Arc<PositionLedger>,
        router: Arc<OrderRouter>,
        audit: Arc<dyn AuditSink>,
        events: EventBus,
    ) -> Self {
        let engine = EngineConfig::default();
        Self {
            aggregator,
            ledger,
            router,
            audit,
            events,
            risk: RiskEngine::new(RiskEngineConfig {
                partial_var_penalty: engine.partial_var_penalty,
            }),
            strategies: Mutex::new(StrategyEngine::default()),
            alerts: Mutex::new(AlertMonitor::new(RiskThresholds::default(), engine.alert_cooldown())),
            settings: LoopSettings::from(&engine),
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_risk_engine(mut self, risk: RiskEngine) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_strategy_engine(mut self, strategies: StrategyEngine) -> Self {
        self.strategies = Mutex::new(strategies);
        self
    }

    pub fn with_alert_monitor(mut self, alerts: AlertMonitor) -> Self {
        self.alerts = Mutex::new(alerts);
        self
    }
}

struct GroupHandle {
    commands: mpsc::Sender<Envelope>,
    status: Arc<RwLock<GroupStatus>>,
    task: JoinHandle<()>,
}

/// Owns the group tasks and routes commands to them.
pub struct ControlLoop {
    ctx: Arc<HedgeContext>,
    groups: HashMap<String, GroupHandle>,
    shutdown: watch::Sender<bool>,
}

impl ControlLoop {
    pub fn new(ctx: HedgeContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ctx),
            groups: HashMap::new(),
            shutdown,
        }
    }

    pub fn context(&self) -> &Arc<HedgeContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HedgeEvent> {
        self.ctx.events.subscribe()
    }

    pub fn groups(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start the control loop of one group.
    pub fn spawn_group(&mut self, spec: GroupSpec) -> Result<(), HedgeError> {
        spec.policy.validate()?;
        if self.groups.contains_key(&spec.id) {
            return Err(HedgeError::InvalidCommand(format!("group {} is already running", spec.id)));
        }

        let (tx, rx) = mpsc::channel(self.ctx.settings.command_capacity.max(1));
        let status = Arc::new(RwLock::new(GroupStatus::new(spec.id.clone())));
        let id = spec.id.clone();
        let worker = GroupWorker::new(spec, self.ctx.clone(), rx, self.shutdown.subscribe(), status.clone());
        let task = tokio::spawn(worker.run());

        info!(group = %id, "Group spawned");
        self.groups.insert(
            id,
            GroupHandle {
                commands: tx,
                status,
                task,
            },
        );
        Ok(())
    }

    /// Validate a command and apply it before the group's next cycle.
    pub async fn send(&self, group: &str, command: ControlCommand) -> CommandReply {
        let handle = self
            .groups
            .get(group)
            .ok_or_else(|| HedgeError::UnknownGroup(group.to_string()))?;
        self.validate(&command).await?;

        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(Envelope { command, reply })
            .await
            .map_err(|_| HedgeError::InvalidCommand(format!("group {} is not running", group)))?;
        response
            .await
            .map_err(|_| HedgeError::InvalidCommand(format!("group {} stopped before replying", group)))?
    }

    async fn validate(&self, command: &ControlCommand) -> Result<(), HedgeError> {
        match command {
            ControlCommand::SetPolicy(policy) => {
                policy.validate()?;
                let connected = self.ctx.router.venue_ids();
                if let Some(venue) = policy.venue_priority.iter().find(|v| !connected.contains(v)) {
                    return Err(HedgeError::InvalidPolicy(format!("venue {} is not connected", venue)));
                }
                if self.ctx.aggregator.instrument(&policy.hedge_instrument).await.is_none() {
                    return Err(HedgeError::InvalidPolicy(format!(
                        "hedge instrument {} is not registered",
                        policy.hedge_instrument
                    )));
                }
                Ok(())
            }
            ControlCommand::HedgeNow(request) => {
                if request.quantity <= Decimal::ZERO {
                    return Err(HedgeError::InvalidCommand("hedge quantity must be positive".to_string()));
                }
                if self.ctx.aggregator.instrument(&request.instrument).await.is_none() {
                    return Err(HedgeError::InvalidCommand(format!(
                        "unknown instrument {}",
                        request.instrument
                    )));
                }
                Ok(())
            }
            ControlCommand::PauseHedging | ControlCommand::ResumeHedging | ControlCommand::ForceHedge => Ok(()),
        }
    }

    /// Phase, metrics and last instruction of a group.
    pub async fn status(&self, group: &str) -> Result<GroupStatus, HedgeError> {
        let handle = self
            .groups
            .get(group)
            .ok_or_else(|| HedgeError::UnknownGroup(group.to_string()))?;
        Ok(handle.status.read().await.clone())
    }

    /// Stop every group; in-flight hedges are cancelled and settled first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for (group, handle) in self.groups {
            if let Err(e) = handle.task.await {
                warn!(group = %group, error = %e, "Group task ended abnormally");
            }
        }
        info!("Control loop stopped");
    }
}
