//! Control loop of a single instrument group.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{CommandReply, ControlCommand, Envelope, GroupStatus};
use super::HedgeContext;
use crate::audit::{self, ExecutionRecord};
use crate::config::GroupConfig;
use crate::error::HedgeError;
use crate::events::HedgeEvent;
use crate::execution::{CancelToken, ExecutionReport, ExecutionStatus};
use crate::ledger::Holdings;
use crate::market::{InstrumentId, MarketSnapshot};
use crate::risk::{AlertSeverity, ReturnHistory, RiskAlert, RiskAlertType, RiskMetrics, RiskScope};
use crate::strategy::{HedgeInstruction, HedgePolicy, ManualHedge, MarketView};

/// What a group hedges and how.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: String,
    pub underlying: String,
    /// Instrument whose mid prices the underlying
    pub reference: InstrumentId,
    pub policy: HedgePolicy,
    pub history: ReturnHistory,
}

impl GroupSpec {
    pub fn new(id: impl Into<String>, underlying: impl Into<String>, reference: impl Into<InstrumentId>, policy: HedgePolicy) -> Self {
        Self {
            id: id.into(),
            underlying: underlying.into(),
            reference: reference.into(),
            policy,
            history: ReturnHistory::new(),
        }
    }

    pub fn with_history(mut self, history: ReturnHistory) -> Self {
        self.history = history;
        self
    }
}

impl From<&GroupConfig> for GroupSpec {
    fn from(config: &GroupConfig) -> Self {
        Self::new(
            config.id.clone(),
            config.underlying.clone(),
            config.spot_instrument.clone(),
            config.policy.clone(),
        )
    }
}

struct InFlight {
    instruction: HedgeInstruction,
    cancel: CancelToken,
    handle: JoinHandle<Result<ExecutionReport, HedgeError>>,
    /// Net delta when the instruction was issued
    entry_delta: Decimal,
    /// Cancel once net delta is back inside the band
    band_sensitive: bool,
}

struct Observation {
    snapshot: Arc<MarketSnapshot>,
    holdings: Holdings,
    metrics: RiskMetrics,
    now: DateTime<Utc>,
}

pub(crate) struct GroupWorker {
    spec: GroupSpec,
    ctx: Arc<HedgeContext>,
    commands: mpsc::Receiver<Envelope>,
    snapshots: watch::Receiver<Arc<MarketSnapshot>>,
    shutdown: watch::Receiver<bool>,
    status: Arc<RwLock<GroupStatus>>,
    inflight: Option<InFlight>,
    backoff_until: Option<Instant>,
}

async fn join_inflight(
    inflight: &mut Option<InFlight>,
) -> Result<Result<ExecutionReport, HedgeError>, JoinError> {
    match inflight {
        Some(f) => (&mut f.handle).await,
        None => std::future::pending().await,
    }
}

/// Whether net delta moved through zero since the instruction was issued.
fn crossed_zero(entry: Decimal, current: Decimal) -> bool {
    entry.is_sign_negative() != current.is_sign_negative() && current != Decimal::ZERO && entry != Decimal::ZERO
}

impl GroupWorker {
    pub(crate) fn new(
        spec: GroupSpec,
        ctx: Arc<HedgeContext>,
        commands: mpsc::Receiver<Envelope>,
        shutdown: watch::Receiver<bool>,
        status: Arc<RwLock<GroupStatus>>,
    ) -> Self {
        let snapshots = ctx.aggregator.subscribe();
        Self {
            spec,
            ctx,
            commands,
            snapshots,
            shutdown,
            status,
            inflight: None,
            backoff_until: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ctx.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        info!(
            group = %self.spec.id,
            strategy = %self.spec.policy.strategy,
            hedge_instrument = %self.spec.policy.hedge_instrument,
            delta_band = %self.spec.policy.delta_band,
            "Group control loop started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(envelope) = self.commands.recv() => {
                    let name = envelope.command.name();
                    let reply = self.handle_command(envelope.command).await;
                    if let Err(e) = &reply {
                        warn!(group = %self.spec.id, command = name, error = %e, "Command rejected");
                    }
                    if envelope.reply.send(reply).is_err() {
                        debug!(group = %self.spec.id, command = name, "Command caller went away");
                    }
                }
                joined = join_inflight(&mut self.inflight) => {
                    if let Some(inflight) = self.inflight.take() {
                        self.finish(inflight, joined).await;
                    }
                }
                changed = self.snapshots.changed(), if feed_open => {
                    if changed.is_err() {
                        warn!(group = %self.spec.id, "Market data feed closed, falling back to interval");
                        feed_open = false;
                        continue;
                    }
                    self.trigger().await;
                }
                _ = ticker.tick() => self.trigger().await,
            }
        }

        if let Some(mut inflight) = self.inflight.take() {
            inflight.cancel.cancel();
            let joined = (&mut inflight.handle).await;
            self.finish(inflight, joined).await;
        }
        info!(group = %self.spec.id, "Group control loop stopped");
    }

    async fn trigger(&mut self) {
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return;
            }
            self.backoff_until = None;
        }
        if let Err(e) = self.cycle(false).await {
            self.on_cycle_error(&e).await;
        }
        self.refresh_status().await;
    }

    /// One monitoring cycle; returns the id of an issued instruction.
    async fn cycle(&mut self, force: bool) -> Result<Option<Uuid>, HedgeError> {
        let Some(obs) = self.observe().await else {
            return Ok(None);
        };
        self.publish_metrics(&obs).await;

        let timed_out = self
            .ctx
            .strategies
            .lock()
            .await
            .advance(&self.spec.id, &self.spec.policy, obs.now);
        if let (Some(id), Some(inflight)) = (timed_out, &self.inflight) {
            if inflight.instruction.id == id {
                inflight.cancel.cancel();
            }
        }

        if self.inflight.is_some() {
            self.watch_inflight(&obs.metrics);
            return Ok(None);
        }

        let view = MarketView {
            snapshot: &obs.snapshot,
            holdings: &obs.holdings,
            now: obs.now,
        };
        let instruction = self
            .ctx
            .strategies
            .lock()
            .await
            .evaluate(&obs.metrics, &self.spec.policy, &view, force)?;

        Ok(instruction.map(|instruction| {
            let id = instruction.id;
            self.dispatch(instruction, obs.metrics.net_delta, !force);
            id
        }))
    }

    async fn observe(&mut self) -> Option<Observation> {
        let snapshot = self.snapshots.borrow_and_update().clone();
        if snapshot.version == 0 {
            debug!(group = %self.spec.id, "Waiting for first market snapshot");
            return None;
        }

        let holdings = self.ctx.ledger.holdings().await;
        let scope = RiskScope {
            group: &self.spec.id,
            underlying: &self.spec.underlying,
            reference: &self.spec.reference,
            var: &self.spec.policy.var,
        };
        let metrics = self
            .ctx
            .risk
            .compute_metrics(&scope, &snapshot, &holdings, &self.spec.history);

        Some(Observation {
            snapshot,
            holdings,
            metrics,
            now: Utc::now(),
        })
    }

    async fn publish_metrics(&mut self, obs: &Observation) {
        let metrics = &obs.metrics;
        if metrics.underlying_price > Decimal::ZERO {
            self.spec
                .history
                .record_close(obs.now.date_naive(), metrics.underlying_price);
        }

        let record = metrics.clone();
        let written = audit::record_blocking(self.ctx.audit.clone(), move |sink| sink.record_metrics(&record)).await;
        if let Err(e) = written {
            warn!(group = %self.spec.id, error = %e, "Failed to audit risk metrics");
        }
        self.ctx
            .events
            .publish(HedgeEvent::RiskMetricsUpdated(metrics.clone()));

        let alert = self.ctx.alerts.lock().await.check(metrics, obs.now);
        if let Some(alert) = alert {
            self.raise(alert);
        }

        let mut status = self.status.write().await;
        status.last_metrics = Some(metrics.clone());
        status.cycles += 1;
    }

    fn dispatch(&mut self, instruction: HedgeInstruction, entry_delta: Decimal, band_sensitive: bool) {
        self.ctx
            .events
            .publish(HedgeEvent::HedgeInstructionIssued(instruction.clone()));

        let router = self.ctx.router.clone();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let routed = instruction.clone();
        let priority = self.spec.policy.venue_priority.clone();
        let max_retries = self.spec.policy.max_retries;

        let handle = tokio::spawn(async move { router.route(&routed, &priority, max_retries, &token).await });

        self.inflight = Some(InFlight {
            instruction,
            cancel,
            handle,
            entry_delta,
            band_sensitive,
        });
    }

    /// Signal cancellation when the risk that motivated the hedge is gone.
    fn watch_inflight(&self, metrics: &RiskMetrics) {
        let Some(inflight) = &self.inflight else {
            return;
        };
        if inflight.cancel.is_cancelled() {
            return;
        }

        let reason = if crossed_zero(inflight.entry_delta, metrics.net_delta) {
            Some("net delta changed sign")
        } else if inflight.band_sensitive && metrics.net_delta.abs() <= self.spec.policy.delta_band {
            Some("net delta back inside band")
        } else {
            None
        };

        if let Some(reason) = reason {
            info!(
                group = %self.spec.id,
                instruction_id = %inflight.instruction.id,
                entry_delta = %inflight.entry_delta,
                net_delta = %metrics.net_delta,
                reason,
                "Cancelling in-flight hedge"
            );
            inflight.cancel.cancel();
        }
    }

    /// Settle a completed execution: ledger, strategy state, audit, events.
    async fn finish(
        &mut self,
        inflight: InFlight,
        joined: Result<Result<ExecutionReport, HedgeError>, JoinError>,
    ) {
        let instruction = inflight.instruction;
        let outcome = joined.unwrap_or_else(|e| {
            Err(HedgeError::HedgeRejected {
                instruction_id: instruction.id,
                reason: format!("execution task failed: {}", e),
            })
        });

        let record = ExecutionRecord::from_outcome(&instruction, &outcome);
        let written = audit::record_blocking(self.ctx.audit.clone(), move |sink| sink.record_execution(&record)).await;
        if let Err(e) = written {
            warn!(group = %self.spec.id, error = %e, "Failed to audit hedge execution");
        }

        let mut fill_error = None;
        let resolved = match &outcome {
            Ok(report) => match self.apply_fills(report).await {
                Ok(()) => report.clone(),
                Err(e) => {
                    fill_error = Some(e);
                    let mut failed = report.clone();
                    failed.status = ExecutionStatus::Failed;
                    failed
                }
            },
            Err(e) => ExecutionReport::from_results(
                instruction.id,
                instruction.group.clone(),
                instruction.instrument.id.clone(),
                instruction.side,
                instruction.quantity,
                Vec::new(),
                false,
                Some(e.to_string()),
            ),
        };

        let failures = {
            let mut strategies = self.ctx.strategies.lock().await;
            strategies.on_execution(&resolved, &self.spec.policy, Utc::now());
            strategies
                .state(&self.spec.id)
                .map(|s| s.consecutive_failures)
                .unwrap_or(0)
        };
        self.refresh_status().await;

        match outcome {
            Ok(report) => {
                info!(
                    group = %self.spec.id,
                    instruction_id = %report.instruction_id,
                    status = ?report.status,
                    filled = %report.filled_qty,
                    avg_price = %report.avg_price,
                    fees = %report.total_fees,
                    "Hedge execution settled"
                );
                self.ctx.events.publish(HedgeEvent::HedgeExecuted(report));
            }
            Err(e) => {
                error!(group = %self.spec.id, instruction_id = %instruction.id, error = %e, "Hedge failed on every venue");
                self.ctx.events.publish(HedgeEvent::HedgeFailed {
                    group: self.spec.id.clone(),
                    instruction_id: instruction.id,
                    reason: e.to_string(),
                });
                self.raise(
                    RiskAlert::new(
                        RiskAlertType::HedgeFailed {
                            instruction_id: instruction.id.to_string(),
                        },
                        AlertSeverity::Error,
                        Some(self.spec.id.clone()),
                        format!("Hedge of {} {} failed: {}", instruction.quantity, instruction.instrument.id, e),
                        "Check venue connectivity; hedging retries next cycle".to_string(),
                    )
                    .with_metric("quantity", instruction.quantity)
                    .with_metric("consecutive_failures", Decimal::from(failures)),
                );
                self.start_backoff();
            }
        }

        if let Some(e) = fill_error {
            self.on_cycle_error(&e).await;
        }

        if resolved.status == ExecutionStatus::Failed && failures >= self.ctx.settings.max_consecutive_failures {
            self.suspend(failures).await;
        }
    }

    async fn apply_fills(&self, report: &ExecutionReport) -> Result<(), HedgeError> {
        for fill in report.fills() {
            let position = self.ctx.ledger.apply_fill(fill).await?;
            debug!(
                group = %self.spec.id,
                instrument = %position.instrument_id(),
                venue = %position.venue,
                quantity = %position.quantity,
                "Ledger updated from fill"
            );
        }
        Ok(())
    }

    async fn suspend(&mut self, failures: u32) {
        self.ctx
            .strategies
            .lock()
            .await
            .suspend(&self.spec.id, format!("{} consecutive hedge failures", failures));
        self.refresh_status().await;

        error!(group = %self.spec.id, failures, "Hedging suspended until resumed");
        self.raise(
            RiskAlert::new(
                RiskAlertType::HedgingSuspended {
                    consecutive_failures: failures,
                },
                AlertSeverity::Critical,
                Some(self.spec.id.clone()),
                format!("Hedging of {} suspended after {} failed hedges", self.spec.underlying, failures),
                "Investigate venues, then send ResumeHedging".to_string(),
            )
            .with_metric("consecutive_failures", Decimal::from(failures)),
        );
        self.ctx.events.publish(HedgeEvent::HedgingSuspended {
            group: self.spec.id.clone(),
            consecutive_failures: failures,
        });
    }

    async fn on_cycle_error(&mut self, error: &HedgeError) {
        match error {
            HedgeError::PolicyViolation { limit, value, cap, .. } => {
                warn!(group = %self.spec.id, error = %error, "Hedge suppressed by policy");
                self.ctx.events.publish(HedgeEvent::PolicySuppressed {
                    group: self.spec.id.clone(),
                    reason: error.to_string(),
                });
                self.raise(
                    RiskAlert::new(
                        RiskAlertType::PolicyViolation {
                            limit: limit.to_string(),
                        },
                        AlertSeverity::Warning,
                        Some(self.spec.id.clone()),
                        format!("Hedge suppressed: {}", error),
                        "Raise the cap or hedge manually".to_string(),
                    )
                    .with_metric("value", *value)
                    .with_metric("cap", *cap),
                );
            }
            HedgeError::InvalidFill { instrument, reason } => {
                error!(group = %self.spec.id, %instrument, reason = %reason, "Ledger rejected a fill, cycle aborted");
                self.raise(RiskAlert::new(
                    RiskAlertType::InvalidFill {
                        instrument: instrument.to_string(),
                    },
                    AlertSeverity::Critical,
                    Some(self.spec.id.clone()),
                    format!("Invalid fill for {}: {}", instrument, reason),
                    "Reconcile positions with the venue".to_string(),
                ));
                self.start_backoff();
            }
            _ => {
                warn!(group = %self.spec.id, error = %error, "Hedge cycle failed");
                self.start_backoff();
            }
        }
        self.status.write().await.last_error = Some(error.to_string());
    }

    async fn handle_command(&mut self, command: ControlCommand) -> CommandReply {
        let reply = match command {
            ControlCommand::SetPolicy(policy) => {
                policy.validate()?;
                info!(group = %self.spec.id, strategy = %policy.strategy, delta_band = %policy.delta_band, "Policy updated");
                self.spec.policy = policy;
                Ok(None)
            }
            ControlCommand::PauseHedging => {
                self.ctx.strategies.lock().await.pause(&self.spec.id);
                info!(group = %self.spec.id, "Hedging paused");
                Ok(None)
            }
            ControlCommand::ResumeHedging => {
                self.ctx.strategies.lock().await.resume(&self.spec.id);
                self.backoff_until = None;
                info!(group = %self.spec.id, "Hedging resumed");
                Ok(None)
            }
            ControlCommand::ForceHedge => {
                let result = self.cycle(true).await;
                if let Err(e) = &result {
                    self.on_cycle_error(e).await;
                }
                result
            }
            ControlCommand::HedgeNow(request) => {
                let result = self.hedge_now(&request).await;
                if let Err(e) = &result {
                    self.on_cycle_error(e).await;
                }
                result.map(Some)
            }
        };
        self.refresh_status().await;
        reply
    }

    async fn hedge_now(&mut self, request: &ManualHedge) -> Result<Uuid, HedgeError> {
        if self.inflight.is_some() {
            return Err(HedgeError::InvalidCommand(format!(
                "group {} already has a hedge in flight",
                self.spec.id
            )));
        }
        let obs = self.observe().await.ok_or_else(|| HedgeError::DataIncomplete {
            instrument: self.spec.reference.clone(),
            missing: "snapshot".to_string(),
        })?;

        let view = MarketView {
            snapshot: &obs.snapshot,
            holdings: &obs.holdings,
            now: obs.now,
        };
        let instruction =
            self.ctx
                .strategies
                .lock()
                .await
                .manual_instruction(request, &obs.metrics, &self.spec.policy, &view)?;
        let id = instruction.id;
        self.dispatch(instruction, obs.metrics.net_delta, false);
        Ok(id)
    }

    fn raise(&self, alert: RiskAlert) {
        alert.emit();
        self.ctx.events.publish(HedgeEvent::RiskAlert(alert));
    }

    fn start_backoff(&mut self) {
        self.backoff_until = Some(Instant::now() + self.ctx.settings.error_backoff);
    }

    async fn refresh_status(&self) {
        let state = self.ctx.strategies.lock().await.state(&self.spec.id).cloned();
        let mut status = self.status.write().await;
        if let Some(state) = state {
            status.phase = state.phase;
            status.paused = state.paused;
            status.consecutive_failures = state.consecutive_failures;
        }
        status.in_flight = self.inflight.as_ref().map(|f| f.instruction.id);
        if let Some(inflight) = &self.inflight {
            if status.last_instruction.as_ref().map(|i| i.id) != Some(inflight.instruction.id) {
                status.last_instruction = Some(inflight.instruction.clone());
            }
        }
    }
}
