//! Append-only audit trail of risk metrics and hedge executions.
//!
//! Records:
//! - Every risk metrics computation per group
//! - Every hedge instruction outcome (filled, partial, failed, cancelled)
//! - Summary queries over hedge history

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::HedgeError;
use crate::execution::ExecutionReport;
use crate::risk::RiskMetrics;
use crate::strategy::HedgeInstruction;

/// Persisted outcome of one hedge instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub instruction_id: Uuid,
    pub group: String,
    pub strategy: String,
    pub instrument: String,
    pub side: String,
    pub requested_qty: Decimal,
    /// Signed fill across venues
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
    pub status: String,
    pub reason: Option<String>,
}

impl ExecutionRecord {
    pub fn from_outcome(
        instruction: &HedgeInstruction,
        outcome: &std::result::Result<ExecutionReport, HedgeError>,
    ) -> Self {
        let base = Self {
            timestamp: Utc::now(),
            instruction_id: instruction.id,
            group: instruction.group.clone(),
            strategy: instruction.strategy.to_string(),
            instrument: instruction.instrument.id.to_string(),
            side: instruction.side.to_string(),
            requested_qty: instruction.quantity,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: "FAILED".to_string(),
            reason: None,
        };

        match outcome {
            Ok(report) => Self {
                timestamp: report.completed_at,
                filled_qty: report.filled_qty,
                avg_price: report.avg_price,
                fees: report.total_fees,
                status: format!("{:?}", report.status).to_uppercase(),
                reason: report.failure_reason.clone(),
                ..base
            },
            Err(e) => Self {
                reason: Some(e.to_string()),
                ..base
            },
        }
    }
}

/// Aggregate over a window of hedge history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HedgeSummary {
    pub executions: u64,
    pub filled: u64,
    pub partial: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_fees: Decimal,
    /// Sum of |filled qty| * avg price
    pub traded_notional: Decimal,
}

impl HedgeSummary {
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let mut summary = Self::default();
        for r in records {
            summary.executions += 1;
            match r.status.as_str() {
                "FILLED" => summary.filled += 1,
                "PARTIAL" => summary.partial += 1,
                "CANCELLED" => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
            summary.total_fees += r.fees;
            summary.traded_notional += r.filled_qty.abs() * r.avg_price;
        }
        summary
    }

    pub fn success_rate(&self) -> Decimal {
        if self.executions == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.filled + self.partial) / Decimal::from(self.executions)
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record_metrics(&self, metrics: &RiskMetrics) -> Result<()>;

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Executions of a group (or all groups) since `since`, oldest first.
    fn hedge_history(&self, group: Option<&str>, since: DateTime<Utc>) -> Result<Vec<ExecutionRecord>>;
}

/// SQLite-backed audit log.
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl SqliteAuditLog {
    /// Open (or create) the audit database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open audit database at {:?}", db_path.as_ref()))?;

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;

        info!("Audit log initialized at {:?}", db_path.as_ref());
        Ok(log)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("audit connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS risk_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                group_id TEXT NOT NULL,
                underlying TEXT NOT NULL,
                snapshot_version INTEGER NOT NULL,
                net_delta TEXT NOT NULL,
                net_gamma TEXT NOT NULL,
                net_theta TEXT NOT NULL,
                net_vega TEXT NOT NULL,
                var TEXT NOT NULL,
                var_degraded INTEGER NOT NULL,
                spot_exposure TEXT NOT NULL,
                underlying_price TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_group_ts ON risk_metrics(group_id, timestamp);

            CREATE TABLE IF NOT EXISTS hedge_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                instruction_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                requested_qty TEXT NOT NULL,
                filled_qty TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                fees TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_group_ts ON hedge_executions(group_id, timestamp);
            "#,
        )?;

        debug!("Audit schema initialized");
        Ok(())
    }

    /// Latest recorded net delta and VaR per row, newest first.
    pub fn recent_metrics(&self, group: &str, limit: usize) -> Result<Vec<(DateTime<Utc>, Decimal, Decimal)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, net_delta, var FROM risk_metrics
            WHERE group_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![group, limit as i64], |row| {
                Ok((timestamp_column(row, 0)?, text_column(row, 1)?, text_column(row, 2)?))
            })?
            .collect::<rusqlite::Result<Vec<(DateTime<Utc>, Decimal, Decimal)>>>()
            .with_context(|| format!("Failed to decode risk metrics of group {}", group))?;

        Ok(rows)
    }

    pub fn hedge_summary(&self, group: Option<&str>, since: DateTime<Utc>) -> Result<HedgeSummary> {
        Ok(HedgeSummary::from_records(&self.hedge_history(group, since)?))
    }
}

impl AuditSink for SqliteAuditLog {
    fn record_metrics(&self, metrics: &RiskMetrics) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO risk_metrics (timestamp, group_id, underlying, snapshot_version, net_delta,
                                      net_gamma, net_theta, net_vega, var, var_degraded,
                                      spot_exposure, underlying_price)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                format_timestamp(metrics.timestamp),
                metrics.group,
                metrics.underlying,
                metrics.snapshot_version as i64,
                metrics.net_delta.to_string(),
                metrics.net_gamma.to_string(),
                metrics.net_theta.to_string(),
                metrics.net_vega.to_string(),
                metrics.var.value.to_string(),
                metrics.var.degraded,
                metrics.spot_exposure.to_string(),
                metrics.underlying_price.to_string(),
            ],
        )?;
        Ok(())
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO hedge_executions (timestamp, instruction_id, group_id, strategy, instrument,
                                          side, requested_qty, filled_qty, avg_price, fees,
                                          status, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                format_timestamp(record.timestamp),
                record.instruction_id.to_string(),
                record.group,
                record.strategy,
                record.instrument,
                record.side,
                record.requested_qty.to_string(),
                record.filled_qty.to_string(),
                record.avg_price.to_string(),
                record.fees.to_string(),
                record.status,
                record.reason,
            ],
        )?;

        debug!(
            instruction_id = %record.instruction_id,
            status = %record.status,
            "Recorded hedge execution"
        );
        Ok(())
    }

    fn hedge_history(&self, group: Option<&str>, since: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, instruction_id, group_id, strategy, instrument, side,
                   requested_qty, filled_qty, avg_price, fees, status, reason
            FROM hedge_executions
            WHERE timestamp >= ?1 AND (?2 IS NULL OR group_id = ?2)
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let records = stmt
            .query_map(params![format_timestamp(since), group], |row| {
                Ok(ExecutionRecord {
                    timestamp: timestamp_column(row, 0)?,
                    instruction_id: text_column(row, 1)?,
                    group: row.get(2)?,
                    strategy: row.get(3)?,
                    instrument: row.get(4)?,
                    side: row.get(5)?,
                    requested_qty: text_column(row, 6)?,
                    filled_qty: text_column(row, 7)?,
                    avg_price: text_column(row, 8)?,
                    fees: text_column(row, 9)?,
                    status: row.get(10)?,
                    reason: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode hedge executions")?;

        Ok(records)
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Decimals and ids are stored as text.
fn text_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get::<_, String>(idx)?.parse().map_err(|e| conversion_error(idx, e))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Run a sink write on the blocking pool so SQLite never stalls the runtime.
pub async fn record_blocking<F>(sink: Arc<dyn AuditSink>, write: F) -> Result<()>
where
    F: FnOnce(&dyn AuditSink) -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || write(sink.as_ref()))
        .await
        .context("Audit write task failed")?
}

/// In-memory audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    metrics: Mutex<Vec<RiskMetrics>>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<RiskMetrics> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record_metrics(&self, metrics: &RiskMetrics) -> Result<()> {
        self.metrics
            .lock()
            .map_err(|_| anyhow!("audit lock poisoned"))?
            .push(metrics.clone());
        Ok(())
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.executions
            .lock()
            .map_err(|_| anyhow!("audit lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    fn hedge_history(&self, group: Option<&str>, since: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .executions()
            .into_iter()
            .filter(|r| r.timestamp >= since && group.map_or(true, |g| r.group == g))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionStatus, OrderIntent, OrderResult};
    use crate::market::{Instrument, Side, VenueId};
    use crate::risk::VarEstimate;
    use crate::strategy::{Rationale, StrategyKind, Urgency};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn instruction(group: &str) -> HedgeInstruction {
        HedgeInstruction::new(
            group,
            Arc::new(Instrument::perpetual("BTC-PERP", "BTC", dec!(1), dec!(0.001))),
            Side::Sell,
            dec!(2),
            Urgency::Normal,
            StrategyKind::DeltaNeutral,
            Rationale {
                net_delta: dec!(2),
                var: dec!(500),
                spot_exposure: dec!(2),
                underlying_price: dec!(60000),
                snapshot_version: 3,
                residual_delta: Decimal::ZERO,
                expected_cost: None,
                reason: "test".into(),
            },
        )
    }

    fn filled_report(instruction: &HedgeInstruction) -> ExecutionReport {
        let intent = OrderIntent::new(
            instruction.id,
            0,
            0,
            VenueId::new("okx"),
            instruction.instrument.id.clone(),
            instruction.side,
            instruction.quantity,
        );
        ExecutionReport::from_results(
            instruction.id,
            instruction.group.clone(),
            instruction.instrument.id.clone(),
            instruction.side,
            instruction.quantity,
            vec![OrderResult::filled(&intent, dec!(60000), dec!(6))],
            false,
            None,
        )
    }

    fn metrics() -> RiskMetrics {
        RiskMetrics {
            group: "btc".into(),
            underlying: "BTC".into(),
            net_delta: dec!(0.02),
            net_gamma: Decimal::ZERO,
            net_theta: Decimal::ZERO,
            net_vega: Decimal::ZERO,
            var: VarEstimate {
                value: dec!(3120.5),
                confidence: dec!(0.99),
                horizon_days: 1,
                observations: 30,
                degraded: false,
                partial_penalty_applied: false,
            },
            spot_exposure: dec!(2),
            underlying_price: dec!(60000),
            implied_vol: None,
            liquidity: None,
            missing_quotes: Vec::new(),
            timestamp: Utc::now(),
            snapshot_version: 3,
        }
    }

    #[test]
    fn test_execution_round_trip() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let hedge = instruction("btc");
        let report = filled_report(&hedge);
        assert_eq!(report.status, ExecutionStatus::Filled);

        log.record_execution(&ExecutionRecord::from_outcome(&hedge, &Ok(report)))
            .unwrap();

        let history = log
            .hedge_history(Some("btc"), Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].instruction_id, hedge.id);
        assert_eq!(history[0].filled_qty, dec!(-2));
        assert_eq!(history[0].status, "FILLED");
        assert_eq!(history[0].strategy, "delta_neutral");
    }

    #[test]
    fn test_summary_counts_failures_per_group() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let ok = instruction("btc");
        let failed = instruction("btc");
        let other = instruction("eth");

        log.record_execution(&ExecutionRecord::from_outcome(&ok, &Ok(filled_report(&ok))))
            .unwrap();
        log.record_execution(&ExecutionRecord::from_outcome(
            &failed,
            &Err(HedgeError::VenueTimeout {
                venue: "okx".into(),
                attempts: 3,
            }),
        ))
        .unwrap();
        log.record_execution(&ExecutionRecord::from_outcome(&other, &Ok(filled_report(&other))))
            .unwrap();

        let since = Utc::now() - Duration::hours(1);
        let summary = log.hedge_summary(Some("btc"), since).unwrap();
        assert_eq!(summary.executions, 2);
        assert_eq!(summary.filled, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_fees, dec!(6));
        assert_eq!(summary.traded_notional, dec!(120000));
        assert_eq!(summary.success_rate(), dec!(0.5));

        assert_eq!(log.hedge_summary(None, since).unwrap().executions, 3);
    }

    #[test]
    fn test_metrics_are_appended() {
        let log = SqliteAuditLog::in_memory().unwrap();
        log.record_metrics(&metrics()).unwrap();
        log.record_metrics(&metrics()).unwrap();

        let rows = log.recent_metrics("btc", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].2, dec!(3120.5));
    }

    #[test]
    fn test_corrupt_row_is_an_error() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let hedge = instruction("btc");
        log.record_execution(&ExecutionRecord::from_outcome(&hedge, &Ok(filled_report(&hedge))))
            .unwrap();
        log.conn()
            .unwrap()
            .execute("UPDATE hedge_executions SET filled_qty = 'n/a'", [])
            .unwrap();

        let err = log
            .hedge_history(Some("btc"), Utc::now() - Duration::hours(1))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to decode hedge executions"));
    }

    #[tokio::test]
    async fn test_blocking_record_reaches_sink() {
        let log = Arc::new(SqliteAuditLog::in_memory().unwrap());
        let sink: Arc<dyn AuditSink> = log.clone();
        let snapshot = metrics();

        record_blocking(sink, move |sink| sink.record_metrics(&snapshot))
            .await
            .unwrap();
        assert_eq!(log.recent_metrics("btc", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_sink_filters_by_group() {
        let log = MemoryAuditLog::new();
        let hedge = instruction("eth");
        log.record_execution(&ExecutionRecord::from_outcome(&hedge, &Ok(filled_report(&hedge))))
            .unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert!(log.hedge_history(Some("btc"), since).unwrap().is_empty());
        assert_eq!(log.hedge_history(None, since).unwrap().len(), 1);
    }
}
