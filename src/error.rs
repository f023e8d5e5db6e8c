//! Error taxonomy for the hedging control loop.
//!
//! None of these errors terminate the process. Each instrument group's cycle
//! handles its own failures; the coordinator decides whether to degrade,
//! alert or suspend.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::market::InstrumentId;

/// Errors raised by the core pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HedgeError {
    /// Snapshot is missing required fields. Recovered locally by degrading.
    #[error("market data incomplete for {instrument}: missing {missing}")]
    DataIncomplete {
        instrument: InstrumentId,
        missing: String,
    },

    /// Ledger integrity violation. Fatal to the group's current cycle.
    #[error("invalid fill for {instrument}: {reason}")]
    InvalidFill {
        instrument: InstrumentId,
        reason: String,
    },

    /// Every venue refused the order.
    #[error("hedge {instruction_id} rejected: {reason}")]
    HedgeRejected { instruction_id: Uuid, reason: String },

    /// Transient venue timeout that exhausted its retries.
    #[error("venue {venue} timed out after {attempts} attempts")]
    VenueTimeout { venue: String, attempts: u32 },

    /// The computed hedge breaches a configured cap and was suppressed.
    #[error("policy violation for {group}: {limit} limit {cap} exceeded by {value}")]
    PolicyViolation {
        group: String,
        limit: &'static str,
        value: Decimal,
        cap: Decimal,
    },

    /// The instruction is already being executed.
    #[error("instruction {0} is already in flight")]
    DuplicateInstruction(Uuid),

    #[error("unknown instrument group: {0}")]
    UnknownGroup(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Errors reported by an execution venue for a single order attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("venue unavailable: {0}")]
    Unavailable(String),

    /// Permanent refusal (unknown instrument, insufficient margin, ...).
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl VenueError {
    /// Transient errors are retried with backoff; rejections are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, VenueError::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_error_classification() {
        assert!(VenueError::Timeout.is_transient());
        assert!(VenueError::RateLimited.is_transient());
        assert!(VenueError::Unavailable("maintenance".into()).is_transient());
        assert!(!VenueError::Rejected("insufficient margin".into()).is_transient());
    }
}
