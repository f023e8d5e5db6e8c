//! Shared utilities.

pub mod bounded;
pub mod decimal;
