pub mod approval;
pub mod audit;
pub mod cost;
pub mod provider;
pub mod workflow;

pub use approval::*;
pub use audit::*;
pub use cost::*;
pub use provider::*;
pub use workflow::*;

use chrono::{DateTime, SubsecRound, Utc};

/// Current time truncated to millisecond precision.
///
/// Persisted timestamps are stored as epoch milliseconds, so every timestamp
/// the engine creates is truncated up front to round-trip unchanged.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Rebuild a timestamp from epoch milliseconds (falls back to now).
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(timestamp_now)
}
