use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{Result, TradeTraceError};

/// Current time at the microsecond precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| TradeTraceError::Parse(format!("invalid duration {input}: {e}")))
}
