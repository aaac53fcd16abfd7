//! Reconnect and update schedule arithmetic
//!
//! Thin wrapper over the `cron` crate. The agent only consumes one contract:
//! how long until the schedule next matches, measured from a given instant.
//! Named aliases and classic five-field specs are normalized before being
//! handed to the parser.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::AgentError;

/// Normalize a schedule spec: map named aliases and prefix five-field specs
/// with a seconds column.
fn normalize(spec: &str) -> String {
    match spec.trim() {
        "midnight" | "daily" => "0 0 0 * * *".to_string(),
        "hourly" => "0 0 * * * *".to_string(),
        "weekly" => "0 0 0 * * SUN".to_string(),
        "monthly" => "0 0 0 1 * *".to_string(),
        "yearly" | "annually" => "0 0 0 1 1 *".to_string(),
        other => {
            if other.split_whitespace().count() == 5 {
                format!("0 {}", other)
            } else {
                other.to_string()
            }
        }
    }
}

/// Duration from `when` until the schedule next matches.
///
/// Returns `Duration::ZERO` when the schedule matches `when` within the same
/// second boundary would have already passed.
pub fn cron_until(spec: &str, when: DateTime<Utc>) -> Result<Duration, AgentError> {
    let normalized = normalize(spec);
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| AgentError::BadArgs(format!("bad schedule \"{}\": {}", spec, e)))?;

    match schedule.after(&when).next() {
        Some(next) => {
            let wait = next - when;
            Ok(wait.to_std().unwrap_or(Duration::ZERO))
        }
        None => Ok(Duration::ZERO),
    }
}
