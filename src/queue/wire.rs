use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::EventError;
use crate::types::{AccountId, JobId};

#[derive(Debug, Clone, Deserialize)]
pub struct OneshotEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub proj_id: AccountId,
    pub job_id: JobId,
    pub count: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LongrunStatus {
    Started,
    Running,
    Finished,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LongrunEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub proj_id: AccountId,
    pub job_id: JobId,
    pub status: LongrunStatus,
    #[serde(default)]
    pub instances: Option<i64>,
    #[serde(default)]
    pub instance_type: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub proj_id: AccountId,
    pub size: i64,
    pub timestamp: i64,
}

/// Rejects a wire timestamp too far in the past or future (§4.7), guarding
/// against stale redelivery or clock-skewed producers.
pub fn validate_timestamp(
    timestamp: i64,
    now: DateTime<Utc>,
    max_past_days: i64,
    max_future_seconds: i64,
) -> Result<DateTime<Utc>, EventError> {
    let at = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| EventError::Permanent(format!("timestamp {timestamp} is out of range")))?;
    let earliest = now - chrono::Duration::days(max_past_days);
    let latest = now + chrono::Duration::seconds(max_future_seconds);
    if at < earliest || at > latest {
        return Err(EventError::Permanent(format!(
            "timestamp {at} outside the allowed window [{earliest}, {latest}]"
        )));
    }
    Ok(at)
}
