use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::identity::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    #[serde(alias = "audio")]
    Audio,
    #[serde(alias = "video")]
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Video => "VIDEO",
        }
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("audio") {
            Ok(Self::Audio)
        } else if value.eq_ignore_ascii_case("video") {
            Ok(Self::Video)
        } else {
            Err(format!("unknown call type: {value}"))
        }
    }
}

/// Call lifecycle status
///
/// ```text
/// INITIATED ──┬──> ANSWERED ──> ENDED
///             ├──> REJECTED
///             └──> MISSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Initiated,
    Answered,
    Rejected,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Answered => "ANSWERED",
            Self::Rejected => "REJECTED",
            Self::Missed => "MISSED",
            Self::Ended => "ENDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Missed | Self::Ended)
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Answered)
                | (Self::Initiated, Self::Rejected)
                | (Self::Initiated, Self::Missed)
                | (Self::Answered, Self::Ended)
        )
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "INITIATED" => Ok(Self::Initiated),
            "ANSWERED" => Ok(Self::Answered),
            "REJECTED" => Ok(Self::Rejected),
            "MISSED" => Ok(Self::Missed),
            "ENDED" => Ok(Self::Ended),
            _ => Err(format!("unknown call status: {value}")),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted call log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: i64,
    pub room_id: String,
    pub caller_email: String,
    pub caller_role: Role,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

/// Whole seconds between start and end, floored, never negative.
pub fn call_duration_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    let elapsed_ms = (ended_at - started_at).num_milliseconds();
    (elapsed_ms / 1000).max(0)
}
