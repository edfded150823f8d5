//! Call states, snapshots and observable events

use crate::models::UserInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Initiating,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Initiating => "initiating",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Read-only view of the active call for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub call_id: String,
    pub direction: Direction,
    pub status: CallStatus,
    pub peer: UserInfo,
    pub duration: Duration,
    pub muted: bool,
    pub speaker_on: bool,
    pub minimized: bool,
    pub peer_muted: bool,
    pub has_remote_audio: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming(CallSnapshot),
    StatusChanged(CallSnapshot),
    Tick { call_id: String, elapsed: Duration },
    PeerMuted { call_id: String, muted: bool },
    /// Transient notification of a failed call; the call is torn down.
    Failed { call_id: String, error: String },
    Ended { call_id: String, reason: String },
    Idle,
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00");
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_millis(59_999)), "00:59");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }
}
