//! Call signaling events and their payloads

use crate::error::Result;
use crate::media::{IceCandidate, SessionDescription};
use crate::models::UserInfo;
use serde::Deserialize;
use serde_json::Value;

pub const INITIATE: &str = "call:initiate";
pub const INCOMING: &str = "call:incoming";
pub const ACCEPT: &str = "call:accept";
pub const ACCEPTED: &str = "call:accepted";
pub const DECLINE: &str = "call:decline";
pub const DECLINED: &str = "call:declined";
pub const FAILED: &str = "call:failed";
pub const END: &str = "call:end";
pub const ENDED: &str = "call:ended";
pub const ICE_CANDIDATE: &str = "call:ice-candidate";
pub const STATUS_UPDATE: &str = "call:status-update";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub from: String,
    #[serde(default)]
    pub from_user_info: Option<UserInfo>,
    pub offer: SessionDescription,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub answer: SessionDescription,
    #[serde(default)]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCandidate {
    pub candidate: IceCandidate,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(default)]
    pub call_id: Option<String>,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReasonPayload {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
}

/// A call signal received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Incoming(IncomingCall),
    Accepted(CallAccepted),
    Declined {
        reason: String,
        call_id: Option<String>,
    },
    Failed {
        reason: String,
        call_id: Option<String>,
    },
    Ended {
        reason: String,
        call_id: Option<String>,
    },
    IceCandidate(RemoteCandidate),
    StatusUpdate(StatusUpdate),
}

impl InboundSignal {
    pub const EVENTS: [&'static str; 7] = [
        INCOMING,
        ACCEPTED,
        DECLINED,
        FAILED,
        ENDED,
        ICE_CANDIDATE,
        STATUS_UPDATE,
    ];

    /// Parses a frame. `Ok(None)` for events that are not call signals.
    pub fn parse(event: &str, payload: Value) -> Result<Option<Self>> {
        let signal = match event {
            INCOMING => Self::Incoming(serde_json::from_value(payload)?),
            ACCEPTED => Self::Accepted(serde_json::from_value(payload)?),
            DECLINED => {
                let (reason, call_id) = closed_by(payload, "declined");
                Self::Declined { reason, call_id }
            }
            FAILED => {
                let (reason, call_id) = closed_by(payload, "failed");
                Self::Failed { reason, call_id }
            }
            ENDED => {
                let (reason, call_id) = closed_by(payload, "ended");
                Self::Ended { reason, call_id }
            }
            ICE_CANDIDATE => Self::IceCandidate(serde_json::from_value(payload)?),
            STATUS_UPDATE => Self::StatusUpdate(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }
}

/// Reason and optional call id of a close signal. Missing or malformed
/// payloads fall back to `default` with no id.
fn closed_by(payload: Value, default: &str) -> (String, Option<String>) {
    let payload = serde_json::from_value::<ReasonPayload>(payload).unwrap_or_default();
    (
        payload.reason.unwrap_or_else(|| default.to_string()),
        payload.call_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SdpKind;
    use serde_json::json;

    #[test]
    fn test_parse_incoming() {
        let signal = InboundSignal::parse(
            INCOMING,
            json!({
                "from": "U2",
                "fromUserInfo": { "id": "U2", "displayName": "Bea" },
                "offer": { "type": "offer", "sdp": "v=0" },
                "callId": "U2-U1-1700000000000"
            }),
        )
        .unwrap()
        .unwrap();

        match signal {
            InboundSignal::Incoming(call) => {
                assert_eq!(call.from, "U2");
                assert_eq!(call.offer.kind, SdpKind::Offer);
                assert_eq!(call.from_user_info.unwrap().display_name, "Bea");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reason_defaults() {
        let signal = InboundSignal::parse(DECLINED, Value::Null).unwrap().unwrap();
        assert_eq!(
            signal,
            InboundSignal::Declined {
                reason: "declined".to_string(),
                call_id: None,
            }
        );

        let signal = InboundSignal::parse(ENDED, json!({ "reason": "hangup" }))
            .unwrap()
            .unwrap();
        assert_eq!(
            signal,
            InboundSignal::Ended {
                reason: "hangup".to_string(),
                call_id: None,
            }
        );
    }

    #[test]
    fn test_close_signals_keep_call_id() {
        let signal = InboundSignal::parse(
            ENDED,
            json!({ "reason": "hangup", "callId": "call-1" }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            signal,
            InboundSignal::Ended {
                reason: "hangup".to_string(),
                call_id: Some("call-1".to_string()),
            }
        );

        let signal = InboundSignal::parse(FAILED, json!({ "callId": "call-2" }))
            .unwrap()
            .unwrap();
        assert_eq!(
            signal,
            InboundSignal::Failed {
                reason: "failed".to_string(),
                call_id: Some("call-2".to_string()),
            }
        );
    }

    #[test]
    fn test_non_call_event_ignored() {
        assert!(InboundSignal::parse("newMessage", json!({})).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_is_error() {
        assert!(InboundSignal::parse(ACCEPTED, json!({ "nope": 1 })).is_err());
    }
}
