//! Peer connection abstraction and its signaling payloads

use crate::error::Result;
use crate::media::device::{LocalAudio, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: &str) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.to_string(),
        }
    }

    pub fn answer(sdp: &str) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: &str) -> Self {
        Self {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from a peer connection, delivered in order on one channel.
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(PeerState),
    IceConnectionState(IceState),
    RemoteTrack(Arc<dyn RemoteTrack>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            PeerEvent::ConnectionState(s) => write!(f, "ConnectionState({:?})", s),
            PeerEvent::IceConnectionState(s) => write!(f, "IceConnectionState({:?})", s),
            PeerEvent::RemoteTrack(t) => write!(f, "RemoteTrack({})", t.id()),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attaches the local audio track for sending.
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<()>;

    /// Creates an audio-only offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Allocates one connection. Its callbacks go to `events`.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let json = serde_json::to_value(IceCandidate::new("candidate:1 1 udp 2122 1.2.3.4 5000 typ host")).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["sdpMid"], "0");

        let parsed: IceCandidate =
            serde_json::from_str(r#"{ "candidate": "candidate:2", "sdpMLineIndex": 1 }"#).unwrap();
        assert_eq!(parsed.sdp_mline_index, Some(1));
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn test_description_wire_shape() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }
}
