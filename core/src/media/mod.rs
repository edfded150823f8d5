//! Media negotiation engine: local audio, peer connections, ICE handling

pub mod codec;
pub mod device;
pub mod negotiation;
pub mod peer;
pub mod processing;
pub mod resample;
pub mod rtc;

pub use device::{
    AudioConstraints, AudioDevices, AudioFrame, CpalDevices, LocalAudio, MediaTrack, Playback,
    RemoteTrack,
};
pub use negotiation::Negotiator;
pub use peer::{
    IceCandidate, IceServer, IceState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerState, SdpKind, SessionDescription,
};
pub use processing::{ProcessingChain, ProcessingConfig};
pub use resample::StreamResampler;
pub use rtc::{WebRtcFactory, WebRtcPeer};
