//! webrtc-rs backed peer connections carrying PCMU audio

use crate::error::Result;
use crate::media::codec::{self, Packetizer, PCMU_RATE};
use crate::media::resample::StreamResampler;
use crate::media::device::{AudioFrame, LocalAudio, Playback, RemoteTrack};
use crate::media::peer::{
    IceCandidate, IceServer, IceState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerState, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const PACKET_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcFactory;

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let pumps = Arc::new(Mutex::new(Vec::new()));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => PeerState::Connecting,
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                RTCPeerConnectionState::Failed => PeerState::Failed,
                RTCPeerConnectionState::Closed => PeerState::Closed,
                _ => PeerState::New,
            };
            let _ = tx.send(PeerEvent::ConnectionState(mapped));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let mapped = match state {
                RTCIceConnectionState::Checking => IceState::Checking,
                RTCIceConnectionState::Connected => IceState::Connected,
                RTCIceConnectionState::Completed => IceState::Completed,
                RTCIceConnectionState::Disconnected => IceState::Disconnected,
                RTCIceConnectionState::Failed => IceState::Failed,
                RTCIceConnectionState::Closed => IceState::Closed,
                _ => IceState::New,
            };
            let _ = tx.send(PeerEvent::IceConnectionState(mapped));
            Box::pin(async {})
        }));

        let tx = events;
        let track_pumps = pumps.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = tx.clone();
            let track_pumps = track_pumps.clone();
            Box::pin(async move {
                match Playback::open(&track.id(), PCMU_RATE).await {
                    Ok(playback) => {
                        info!("Remote audio track {} started", track.id());
                        track_pumps
                            .lock()
                            .push(tokio::spawn(receive_audio(track, playback.clone())));
                        let _ = tx.send(PeerEvent::RemoteTrack(playback));
                    }
                    Err(e) => warn!("Cannot play remote audio: {}", e),
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer { pc, pumps }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    pumps: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            audio.track().id().to_owned(),
            "voxlink".to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        if let Some(frames) = audio.take_frames() {
            self.pumps.lock().push(tokio::spawn(send_audio(frames, track)));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}

async fn send_audio(
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    track: Arc<TrackLocalStaticSample>,
) {
    let mut packetizer = Packetizer::new();
    let mut resampler: Option<(u32, StreamResampler)> = None;
    while let Some(frame) = frames.recv().await {
        let rate = frame.sample_rate;
        if !matches!(&resampler, Some((current, _)) if *current == rate) {
            match StreamResampler::for_rates(rate, PCMU_RATE) {
                Ok(r) => resampler = Some((rate, r)),
                Err(e) => {
                    warn!("Cannot resample local audio from {} Hz: {}", rate, e);
                    return;
                }
            }
        }
        let Some((_, stream)) = resampler.as_mut() else {
            return;
        };
        let resampled = match stream.process(&frame.samples) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping local audio frame: {}", e);
                continue;
            }
        };
        for packet in packetizer.push(&resampled) {
            let sample = Sample {
                data: Bytes::from(codec::encode(&packet)),
                duration: PACKET_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Local audio write stopped: {}", e);
                return;
            }
        }
    }
}

async fn receive_audio(track: Arc<TrackRemote>, playback: Arc<Playback>) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(e) = playback.push(&codec::decode(&packet.payload)) {
                    warn!("Dropping remote audio packet: {}", e);
                }
            }
            Err(e) => {
                debug!("Remote audio {} ended: {}", playback.id(), e);
                return;
            }
        }
    }
}
