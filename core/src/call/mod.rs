//! Voice call state machine
//!
//! One call at a time: `idle -> initiating -> ringing -> connecting ->
//! connected -> ended -> idle`. Signaling events, peer connection callbacks
//! and timers interleave freely, so every handler re-reads the slot and
//! checks the call id and status before mutating, and every resumption
//! after an await does the same. Results that arrive for a call that is no
//! longer current are released and dropped.

pub mod signal;
pub mod state;

pub use signal::InboundSignal;
pub use state::{format_duration, CallEvent, CallSnapshot, CallStatus, Direction};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{
    AudioConstraints, AudioDevices, IceCandidate, IceServer, IceState, LocalAudio, Negotiator,
    PeerConnectionFactory, PeerEvent, PeerState, RemoteTrack, SessionDescription,
};
use crate::models::UserInfo;
use crate::signaling::Signaling;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use signal::{CallAccepted, IncomingCall, RemoteCandidate, StatusUpdate};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SPEAKER_VOLUME: f32 = 1.0;
const EARPIECE_VOLUME: f32 = 0.5;

const ACTIVE: &[CallStatus] = &[
    CallStatus::Initiating,
    CallStatus::Ringing,
    CallStatus::Connecting,
    CallStatus::Connected,
];

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub ice_servers: Vec<IceServer>,
    pub ring_timeout: Duration,
    /// Delay after both streams exist before readiness is force-evaluated.
    pub force_connect_delay: Duration,
    /// How long `connecting` may last before readiness is force-evaluated.
    pub connecting_timeout: Duration,
    pub constraints: AudioConstraints,
}

impl CallSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(|url| IceServer::stun(url)).collect(),
            ring_timeout: config.ring_timeout(),
            force_connect_delay: config.force_connect_delay(),
            connecting_timeout: config.connecting_timeout(),
            constraints: AudioConstraints::default(),
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

struct Inner {
    self_user: UserInfo,
    settings: CallSettings,
    signaling: Arc<dyn Signaling>,
    devices: Arc<dyn AudioDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    slot: Mutex<Option<ActiveCall>>,
    events: broadcast::Sender<CallEvent>,
}

#[derive(Default)]
struct Timers {
    ring: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    readiness: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    peer_events: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.ring.take(),
            self.watchdog.take(),
            self.readiness.take(),
            self.ticker.take(),
            self.peer_events.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct ActiveCall {
    id: String,
    direction: Direction,
    peer: UserInfo,
    status: CallStatus,
    /// Whether the other side knows about this call yet.
    signaled: bool,
    started_at: Option<Instant>,
    remote_offer: Option<SessionDescription>,
    /// Remote candidates received before the connection existed.
    early_candidates: VecDeque<IceCandidate>,
    /// Local candidates gathered before the offer went out.
    unsent_candidates: Vec<IceCandidate>,
    local: Option<Arc<LocalAudio>>,
    remote: Option<Arc<dyn RemoteTrack>>,
    negotiator: Option<Arc<Negotiator>>,
    muted: bool,
    speaker_on: bool,
    minimized: bool,
    peer_muted: bool,
    timers: Timers,
}

impl ActiveCall {
    fn new(id: String, direction: Direction, peer: UserInfo, status: CallStatus) -> Self {
        Self {
            id,
            direction,
            peer,
            status,
            signaled: direction == Direction::Incoming,
            started_at: None,
            remote_offer: None,
            early_candidates: VecDeque::new(),
            unsent_candidates: Vec::new(),
            local: None,
            remote: None,
            negotiator: None,
            muted: false,
            speaker_on: true,
            minimized: false,
            peer_muted: false,
            timers: Timers::default(),
        }
    }

    fn is(&self, call_id: &str, expected: &[CallStatus]) -> bool {
        self.id == call_id && expected.contains(&self.status)
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id.clone(),
            direction: self.direction,
            status: self.status,
            peer: self.peer.clone(),
            duration: self.started_at.map(|s| s.elapsed()).unwrap_or_default(),
            muted: self.muted,
            speaker_on: self.speaker_on,
            minimized: self.minimized,
            peer_muted: self.peer_muted,
            has_remote_audio: self.remote.is_some(),
        }
    }
}

/// How a call is torn down and what the peer is told.
struct Outcome {
    reason: String,
    notify: Option<&'static str>,
    error: Option<String>,
}

impl Outcome {
    fn new(reason: &str, notify: Option<&'static str>) -> Self {
        Self {
            reason: reason.to_string(),
            notify,
            error: None,
        }
    }

    fn failed(e: &Error) -> Self {
        Self {
            reason: e.reason().to_string(),
            notify: Some(signal::END),
            error: Some(e.to_string()),
        }
    }
}

impl CallManager {
    pub fn new(
        self_user: UserInfo,
        settings: CallSettings,
        signaling: Arc<dyn Signaling>,
        devices: Arc<dyn AudioDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                self_user,
                settings,
                signaling,
                devices,
                factory,
                slot: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> CallStatus {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(|call| call.status)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.inner.slot.lock().as_ref().map(ActiveCall::snapshot)
    }

    /// Time since the call connected; zero before that.
    pub fn duration(&self) -> Duration {
        self.inner
            .slot
            .lock()
            .as_ref()
            .and_then(|call| call.started_at)
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration())
    }

    /// Routes the call signals of the transport into this manager. Signals
    /// are handled one at a time in arrival order.
    pub fn attach(&self) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundSignal>();
        for event in InboundSignal::EVENTS {
            let tx = tx.clone();
            self.inner.signaling.on(
                event,
                Arc::new(move |payload| match InboundSignal::parse(event, payload) {
                    Ok(Some(signal)) => {
                        let _ = tx.send(signal);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Malformed {} signal: {}", event, e),
                }),
            );
        }

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                manager.handle_signal(signal).await;
            }
        })
    }

    pub fn detach(&self) {
        for event in InboundSignal::EVENTS {
            self.inner.signaling.off(event);
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Calls `user`. Returns the new call id.
    pub async fn initiate(&self, user: UserInfo) -> Result<String> {
        let call_id = format!(
            "{}-{}-{}",
            self.inner.self_user.id,
            user.id,
            chrono::Utc::now().timestamp_millis()
        );

        let snapshot = {
            let mut slot = self.inner.slot.lock();
            if slot.is_some() {
                return Err(Error::Busy);
            }
            let call = ActiveCall::new(
                call_id.clone(),
                Direction::Outgoing,
                user,
                CallStatus::Initiating,
            );
            let snapshot = call.snapshot();
            *slot = Some(call);
            snapshot
        };
        info!("Calling {} ({})", snapshot.peer.id, call_id);
        self.publish(CallEvent::StatusChanged(snapshot));

        match self.start_outgoing(&call_id).await {
            Ok(()) => Ok(call_id),
            Err(e) => {
                self.fail(&call_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn accept(&self) -> Result<()> {
        let (call_id, offer, snapshot) = {
            let mut slot = self.inner.slot.lock();
            let call = slot.as_mut().ok_or(Error::NoActiveCall)?;
            if call.status != CallStatus::Ringing || call.direction != Direction::Incoming {
                return Err(Error::InvalidCallState(call.status.to_string()));
            }
            call.status = CallStatus::Connecting;
            if let Some(ring) = call.timers.ring.take() {
                ring.abort();
            }
            (call.id.clone(), call.remote_offer.take(), call.snapshot())
        };
        info!("Accepting call {}", call_id);
        self.publish(CallEvent::StatusChanged(snapshot));
        self.arm_watchdog(&call_id);

        let result = match offer {
            Some(offer) => self.answer(&call_id, offer).await,
            None => Err(Error::NegotiationFailed("no offer to answer".to_string())),
        };
        if let Err(e) = result {
            self.fail(&call_id, &e).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn decline(&self) -> Result<()> {
        let call_id = {
            let slot = self.inner.slot.lock();
            let call = slot.as_ref().ok_or(Error::NoActiveCall)?;
            if call.status != CallStatus::Ringing || call.direction != Direction::Incoming {
                return Err(Error::InvalidCallState(call.status.to_string()));
            }
            call.id.clone()
        };
        self.finish(
            Some(&call_id),
            &[CallStatus::Ringing],
            Outcome::new("declined", Some(signal::DECLINE)),
        )
        .await;
        Ok(())
    }

    /// Hangs up whatever call is active. Safe in every state.
    pub async fn end(&self) -> Result<()> {
        self.finish(None, ACTIVE, Outcome::new("ended", Some(signal::END)))
            .await;
        Ok(())
    }

    /// Flips the local microphone and tells the peer. Returns the new
    /// muted state.
    pub fn toggle_mute(&self) -> Result<bool> {
        let (call_id, to, muted, snapshot) = {
            let mut slot = self.inner.slot.lock();
            let call = connected_call(&mut slot)?;
            call.muted = !call.muted;
            if let Some(local) = &call.local {
                local.set_enabled(!call.muted);
            }
            (
                call.id.clone(),
                call.peer.id.clone(),
                call.muted,
                call.snapshot(),
            )
        };

        self.inner.signaling.emit(
            signal::STATUS_UPDATE,
            json!({
                "to": to,
                "callId": call_id,
                "status": { "type": "mute", "isMuted": muted },
            }),
        );
        self.publish(CallEvent::StatusChanged(snapshot));
        Ok(muted)
    }

    /// Switches local playback between speaker and earpiece volume. Not
    /// signaled to the peer.
    pub fn toggle_speaker(&self) -> Result<bool> {
        let (speaker_on, snapshot) = {
            let mut slot = self.inner.slot.lock();
            let call = connected_call(&mut slot)?;
            call.speaker_on = !call.speaker_on;
            if let Some(remote) = &call.remote {
                remote.set_volume(playback_volume(call.speaker_on));
            }
            (call.speaker_on, call.snapshot())
        };
        self.publish(CallEvent::StatusChanged(snapshot));
        Ok(speaker_on)
    }

    pub fn minimize(&self) -> Result<()> {
        self.set_minimized(true)
    }

    pub fn maximize(&self) -> Result<()> {
        self.set_minimized(false)
    }

    fn set_minimized(&self, minimized: bool) -> Result<()> {
        let snapshot = {
            let mut slot = self.inner.slot.lock();
            let call = connected_call(&mut slot)?;
            call.minimized = minimized;
            call.snapshot()
        };
        self.publish(CallEvent::StatusChanged(snapshot));
        Ok(())
    }

    // ========================================================================
    // Inbound signals
    // ========================================================================

    pub async fn handle_signal(&self, signal: InboundSignal) {
        match signal {
            InboundSignal::Incoming(incoming) => self.on_incoming(incoming),
            InboundSignal::Accepted(accepted) => self.on_accepted(accepted).await,
            InboundSignal::Declined { reason, call_id }
            | InboundSignal::Failed { reason, call_id }
            | InboundSignal::Ended { reason, call_id } => {
                // A close carrying an id only applies to that call.
                let outcome = Outcome::new(&reason, None);
                if self.finish(call_id.as_deref(), ACTIVE, outcome).await {
                    info!("Call closed by peer: {}", reason);
                } else if let Some(id) = call_id {
                    debug!("Ignoring stale close for {}", id);
                }
            }
            InboundSignal::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            InboundSignal::StatusUpdate(update) => self.on_status_update(update),
        }
    }

    fn on_incoming(&self, incoming: IncomingCall) {
        let snapshot = {
            let mut slot = self.inner.slot.lock();
            match slot.as_ref() {
                Some(call) if call.id == incoming.call_id => {
                    debug!("Duplicate incoming signal for {}", incoming.call_id);
                    return;
                }
                Some(_) => None,
                None => {
                    let peer = incoming
                        .from_user_info
                        .clone()
                        .unwrap_or_else(|| UserInfo::new(&incoming.from, &incoming.from));
                    let mut call = ActiveCall::new(
                        incoming.call_id.clone(),
                        Direction::Incoming,
                        peer,
                        CallStatus::Ringing,
                    );
                    call.remote_offer = Some(incoming.offer.clone());
                    call.timers.ring = Some(self.spawn_ring_timer(&incoming.call_id));
                    let snapshot = call.snapshot();
                    *slot = Some(call);
                    Some(snapshot)
                }
            }
        };

        match snapshot {
            Some(snapshot) => {
                info!("Incoming call {} from {}", snapshot.call_id, incoming.from);
                self.publish(CallEvent::Incoming(snapshot));
            }
            None => {
                info!("Busy, declining call {} from {}", incoming.call_id, incoming.from);
                self.inner.signaling.emit(
                    signal::DECLINE,
                    json!({
                        "to": incoming.from,
                        "callId": incoming.call_id,
                        "reason": "busy",
                    }),
                );
            }
        }
    }

    async fn on_accepted(&self, accepted: CallAccepted) {
        let (call_id, negotiator, snapshot) = {
            let mut slot = self.inner.slot.lock();
            let Some(call) = slot.as_mut() else {
                debug!("Ignoring call:accepted with no active call");
                return;
            };
            let id_matches = accepted
                .call_id
                .as_deref()
                .map(|id| id == call.id)
                .unwrap_or(true);
            if !id_matches
                || call.direction != Direction::Outgoing
                || call.status != CallStatus::Ringing
            {
                debug!("Ignoring call:accepted while {}", call.status);
                return;
            }
            call.status = CallStatus::Connecting;
            if let Some(ring) = call.timers.ring.take() {
                ring.abort();
            }
            (call.id.clone(), call.negotiator.clone(), call.snapshot())
        };
        info!("Call {} accepted", call_id);
        self.publish(CallEvent::StatusChanged(snapshot));
        self.arm_watchdog(&call_id);

        let result = match negotiator {
            Some(negotiator) => negotiator.apply_answer(accepted.answer).await,
            None => Err(Error::NegotiationFailed("no connection for answer".to_string())),
        };
        if let Err(e) = result {
            self.fail(&call_id, &e).await;
        }
    }

    async fn on_remote_candidate(&self, remote: RemoteCandidate) {
        let negotiator = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call)
                    if remote
                        .call_id
                        .as_deref()
                        .map(|id| id == call.id)
                        .unwrap_or(true) =>
                {
                    match &call.negotiator {
                        Some(negotiator) => Some(negotiator.clone()),
                        None => {
                            call.early_candidates.push_back(remote.candidate.clone());
                            None
                        }
                    }
                }
                _ => {
                    debug!("Dropping ICE candidate for inactive call");
                    None
                }
            }
        };

        if let Some(negotiator) = negotiator {
            if let Err(e) = negotiator.submit_remote_candidate(remote.candidate).await {
                warn!("Failed to apply ICE candidate: {}", e);
            }
        }
    }

    fn on_status_update(&self, update: StatusUpdate) {
        if update.status.kind != "mute" {
            debug!("Ignoring status update {}", update.status.kind);
            return;
        }
        let call_id = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call)
                    if update
                        .call_id
                        .as_deref()
                        .map(|id| id == call.id)
                        .unwrap_or(true) =>
                {
                    call.peer_muted = update.status.is_muted;
                    call.id.clone()
                }
                _ => return,
            }
        };
        self.publish(CallEvent::PeerMuted {
            call_id,
            muted: update.status.is_muted,
        });
    }

    // ========================================================================
    // Negotiation steps
    // ========================================================================

    async fn start_outgoing(&self, call_id: &str) -> Result<()> {
        let Some(local) = self.acquire_audio(call_id, &[CallStatus::Initiating]).await? else {
            return Ok(());
        };
        let Some(negotiator) = self
            .open_connection(call_id, &[CallStatus::Initiating])
            .await?
        else {
            return Ok(());
        };
        let offer = negotiator.create_offer(&local).await?;

        let (to, unsent, snapshot) = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, &[CallStatus::Initiating]) => {
                    call.status = CallStatus::Ringing;
                    call.signaled = true;
                    call.timers.ring = Some(self.spawn_ring_timer(call_id));
                    (
                        call.peer.id.clone(),
                        std::mem::take(&mut call.unsent_candidates),
                        call.snapshot(),
                    )
                }
                _ => {
                    debug!("Offer for {} is stale", call_id);
                    return Ok(());
                }
            }
        };

        self.inner.signaling.emit(
            signal::INITIATE,
            json!({
                "to": to,
                "offer": offer,
                "callType": "audio",
                "callId": call_id,
                "fromUserInfo": self.inner.self_user,
            }),
        );
        for candidate in unsent {
            self.send_candidate(&to, call_id, &candidate);
        }
        self.publish(CallEvent::StatusChanged(snapshot));
        Ok(())
    }

    async fn answer(&self, call_id: &str, offer: SessionDescription) -> Result<()> {
        let Some(local) = self.acquire_audio(call_id, &[CallStatus::Connecting]).await? else {
            return Ok(());
        };
        let Some(negotiator) = self
            .open_connection(call_id, &[CallStatus::Connecting])
            .await?
        else {
            return Ok(());
        };
        let answer = negotiator.create_answer(&local, offer).await?;

        let to = {
            let slot = self.inner.slot.lock();
            match slot.as_ref() {
                Some(call) if call.is(call_id, &[CallStatus::Connecting, CallStatus::Connected]) => {
                    call.peer.id.clone()
                }
                _ => {
                    debug!("Answer for {} is stale", call_id);
                    return Ok(());
                }
            }
        };

        self.inner.signaling.emit(
            signal::ACCEPT,
            json!({
                "to": to,
                "answer": answer,
                "callId": call_id,
            }),
        );
        Ok(())
    }

    /// Acquires the microphone and stores it on the call if the call is
    /// still current. `None` when the call moved on meanwhile.
    async fn acquire_audio(
        &self,
        call_id: &str,
        expected: &[CallStatus],
    ) -> Result<Option<Arc<LocalAudio>>> {
        let local = Arc::new(
            self.inner
                .devices
                .acquire_local_audio(&self.inner.settings.constraints)
                .await?,
        );

        let installed = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, expected) => {
                    call.local = Some(local.clone());
                    true
                }
                _ => false,
            }
        };

        if installed {
            Ok(Some(local))
        } else {
            debug!("Microphone granted after {} ended, releasing", call_id);
            local.stop();
            Ok(None)
        }
    }

    async fn open_connection(
        &self,
        call_id: &str,
        expected: &[CallStatus],
    ) -> Result<Option<Arc<Negotiator>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self
            .inner
            .factory
            .create(&self.inner.settings.ice_servers, tx)
            .await
            .map_err(|e| match e {
                Error::UnsupportedPlatform(_) | Error::NegotiationFailed(_) => e,
                other => Error::NegotiationFailed(other.to_string()),
            })?;

        let negotiator = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, expected) => {
                    let negotiator = Arc::new(Negotiator::new(
                        peer.clone(),
                        std::mem::take(&mut call.early_candidates),
                    ));
                    call.negotiator = Some(negotiator.clone());
                    call.timers.peer_events = Some(self.spawn_peer_pump(call_id, rx));
                    Some(negotiator)
                }
                _ => None,
            }
        };

        if negotiator.is_none() {
            debug!("Connection for {} is stale, closing", call_id);
            if let Err(e) = peer.close().await {
                warn!("Failed to close stale connection: {}", e);
            }
        }
        Ok(negotiator)
    }

    // ========================================================================
    // Peer connection callbacks
    // ========================================================================

    fn spawn_peer_pump(
        &self,
        call_id: &str,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.on_peer_event(&call_id, event).await;
            }
        })
    }

    async fn on_peer_event(&self, call_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(call_id, candidate),
            PeerEvent::ConnectionState(PeerState::Connected)
            | PeerEvent::IceConnectionState(IceState::Connected)
            | PeerEvent::IceConnectionState(IceState::Completed) => {
                self.promote(call_id, "media connected");
            }
            PeerEvent::ConnectionState(PeerState::Failed)
            | PeerEvent::IceConnectionState(IceState::Failed) => {
                let e = Error::ConnectionFailed("ICE negotiation failed".to_string());
                self.fail(call_id, &e).await;
            }
            PeerEvent::ConnectionState(PeerState::Disconnected)
            | PeerEvent::IceConnectionState(IceState::Disconnected) => {
                warn!("Media path for {} interrupted, waiting for recovery", call_id);
            }
            PeerEvent::ConnectionState(PeerState::Connecting)
            | PeerEvent::IceConnectionState(IceState::Checking) => {
                self.arm_watchdog(call_id);
            }
            PeerEvent::RemoteTrack(track) => self.on_remote_track(call_id, track),
            other => debug!("Peer event for {}: {:?}", call_id, other),
        }
    }

    fn on_local_candidate(&self, call_id: &str, candidate: IceCandidate) {
        let to = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, ACTIVE) => {
                    if !call.signaled {
                        call.unsent_candidates.push(candidate);
                        return;
                    }
                    call.peer.id.clone()
                }
                _ => return,
            }
        };
        self.send_candidate(&to, call_id, &candidate);
    }

    fn send_candidate(&self, to: &str, call_id: &str, candidate: &IceCandidate) {
        self.inner.signaling.emit(
            signal::ICE_CANDIDATE,
            json!({
                "to": to,
                "candidate": candidate,
                "callId": call_id,
            }),
        );
    }

    fn on_remote_track(&self, call_id: &str, track: Arc<dyn RemoteTrack>) {
        let snapshot = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, ACTIVE) => {
                    track.set_volume(playback_volume(call.speaker_on));
                    if let Some(previous) = call.remote.replace(track) {
                        previous.stop();
                    }
                    if call.status == CallStatus::Connecting {
                        let handle = self.spawn_readiness(
                            call_id,
                            self.inner.settings.force_connect_delay,
                        );
                        if let Some(old) = call.timers.readiness.replace(handle) {
                            old.abort();
                        }
                    }
                    call.snapshot()
                }
                _ => {
                    track.stop();
                    return;
                }
            }
        };
        info!("Remote audio for {} available", call_id);
        self.publish(CallEvent::StatusChanged(snapshot));
    }

    // ========================================================================
    // Readiness reconciliation
    //
    // Connection-state callbacks are not delivered reliably. Two timers back
    // them up: one fires `force_connect_delay` after the remote stream shows
    // up, the other `connecting_timeout` after connecting began. Either
    // promotes the call when local stream, remote stream and connection are
    // all present. This redundancy is deliberate; the callbacks alone leave
    // calls stuck in connecting.
    // ========================================================================

    fn arm_watchdog(&self, call_id: &str) {
        let mut slot = self.inner.slot.lock();
        if let Some(call) = slot.as_mut() {
            if call.is(call_id, &[CallStatus::Connecting]) && call.timers.watchdog.is_none() {
                call.timers.watchdog =
                    Some(self.spawn_readiness(call_id, self.inner.settings.connecting_timeout));
            }
        }
    }

    fn spawn_readiness(&self, call_id: &str, delay: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconcile_readiness(&call_id);
        })
    }

    fn reconcile_readiness(&self, call_id: &str) {
        let ready = {
            let slot = self.inner.slot.lock();
            match slot.as_ref() {
                Some(call) if call.is(call_id, &[CallStatus::Connecting]) => {
                    call.local.is_some() && call.remote.is_some() && call.negotiator.is_some()
                }
                _ => return,
            }
        };

        if ready {
            self.promote(call_id, "readiness reconciliation");
        } else {
            debug!("Call {} still negotiating", call_id);
        }
    }

    fn promote(&self, call_id: &str, cause: &str) {
        let snapshot = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(call) if call.is(call_id, &[CallStatus::Connecting]) => {
                    call.status = CallStatus::Connected;
                    call.started_at = Some(Instant::now());
                    for timer in [call.timers.watchdog.take(), call.timers.readiness.take()]
                        .into_iter()
                        .flatten()
                    {
                        timer.abort();
                    }
                    call.timers.ticker = Some(self.spawn_ticker(call_id));
                    call.snapshot()
                }
                _ => return,
            }
        };
        info!("Call {} connected ({})", call_id, cause);
        self.publish(CallEvent::StatusChanged(snapshot));
    }

    fn spawn_ticker(&self, call_id: &str) -> JoinHandle<()> {
        let manager = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let elapsed = {
                    let slot = manager.inner.slot.lock();
                    match slot.as_ref() {
                        Some(call) if call.is(&call_id, &[CallStatus::Connected]) => {
                            call.started_at.map(|s| s.elapsed()).unwrap_or_default()
                        }
                        _ => break,
                    }
                };
                manager.publish(CallEvent::Tick {
                    call_id: call_id.clone(),
                    elapsed,
                });
            }
        })
    }

    fn spawn_ring_timer(&self, call_id: &str) -> JoinHandle<()> {
        let manager = self.clone();
        let call_id = call_id.to_string();
        let timeout = self.inner.settings.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.ring_timeout(&call_id).await;
        })
    }

    async fn ring_timeout(&self, call_id: &str) {
        let direction = {
            let slot = self.inner.slot.lock();
            match slot.as_ref() {
                Some(call) if call.is(call_id, &[CallStatus::Ringing]) => call.direction,
                _ => return,
            }
        };
        info!("Call {} unanswered", call_id);
        let outcome = match direction {
            Direction::Incoming => Outcome::new("timeout", Some(signal::DECLINE)),
            Direction::Outgoing => Outcome::new("no-answer", Some(signal::END)),
        };
        self.finish(Some(call_id), &[CallStatus::Ringing], outcome)
            .await;
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    async fn fail(&self, call_id: &str, e: &Error) {
        self.finish(Some(call_id), ACTIVE, Outcome::failed(e)).await;
    }

    /// Takes the call out of the slot if it is `call_id` (any call when
    /// `None`) in one of `expected`, tells the peer per `outcome`, and
    /// releases everything it owns. Returns whether a call was ended.
    async fn finish(
        &self,
        call_id: Option<&str>,
        expected: &[CallStatus],
        outcome: Outcome,
    ) -> bool {
        let call = {
            let mut slot = self.inner.slot.lock();
            let matches = slot
                .as_ref()
                .map(|call| {
                    call_id.map(|id| id == call.id).unwrap_or(true)
                        && expected.contains(&call.status)
                })
                .unwrap_or(false);
            if matches {
                slot.take()
            } else {
                None
            }
        };
        let Some(mut call) = call else {
            return false;
        };

        if let Some(event) = outcome.notify {
            if call.signaled {
                self.inner.signaling.emit(
                    event,
                    json!({
                        "to": call.peer.id,
                        "callId": call.id,
                        "reason": outcome.reason,
                    }),
                );
            }
        }

        if let Some(error) = outcome.error {
            error!("Call {} failed: {}", call.id, error);
            self.publish(CallEvent::Failed {
                call_id: call.id.clone(),
                error,
            });
        }

        call.status = CallStatus::Ended;
        info!("Call {} ended: {}", call.id, outcome.reason);
        self.publish(CallEvent::Ended {
            call_id: call.id.clone(),
            reason: outcome.reason,
        });

        if let Some(local) = call.local.take() {
            local.stop();
        }
        if let Some(remote) = call.remote.take() {
            remote.stop();
        }
        if let Some(negotiator) = call.negotiator.take() {
            if let Err(e) = negotiator.peer().close().await {
                warn!("Failed to close connection for {}: {}", call.id, e);
            }
        }

        self.publish(CallEvent::Idle);
        // Last: this may be running on one of these tasks.
        call.timers.abort_all();
        true
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn connected_call(slot: &mut Option<ActiveCall>) -> Result<&mut ActiveCall> {
    let call = slot.as_mut().ok_or(Error::NoActiveCall)?;
    if call.status != CallStatus::Connected {
        return Err(Error::InvalidCallState(call.status.to_string()));
    }
    Ok(call)
}

fn playback_volume(speaker_on: bool) -> f32 {
    if speaker_on {
        SPEAKER_VOLUME
    } else {
        EARPIECE_VOLUME
    }
}
