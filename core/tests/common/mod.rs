//! Mock collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voxlink_core::media::{
    AudioConstraints, AudioDevices, IceCandidate, IceServer, LocalAudio, MediaTrack,
    PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack, SessionDescription,
};
use voxlink_core::signaling::{Handler, Signaling};
use voxlink_core::{
    ChatApi, ConversationKey, Error, Message, MessagePage, OutgoingContent, PageQuery, Result,
    UserInfo,
};

// ============================================================================
// Signaling
// ============================================================================

#[derive(Default)]
pub struct MockSignaling {
    sent: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, Handler>>,
}

impl MockSignaling {
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn sent_named(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Delivers a server frame to the registered handler.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        let handler = self.handlers.lock().get(event).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.lock().contains_key(event)
    }
}

impl Signaling for MockSignaling {
    fn emit(&self, event: &str, payload: Value) {
        self.sent.lock().push((event.to_string(), payload));
    }

    fn on(&self, event: &str, handler: Handler) {
        self.handlers.lock().insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        self.handlers.lock().remove(event);
    }
}

// ============================================================================
// Audio devices
// ============================================================================

pub struct MockTrack {
    enabled: AtomicBool,
    pub stops: Arc<AtomicUsize>,
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        "mock-mic"
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDevices {
    pub acquired: AtomicUsize,
    /// Stop counter per acquired stream, in acquisition order.
    pub stops: Mutex<Vec<Arc<AtomicUsize>>>,
    pub tracks: Mutex<Vec<Arc<MockTrack>>>,
    pub deny: AtomicBool,
    /// Simulated time the permission prompt stays open.
    pub delay: Mutex<Option<Duration>>,
}

impl MockDevices {
    pub fn stop_counts(&self) -> Vec<usize> {
        self.stops
            .lock()
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .collect()
    }

    pub fn last_track(&self) -> Option<Arc<MockTrack>> {
        self.tracks.lock().last().cloned()
    }
}

#[async_trait]
impl AudioDevices for MockDevices {
    async fn acquire_local_audio(&self, _constraints: &AudioConstraints) -> Result<LocalAudio> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("user refused".to_string()));
        }

        self.acquired.fetch_add(1, Ordering::SeqCst);
        let stops = Arc::new(AtomicUsize::new(0));
        let track = Arc::new(MockTrack {
            enabled: AtomicBool::new(true),
            stops: stops.clone(),
        });
        self.stops.lock().push(stops);
        self.tracks.lock().push(track.clone());
        Ok(LocalAudio::new(track, None))
    }
}

// ============================================================================
// Peer connections
// ============================================================================

pub struct MockRemote {
    volume: Mutex<f32>,
    pub stops: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            volume: Mutex::new(1.0),
            stops: AtomicUsize::new(0),
        })
    }
}

impl RemoteTrack for MockRemote {
    fn id(&self) -> &str {
        "mock-remote"
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }

    fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    /// Operations in the order they were applied.
    pub ops: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

impl MockPeer {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| op.strip_prefix("ice:").map(str::to_string))
            .collect()
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_local_audio(&self, _audio: &LocalAudio) -> Result<()> {
        self.ops.lock().push("add-audio".to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ops.lock().push("create-offer".to_string());
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ops.lock().push("create-answer".to_string());
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ops.lock().push(format!("remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ops.lock().push(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockFactory {
    pub fn peer(&self) -> Arc<MockPeer> {
        self.peers
            .lock()
            .last()
            .cloned()
            .expect("no peer connection created")
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MockPeer {
            ops: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            events,
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Chat API
// ============================================================================

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn direct_message(id: &str, from: &str, to: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        sender_id: from.to_string(),
        receiver_id: Some(to.to_string()),
        group_id: None,
        created_at: at(secs),
        text: Some(format!("text of {}", id)),
        file: None,
        message_type: Default::default(),
        sender: None,
    }
}

/// Serves a fixed, ascending history and pages it like the backend.
pub struct MockApi {
    pub self_id: String,
    pub history: Mutex<HashMap<ConversationKey, Vec<Message>>>,
    pub fetches: Mutex<Vec<PageQuery>>,
    pub sends: AtomicUsize,
    pub mark_reads: Mutex<Vec<ConversationKey>>,
    pub fail_sends: AtomicBool,
    pub fail_fetches: AtomicBool,
    /// Simulated latency of page fetches.
    pub fetch_delay: Mutex<Option<Duration>>,
}

impl MockApi {
    pub fn new(self_id: &str) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.to_string(),
            history: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            mark_reads: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
        })
    }

    pub fn seed(&self, key: &ConversationKey, messages: Vec<Message>) {
        self.history.lock().insert(key.clone(), messages);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn mark_read_count(&self, key: &ConversationKey) -> usize {
        self.mark_reads.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_messages(&self, key: &ConversationKey, query: PageQuery) -> Result<MessagePage> {
        self.fetches.lock().push(query);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }

        let history = self.history.lock().get(key).cloned().unwrap_or_default();
        let (candidates, limit): (Vec<Message>, usize) = match query {
            PageQuery::Latest { limit } => (history, limit),
            PageQuery::Before { before, limit } => (
                history.into_iter().filter(|m| m.created_at < before).collect(),
                limit,
            ),
        };
        let has_more = candidates.len() > limit;
        let start = candidates.len().saturating_sub(limit);
        Ok(MessagePage {
            messages: candidates[start..].to_vec(),
            has_more,
        })
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        content: &OutgoingContent,
    ) -> Result<Message> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        let mut message = direct_message(
            &format!("sent-{}", n),
            &self.self_id,
            &key.remote_id(&self.self_id),
            10_000 + n as i64,
        );
        message.text = content.text.clone();
        Ok(message)
    }

    async fn mark_read(&self, key: &ConversationKey) -> Result<()> {
        self.mark_reads.lock().push(key.clone());
        Ok(())
    }
}

pub fn user(id: &str) -> UserInfo {
    UserInfo::new(id, &format!("User {}", id))
}

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
