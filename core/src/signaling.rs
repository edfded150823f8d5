//! Signaling transport - persistent WebSocket event channel
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Emission is fire-and-forget: frames emitted while disconnected are
//! dropped, never queued. Listeners are owned by a [`SubscriptionManager`]
//! whose dispatch table is torn down on disconnect and rebuilt in one step
//! on every (re)connect, so each event reaches exactly one handler.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::UserInfo;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// The event channel as seen by the components that signal over it.
pub trait Signaling: Send + Sync {
    /// Fire-and-forget; no acknowledgement, no retry.
    fn emit(&self, event: &str, payload: Value);

    /// Registers `handler` for `event`, replacing any previous handler.
    fn on(&self, event: &str, handler: Handler);

    fn off(&self, event: &str);
}

// ============================================================================
// Wire frame
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Desired listener set plus the dispatch table built from it.
///
/// `on`/`off` edit the desired set; the dispatch table only exists while
/// the transport is connected.
#[derive(Default)]
pub struct SubscriptionManager {
    desired: Mutex<HashMap<String, Handler>>,
    active: RwLock<HashMap<String, Handler>>,
    live: AtomicBool,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: Handler) {
        let mut desired = self.desired.lock();
        desired.insert(event.to_string(), handler.clone());
        if self.live.load(Ordering::SeqCst) {
            self.active.write().insert(event.to_string(), handler);
        }
    }

    pub fn off(&self, event: &str) {
        self.desired.lock().remove(event);
        self.active.write().remove(event);
    }

    /// Rebuilds the dispatch table from the desired set.
    pub fn activate(&self) {
        let desired = self.desired.lock();
        let table: HashMap<String, Handler> = desired
            .iter()
            .map(|(event, handler)| (event.clone(), handler.clone()))
            .collect();
        *self.active.write() = table;
        self.live.store(true, Ordering::SeqCst);
        debug!("Installed {} signaling listeners", desired.len());
    }

    pub fn deactivate(&self) {
        let _desired = self.desired.lock();
        self.live.store(false, Ordering::SeqCst);
        self.active.write().clear();
    }

    /// Delivers a frame to its handler. Returns false when nobody listens.
    pub fn dispatch(&self, frame: Frame) -> bool {
        let handler = self.active.read().get(&frame.event).cloned();
        match handler {
            Some(handler) => {
                handler(frame.data);
                true
            }
            None => {
                debug!("No listener for {}", frame.event);
                false
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.active.read().len()
    }
}

// ============================================================================
// WebSocket transport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    max_backoff: Duration,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscriptions: SubscriptionManager,
    state: watch::Sender<TransportState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Identity {
    user: UserInfo,
    token: Option<String>,
}

impl SignalingClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let url = Url::parse(&config.ws_url())
            .map_err(|e| Error::WebSocket(format!("invalid signaling url: {}", e)))?;
        let (state, _) = watch::channel(TransportState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                max_backoff: config.reconnect_max_backoff(),
                outbound: Mutex::new(None),
                subscriptions: SubscriptionManager::new(),
                state,
                task: Mutex::new(None),
            }),
        })
    }

    /// Starts the connection loop for `user`. A no-op while a loop is
    /// already running.
    pub fn connect(&self, user: UserInfo, token: Option<String>) {
        let mut task = self.inner.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("Signaling already running for this client");
            return;
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(run(inner, Identity { user, token })));
    }

    pub fn disconnect(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        *self.inner.outbound.lock() = None;
        self.inner.subscriptions.deactivate();
        self.inner.state.send_replace(TransportState::Disconnected);
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }
}

impl Signaling for SignalingClient {
    fn emit(&self, event: &str, payload: Value) {
        let text = match Frame::new(event, payload).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", event, e);
                return;
            }
        };

        match *self.inner.outbound.lock() {
            Some(ref sender) => {
                if sender.send(text).is_err() {
                    debug!("Dropping {}: writer closed", event);
                }
            }
            None => debug!("Dropping {}: not connected", event),
        }
    }

    fn on(&self, event: &str, handler: Handler) {
        self.inner.subscriptions.on(event, handler);
    }

    fn off(&self, event: &str) {
        self.inner.subscriptions.off(event);
    }
}

async fn run(inner: Arc<Inner>, identity: Identity) {
    let mut backoff = Duration::from_secs(1);

    loop {
        inner.state.send_replace(TransportState::Connecting);

        match connect_async(inner.url.as_str()).await {
            Ok((ws_stream, _)) => {
                backoff = Duration::from_secs(1);
                let (mut write, mut read) = ws_stream.split();

                let auth = Frame::new(
                    "authenticate",
                    json!({
                        "userId": identity.user.id,
                        "userInfo": identity.user,
                        "token": identity.token,
                    }),
                );
                let sent: Result<()> = match auth.encode() {
                    Ok(text) => write.send(WsMessage::Text(text)).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!("Signaling authentication failed: {}", e);
                } else {
                    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                    *inner.outbound.lock() = Some(tx);
                    inner.subscriptions.activate();
                    inner.state.send_replace(TransportState::Connected);
                    info!("Signaling connected as {}", identity.user.id);

                    // Send task
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if write.send(WsMessage::Text(msg)).await.is_err() {
                                break;
                            }
                        }
                    });

                    // Receive loop
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(WsMessage::Text(text)) => match Frame::decode(&text) {
                                Ok(frame) => {
                                    inner.subscriptions.dispatch(frame);
                                }
                                Err(e) => warn!("Failed to parse signaling frame: {}", e),
                            },
                            Ok(WsMessage::Close(_)) | Err(_) => break,
                            _ => {}
                        }
                    }

                    writer.abort();
                    *inner.outbound.lock() = None;
                    inner.subscriptions.deactivate();
                    warn!("Signaling disconnected");
                }
            }
            Err(e) => warn!("Signaling connect to {} failed: {}", inner.url, e),
        }

        inner.state.send_replace(TransportState::Disconnected);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(inner.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_frame_encoding() {
        let frame = Frame::new("call:decline", json!({ "to": "U2", "reason": "busy" }));
        let text = frame.encode().unwrap();
        assert_eq!(Frame::decode(&text).unwrap(), frame);

        let bare = Frame::decode(r#"{ "event": "getOnlineUsers" }"#).unwrap();
        assert_eq!(bare.data, Value::Null);
    }

    #[test]
    fn test_no_dispatch_before_connect() {
        let manager = SubscriptionManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.on("newMessage", counting_handler(counter.clone()));

        assert!(!manager.dispatch(Frame::new("newMessage", Value::Null)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        manager.activate();
        assert!(manager.dispatch(Frame::new("newMessage", Value::Null)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reregistration_replaces_handler() {
        let manager = SubscriptionManager::new();
        manager.activate();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        manager.on("typingUpdate", counting_handler(first.clone()));
        manager.on("typingUpdate", counting_handler(second.clone()));

        manager.dispatch(Frame::new("typingUpdate", Value::Null));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(manager.listener_count(), 1);
    }

    #[test]
    fn test_reconnect_delivers_once() {
        let manager = SubscriptionManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.on("call:incoming", counting_handler(counter.clone()));

        // connect, drop, reconnect twice
        manager.activate();
        manager.deactivate();
        manager.activate();
        manager.activate();

        manager.dispatch(Frame::new("call:incoming", Value::Null));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let manager = SubscriptionManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.on("getOnlineUsers", counting_handler(counter.clone()));
        manager.off("getOnlineUsers");
        manager.activate();

        assert!(!manager.dispatch(Frame::new("getOnlineUsers", Value::Null)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_dropped() {
        let client = SignalingClient::new(&ClientConfig::default()).unwrap();
        assert_eq!(client.state(), TransportState::Disconnected);
        // must not panic or queue
        client.emit("typing", json!({ "chatId": "c1", "isTyping": true }));
        assert!(client.inner.outbound.lock().is_none());
    }
}
