//! Voxlink Core Library
//!
//! Client core for chat with one-to-one voice calls.
//! Provides: signaling, media negotiation, the call state machine,
//! the message store, unread tracking, networking and local storage.

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod models;
pub mod network;
pub mod presence;
pub mod signaling;
pub mod storage;
pub mod store;
pub mod unread;

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub use call::{CallEvent, CallManager, CallSettings, CallSnapshot, CallStatus, Direction};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use models::*;
pub use network::{ApiClient, ChatApi};
pub use presence::{Presence, TypingNotifier, TypingUpdate};
pub use signaling::{Signaling, SignalingClient, TransportState};
pub use storage::LocalStorage;
pub use store::MessageStore;
pub use unread::{badge_title, UnreadAggregator};

pub const NEW_MESSAGE: &str = "newMessage";
pub const NEW_GROUP_MESSAGE: &str = "newGroupMessage";

/// Components that exist while a user is logged in.
struct Session {
    user: UserInfo,
    store: Arc<MessageStore>,
    calls: CallManager,
    presence: Arc<Presence>,
    typing: TypingNotifier,
    call_router: JoinHandle<()>,
}

/// Main client instance. Owns every component; nothing is global.
pub struct VoxClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    storage: Arc<LocalStorage>,
    signaling: SignalingClient,
    session: RwLock<Option<Session>>,
}

impl VoxClient {
    pub fn new(config: ClientConfig, data_dir: &Path) -> Result<Self> {
        let storage = Arc::new(LocalStorage::new(data_dir)?);
        let api = Arc::new(ApiClient::new(&config)?);
        let signaling = SignalingClient::new(&config)?;

        Ok(Self {
            config,
            api,
            storage,
            signaling,
            session: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession> {
        let session = self.api.login(username, password).await?;
        self.storage.save_session(&session)?;
        info!("Logged in as {}", session.user.display_name);
        self.start(session.user.clone(), Some(session.token.clone()));
        Ok(session)
    }

    /// Restores the saved session if the backend still accepts its token.
    pub async fn resume(&self) -> Result<Option<UserInfo>> {
        let Some(saved) = self.storage.load_session()? else {
            return Ok(None);
        };
        let token = saved.token.clone();
        self.api.restore(saved);

        match self.api.check_auth().await {
            Ok(user) => {
                info!("Resumed session for {}", user.display_name);
                self.start(user.clone(), Some(token));
                Ok(Some(user))
            }
            Err(Error::NotLoggedIn) => {
                self.storage.clear_session()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn logout(&self) -> Result<()> {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.calls.end().await?;
            session.calls.detach();
            session.typing.stop();
            session.call_router.abort();
        }
        for event in [
            NEW_MESSAGE,
            NEW_GROUP_MESSAGE,
            presence::ONLINE_USERS,
            presence::TYPING_UPDATE,
        ] {
            self.signaling.off(event);
        }
        self.signaling.disconnect();
        if self.api.session().is_none() {
            if let Some(saved) = self.storage.load_session()? {
                self.api.restore(saved);
            }
        }
        self.api.logout().await?;
        self.storage.clear_session()?;
        Ok(())
    }

    fn start(&self, user: UserInfo, token: Option<String>) {
        let unread = Arc::new(UnreadAggregator::new());
        let store = Arc::new(MessageStore::new(
            self.api.clone(),
            user.clone(),
            unread,
            self.config.page_size,
            self.config.cache_ttl(),
        ));
        let signaling: Arc<dyn Signaling> = Arc::new(self.signaling.clone());
        let calls = CallManager::new(
            user.clone(),
            CallSettings::from_config(&self.config),
            signaling.clone(),
            Arc::new(media::CpalDevices),
            Arc::new(media::WebRtcFactory),
        );
        let presence = Arc::new(Presence::new(&user.id));
        let typing = TypingNotifier::new(signaling, user.clone(), self.config.typing_idle());

        for event in [NEW_MESSAGE, NEW_GROUP_MESSAGE] {
            let store = store.clone();
            self.signaling.on(
                event,
                Arc::new(move |payload: Value| match serde_json::from_value::<Message>(payload) {
                    Ok(message) => store.on_realtime_message(message),
                    Err(e) => warn!("Malformed {} payload: {}", event, e),
                }),
            );
        }

        let online = presence.clone();
        self.signaling.on(
            presence::ONLINE_USERS,
            Arc::new(move |payload: Value| {
                match serde_json::from_value::<Vec<String>>(payload) {
                    Ok(users) => online.set_online(users),
                    Err(e) => warn!("Malformed online users payload: {}", e),
                }
            }),
        );

        let typing_presence = presence.clone();
        self.signaling.on(
            presence::TYPING_UPDATE,
            Arc::new(move |payload: Value| {
                match serde_json::from_value::<TypingUpdate>(payload) {
                    Ok(update) => typing_presence.on_typing_update(update),
                    Err(e) => debug!("Ignoring typing update: {}", e),
                }
            }),
        );

        let call_router = calls.attach();
        self.signaling.connect(user.clone(), token);

        let previous = self.session.write().replace(Session {
            user,
            store,
            calls,
            presence,
            typing,
            call_router,
        });
        if let Some(previous) = previous {
            previous.call_router.abort();
        }
    }

    pub fn current_user(&self) -> Option<UserInfo> {
        self.session.read().as_ref().map(|s| s.user.clone())
    }

    pub fn store(&self) -> Result<Arc<MessageStore>> {
        self.with_session(|s| s.store.clone())
    }

    pub fn calls(&self) -> Result<CallManager> {
        self.with_session(|s| s.calls.clone())
    }

    pub fn presence(&self) -> Result<Arc<Presence>> {
        self.with_session(|s| s.presence.clone())
    }

    pub fn typing(&self) -> Result<TypingNotifier> {
        self.with_session(|s| s.typing.clone())
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Result<T> {
        self.session.read().as_ref().map(f).ok_or(Error::NotLoggedIn)
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }
}
