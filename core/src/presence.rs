//! Online users and typing indicators

use crate::models::{ChatType, UserInfo};
use crate::signaling::Signaling;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const ONLINE_USERS: &str = "getOnlineUsers";
pub const TYPING: &str = "typing";
pub const TYPING_UPDATE: &str = "typingUpdate";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TypingUser {
    Info(UserInfo),
    Id(String),
}

impl TypingUser {
    fn into_user(self) -> UserInfo {
        match self {
            TypingUser::Info(user) => user,
            TypingUser::Id(id) => UserInfo::new(&id, &id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub chat_id: String,
    #[serde(default)]
    typing_users: Vec<TypingUser>,
}

/// Who is online and who is typing where, as last reported by the server.
pub struct Presence {
    self_id: String,
    online: RwLock<HashSet<String>>,
    typing: RwLock<HashMap<String, Vec<UserInfo>>>,
}

impl Presence {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            online: RwLock::new(HashSet::new()),
            typing: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the online set.
    pub fn set_online(&self, user_ids: Vec<String>) {
        debug!("{} users online", user_ids.len());
        *self.online.write() = user_ids.into_iter().collect();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.read().contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.read().iter().cloned().collect();
        users.sort();
        users
    }

    pub fn on_typing_update(&self, update: TypingUpdate) {
        let users: Vec<UserInfo> = update
            .typing_users
            .into_iter()
            .map(TypingUser::into_user)
            .filter(|u| u.id != self.self_id)
            .collect();

        let mut typing = self.typing.write();
        if users.is_empty() {
            typing.remove(&update.chat_id);
        } else {
            typing.insert(update.chat_id, users);
        }
    }

    pub fn typing_users(&self, chat_id: &str) -> Vec<UserInfo> {
        self.typing.read().get(chat_id).cloned().unwrap_or_default()
    }
}

struct TypingSession {
    chat_id: String,
    chat_type: ChatType,
    /// Bumped on every keystroke; an idle timer only expires its own.
    generation: u64,
    idle: JoinHandle<()>,
}

/// Emits `typing` start/stop signals for the local user. The first
/// keystroke in a chat sends `isTyping: true`; silence for the idle
/// period, a send, or switching chats sends `isTyping: false`.
#[derive(Clone)]
pub struct TypingNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    signaling: Arc<dyn Signaling>,
    user: UserInfo,
    idle: Duration,
    generation: AtomicU64,
    session: Mutex<Option<TypingSession>>,
}

impl TypingNotifier {
    pub fn new(signaling: Arc<dyn Signaling>, user: UserInfo, idle: Duration) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                signaling,
                user,
                idle,
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn keystroke(&self, chat_id: &str, chat_type: ChatType) {
        let mut session = self.inner.session.lock();
        let started = match session.take() {
            Some(current) if current.chat_id == chat_id => {
                current.idle.abort();
                false
            }
            Some(previous) => {
                previous.idle.abort();
                self.emit(&previous.chat_id, previous.chat_type, false);
                true
            }
            None => true,
        };
        if started {
            self.emit(chat_id, chat_type, true);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let notifier = self.clone();
        let idle = self.inner.idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            notifier.expire(generation);
        });
        *session = Some(TypingSession {
            chat_id: chat_id.to_string(),
            chat_type,
            generation,
            idle: handle,
        });
    }

    /// Ends the current typing session, e.g. when the message is sent.
    pub fn stop(&self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.idle.abort();
            self.emit(&session.chat_id, session.chat_type, false);
        }
    }

    pub fn is_typing(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    fn expire(&self, generation: u64) {
        let mut session = self.inner.session.lock();
        match session.as_ref() {
            Some(current) if current.generation == generation => {}
            _ => {
                debug!("Typing timer {} superseded", generation);
                return;
            }
        }
        if let Some(expired) = session.take() {
            self.emit(&expired.chat_id, expired.chat_type, false);
        }
    }

    fn emit(&self, chat_id: &str, chat_type: ChatType, is_typing: bool) {
        self.inner.signaling.emit(
            TYPING,
            json!({
                "chatId": chat_id,
                "chatType": chat_type,
                "isTyping": is_typing,
                "userInfo": self.inner.user,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Handler;
    use serde_json::Value;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl Signaling for Recorder {
        fn emit(&self, event: &str, payload: Value) {
            self.sent.lock().push((event.to_string(), payload));
        }
        fn on(&self, _event: &str, _handler: Handler) {}
        fn off(&self, _event: &str) {}
    }

    #[test]
    fn test_typing_update_excludes_self() {
        let presence = Presence::new("U1");
        let update: TypingUpdate = serde_json::from_value(json!({
            "chatId": "G1",
            "typingUsers": [
                { "id": "U1", "displayName": "Me" },
                { "id": "U2", "displayName": "Bea" },
                "U3"
            ]
        }))
        .unwrap();
        presence.on_typing_update(update);

        let ids: Vec<String> = presence.typing_users("G1").into_iter().map(|u| u.id).collect();
        assert_eq!(ids, ["U2", "U3"]);
    }

    #[test]
    fn test_online_set_replaced() {
        let presence = Presence::new("U1");
        presence.set_online(vec!["U2".into(), "U3".into()]);
        presence.set_online(vec!["U3".into()]);
        assert!(!presence.is_online("U2"));
        assert!(presence.is_online("U3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_stops_after_idle() {
        let recorder = Arc::new(Recorder::default());
        let notifier = TypingNotifier::new(
            recorder.clone(),
            UserInfo::new("U1", "Ann"),
            Duration::from_millis(3000),
        );

        notifier.keystroke("U2", ChatType::Direct);
        notifier.keystroke("U2", ChatType::Direct);
        assert_eq!(recorder.sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1["isTyping"], true);
        assert_eq!(sent[1].1["isTyping"], false);
        assert!(!notifier.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_idle_timer_keeps_session() {
        let recorder = Arc::new(Recorder::default());
        let notifier = TypingNotifier::new(
            recorder.clone(),
            UserInfo::new("U1", "Ann"),
            Duration::from_millis(3000),
        );

        notifier.keystroke("U2", ChatType::Direct);
        let first = notifier.inner.generation.load(Ordering::Relaxed);
        notifier.keystroke("U2", ChatType::Direct);

        // The first timer fired just as the second keystroke replaced it.
        notifier.expire(first);
        assert!(notifier.is_typing());
        assert_eq!(recorder.sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(!notifier.is_typing());
        assert_eq!(recorder.sent.lock().len(), 2);
    }
}
