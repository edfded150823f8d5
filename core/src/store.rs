//! Message store: paginated history, page cache, send and realtime routing
//!
//! Sent messages are rendered from the server confirmation and the later
//! realtime echo is dropped by id. Every append path goes through the
//! conversation's id set, so a message is never shown twice.

use crate::error::Result;
use crate::models::{ConversationKey, Message, OutgoingContent, PageQuery, Preview, UserInfo};
use crate::network::ChatApi;
use crate::unread::UnreadAggregator;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Loaded history of one conversation, ascending by `created_at`.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    ids: HashSet<String>,
    has_more: bool,
    loading_older: bool,
    /// Bumped whenever the sequence is replaced; in-flight older-page
    /// loads started under a previous generation are discarded.
    generation: u64,
    preview: Option<Preview>,
}

impl Conversation {
    /// Oldest loaded timestamp, the pagination cursor.
    fn cursor(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.messages.first().map(|m| m.created_at)
    }

    fn replace(&mut self, messages: Vec<Message>, has_more: bool) {
        self.ids = messages.iter().map(|m| m.id.clone()).collect();
        self.messages = messages;
        self.has_more = has_more;
        self.loading_older = false;
        self.generation += 1;
    }

    /// Appends unless the id is already present.
    fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    fn prepend(&mut self, older: Vec<Message>) -> usize {
        let fresh: Vec<Message> = older
            .into_iter()
            .filter(|m| self.ids.insert(m.id.clone()))
            .collect();
        let count = fresh.len();
        self.messages.splice(0..0, fresh);
        count
    }

    fn update_preview(&mut self, key: &ConversationKey, message: &Message) {
        let newer = self
            .preview
            .as_ref()
            .map(|p| message.created_at >= p.at)
            .unwrap_or(true);
        if newer {
            self.preview = Some(Preview {
                key: key.clone(),
                text: message.preview_text(),
                sender_id: message.sender_id.clone(),
                at: message.created_at,
            });
        }
    }
}

struct CachedPage {
    messages: Vec<Message>,
    has_more: bool,
    fetched_at: Instant,
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationKey, Conversation>,
    active: Option<ConversationKey>,
    cache: HashMap<ConversationKey, CachedPage>,
}

pub struct MessageStore {
    api: Arc<dyn ChatApi>,
    self_user: UserInfo,
    unread: Arc<UnreadAggregator>,
    page_size: usize,
    cache_ttl: Duration,
    state: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new(
        api: Arc<dyn ChatApi>,
        self_user: UserInfo,
        unread: Arc<UnreadAggregator>,
        page_size: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            api,
            self_user,
            unread,
            page_size,
            cache_ttl,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn self_user(&self) -> &UserInfo {
        &self.self_user
    }

    pub fn unread(&self) -> &Arc<UnreadAggregator> {
        &self.unread
    }

    /// Makes `key` the open conversation and marks it read.
    pub fn open(&self, key: &ConversationKey) {
        {
            let mut state = self.state.lock();
            state.active = Some(key.clone());
            state.conversations.entry(key.clone()).or_default();
        }
        info!("Opened conversation {}", key);
        self.mark_read(key);
    }

    pub fn close(&self) {
        self.state.lock().active = None;
    }

    pub fn active(&self) -> Option<ConversationKey> {
        self.state.lock().active.clone()
    }

    /// Loads the newest page, from the cache when it is fresh. Replaces the
    /// loaded sequence and marks the conversation read.
    pub async fn load_initial(&self, key: &ConversationKey) -> Result<()> {
        let cached = {
            let state = self.state.lock();
            state
                .cache
                .get(key)
                .filter(|c| c.fetched_at.elapsed() < self.cache_ttl)
                .map(|c| (c.messages.clone(), c.has_more))
        };

        let (messages, has_more) = match cached {
            Some(hit) => {
                debug!("Serving {} from page cache", key);
                hit
            }
            None => {
                let page = self
                    .api
                    .fetch_messages(
                        key,
                        PageQuery::Latest {
                            limit: self.page_size,
                        },
                    )
                    .await?;
                self.state.lock().cache.insert(
                    key.clone(),
                    CachedPage {
                        messages: page.messages.clone(),
                        has_more: page.has_more,
                        fetched_at: Instant::now(),
                    },
                );
                (page.messages, page.has_more)
            }
        };

        {
            let mut state = self.state.lock();
            let conversation = state.conversations.entry(key.clone()).or_default();

            // Keep messages appended while the page was in flight.
            let newest = messages.last().map(|m| m.created_at);
            let page_ids: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            let later: Vec<Message> = conversation
                .messages
                .iter()
                .filter(|m| !page_ids.contains(m.id.as_str()))
                .filter(|m| newest.map(|n| m.created_at >= n).unwrap_or(true))
                .cloned()
                .collect();

            conversation.replace(messages, has_more);
            for message in later {
                conversation.append(message);
            }
            if let Some(last) = conversation.messages.last().cloned() {
                conversation.update_preview(key, &last);
            }
            debug!(
                "Loaded {} messages for {} (has_more: {})",
                conversation.messages.len(),
                key,
                has_more
            );
        }

        self.mark_read(key);
        Ok(())
    }

    /// Prepends the page before the oldest loaded message. Returns how many
    /// messages were added; zero when there is nothing to load, a load is
    /// already running, or nothing is loaded yet.
    pub async fn load_older(&self, key: &ConversationKey) -> Result<usize> {
        let (before, generation) = {
            let mut state = self.state.lock();
            let Some(conversation) = state.conversations.get_mut(key) else {
                return Ok(0);
            };
            if !conversation.has_more || conversation.loading_older {
                return Ok(0);
            }
            let Some(before) = conversation.cursor() else {
                return Ok(0);
            };
            conversation.loading_older = true;
            (before, conversation.generation)
        };

        let result = self
            .api
            .fetch_messages(
                key,
                PageQuery::Before {
                    before,
                    limit: self.page_size,
                },
            )
            .await;

        let mut state = self.state.lock();
        let Some(conversation) = state.conversations.get_mut(key) else {
            return Ok(0);
        };
        if conversation.generation != generation {
            debug!("Discarding stale older page for {}", key);
            return Ok(0);
        }
        conversation.loading_older = false;

        let page = result?;
        conversation.has_more = page.has_more;
        let added = conversation.prepend(page.messages);
        debug!("Prepended {} older messages to {}", added, key);
        Ok(added)
    }

    /// Sends and appends the server-confirmed message. On failure nothing
    /// changes and the error is returned for the caller to surface.
    pub async fn send(&self, key: &ConversationKey, content: OutgoingContent) -> Result<Message> {
        content.validate()?;
        let mut message = self.api.send_message(key, &content).await?;
        if message.sender.is_none() {
            message.sender = Some(self.self_user.clone());
        }

        let mut state = self.state.lock();
        state.cache.remove(key);
        let conversation = state.conversations.entry(key.clone()).or_default();
        conversation.update_preview(key, &message);
        if !conversation.append(message.clone()) {
            debug!("Sent message {} already present", message.id);
        }
        Ok(message)
    }

    /// Routes a message pushed by the server.
    pub fn on_realtime_message(&self, message: Message) {
        let Some(key) = message.conversation_key(&self.self_user.id) else {
            debug!("Dropping realtime message {} without conversation", message.id);
            return;
        };

        let is_active = {
            let mut state = self.state.lock();
            let is_active = state.active.as_ref() == Some(&key);
            let conversation = state.conversations.entry(key.clone()).or_default();
            if conversation.ids.contains(&message.id) {
                debug!("Dropping echo of {}", message.id);
                return;
            }
            conversation.update_preview(&key, &message);
            if is_active {
                conversation.append(message.clone());
            } else {
                // Not rendered; remembered so a redelivery is not counted twice.
                conversation.ids.insert(message.id.clone());
            }
            state.cache.remove(&key);
            is_active
        };

        if is_active {
            self.mark_read(&key);
        } else if message.sender_id != self.self_user.id {
            let count = self.unread.increment(&key);
            debug!("{} now has {} unread", key, count);
        }
    }

    /// Resets the unread count and notifies the backend in the background.
    /// Returns the count that was cleared.
    pub fn mark_read(&self, key: &ConversationKey) -> u32 {
        let prior = self.unread.reset(key);
        let api = self.api.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&key).await {
                warn!("Failed to mark {} read: {}", key, e);
            }
        });
        prior
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.state
            .lock()
            .conversations
            .get(key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn has_more(&self, key: &ConversationKey) -> bool {
        self.state
            .lock()
            .conversations
            .get(key)
            .map(|c| c.has_more)
            .unwrap_or(false)
    }

    pub fn is_loading_older(&self, key: &ConversationKey) -> bool {
        self.state
            .lock()
            .conversations
            .get(key)
            .map(|c| c.loading_older)
            .unwrap_or(false)
    }

    /// Sidebar previews, newest first.
    pub fn previews(&self) -> Vec<Preview> {
        let state = self.state.lock();
        let mut previews: Vec<Preview> = state
            .conversations
            .values()
            .filter_map(|c| c.preview.clone())
            .collect();
        previews.sort_by(|a, b| b.at.cmp(&a.at));
        previews
    }

    pub fn unread_count(&self, key: &ConversationKey) -> u32 {
        self.unread.count(key)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: "U2".to_string(),
            receiver_id: Some("U1".to_string()),
            group_id: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            text: Some(format!("msg {}", id)),
            file: None,
            message_type: Default::default(),
            sender: None,
        }
    }

    #[test]
    fn test_append_skips_known_ids() {
        let mut conversation = Conversation::default();
        assert!(conversation.append(message("a", 1)));
        assert!(!conversation.append(message("a", 1)));
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn test_prepend_keeps_order() {
        let mut conversation = Conversation::default();
        conversation.replace(vec![message("c", 3), message("d", 4)], true);
        let added = conversation.prepend(vec![message("a", 1), message("b", 2), message("c", 3)]);

        assert_eq!(added, 2);
        let ids: Vec<&str> = conversation.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);
        assert_eq!(conversation.cursor(), Some(message("a", 1).created_at));
    }

    #[test]
    fn test_replace_bumps_generation() {
        let mut conversation = Conversation::default();
        conversation.loading_older = true;
        conversation.replace(vec![message("a", 1)], false);
        assert_eq!(conversation.generation, 1);
        assert!(!conversation.loading_older);
        assert!(!conversation.has_more);
    }

    #[test]
    fn test_preview_only_moves_forward() {
        let key = ConversationKey::direct("U1", "U2");
        let mut conversation = Conversation::default();
        conversation.update_preview(&key, &message("new", 10));
        conversation.update_preview(&key, &message("old", 1));
        assert_eq!(conversation.preview.unwrap().text, "msg new");
    }
}
