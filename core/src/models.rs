//! Data models for Voxlink

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "username", default)]
    pub display_name: String,
    #[serde(alias = "profilePic", default)]
    pub avatar: Option<String>,
}

impl UserInfo {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar: None,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub user: UserInfo,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

// ============================================================================
// Conversations
// ============================================================================

/// Canonical identifier of a conversation: the sorted user-id pair of a
/// direct chat, or a group id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    Direct(String, String),
    Group(String),
}

impl ConversationKey {
    pub fn direct(a: &str, b: &str) -> Self {
        if a <= b {
            Self::Direct(a.to_string(), b.to_string())
        } else {
            Self::Direct(b.to_string(), a.to_string())
        }
    }

    pub fn group(group_id: &str) -> Self {
        Self::Group(group_id.to_string())
    }

    pub fn chat_type(&self) -> ChatType {
        match self {
            Self::Direct(..) => ChatType::Direct,
            Self::Group(_) => ChatType::Group,
        }
    }

    /// The id the backend addresses this conversation by, as seen from
    /// `self_id`: the other user of a direct pair, or the group id.
    pub fn remote_id(&self, self_id: &str) -> String {
        match self {
            Self::Direct(a, b) => {
                if a == self_id {
                    b.clone()
                } else {
                    a.clone()
                }
            }
            Self::Group(id) => id.clone(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(a, b) => write!(f, "{}-{}", a, b),
            Self::Group(id) => write!(f, "group:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Direct => "direct",
            ChatType::Group => "group",
        }
    }
}

/// Sidebar summary of the latest message in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub key: ConversationKey,
    pub text: String,
    pub sender_id: String,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Audio,
    Voice,
    Video,
    #[serde(other)]
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Seconds, voice messages only.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub waveform: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file: Option<Attachment>,
    #[serde(default)]
    pub message_type: ChatType,
    #[serde(default)]
    pub sender: Option<UserInfo>,
}

impl Message {
    /// Conversation this message belongs to, as seen from `self_id`.
    pub fn conversation_key(&self, self_id: &str) -> Option<ConversationKey> {
        match self.message_type {
            ChatType::Group => self.group_id.as_deref().map(ConversationKey::group),
            ChatType::Direct => {
                let receiver = self.receiver_id.as_deref().unwrap_or(self_id);
                Some(ConversationKey::direct(&self.sender_id, receiver))
            }
        }
    }

    pub fn preview_text(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.chars().take(50).collect();
        }
        match self.file.as_ref().map(|f| f.kind) {
            Some(FileKind::Voice) | Some(FileKind::Audio) => "[voice message]".to_string(),
            Some(FileKind::Image) => "[image]".to_string(),
            Some(FileKind::Video) => "[video]".to_string(),
            Some(FileKind::Document) => "[file]".to_string(),
            None => String::new(),
        }
    }
}

/// One page of history as returned by the backend.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageQuery {
    Latest { limit: usize },
    Before { before: DateTime<Utc>, limit: usize },
}

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Content of a message about to be sent: text and/or one attachment.
#[derive(Debug, Clone, Default)]
pub struct OutgoingContent {
    pub text: Option<String>,
    pub file: Option<OutgoingFile>,
}

impl OutgoingContent {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            file: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_text = self
            .text
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !has_text && self.file.is_none() {
            return Err(Error::Validation("message is empty".to_string()));
        }
        Ok(())
    }
}
