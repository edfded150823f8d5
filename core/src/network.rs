//! HTTP API client for the chat backend

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// The message endpoints the store depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_messages(&self, key: &ConversationKey, query: PageQuery)
        -> Result<MessagePage>;

    /// Posts the content and returns the message as the server stored it.
    async fn send_message(
        &self,
        key: &ConversationKey,
        content: &OutgoingContent,
    ) -> Result<Message>;

    async fn mark_read(&self, key: &ConversationKey) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    user: UserInfo,
    #[serde(default)]
    expires_at: Option<i64>,
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Mutex<Option<AuthSession>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.use_tls)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            session: Mutex::new(None),
        })
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.session.lock().clone()
    }

    /// Installs a session restored from disk.
    pub fn restore(&self, session: AuthSession) {
        *self.session.lock() = Some(session);
    }

    pub fn current_user(&self) -> Result<UserInfo> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.user.clone())
            .ok_or(Error::NotLoggedIn)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.session.lock().as_ref() {
            Some(session) => req.bearer_auth(&session.token),
            None => req,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession> {
        let resp = self
            .client
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::BAD_REQUEST {
            return Err(Error::InvalidCredentials);
        }
        let data: AuthResponse = check(resp).await?.json().await?;

        let session = AuthSession {
            token: data.token,
            user: data.user,
            expires_at: data.expires_at,
        };
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// Asks the backend whether the current token is still valid and
    /// returns the user it belongs to.
    pub async fn check_auth(&self) -> Result<UserInfo> {
        if self.session.lock().is_none() {
            return Err(Error::NotLoggedIn);
        }
        let resp = self
            .authorized(self.client.get(format!("{}/api/auth/check", self.base_url)))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            *self.session.lock() = None;
            return Err(Error::NotLoggedIn);
        }
        let user: UserInfo = check(resp).await?.json().await?;
        Ok(user)
    }

    pub async fn logout(&self) -> Result<()> {
        let req = self.authorized(self.client.post(format!("{}/api/auth/logout", self.base_url)));
        *self.session.lock() = None;

        if let Err(e) = req.send().await.map_err(Error::from).and_then(status_ok) {
            warn!("Logout request failed: {}", e);
        }
        Ok(())
    }

    fn messages_url(&self, key: &ConversationKey, self_id: &str) -> String {
        match key {
            ConversationKey::Direct(..) => {
                format!("{}/api/messages/{}", self.base_url, key.remote_id(self_id))
            }
            ConversationKey::Group(id) => format!("{}/api/groups/{}/messages", self.base_url, id),
        }
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn fetch_messages(
        &self,
        key: &ConversationKey,
        query: PageQuery,
    ) -> Result<MessagePage> {
        let me = self.current_user()?;
        let mut req = self.client.get(self.messages_url(key, &me.id));
        req = match query {
            PageQuery::Latest { limit } => {
                req.query(&[("page", "1".to_string()), ("limit", limit.to_string())])
            }
            PageQuery::Before { before, limit } => req.query(&[
                ("before", before.to_rfc3339()),
                ("limit", limit.to_string()),
            ]),
        };

        let resp = self.authorized(req).send().await?;
        let page: PageResponse = check(resp).await?.json().await?;
        debug!(
            "Fetched {} messages for {} (has_more: {})",
            page.messages.len(),
            key,
            page.pagination.has_more
        );

        Ok(MessagePage {
            messages: page.messages,
            has_more: page.pagination.has_more,
        })
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        content: &OutgoingContent,
    ) -> Result<Message> {
        let me = self.current_user()?;
        let mut form = reqwest::multipart::Form::new();
        if let Some(text) = &content.text {
            form = form.text("text", text.clone());
        }
        if let Some(file) = &content.file {
            let part = reqwest::multipart::Part::bytes(file.data.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.mime_type)?;
            form = form.part("file", part);
        }

        let url = match key {
            ConversationKey::Direct(..) => {
                format!("{}/api/messages/send/{}", self.base_url, key.remote_id(&me.id))
            }
            ConversationKey::Group(id) => format!("{}/api/groups/{}/messages", self.base_url, id),
        };

        let resp = self
            .authorized(self.client.post(url))
            .multipart(form)
            .send()
            .await?;
        let mut message: Message = check(resp).await?.json().await?;
        if message.sender.is_none() && message.sender_id == me.id {
            message.sender = Some(me);
        }
        Ok(message)
    }

    async fn mark_read(&self, key: &ConversationKey) -> Result<()> {
        let me = self.current_user()?;
        let url = format!(
            "{}/api/messages/mark-read/{}/{}",
            self.base_url,
            key.chat_type().as_str(),
            key.remote_id(&me.id)
        );
        let resp = self.authorized(self.client.post(url)).send().await?;
        status_ok(resp)
    }
}

fn status_ok(resp: Response) -> Result<()> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(Error::Http(format!("{} {}", resp.status(), resp.url().path())))
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let path = resp.url().path().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Http(format!("{} {}: {}", status, path, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_response_parsing() {
        let json = r#"{
            "messages": [
                { "_id": "m1", "senderId": "U2", "receiverId": "U1",
                  "createdAt": "2024-05-01T10:00:00Z", "text": "hi" }
            ],
            "pagination": { "hasMore": true, "page": 1 }
        }"#;
        let page: PageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.pagination.has_more);
    }

    #[test]
    fn test_page_response_without_pagination() {
        let page: PageResponse = serde_json::from_str(r#"{ "messages": [] }"#).unwrap();
        assert!(!page.pagination.has_more);
    }

    #[test]
    fn test_messages_url() {
        let api = ApiClient::new(&ClientConfig::new("chat.local", 8080, false)).unwrap();
        assert_eq!(
            api.messages_url(&ConversationKey::direct("U2", "U1"), "U1"),
            "http://chat.local:8080/api/messages/U2"
        );
        assert_eq!(
            api.messages_url(&ConversationKey::group("G1"), "U1"),
            "http://chat.local:8080/api/groups/G1/messages"
        );
    }

    #[test]
    fn test_requires_login() {
        let api = ApiClient::new(&ClientConfig::default()).unwrap();
        assert!(matches!(api.current_user(), Err(Error::NotLoggedIn)));
    }
}
