//! SocialStream REST client

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::backend::{MessagingApi, RoomApi};
use super::types::*;
use crate::config::ClientConfig;
use crate::messaging::{DirectMessage, Reaction};

/// Errors that can occur when talking to the backend
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// 401/403: the session token is no longer accepted
    #[error("Session is no longer valid")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error: {0}")]
    Api(String),
}

impl ApiError {
    /// Whether the failure means the caller must re-authenticate
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

/// Client for the SocialStream REST API
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for the configured backend
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            token: None,
        })
    }

    /// Set the bearer token attached to every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build a request with optional authentication
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        req
    }

    /// Send a request and map the status before decoding the body
    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T, ApiError> {
        let resp = req.send().await?;
        check_status(resp.status(), what)?;
        Ok(resp.json::<T>().await?)
    }

    async fn send_empty(&self, req: RequestBuilder, what: &str) -> Result<(), ApiError> {
        let resp = req.send().await?;
        check_status(resp.status(), what)
    }
}

fn check_status(status: StatusCode, what: &str) -> Result<(), ApiError> {
    debug!("{} -> HTTP {}", what, status.as_u16());
    match status.as_u16() {
        200..=299 => Ok(()),
        401 | 403 => {
            warn!("{} rejected: session invalid", what);
            Err(ApiError::Unauthorized)
        }
        404 => Err(ApiError::NotFound(what.to_string())),
        code => Err(ApiError::Api(format!("{} failed (HTTP {})", what, code))),
    }
}

impl RoomApi for ApiClient {
    #[instrument(skip(self))]
    async fn room_state(&self, room_id: i64) -> Result<RoomStateResponse, ApiError> {
        let req = self.request(Method::GET, &format!("/api/rooms/{}/state", room_id));
        self.send_json(req, "room state").await
    }

    #[instrument(skip(self))]
    async fn queue(&self, room_id: i64) -> Result<Vec<QueueItem>, ApiError> {
        let req = self.request(Method::GET, &format!("/api/rooms/{}/queue", room_id));
        self.send_json(req, "queue").await
    }

    #[instrument(skip(self))]
    async fn add_to_queue(&self, room_id: i64, video_id: i64) -> Result<QueueItem, ApiError> {
        let req = self
            .request(Method::POST, &format!("/api/rooms/{}/queue", room_id))
            .query(&[("videoId", video_id)]);
        self.send_json(req, "add to queue").await
    }

    #[instrument(skip(self))]
    async fn remove_from_queue(&self, room_id: i64, entry_id: i64) -> Result<(), ApiError> {
        let req = self.request(Method::DELETE, &format!("/api/rooms/{}/queue/{}", room_id, entry_id));
        self.send_empty(req, "remove from queue").await
    }

    #[instrument(skip(self))]
    async fn toggle_vote(&self, room_id: i64, entry_id: i64) -> Result<(), ApiError> {
        let req = self.request(Method::POST, &format!("/api/rooms/{}/queue/{}/vote", room_id, entry_id));
        self.send_empty(req, "toggle vote").await
    }

    #[instrument(skip(self))]
    async fn members(&self, room_id: i64) -> Result<Vec<MemberResponse>, ApiError> {
        let req = self.request(Method::GET, &format!("/api/rooms/{}/members", room_id));
        self.send_json(req, "members").await
    }

    #[instrument(skip(self))]
    async fn video(&self, video_id: i64) -> Result<Video, ApiError> {
        let req = self.request(Method::GET, &format!("/api/manual/video/{}", video_id));
        self.send_json(req, "video").await
    }
}

impl MessagingApi for ApiClient {
    #[instrument(skip(self, content))]
    async fn send_message(&self, recipient_id: i64, content: &str) -> Result<DirectMessage, ApiError> {
        let req = self
            .request(Method::POST, "/api/messages/send")
            .json(&SendMessageRequest {
                recipient_id,
                content: content.to_string(),
            });
        self.send_json(req, "send message").await
    }

    #[instrument(skip(self))]
    async fn conversation(&self, friend_id: i64, page: u32, size: u32) -> Result<Page<DirectMessage>, ApiError> {
        let req = self
            .request(Method::GET, &format!("/api/messages/conversation/{}", friend_id))
            .query(&[("page", page), ("size", size)]);
        self.send_json(req, "conversation").await
    }

    #[instrument(skip(self))]
    async fn add_reaction(&self, message_id: i64, reaction: Reaction) -> Result<DirectMessage, ApiError> {
        let req = self
            .request(Method::POST, &format!("/api/messages/react/{}", message_id))
            .query(&[("reaction", reaction.as_str())]);
        self.send_json(req, "add reaction").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ClientConfig::for_base_url("http://127.0.0.1:9000");
        let client = ApiClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:9000");
        assert_eq!(client.token, None);

        let client = client.with_token("jwt");
        assert_eq!(client.token.as_deref(), Some("jwt"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK, "x").is_ok());
        assert!(check_status(StatusCode::NO_CONTENT, "x").is_ok());
        assert!(check_status(StatusCode::UNAUTHORIZED, "x").unwrap_err().is_session_invalid());
        assert!(check_status(StatusCode::FORBIDDEN, "x").unwrap_err().is_session_invalid());
        assert!(matches!(check_status(StatusCode::NOT_FOUND, "x"), Err(ApiError::NotFound(_))));
        assert!(matches!(check_status(StatusCode::BAD_GATEWAY, "x"), Err(ApiError::Api(_))));
    }
}
