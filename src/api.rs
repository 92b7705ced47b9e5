// REST boundary of the sync engine
// The session talks to the server only through the RestApi trait; HttpApi is the reqwest implementation

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::models::{Identity, MessageRecord, UserStatus};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("credential rejected ({0})")]
    Unauthorized(StatusCode),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Server calls needed by the sync engine. All of them carry the bearer credential.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// GET /api/dashboard
    async fn fetch_identity(&self) -> Result<Identity, ApiError>;
    /// GET /api/users, raw records so malformed entries can be filtered one by one
    async fn fetch_users(&self) -> Result<Vec<Value>, ApiError>;
    /// GET /api/messages/conversations
    async fn fetch_conversations(&self) -> Result<Vec<Value>, ApiError>;
    /// GET /api/messages/{peerId}
    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<MessageRecord>, ApiError>;
    /// GET /api/messages/unread/count
    async fn fetch_unread_total(&self) -> Result<u32, ApiError>;
    /// GET /api/messages/unread/counts-by-sender
    async fn fetch_unread_by_sender(&self) -> Result<HashMap<String, u32>, ApiError>;
    /// PUT /api/messages/{messageId}/read
    async fn mark_read(&self, message_id: &str) -> Result<(), ApiError>;
    /// POST /api/users/status
    async fn set_status(&self, status: UserStatus) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct DashboardResponse {
    user: Identity,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u32,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Clone)]
pub struct HttpApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(config: &SyncConfig, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(config)?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Exchange email and password for a bearer token (POST /api/auth/login)
    pub async fn login(config: &SyncConfig, email: &str, password: &str) -> Result<String, ApiError> {
        let http = build_client(config)?;
        let url = format!("{}/api/auth/login", config.api_url.trim_end_matches('/'));
        let body = serde_json::json!({ "email": email, "password": password });
        let res = http.post(url).json(&body).send().await?;
        let response: LoginResponse = decode(res).await?;
        Ok(response.token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!("GET {}", path);
        let res = self.authed(self.http.get(self.url(path))).send().await?;
        decode(res).await
    }
}

fn build_client(config: &SyncConfig) -> Result<Client, ApiError> {
    let mut builder = Client::builder();
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized(status));
    }
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::UnexpectedStatus { status, body })
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, ApiError> {
    let res = check_status(res).await?;
    let bytes = res.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl RestApi for HttpApi {
    async fn fetch_identity(&self) -> Result<Identity, ApiError> {
        let response: DashboardResponse = self.get_json("/api/dashboard").await?;
        Ok(response.user)
    }

    async fn fetch_users(&self) -> Result<Vec<Value>, ApiError> {
        self.get_json("/api/users").await
    }

    async fn fetch_conversations(&self) -> Result<Vec<Value>, ApiError> {
        self.get_json("/api/messages/conversations").await
    }

    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<MessageRecord>, ApiError> {
        let raw: Vec<Value> = self.get_json(&format!("/api/messages/{}", peer_id)).await?;
        // A single broken record should not hide the rest of the conversation
        let records = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<MessageRecord>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed message record from history of {}: {}", peer_id, e);
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn fetch_unread_total(&self) -> Result<u32, ApiError> {
        let response: CountResponse = self.get_json("/api/messages/unread/count").await?;
        Ok(response.count)
    }

    async fn fetch_unread_by_sender(&self) -> Result<HashMap<String, u32>, ApiError> {
        self.get_json("/api/messages/unread/counts-by-sender").await
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/messages/{}/read", message_id);
        debug!("PUT {}", path);
        let res = self
            .authed(self.http.put(self.url(&path)))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ApiError> {
        debug!("POST /api/users/status ({})", status.as_str());
        let res = self
            .authed(self.http.post(self.url("/api/users/status")))
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }
}
