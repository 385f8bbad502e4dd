//! Backend REST client and the collaborator traits the engine consumes.
//!
//! `GET /auth/me` probes the session, `POST /chat/threads` creates a thread and
//! `POST /chat/threads/{id}/messages` submits a user message. Every request carries
//! `X-Workspace-ID` when a workspace is configured.

use crate::config::{self, Config};
use crate::message::{Attachment, ThreadId};
use crate::stream::{encode_segment, ChunkedReader};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error body fields the backend may return (`detail`, `title`).
#[derive(Debug, Default, Deserialize)]
struct ProblemBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error {status}: {detail}")]
    Status {
        status: u16,
        detail: String,
        request_id: Option<String>,
    },
    #[error("api response invalid: {0}")]
    Invalid(String),
}

impl ApiError {
    /// HTTP status for status errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Request(e) => e.status().map(|s| s.as_u16()),
            ApiError::Invalid(_) => None,
        }
    }
}

/// Authenticated user as returned by `GET /auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Attachment as submitted to the backend (uploaded files only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
}

/// Body of `POST /chat/threads/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentRef>>,
}

impl MessagePayload {
    /// Build the payload, keeping only attachments that have been uploaded.
    pub fn new(content: impl Into<String>, attachments: &[Attachment]) -> Self {
        let refs: Vec<AttachmentRef> = attachments
            .iter()
            .filter_map(|a| {
                a.url.as_ref().filter(|u| !u.is_empty()).map(|url| AttachmentRef {
                    url: url.clone(),
                    name: a.name.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size,
                })
            })
            .collect();
        Self {
            content: content.into(),
            attachments: if attachments.is_empty() { None } else { Some(refs) },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateThreadResponse {
    thread_id: ThreadId,
}

/// Thread creation and message submission.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_thread(&self) -> Result<ThreadId, ApiError>;
    /// Must succeed before a reply is streamed.
    async fn post_message(&self, thread_id: &str, payload: &MessagePayload) -> Result<(), ApiError>;
}

/// Session probe used once at startup to pick the operating mode.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// `Ok(None)` when there is no valid session.
    async fn current_user(&self) -> Result<Option<User>, ApiError>;
}

/// Client for the backend REST API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ApiClient {
    /// Build from config (API base, workspace id and auth token resolved with env overrides).
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            config::resolve_api_base(config),
            config::resolve_workspace_id(config).as_deref(),
            config::resolve_auth_token(config).as_deref(),
            Duration::from_millis(config.api.request_timeout_ms),
        )
    }

    pub fn new(
        base_url: impl Into<String>,
        workspace_id: Option<&str>,
        auth_token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(ws) = workspace_id {
            let v = HeaderValue::from_str(ws)
                .map_err(|_| ApiError::Invalid(format!("workspace id {:?}", ws)))?;
            headers.insert("X-Workspace-ID", v);
        }
        if let Some(token) = auth_token {
            let v = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::Invalid("auth token".to_string()))?;
            headers.insert(AUTHORIZATION, v);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Primary token transport sharing this client's headers and cookies.
    pub fn chunked_reader(&self) -> ChunkedReader {
        ChunkedReader::new(self.client.clone(), self.base_url.clone())
    }

    /// Cheap reachability check of the API base (any HTTP response counts as online).
    pub async fn ping(&self) -> bool {
        self.client
            .head(&self.base_url)
            .timeout(self.request_timeout)
            .send()
            .await
            .is_ok()
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout);
        if let Some(b) = body {
            req = req.json(b);
        }
        let res = req.send().await?;
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let request_id = res
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = res.text().await.unwrap_or_default();
        let detail = problem_detail(&text, status);
        log::warn!(
            "api error: {} {} (request id {})",
            path,
            status.as_u16(),
            request_id.as_deref().unwrap_or("-")
        );
        Err(ApiError::Status {
            status: status.as_u16(),
            detail,
            request_id,
        })
    }
}

/// Human-readable detail from an error body: JSON `detail`, else `title`, else the raw text or status reason.
fn problem_detail(text: &str, status: StatusCode) -> String {
    if let Ok(p) = serde_json::from_str::<ProblemBody>(text) {
        match p.detail {
            Some(serde_json::Value::String(s)) => return s,
            Some(v) if !v.is_null() => return v.to_string(),
            _ => {}
        }
        if let Some(t) = p.title {
            return t;
        }
    }
    if !text.trim().is_empty() {
        return text.trim().to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn create_thread(&self) -> Result<ThreadId, ApiError> {
        let res = self
            .request(reqwest::Method::POST, "/chat/threads", None)
            .await?;
        let data: CreateThreadResponse = res
            .json()
            .await
            .map_err(|e| ApiError::Invalid(e.to_string()))?;
        Ok(data.thread_id)
    }

    async fn post_message(&self, thread_id: &str, payload: &MessagePayload) -> Result<(), ApiError> {
        let path = format!("/chat/threads/{}/messages", encode_segment(thread_id));
        let body = serde_json::to_value(payload).map_err(|e| ApiError::Invalid(e.to_string()))?;
        self.request(reqwest::Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionProbe for ApiClient {
    async fn current_user(&self) -> Result<Option<User>, ApiError> {
        match self.request(reqwest::Method::GET, "/auth/me", None).await {
            Ok(res) => {
                let user: User = res
                    .json()
                    .await
                    .map_err(|e| ApiError::Invalid(e.to_string()))?;
                Ok(Some(user))
            }
            Err(ApiError::Status { status: 401, .. }) | Err(ApiError::Status { status: 403, .. }) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_keeps_only_uploaded_attachments() {
        let uploaded = Attachment::new("a.png", 3, "image/png", Some("https://cdn/a.png".into())).unwrap();
        let local = Attachment::new("b.txt", 1, "text/plain", None).unwrap();
        let p = MessagePayload::new("hi", &[uploaded, local]);
        let refs = p.attachments.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "https://cdn/a.png");

        let json = serde_json::to_value(MessagePayload::new("hi", &[])).unwrap();
        assert!(json.get("attachments").is_none());
    }

    #[test]
    fn problem_detail_prefers_json_detail() {
        assert_eq!(
            problem_detail(r#"{"detail":"thread not found"}"#, StatusCode::NOT_FOUND),
            "thread not found"
        );
        assert_eq!(
            problem_detail(r#"{"title":"Bad"}"#, StatusCode::BAD_REQUEST),
            "Bad"
        );
        assert_eq!(problem_detail("oops", StatusCode::BAD_GATEWAY), "oops");
        assert_eq!(
            problem_detail("", StatusCode::INTERNAL_SERVER_ERROR),
            "Internal Server Error"
        );
    }
}
