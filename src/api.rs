//! API Client Module
//!
//! Thin HTTP wrappers for the SafeSignal backend: authentication, trusted
//! contacts, session history and fake-call audio.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{Credentials, UserProfile};
use crate::fake_call::{AudioSegment, SegmentSource};
use crate::protocol::{SessionId, UserId};

/// API client for the SafeSignal backend
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange email and password for a token
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
        let url = format!("{}/auth/login", self.base_url);
        debug!("Logging in at: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let data: AuthResponse = parse(response, "Login failed").await?;
        info!(user_id = %data.user.id, "Logged in");
        Ok(data)
    }

    /// Create an account. The backend signs the new user in immediately.
    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        let url = format!("{}/auth/register", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let data: AuthResponse = parse(response, "Registration failed").await?;
        info!(user_id = %data.user.id, "Registered");
        Ok(data)
    }

    pub async fn list_contacts(&self, credentials: &Credentials) -> Result<Vec<TrustedContact>, ApiError> {
        let url = format!("{}/users/{}/contacts", self.base_url, credentials.user_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        parse(response, "Failed to fetch contacts").await
    }

    pub async fn add_contact(
        &self,
        credentials: &Credentials,
        contact: &NewContact,
    ) -> Result<TrustedContact, ApiError> {
        let url = format!("{}/users/{}/contacts", self.base_url, credentials.user_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&credentials.token)
            .json(contact)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let data: TrustedContact = parse(response, "Failed to add contact").await?;
        info!(contact_id = data.id, "Added trusted contact");
        Ok(data)
    }

    pub async fn delete_contact(&self, credentials: &Credentials, contact_id: i64) -> Result<(), ApiError> {
        let url = format!(
            "{}/users/{}/contacts/{}",
            self.base_url, credentials.user_id, contact_id
        );

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(server_error(response, "Failed to delete contact").await);
        }
        info!(contact_id, "Deleted trusted contact");
        Ok(())
    }

    /// Past and current sharing sessions of the signed-in user
    pub async fn list_sessions(&self, credentials: &Credentials) -> Result<Vec<SessionRecord>, ApiError> {
        let url = format!("{}/users/{}/sessions", self.base_url, credentials.user_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        parse(response, "Failed to fetch sessions").await
    }

    /// Fetch one synthetic-call audio segment. `Ok(None)` once the
    /// conversation has no more segments.
    pub async fn fetch_call_segment(
        &self,
        segment: u32,
        conversation: Option<u32>,
    ) -> Result<Option<AudioSegment>, ApiError> {
        let url = format!("{}/fake-call/audio", self.base_url);
        let conversation_param = conversation.map(i64::from).unwrap_or(-1);

        let response = self
            .client
            .post(&url)
            .query(&[("segment", i64::from(segment)), ("conversation", conversation_param)])
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(segment, "No more fake-call segments");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(server_error(response, "Failed to fetch call audio").await);
        }

        let header = |name: &str| -> Option<u32> {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };
        let conversation = header("X-Conversation-Index").or(conversation).unwrap_or(0);
        let total = header("X-Total-Segments");
        let index = header("X-Current-Segment").unwrap_or(segment);

        let audio = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Some(AudioSegment {
            conversation,
            index,
            total,
            audio: audio.to_vec(),
        }))
    }
}

#[async_trait]
impl SegmentSource for ApiClient {
    async fn fetch_segment(&self, segment: u32, conversation: Option<u32>) -> Result<Option<AudioSegment>, ApiError> {
        self.fetch_call_segment(segment, conversation).await
    }
}

async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response, fallback: &str) -> Result<T, ApiError> {
    if !response.status().is_success() {
        return Err(server_error(response, fallback).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::Parse(e.to_string()))
}

/// Build an error from `detail`, `message`, the status text, or `fallback`.
async fn server_error(response: reqwest::Response, fallback: &str) -> ApiError {
    let status = response.status();
    let body: Option<ErrorResponse> = response.json().await.ok();
    let message = body
        .and_then(|b| b.detail.or(b.message))
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| fallback.to_string());

    ApiError::Server {
        status: status.as_u16(),
        message,
    }
}

// Request/Response types

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

impl AuthResponse {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.token.clone(), self.user.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Accepted,
    Blocked,
    Invited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedContact {
    pub id: i64,
    pub user_id: UserId,
    #[serde(default)]
    pub contact_user_id: Option<UserId>,
    pub contact_name: String,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub status: Option<ContactStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewContact {
    pub contact_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_id: UserId,
    pub started_at: chrono::NaiveDateTime,
    #[serde(default)]
    pub ended_at: Option<chrono::NaiveDateTime>,
    pub is_active: bool,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_response_yields_channel_credentials() {
        let json = r#"{
            "token": "jwt-abc",
            "user": {"id": 7, "username": "sam", "email": "sam@example.com", "phone": null, "created_at": "2025-01-01T00:00:00"}
        }"#;
        let data: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(data.credentials(), Credentials::new("jwt-abc", UserId(7)));
        assert_eq!(data.user.username, "sam");
    }

    #[test]
    fn trusted_contact_tolerates_missing_optionals() {
        let json = r#"{"id": 3, "user_id": 7, "contact_name": "Mom", "status": "invited"}"#;
        let contact: TrustedContact = serde_json::from_str(json).unwrap();
        assert_eq!(contact.contact_name, "Mom");
        assert_eq!(contact.status, Some(ContactStatus::Invited));
        assert!(contact.contact_user_id.is_none());
    }

    #[test]
    fn session_record_parses_backend_timestamps() {
        let json = r#"{"id": 99, "user_id": 7, "started_at": "2025-03-01T12:30:00.123456", "ended_at": null, "is_active": true}"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, SessionId(99));
        assert!(record.is_active);
        assert!(record.ended_at.is_none());
    }

    #[test]
    fn register_request_omits_missing_phone() {
        let request = RegisterRequest {
            username: "sam".into(),
            email: "sam@example.com".into(),
            password: "pw".into(),
            phone: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("phone").is_none());
    }

    #[test]
    fn base_url_is_normalised() {
        let api = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:8000");
    }
}
