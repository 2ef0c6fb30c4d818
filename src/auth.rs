//! Authentication Module
//!
//! Holds the signed-in identity that the realtime channel is bound to.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::protocol::UserId;

/// Token and identity presented to the realtime channel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

impl Credentials {
    pub fn new(token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            token: token.into(),
            user_id,
        }
    }
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Profile returned by the API on login/register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Manages authentication state
#[derive(Debug, Default)]
pub struct AuthManager {
    credentials: Option<Credentials>,
    profile: Option<UserProfile>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the signed-in identity. Returns true if the credentials changed.
    pub fn set_credentials(&mut self, credentials: Credentials, profile: UserProfile) -> bool {
        let changed = self.credentials.as_ref() != Some(&credentials);
        if changed {
            info!(user_id = %credentials.user_id, "Credentials set");
        }
        self.credentials = Some(credentials);
        self.profile = Some(profile);
        changed
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Forget the signed-in identity
    pub fn clear(&mut self) {
        if self.credentials.take().is_some() {
            info!("Credentials cleared");
        }
        self.profile = None;
    }
}
