//! Commands Module
//!
//! User-facing operations over the shared [`AppState`]. Each command reports
//! failures in its result instead of returning transport-level errors.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{NewContact, RegisterRequest, SessionRecord, TrustedContact};
use crate::auth::Credentials;
use crate::fake_call::CallPhase;
use crate::presence::PresenceObserver;
use crate::protocol::{SessionId, UserId};
use crate::session::SharingError;
use crate::storage::StoredSession;
use crate::AppState;

// Response types

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResult {
    pub success: bool,
    pub session: Option<SessionResponse>,
    pub error: Option<String>,
}

impl AuthResult {
    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            session: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SharingResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SharingStatus {
    pub phase: String,
    pub session_id: Option<SessionId>,
    pub channel: String,
    pub contacts_sharing: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct ContactsResult {
    pub success: bool,
    pub contacts: Vec<TrustedContact>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallStatus {
    pub phase: String,
    pub elapsed_secs: Option<u64>,
    pub segments_played: u32,
}

const NOT_SIGNED_IN: &str = "Not signed in";

fn current_credentials(state: &AppState) -> Option<Credentials> {
    state.auth.lock().credentials().cloned()
}

/// Bind the app to `stored`: remember it, then open the channel.
///
/// When a different identity was signed in, its sharing session and channel
/// are ended first.
async fn sign_in(state: &AppState, stored: &StoredSession) -> SessionResponse {
    let credentials = stored.credentials();
    let (changed, had_previous) = {
        let mut auth = state.auth.lock();
        let had_previous = auth.is_authenticated();
        (auth.set_credentials(credentials.clone(), stored.user.clone()), had_previous)
    };

    if changed {
        if had_previous {
            state.sharing.stop_sharing();
            state.channel.teardown();
        }
        let observer = PresenceObserver::attach(state.channel.registry());
        if let Some(previous) = state.presence.lock().replace(observer) {
            previous.detach();
        }
    }

    if let Err(e) = state.channel.connect(&credentials).await {
        warn!(error = %e, "Channel unavailable, sharing will resume once it connects");
    }

    SessionResponse {
        user_id: stored.user.id,
        username: stored.user.username.clone(),
        email: stored.user.email.clone(),
    }
}

// Commands

/// Restore the session persisted by a previous launch
pub async fn restore_session(state: &AppState) -> Option<SessionResponse> {
    debug!("Getting stored session");

    match StoredSession::load(state.storage.as_ref()).await {
        Ok(Some(stored)) => Some(sign_in(state, &stored).await),
        Ok(None) => {
            debug!("No stored session found");
            None
        }
        Err(e) => {
            error!("Failed to read stored session: {}", e);
            None
        }
    }
}

/// Sign in with email and password
pub async fn login(state: &AppState, email: &str, password: &str) -> AuthResult {
    info!("Logging in");

    match state.api.login(email, password).await {
        Ok(response) => {
            let stored = StoredSession {
                token: response.token,
                user: response.user,
            };
            if let Err(e) = stored.save(state.storage.as_ref()).await {
                error!("Failed to save session: {}", e);
            }
            AuthResult {
                success: true,
                session: Some(sign_in(state, &stored).await),
                error: None,
            }
        }
        Err(e) => {
            error!("Login failed: {}", e);
            AuthResult::failed(e)
        }
    }
}

/// Create an account and sign in to it
pub async fn register(state: &AppState, request: &RegisterRequest) -> AuthResult {
    info!(username = %request.username, "Registering");

    match state.api.register(request).await {
        Ok(response) => {
            let stored = StoredSession {
                token: response.token,
                user: response.user,
            };
            if let Err(e) = stored.save(state.storage.as_ref()).await {
                error!("Failed to save session: {}", e);
            }
            AuthResult {
                success: true,
                session: Some(sign_in(state, &stored).await),
                error: None,
            }
        }
        Err(e) => {
            error!("Registration failed: {}", e);
            AuthResult::failed(e)
        }
    }
}

/// End sharing, close the channel and forget the stored session
pub async fn logout(state: &AppState) -> Result<(), String> {
    info!("Logging out");

    state.sharing.stop_sharing();
    state.channel.teardown();
    if let Some(observer) = state.presence.lock().take() {
        observer.detach();
    }
    state.auth.lock().clear();

    StoredSession::clear(state.storage.as_ref())
        .await
        .map_err(|e| {
            error!("Failed to clear stored session: {}", e);
            e.to_string()
        })
}

/// Start emergency sharing
pub async fn start_sharing(state: &AppState) -> SharingResult {
    if current_credentials(state).is_none() {
        return SharingResult {
            success: false,
            error: Some(NOT_SIGNED_IN.to_string()),
        };
    }

    match state.sharing.start_sharing().await {
        Ok(()) => SharingResult {
            success: true,
            error: None,
        },
        Err(SharingError::PermissionDenied) => SharingResult {
            success: false,
            error: Some("Location permission is required to share your location".to_string()),
        },
        Err(e) => SharingResult {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

/// Stop emergency sharing
pub fn stop_sharing(state: &AppState) -> SharingResult {
    let stopped = state.sharing.stop_sharing();
    SharingResult {
        success: stopped,
        error: (!stopped).then(|| "Not sharing".to_string()),
    }
}

pub fn sharing_status(state: &AppState) -> SharingStatus {
    let contacts_sharing = state
        .presence
        .lock()
        .as_ref()
        .map(PresenceObserver::sharing_contacts)
        .unwrap_or_default();

    SharingStatus {
        phase: format!("{:?}", state.sharing.phase()).to_lowercase(),
        session_id: state.sharing.session_id(),
        channel: state.channel.state().to_string(),
        contacts_sharing,
    }
}

pub async fn list_contacts(state: &AppState) -> ContactsResult {
    let Some(credentials) = current_credentials(state) else {
        return ContactsResult {
            success: false,
            contacts: Vec::new(),
            error: Some(NOT_SIGNED_IN.to_string()),
        };
    };

    match state.api.list_contacts(&credentials).await {
        Ok(contacts) => ContactsResult {
            success: true,
            contacts,
            error: None,
        },
        Err(e) => {
            error!("Failed to fetch contacts: {}", e);
            ContactsResult {
                success: false,
                contacts: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

pub async fn add_contact(state: &AppState, contact: &NewContact) -> ContactsResult {
    let Some(credentials) = current_credentials(state) else {
        return ContactsResult {
            success: false,
            contacts: Vec::new(),
            error: Some(NOT_SIGNED_IN.to_string()),
        };
    };

    match state.api.add_contact(&credentials, contact).await {
        Ok(added) => ContactsResult {
            success: true,
            contacts: vec![added],
            error: None,
        },
        Err(e) => {
            error!("Failed to add contact: {}", e);
            ContactsResult {
                success: false,
                contacts: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

pub async fn delete_contact(state: &AppState, contact_id: i64) -> Result<(), String> {
    let credentials = current_credentials(state).ok_or_else(|| NOT_SIGNED_IN.to_string())?;
    state
        .api
        .delete_contact(&credentials, contact_id)
        .await
        .map_err(|e| e.to_string())
}

/// Past sharing sessions recorded by the server
pub async fn session_history(state: &AppState) -> Result<Vec<SessionRecord>, String> {
    let credentials = current_credentials(state).ok_or_else(|| NOT_SIGNED_IN.to_string())?;
    state.api.list_sessions(&credentials).await.map_err(|e| {
        error!("Failed to fetch sessions: {}", e);
        e.to_string()
    })
}

fn call_status(state: &AppState) -> CallStatus {
    CallStatus {
        phase: format!("{:?}", state.fake_call.phase()).to_lowercase(),
        elapsed_secs: state.fake_call.elapsed().map(|d| d.as_secs()),
        segments_played: state.fake_call.segments_played(),
    }
}

/// Make the phone "ring"
pub fn start_fake_call(state: &AppState) -> CallStatus {
    if !state.fake_call.ring() {
        debug!("Fake call already in progress");
    }
    call_status(state)
}

pub fn answer_fake_call(state: &AppState) -> Result<CallStatus, String> {
    state.fake_call.answer().map_err(|e| e.to_string())?;
    Ok(call_status(state))
}

/// Hang up, or decline if the call is still ringing
pub async fn end_fake_call(state: &AppState) -> CallStatus {
    if state.fake_call.phase() == CallPhase::Ringing {
        state.fake_call.decline();
    } else {
        state.fake_call.end_call().await;
    }
    call_status(state)
}
