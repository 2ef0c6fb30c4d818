//! SafeSignal Client Library
//!
//! Realtime session and telemetry core for the SafeSignal personal-safety
//! client: the authenticated channel, emergency sharing, contact presence,
//! and the HTTP and fake-call collaborators around them.

pub mod api;
pub mod auth;
pub mod channel;
pub mod commands;
pub mod config;
pub mod fake_call;
pub mod logging;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod telemetry;

use parking_lot::Mutex;
use std::sync::Arc;

use api::ApiClient;
use auth::AuthManager;
use channel::{ChannelEndpoint, ChannelManager, Connector};
use config::AppConfig;
use fake_call::{AudioSink, FakeCallController};
use presence::PresenceObserver;
use session::SessionController;
use storage::CredentialStore;
use telemetry::LocationProvider;

/// Application state shared across commands
pub struct AppState {
    pub auth: Mutex<AuthManager>,
    pub storage: Arc<dyn CredentialStore>,
    pub api: Arc<ApiClient>,
    pub channel: ChannelManager,
    pub sharing: SessionController,
    pub presence: Mutex<Option<PresenceObserver>>,
    pub fake_call: FakeCallController,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        location: Arc<dyn LocationProvider>,
        storage: Arc<dyn CredentialStore>,
        audio: Arc<dyn AudioSink>,
    ) -> anyhow::Result<Self> {
        let api = Arc::new(ApiClient::new(&config.api_url)?);
        let endpoint = ChannelEndpoint::parse(&config.ws_url)?;
        let channel = ChannelManager::new(endpoint, connector, config.reconnect.clone());
        let sharing = SessionController::new(channel.clone(), location, config.poll_interval);
        let fake_call = FakeCallController::new(api.clone(), audio, config.fake_call_pause);

        Ok(Self {
            auth: Mutex::new(AuthManager::new()),
            storage,
            api,
            channel,
            sharing,
            presence: Mutex::new(None),
            fake_call,
        })
    }
}
