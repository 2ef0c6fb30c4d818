//! Shared test utilities for channel and sharing integration tests
//!
//! Note: some helpers may appear unused because each test file compiles
//! this module independently.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use safesignal::auth::Credentials;
use safesignal::channel::{
    ChannelEndpoint, ChannelError, ChannelManager, Connector, Link, LinkEvent, ReconnectConfig,
};
use safesignal::protocol::UserId;
use safesignal::telemetry::{Accuracy, LocationError, LocationProvider, PermissionStatus, PositionFix};

/// Server half of one in-memory link
struct ServerEnd {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct ConnectorState {
    opened: Vec<Url>,
    links: Vec<ServerEnd>,
    sent: Vec<String>,
    fail_next: u32,
}

/// In-memory transport that records what the client does
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<ConnectorState>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &Url) -> Result<Link, ChannelError> {
        let mut state = self.state.lock();
        state.opened.push(url.clone());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ChannelError::Connect("connection refused".into()));
        }

        let (outgoing, outbound) = mpsc::unbounded_channel();
        let (inbound, incoming) = mpsc::unbounded_channel();
        state.links.push(ServerEnd { outbound, inbound });
        Ok(Link { outgoing, incoming })
    }
}

#[allow(dead_code)]
impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` opens fail
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Every URL an open was attempted for, failed ones included
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().opened.iter().map(|u| u.to_string()).collect()
    }

    /// Number of links actually established
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Deliver a raw frame on the newest link
    pub fn push(&self, frame: &str) {
        let state = self.state.lock();
        if let Some(link) = state.links.last() {
            let _ = link.inbound.send(LinkEvent::Frame(frame.to_string()));
        }
    }

    /// Deliver a raw frame on a specific link
    pub fn push_on(&self, index: usize, frame: &str) {
        let state = self.state.lock();
        let _ = state.links[index].inbound.send(LinkEvent::Frame(frame.to_string()));
    }

    /// Server closes the newest link
    pub fn drop_link(&self) {
        let state = self.state.lock();
        if let Some(link) = state.links.last() {
            let _ = link.inbound.send(LinkEvent::Closed(Some("server restart".into())));
        }
    }

    /// True once the client released its end of link `index`
    pub fn is_released(&self, index: usize) -> bool {
        self.state.lock().links[index].inbound.is_closed()
    }

    /// Frames written by the client so far, across all links, as JSON
    pub fn sent(&self) -> Vec<serde_json::Value> {
        let mut state = self.state.lock();
        let ConnectorState { links, sent, .. } = &mut *state;
        for link in links.iter_mut() {
            while let Ok(frame) = link.outbound.try_recv() {
                sent.push(frame);
            }
        }
        sent.iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }

    /// `type` tags of [`sent`](Self::sent)
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|frame| frame["type"].as_str().unwrap().to_string())
            .collect()
    }
}

/// Location provider with scripted permission, failures and latency
#[allow(dead_code)]
pub struct ScriptedLocation {
    permission: PermissionStatus,
    failing_calls: HashSet<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedLocation {
    pub fn new() -> Self {
        Self {
            permission: PermissionStatus::Granted,
            failing_calls: HashSet::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn denied() -> Self {
        Self {
            permission: PermissionStatus::Denied,
            ..Self::new()
        }
    }

    /// Fail the given 1-based `current_position` calls
    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.failing_calls = calls.iter().copied().collect();
        self
    }

    /// Take `delay` to resolve every fix
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationProvider for ScriptedLocation {
    async fn request_permission(&self) -> PermissionStatus {
        self.permission
    }

    /// Call `n` resolves to `(n, -n)` so tests can tell fixes apart.
    async fn current_position(&self, _accuracy: Accuracy) -> Result<PositionFix, LocationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_calls.contains(&call) {
            return Err(LocationError::Unavailable(format!("no satellites on call {call}")));
        }
        Ok(PositionFix::new(call as f64, -(call as f64), Some(5.0)))
    }
}

#[allow(dead_code)]
pub fn credentials(token: &str, user_id: i64) -> Credentials {
    Credentials::new(token, UserId(user_id))
}

/// Channel manager on the in-memory transport
#[allow(dead_code)]
pub fn channel(reconnect: ReconnectConfig) -> (Arc<MemoryConnector>, ChannelManager) {
    let connector = MemoryConnector::new();
    let endpoint = ChannelEndpoint::parse("ws://localhost:8000").unwrap();
    let channel = ChannelManager::new(endpoint, connector.clone(), reconnect);
    (connector, channel)
}

/// Let spawned tasks run until they block
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
