//! Realtime Channel Module
//!
//! Owns the single authenticated connection to the realtime server. Outbound
//! messages are encoded and written in call order; inbound frames are decoded
//! and fanned out through the [`ListenerRegistry`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::Credentials;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::registry::{ListenerRegistry, Subscription};

/// Connection lifecycle, exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Event produced by the read side of a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(String),
    Closed(Option<String>),
    Error(String),
}

/// An established transport: text frames out, events in.
///
/// Dropping `outgoing` asks the transport to close.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens transports for the channel manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Link, ChannelError>;
}

/// WebSocket transport
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Forward queued frames to the socket, closing it once every sender is gone.
    async fn write_frames<S>(mut rx: mpsc::UnboundedReceiver<String>, mut ws_sender: S)
    where
        S: SinkExt<Message> + Unpin,
        S::Error: fmt::Display,
    {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                warn!(error = %e, "Failed to write WebSocket frame");
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("WebSocket writer stopped");
    }

    async fn read_frames<S>(mut ws_receiver: S, tx: mpsc::UnboundedSender<LinkEvent>)
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(result) = ws_receiver.next().await {
            let event = match result {
                Ok(Message::Text(text)) => LinkEvent::Frame(text.to_string()),
                Ok(Message::Close(frame)) => {
                    let _ = tx.send(LinkEvent::Closed(frame.map(|f| f.reason.to_string())));
                    return;
                }
                Ok(Message::Binary(_)) => {
                    debug!("Ignoring binary frame");
                    continue;
                }
                // Pings are answered by tungstenite
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => {
                    let _ = tx.send(LinkEvent::Error(e.to_string()));
                    return;
                }
            };
            if tx.send(event).is_err() {
                return;
            }
        }
        let _ = tx.send(LinkEvent::Closed(None));
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Link, ChannelError> {
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_frames(outgoing_rx, ws_sender));
        tokio::spawn(Self::read_frames(ws_receiver, incoming_tx));

        Ok(Link {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Base address of the realtime server
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    base: Url,
}

impl ChannelEndpoint {
    /// Accepts `ws(s)://` or `http(s)://` base URLs.
    pub fn parse(base: &str) -> Result<Self, ChannelError> {
        let mut url = Url::parse(base).map_err(|e| ChannelError::InvalidEndpoint(format!("{base}: {e}")))?;
        if url.host_str().is_none() {
            return Err(ChannelError::InvalidEndpoint(format!("{base}: missing host")));
        }

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ChannelError::InvalidEndpoint(format!(
                    "{base}: unsupported scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::InvalidEndpoint(base.to_string()))?;
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self { base: url })
    }

    /// `ws(s)://<host>/ws/<userId>?token=<token>`
    pub fn url_for(&self, credentials: &Credentials) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}/ws/{}", self.base.path().trim_end_matches('/'), credentials.user_id);
        url.set_path(&path);
        url.query_pairs_mut().append_pair("token", &credentials.token);
        url
    }
}

/// Backoff policy for re-opening a dropped channel
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the given (0-indexed) attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
    }
}

struct LinkSlot {
    credentials: Credentials,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

struct ChannelInner {
    endpoint: ChannelEndpoint,
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    registry: ListenerRegistry,
    state: watch::Sender<ChannelState>,
    link: Mutex<Option<LinkSlot>>,
    connecting: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl ChannelInner {
    /// Publish `state` if `generation` still owns the link.
    fn set_state_if(&self, generation: u64, state: ChannelState) -> bool {
        let slot = self.link.lock();
        match slot.as_ref() {
            Some(link) if link.generation == generation => {
                self.state.send_replace(state);
                true
            }
            _ => false,
        }
    }

    fn install(&self, generation: u64, outgoing: mpsc::UnboundedSender<String>) -> bool {
        let mut slot = self.link.lock();
        match slot.as_mut() {
            Some(link) if link.generation == generation => {
                link.outgoing = Some(outgoing);
                self.state.send_replace(ChannelState::Open);
                info!(user_id = %link.credentials.user_id, "Channel open");
                true
            }
            _ => false,
        }
    }

    fn link_lost(&self, generation: u64, reason: &str) {
        let mut slot = self.link.lock();
        if let Some(link) = slot.as_mut().filter(|link| link.generation == generation) {
            link.outgoing = None;
            self.state.send_replace(ChannelState::Closed);
            warn!(user_id = %link.credentials.user_id, reason, "Channel closed");
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancel.cancel();
        }
    }
}

enum PumpEnd {
    Cancelled,
    Lost(String),
}

/// Owner of the realtime connection for one signed-in user
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
}

impl ChannelManager {
    pub fn new(endpoint: ChannelEndpoint, connector: Arc<dyn Connector>, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                endpoint,
                connector,
                reconnect,
                registry: ListenerRegistry::new(),
                state,
                link: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Manager backed by the WebSocket transport
    pub fn websocket(endpoint: ChannelEndpoint, reconnect: ReconnectConfig) -> Self {
        Self::new(endpoint, Arc::new(WsConnector::default()), reconnect)
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    /// Shorthand for `registry().subscribe(..)`
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(callback)
    }

    /// Credentials of the current link, if any
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.link.lock().as_ref().map(|link| link.credentials.clone())
    }

    /// Open the channel for `credentials`.
    ///
    /// A no-op when a link for the same credentials is already connecting or
    /// open. Any other existing link is closed first. Returns the outcome of the
    /// first attempt; with reconnection enabled, a failed attempt keeps
    /// retrying in the background.
    pub async fn connect(&self, credentials: &Credentials) -> Result<(), ChannelError> {
        let _connecting = self.inner.connecting.lock().await;

        {
            let slot = self.inner.link.lock();
            let live = matches!(self.state(), ChannelState::Connecting | ChannelState::Open);
            if let Some(link) = slot.as_ref() {
                if live && link.credentials == *credentials {
                    debug!(user_id = %credentials.user_id, "Channel already connected");
                    return Ok(());
                }
            }
        }

        self.close_link("replaced");

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *self.inner.link.lock() = Some(LinkSlot {
            credentials: credentials.clone(),
            generation,
            outgoing: None,
            cancel: cancel.clone(),
        });
        self.inner.state.send_replace(ChannelState::Connecting);
        info!(user_id = %credentials.user_id, "Connecting channel");

        let url = self.inner.endpoint.url_for(credentials);
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connector),
            self.inner.registry.clone(),
            self.inner.reconnect.clone(),
            url,
            generation,
            cancel,
            first_tx,
        ));

        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Queue a message for the server.
    ///
    /// Fire-and-forget: returns false (and logs) when the message was dropped
    /// because the channel is not open or the message is invalid. Nothing is
    /// queued for later delivery.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let state = self.state();
        if state != ChannelState::Open {
            warn!(kind = message.kind(), %state, "Channel not open, dropping message");
            return false;
        }

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Refusing to send invalid message");
                return false;
            }
        };

        let slot = self.inner.link.lock();
        let Some(outgoing) = slot.as_ref().and_then(|link| link.outgoing.as_ref()) else {
            warn!(kind = message.kind(), "Channel has no writer, dropping message");
            return false;
        };
        if outgoing.send(frame).is_err() {
            warn!(kind = message.kind(), "Channel writer gone, dropping message");
            return false;
        }

        debug!(kind = message.kind(), "Sent message");
        true
    }

    /// Close the channel, drop every listener and release the connection.
    pub fn teardown(&self) {
        self.close_link("teardown");
        self.inner.state.send_replace(ChannelState::Disconnected);
        self.inner.registry.clear();
        info!("Channel torn down");
    }

    fn close_link(&self, reason: &str) {
        let previous = self.inner.link.lock().take();
        if let Some(link) = previous {
            link.cancel.cancel();
            info!(user_id = %link.credentials.user_id, reason, "Closing channel");
        }
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("state", &self.state())
            .field("listeners", &self.inner.registry.len())
            .finish()
    }
}

/// Connect, pump frames, and reconnect with backoff until cancelled.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    inner: Weak<ChannelInner>,
    connector: Arc<dyn Connector>,
    registry: ListenerRegistry,
    policy: ReconnectConfig,
    url: Url,
    generation: u64,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut first = Some(first);
    let mut attempt: u32 = 0;

    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = connector.open(&url) => result,
        };

        match opened {
            Ok(Link { outgoing, incoming }) => {
                let installed = inner
                    .upgrade()
                    .map(|inner| inner.install(generation, outgoing))
                    .unwrap_or(false);
                if !installed {
                    return;
                }
                attempt = 0;
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                match pump(&registry, incoming, &cancel).await {
                    PumpEnd::Cancelled => return,
                    PumpEnd::Lost(reason) => match inner.upgrade() {
                        Some(inner) => inner.link_lost(generation, &reason),
                        None => return,
                    },
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "Channel connection failed");
                match inner.upgrade() {
                    Some(inner) => {
                        if !inner.set_state_if(generation, ChannelState::Closed) {
                            return;
                        }
                    }
                    None => return,
                }
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e));
                }
            }
        }

        if !policy.enabled {
            return;
        }
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(attempts = attempt, "Giving up on channel reconnection");
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting channel");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match inner.upgrade() {
            Some(inner) if inner.set_state_if(generation, ChannelState::Connecting) => {}
            _ => return,
        }
    }
}

/// Dispatch inbound frames until the link ends or the channel is cancelled.
async fn pump(
    registry: &ListenerRegistry,
    mut incoming: mpsc::UnboundedReceiver<LinkEvent>,
    cancel: &CancellationToken,
) -> PumpEnd {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpEnd::Cancelled,
            event = incoming.recv() => event,
        };

        match event {
            Some(LinkEvent::Frame(text)) => match InboundMessage::from_frame(&text) {
                Ok(message) => {
                    debug!(kind = message.kind(), "Inbound message");
                    registry.dispatch(&message);
                }
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            },
            Some(LinkEvent::Closed(reason)) => {
                return PumpEnd::Lost(reason.unwrap_or_else(|| "closed by server".to_string()))
            }
            Some(LinkEvent::Error(e)) => return PumpEnd::Lost(e),
            None => return PumpEnd::Lost("link dropped".to_string()),
        }
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid channel endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection attempt cancelled")]
    Cancelled,
}
