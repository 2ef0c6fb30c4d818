//! Emergency Sharing Session Module
//!
//! Client-side state machine for one emergency-sharing episode:
//! `Idle → Requesting → Active → Ending → Idle`.
//!
//! While active, a polling task reads a high-accuracy fix once per interval
//! and sends it as a `location_update`. Cancellation is cooperative: the
//! task checks a liveness token before every send and while waiting for the
//! next tick, so a fix still in flight at stop time completes and is
//! discarded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelManager;
use crate::protocol::{InboundMessage, OutboundMessage, SessionId};
use crate::registry::Subscription;
use crate::telemetry::{Accuracy, LocationError, LocationProvider, PermissionStatus, PositionFix};

/// Phase of the sharing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Requesting,
    Active,
    Ending,
}

/// State of one start attempt, shared with its polling task and ack listener
struct SharingRun {
    liveness: CancellationToken,
    session_id: Mutex<Option<SessionId>>,
    start_sent: AtomicBool,
}

impl SharingRun {
    fn new() -> Self {
        Self {
            liveness: CancellationToken::new(),
            session_id: Mutex::new(None),
            start_sent: AtomicBool::new(false),
        }
    }

    fn is_live(&self) -> bool {
        !self.liveness.is_cancelled()
    }

    fn acknowledge(&self, session_id: SessionId) {
        let previous = self.session_id.lock().replace(session_id);
        match previous {
            Some(previous) if previous != session_id => {
                warn!(%previous, %session_id, "Server reassigned session id")
            }
            Some(_) => {}
            None => info!(%session_id, "Session acknowledged"),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    phase: SessionPhase,
    run: Option<Arc<SharingRun>>,
    poller: Option<JoinHandle<()>>,
    ack: Option<Subscription>,
}

struct ControllerInner {
    channel: ChannelManager,
    location: Arc<dyn LocationProvider>,
    poll_interval: Duration,
    state: Mutex<ControllerState>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl ControllerInner {
    fn set_phase(&self, state: &mut ControllerState, phase: SessionPhase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Return to Idle if `run` is still the current attempt.
    fn abandon(&self, run: &Arc<SharingRun>) {
        let mut state = self.state.lock();
        if state.run.as_ref().is_some_and(|current| Arc::ptr_eq(current, run)) {
            run.liveness.cancel();
            state.run = None;
            self.set_phase(&mut state, SessionPhase::Idle);
        }
    }
}

/// Starts and stops emergency sharing over the realtime channel
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(channel: ChannelManager, location: Arc<dyn LocationProvider>, poll_interval: Duration) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            inner: Arc::new(ControllerInner {
                channel,
                location,
                poll_interval,
                state: Mutex::new(ControllerState::default()),
                phase_tx,
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Server-assigned id of the current session, once acknowledged
    pub fn session_id(&self) -> Option<SessionId> {
        let state = self.inner.state.lock();
        state.run.as_ref().and_then(|run| *run.session_id.lock())
    }

    pub fn is_sharing(&self) -> bool {
        self.phase() == SessionPhase::Active
    }

    /// Begin sharing: check permission, take an initial fix, announce the
    /// session with an emergency alert, then poll.
    ///
    /// A no-op unless Idle. If `stop_sharing` runs before the initial fix
    /// resolves, the attempt is abandoned and this returns `Ok(())`.
    pub async fn start_sharing(&self) -> Result<(), SharingError> {
        let run = {
            let mut state = self.inner.state.lock();
            if state.phase != SessionPhase::Idle {
                debug!(phase = ?state.phase, "Sharing already in progress");
                return Ok(());
            }
            let run = Arc::new(SharingRun::new());
            state.run = Some(Arc::clone(&run));
            self.inner.set_phase(&mut state, SessionPhase::Requesting);
            run
        };

        if self.inner.location.request_permission().await == PermissionStatus::Denied {
            warn!("Location permission denied");
            self.inner.abandon(&run);
            return Err(SharingError::PermissionDenied);
        }
        if !run.is_live() {
            debug!("Sharing stopped while requesting permission");
            return Ok(());
        }

        let fix = match self.inner.location.current_position(Accuracy::High).await {
            Ok(fix) => fix,
            Err(LocationError::PermissionDenied) => {
                self.inner.abandon(&run);
                return Err(SharingError::PermissionDenied);
            }
            Err(e) => {
                warn!(error = %e, "Initial position fix failed");
                self.inner.abandon(&run);
                return Err(SharingError::PositionUnavailable(e));
            }
        };

        let mut state = self.inner.state.lock();
        let current = state.run.as_ref().is_some_and(|current| Arc::ptr_eq(current, &run));
        if !run.is_live() || !current {
            debug!("Sharing stopped before the initial fix resolved");
            return Ok(());
        }

        // Listen before announcing so the acknowledgement cannot be missed.
        let ack_run = Arc::clone(&run);
        state.ack = Some(self.inner.channel.subscribe(move |message| {
            if let InboundMessage::SessionStarted { session_id } = message {
                if ack_run.is_live() {
                    ack_run.acknowledge(*session_id);
                }
            }
            Ok(())
        }));

        self.inner.channel.send(&OutboundMessage::StartSession);
        run.start_sent.store(true, Ordering::Release);
        self.inner.channel.send(&OutboundMessage::EmergencyAlert {
            lat: fix.latitude,
            lng: fix.longitude,
        });

        state.poller = Some(tokio::spawn(poll_locations(
            Arc::clone(&run),
            self.inner.channel.clone(),
            Arc::clone(&self.inner.location),
            self.inner.poll_interval,
        )));
        self.inner.set_phase(&mut state, SessionPhase::Active);
        info!(lat = fix.latitude, lng = fix.longitude, "Emergency sharing started");
        Ok(())
    }

    /// End sharing. Returns false when there was nothing to stop.
    ///
    /// Safe before the server acknowledged the session (the `end_session`
    /// carries a null id) and while the channel is down (the message is
    /// dropped with a warning).
    pub fn stop_sharing(&self) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, SessionPhase::Idle | SessionPhase::Ending) {
            debug!("No sharing session to stop");
            return false;
        }
        self.inner.set_phase(&mut state, SessionPhase::Ending);

        let run = state.run.take();
        let poller = state.poller.take();
        let ack = state.ack.take();

        if let Some(run) = &run {
            run.liveness.cancel();
            if run.start_sent.load(Ordering::Acquire) {
                let session_id = *run.session_id.lock();
                self.inner.channel.send(&OutboundMessage::EndSession { session_id });
                info!(session_id = ?session_id.map(|id| id.0), "Emergency sharing stopped");
            } else {
                info!("Sharing attempt abandoned before start");
            }
        }
        // Detach: the task exits on its own once it observes the token.
        drop(poller);
        if let Some(ack) = ack {
            ack.unsubscribe();
        }

        self.inner.set_phase(&mut state, SessionPhase::Idle);
        true
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("phase", &self.phase())
            .field("session_id", &self.session_id())
            .finish()
    }
}

fn location_update(fix: &PositionFix) -> OutboundMessage {
    OutboundMessage::LocationUpdate {
        lat: fix.latitude,
        lng: fix.longitude,
        accuracy: fix.accuracy,
    }
}

async fn poll_locations(
    run: Arc<SharingRun>,
    channel: ChannelManager,
    location: Arc<dyn LocationProvider>,
    interval: Duration,
) {
    let mut tick: u64 = 0;

    while run.is_live() {
        tick += 1;
        match location.current_position(Accuracy::High).await {
            Ok(fix) => {
                if !run.is_live() {
                    debug!(tick, "Discarding fix that resolved after stop");
                    break;
                }
                channel.send(&location_update(&fix));
            }
            Err(e) => warn!(tick, error = %e, "Position fix failed, retrying next tick"),
        }

        tokio::select! {
            biased;
            _ = run.liveness.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(ticks = tick, "Location polling stopped");
}

/// Errors surfaced to the user when starting a session
#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Could not determine current position: {0}")]
    PositionUnavailable(LocationError),
}
