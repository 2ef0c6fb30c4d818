//! Fake Call Module
//!
//! Plays a synthetic incoming call: `Ringing → Active → Ended`. Once
//! answered, audio segments are fetched and played one at a time with a
//! pause between them, until the conversation runs out or the call is ended.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiError;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// One playable piece of the conversation
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub conversation: u32,
    pub index: u32,
    pub total: Option<u32>,
    pub audio: Vec<u8>,
}

/// Where segments come from
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// `Ok(None)` means the conversation is over.
    async fn fetch_segment(&self, segment: u32, conversation: Option<u32>) -> Result<Option<AudioSegment>, ApiError>;
}

/// Where segments are played
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a segment, resolving when playback finishes.
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()>;

    /// Stop any playback in progress.
    async fn stop(&self);
}

/// Writes each segment to disk instead of playing it
pub struct SpoolAudioSink {
    dir: PathBuf,
}

impl SpoolAudioSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AudioSink for SpoolAudioSink {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("conversation-{}-segment-{}.mp3", segment.conversation, segment.index));
        tokio::fs::write(&path, &segment.audio).await?;
        info!(path = %path.display(), bytes = segment.audio.len(), "Spooled call segment");
        Ok(())
    }

    async fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    Ringing,
    Active,
    Ended,
}

#[derive(Default)]
struct CallState {
    phase: CallPhase,
    liveness: Option<CancellationToken>,
    answered_at: Option<Instant>,
}

struct CallInner {
    source: Arc<dyn SegmentSource>,
    sink: Arc<dyn AudioSink>,
    pause: Duration,
    state: Mutex<CallState>,
    played: AtomicU32,
}

/// Synthetic call sequencer
#[derive(Clone)]
pub struct FakeCallController {
    inner: Arc<CallInner>,
}

impl FakeCallController {
    pub fn new(source: Arc<dyn SegmentSource>, sink: Arc<dyn AudioSink>, pause: Duration) -> Self {
        Self {
            inner: Arc::new(CallInner {
                source,
                sink,
                pause,
                state: Mutex::new(CallState::default()),
                played: AtomicU32::new(0),
            }),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.state.lock().phase
    }

    /// Time since the call was answered
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.inner.state.lock();
        match state.phase {
            CallPhase::Active => state.answered_at.map(|at| at.elapsed()),
            _ => None,
        }
    }

    pub fn segments_played(&self) -> u32 {
        self.inner.played.load(Ordering::Acquire)
    }

    /// Start ringing. Returns false if a call is already ringing or active.
    pub fn ring(&self) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, CallPhase::Ringing | CallPhase::Active) {
            return false;
        }
        state.phase = CallPhase::Ringing;
        state.answered_at = None;
        self.inner.played.store(0, Ordering::Release);
        info!("Fake call ringing");
        true
    }

    /// Answer a ringing call and start the conversation.
    pub fn answer(&self) -> Result<(), CallError> {
        let mut state = self.inner.state.lock();
        if state.phase != CallPhase::Ringing {
            return Err(CallError::NotRinging);
        }

        let liveness = CancellationToken::new();
        state.phase = CallPhase::Active;
        state.answered_at = Some(Instant::now());
        state.liveness = Some(liveness.clone());
        tokio::spawn(play_conversation(Arc::clone(&self.inner), liveness));
        info!("Fake call answered");
        Ok(())
    }

    /// Reject a ringing call.
    pub fn decline(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.phase != CallPhase::Ringing {
            return false;
        }
        state.phase = CallPhase::Idle;
        info!("Fake call declined");
        true
    }

    /// Hang up an active call.
    pub async fn end_call(&self) -> bool {
        let liveness = {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::Active {
                return false;
            }
            state.phase = CallPhase::Ended;
            state.liveness.take()
        };

        if let Some(liveness) = liveness {
            liveness.cancel();
        }
        self.inner.sink.stop().await;
        info!(segments = self.segments_played(), "Fake call ended");
        true
    }
}

/// Mark the call ended if `liveness` still owns it.
fn finish(inner: &CallInner, liveness: &CancellationToken) {
    let mut state = inner.state.lock();
    if state.phase == CallPhase::Active && !liveness.is_cancelled() {
        state.phase = CallPhase::Ended;
        state.liveness = None;
    }
}

async fn play_conversation(inner: Arc<CallInner>, liveness: CancellationToken) {
    let mut segment: u32 = 0;
    let mut conversation: Option<u32> = None;
    let mut failures: u32 = 0;

    while !liveness.is_cancelled() {
        match inner.source.fetch_segment(segment, conversation).await {
            Ok(Some(audio)) => {
                failures = 0;
                if liveness.is_cancelled() {
                    break;
                }
                conversation = Some(audio.conversation);
                if let Err(e) = inner.sink.play(&audio).await {
                    warn!(segment, error = %e, "Failed to play call segment");
                }
                inner.played.fetch_add(1, Ordering::AcqRel);
                segment += 1;
            }
            Ok(None) => {
                info!(segments = segment, "Fake call conversation finished");
                finish(&inner, &liveness);
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(segment, failures, error = %e, "Failed to fetch call segment");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    finish(&inner, &liveness);
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = liveness.cancelled() => break,
            _ = tokio::time::sleep(inner.pause) => {}
        }
    }

    debug!("Fake call playback stopped");
}

/// Fake call errors
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("No call is ringing")]
    NotRinging,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSource {
        total: u32,
        fail_at: Option<u32>,
        requests: Mutex<Vec<(u32, Option<u32>)>>,
    }

    impl ScriptedSource {
        fn new(total: u32) -> Self {
            Self {
                total,
                fail_at: None,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SegmentSource for ScriptedSource {
        async fn fetch_segment(&self, segment: u32, conversation: Option<u32>) -> Result<Option<AudioSegment>, ApiError> {
            self.requests.lock().push((segment, conversation));
            if self.fail_at == Some(segment) {
                return Err(ApiError::Network("offline".into()));
            }
            if segment >= self.total {
                return Ok(None);
            }
            Ok(Some(AudioSegment {
                conversation: 2,
                index: segment,
                total: Some(self.total),
                audio: vec![segment as u8; 4],
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<u32>>,
        stops: AtomicU32,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
            self.played.lock().push(segment.index);
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller(source: Arc<ScriptedSource>, sink: Arc<RecordingSink>) -> FakeCallController {
        FakeCallController::new(source, sink, Duration::from_secs(3))
    }

    #[tokio::test(start_paused = true)]
    async fn plays_whole_conversation_then_ends() {
        let source = Arc::new(ScriptedSource::new(3));
        let sink = Arc::new(RecordingSink::default());
        let call = controller(Arc::clone(&source), Arc::clone(&sink));

        assert!(call.ring());
        call.answer().unwrap();
        assert_eq!(call.phase(), CallPhase::Active);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(*sink.played.lock(), vec![0, 1, 2]);
        assert_eq!(call.phase(), CallPhase::Ended);
        assert_eq!(call.segments_played(), 3);
        // First request picks the conversation, later ones pin it.
        let requests = source.requests.lock().clone();
        assert_eq!(requests, vec![(0, None), (1, Some(2)), (2, Some(2)), (3, Some(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_the_call_stops_playback() {
        let source = Arc::new(ScriptedSource::new(10));
        let sink = Arc::new(RecordingSink::default());
        let call = controller(Arc::clone(&source), Arc::clone(&sink));

        call.ring();
        call.answer().unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(call.end_call().await);
        assert!(!call.end_call().await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*sink.played.lock(), vec![0, 1]);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
        assert_eq!(call.phase(), CallPhase::Ended);
        assert!(call.elapsed().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_fetch_failures_end_the_call() {
        let source = Arc::new(ScriptedSource {
            fail_at: Some(1),
            ..ScriptedSource::new(5)
        });
        let sink = Arc::new(RecordingSink::default());
        let call = controller(Arc::clone(&source), Arc::clone(&sink));

        call.ring();
        call.answer().unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(*sink.played.lock(), vec![0]);
        assert_eq!(call.phase(), CallPhase::Ended);
        let retries = source.requests.lock().iter().filter(|(s, _)| *s == 1).count();
        assert_eq!(retries, MAX_CONSECUTIVE_FAILURES as usize);
    }

    #[tokio::test]
    async fn answer_and_decline_require_ringing() {
        let call = controller(Arc::new(ScriptedSource::new(1)), Arc::new(RecordingSink::default()));

        assert!(matches!(call.answer(), Err(CallError::NotRinging)));
        assert!(!call.decline());

        assert!(call.ring());
        assert!(!call.ring());
        assert!(call.decline());
        assert_eq!(call.phase(), CallPhase::Idle);
    }
}
