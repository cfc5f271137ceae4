use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::encode::EncodedFrame;
use super::error::AudioError;
use super::playback::{PlaybackBuffer, PlaybackScheduler};
use super::transport::{AgentTransport, TransportEvent, TransportHandle};
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Open => "Open",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
            SessionState::Errored => "Errored",
        };
        f.write_str(name)
    }
}

/// Publishes state transitions for one session generation.
///
/// Once the manager moves on to a newer generation every report from this
/// one is silently dropped.
#[derive(Clone)]
pub struct StateReporter {
    generation: u64,
    live_generation: Arc<AtomicU64>,
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateReporter {
    pub fn new(generation: u64, live_generation: Arc<AtomicU64>, tx: Arc<watch::Sender<SessionState>>) -> Self {
        Self { generation, live_generation, tx }
    }

    /// A reporter that is always live, for driving a controller on its own
    pub fn detached() -> (Self, watch::Receiver<SessionState>) {
        let (tx, rx) = watch::channel(SessionState::Idle);
        (Self::new(0, Arc::new(AtomicU64::new(0)), Arc::new(tx)), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live_generation.load(Ordering::Acquire) == self.generation
    }

    /// Returns false when the report was dropped as stale
    pub fn report(&self, state: SessionState) -> bool {
        if !self.is_live() {
            debug!("Dropping stale state report {} from generation {}", state, self.generation);
            return false;
        }
        self.tx.send_replace(state);
        true
    }
}

/// What the session actor should do after an inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Setup acknowledged, the session is now `Open`
    Opened,
    Scheduled(PlaybackBuffer),
    /// Malformed chunk, already discarded
    Dropped(AudioError),
    /// Barge-in handled, with the number of buffers discarded
    Interrupted(usize),
    TurnComplete,
    /// Nothing to do in the current state
    Ignored,
    /// The remote side closed the session
    Ended,
    Failed(AudioError),
}

/// Connection lifecycle state machine.
///
/// `Idle -> Connecting -> Open -> Closing -> Closed`, with `Errored` reachable
/// from any live state on a transport failure.
pub struct StreamingSessionController {
    session_id: String,
    state: SessionState,
    reporter: StateReporter,
    handle: Option<Box<dyn TransportHandle>>,
    frames_sent: u64,
}

impl StreamingSessionController {
    pub fn new(session_id: impl Into<String>, reporter: StateReporter) -> Self {
        Self {
            session_id: session_id.into(),
            state: SessionState::Idle,
            reporter,
            handle: None,
            frames_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!("[{}] Session {} -> {}", self.session_id, self.state, next);
        self.state = next;
        self.reporter.report(next);
    }

    /// Start connecting to the agent.
    ///
    /// On success the controller is `Connecting` and the returned receiver
    /// delivers inbound events; the session becomes `Open` when the setup ack
    /// arrives through [`StreamingSessionController::handle_event`]. Returns
    /// `Ok(None)` if `cancel` fired first, in which case a connection that
    /// completes later is closed straight away.
    pub async fn open(
        &mut self,
        transport: Arc<dyn AgentTransport>,
        config: SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<mpsc::Receiver<TransportEvent>>, AudioError> {
        if matches!(self.state, SessionState::Connecting | SessionState::Open | SessionState::Closing) {
            return Err(AudioError::invalid_state(self.state, "session already active"));
        }

        self.frames_sent = 0;
        self.transition(SessionState::Connecting);

        let mut pending = tokio::spawn(async move { transport.open(&config).await });

        tokio::select! {
            joined = &mut pending => {
                let opened = joined
                    .map_err(|e| AudioError::transport_open(format!("open task failed: {}", e)))
                    .and_then(|result| result);

                match opened {
                    Ok(connection) => {
                        debug!("[{}] Transport connected, waiting for setup ack", self.session_id);
                        self.handle = Some(connection.handle);
                        Ok(Some(connection.events))
                    }
                    Err(e) => {
                        error!("[{}] Failed to open transport: {}", self.session_id, e);
                        self.transition(SessionState::Errored);
                        Err(match e {
                            AudioError::TransportOpen { .. } => e,
                            other => AudioError::transport_open(other.to_string()),
                        })
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("[{}] Open cancelled before the transport connected", self.session_id);
                let session_id = self.session_id.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(mut connection)) = pending.await {
                        debug!("[{}] Closing connection that completed after teardown", session_id);
                        if let Err(e) = connection.handle.close().await {
                            warn!("[{}] Failed to close late connection: {}", session_id, e);
                        }
                    }
                });
                Ok(None)
            }
        }
    }

    /// Forward one frame while `Open`. Returns false when the frame was not
    /// sent because the session is in any other state.
    ///
    /// A send error leaves the state alone so the caller can release its
    /// inputs first; it then calls [`StreamingSessionController::fail`].
    pub async fn send_frame(&mut self, frame: &EncodedFrame) -> Result<bool, AudioError> {
        if self.state != SessionState::Open {
            return Ok(false);
        }
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Ok(false),
        };

        match handle.send(frame).await {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(true)
            }
            Err(e) => {
                error!("[{}] Failed to send frame {}: {}", self.session_id, frame.sequence, e);
                Err(match e {
                    AudioError::Transport { .. } => e,
                    other => AudioError::transport(other.to_string()),
                })
            }
        }
    }

    /// Record a fatal failure reported by the caller
    pub fn fail(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Open | SessionState::Closing) {
            self.transition(SessionState::Errored);
        }
    }

    /// Dispatch one inbound event. Audio goes straight to the scheduler so
    /// chunks are placed in exactly the order they arrived.
    pub fn handle_event(&mut self, event: TransportEvent, scheduler: &mut PlaybackScheduler) -> InboundOutcome {
        match event {
            TransportEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.transition(SessionState::Open);
                    InboundOutcome::Opened
                } else {
                    debug!("[{}] Ignoring setup ack in state {}", self.session_id, self.state);
                    InboundOutcome::Ignored
                }
            }
            TransportEvent::AudioChunk(chunk) => {
                if self.state != SessionState::Open {
                    debug!("[{}] Ignoring {} byte chunk in state {}", self.session_id, chunk.len(), self.state);
                    return InboundOutcome::Ignored;
                }
                match scheduler.enqueue_chunk(&chunk) {
                    Ok(buffer) => InboundOutcome::Scheduled(buffer),
                    Err(e @ AudioError::Decode { .. }) => InboundOutcome::Dropped(e),
                    Err(e) => {
                        error!("[{}] Playback failed: {}", self.session_id, e);
                        self.transition(SessionState::Errored);
                        InboundOutcome::Failed(e)
                    }
                }
            }
            TransportEvent::Interrupted => {
                if self.state != SessionState::Open {
                    return InboundOutcome::Ignored;
                }
                InboundOutcome::Interrupted(scheduler.interrupt())
            }
            TransportEvent::TurnComplete => {
                debug!("[{}] Agent turn complete", self.session_id);
                InboundOutcome::TurnComplete
            }
            TransportEvent::Closed { reason } => match self.state {
                SessionState::Connecting => {
                    let message = format!(
                        "connection closed before setup completed: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    warn!("[{}] {}", self.session_id, message);
                    self.transition(SessionState::Errored);
                    InboundOutcome::Failed(AudioError::transport_open(message))
                }
                SessionState::Open => {
                    info!("[{}] Remote closed the session: {}", self.session_id, reason.as_deref().unwrap_or("no reason given"));
                    self.transition(SessionState::Closing);
                    InboundOutcome::Ended
                }
                _ => InboundOutcome::Ignored,
            },
            TransportEvent::Error(message) => match self.state {
                SessionState::Connecting => {
                    self.transition(SessionState::Errored);
                    InboundOutcome::Failed(AudioError::transport_open(message))
                }
                SessionState::Open | SessionState::Closing => {
                    self.transition(SessionState::Errored);
                    InboundOutcome::Failed(AudioError::transport(message))
                }
                _ => InboundOutcome::Ignored,
            },
        }
    }

    /// Graceful close. Safe in every state and safe to repeat; a failing
    /// close on the transport is logged and the session still ends `Closed`.
    pub async fn close(&mut self) {
        if self.state == SessionState::Idle && self.handle.is_none() {
            return;
        }
        if self.state == SessionState::Closed && self.handle.is_none() {
            return;
        }

        self.transition(SessionState::Closing);
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("[{}] Transport close failed: {}", self.session_id, e);
            }
        }
        self.transition(SessionState::Closed);
        info!("[{}] Session closed after {} frames sent", self.session_id, self.frames_sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::activity::ActivityState;
    use crate::audio::device::OutputHandle;
    use crate::audio::encode::{encode_pcm16, PcmFormat};
    use crate::audio::tests::test_utils::{AudioTestGenerator, FakeOutputDevice, FakeTransport};

    fn frame(sequence: u64) -> EncodedFrame {
        EncodedFrame {
            data: encode_pcm16(&[0.1; 8]),
            format: PcmFormat::mono(16000),
            sequence,
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<FakeOutputDevice>) {
        let output = FakeOutputDevice::new();
        let (mut scheduler, _finished) = PlaybackScheduler::new(24000, Arc::new(ActivityState::new()));
        scheduler.attach_output(output.clone(), OutputHandle::new(1));
        (scheduler, output)
    }

    async fn open_controller(transport: Arc<FakeTransport>) -> (StreamingSessionController, mpsc::Receiver<TransportEvent>, watch::Receiver<SessionState>) {
        let (reporter, states) = StateReporter::detached();
        let mut controller = StreamingSessionController::new("test", reporter);
        let events = controller
            .open(transport, SessionConfig::default(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        (controller, events, states)
    }

    #[tokio::test]
    async fn test_open_waits_for_ack() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, states) = open_controller(transport.clone()).await;
        let (mut scheduler, _output) = scheduler();

        assert_eq!(controller.state(), SessionState::Connecting);
        assert_eq!(*states.borrow(), SessionState::Connecting);

        let ack = events.recv().await.unwrap();
        assert_eq!(controller.handle_event(ack, &mut scheduler), InboundOutcome::Opened);
        assert_eq!(controller.state(), SessionState::Open);
        assert_eq!(*states.borrow(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_open_rejected_while_active() {
        let transport = FakeTransport::new();
        let (mut controller, _events, _states) = open_controller(transport.clone()).await;

        let second = controller.open(transport.clone(), SessionConfig::default(), &CancellationToken::new()).await;
        assert!(matches!(second, Err(AudioError::SessionState { .. })));
        assert_eq!(controller.state(), SessionState::Connecting);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order_only_while_open() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, _states) = open_controller(transport.clone()).await;
        let (mut scheduler, _output) = scheduler();

        assert!(!controller.send_frame(&frame(0)).await.unwrap());

        let ack = events.recv().await.unwrap();
        controller.handle_event(ack, &mut scheduler);
        for sequence in 1..=5 {
            assert!(controller.send_frame(&frame(sequence)).await.unwrap());
        }

        let sent: Vec<u64> = transport.sent_frames().iter().map(|f| f.sequence).collect();
        assert_eq!(sent, vec![1, 2, 3, 4, 5]);
        assert_eq!(controller.frames_sent(), 5);
    }

    #[tokio::test]
    async fn test_inbound_audio_and_interruption() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, _states) = open_controller(transport.clone()).await;
        let (mut scheduler, output) = scheduler();
        controller.handle_event(events.recv().await.unwrap(), &mut scheduler);

        let chunk = AudioTestGenerator::pcm_chunk(1.0, 24000);
        let outcome = controller.handle_event(TransportEvent::AudioChunk(chunk), &mut scheduler);
        assert!(matches!(outcome, InboundOutcome::Scheduled(ref b) if b.start_at == 0.0 && b.duration == 1.0));

        let outcome = controller.handle_event(TransportEvent::AudioChunk(bytes::Bytes::from_static(&[1, 2, 3])), &mut scheduler);
        assert!(matches!(outcome, InboundOutcome::Dropped(AudioError::Decode { .. })));
        assert_eq!(controller.state(), SessionState::Open);

        output.set_time(0.3);
        assert_eq!(controller.handle_event(TransportEvent::Interrupted, &mut scheduler), InboundOutcome::Interrupted(1));
        assert!(scheduler.is_idle());
        assert_eq!(controller.handle_event(TransportEvent::TurnComplete, &mut scheduler), InboundOutcome::TurnComplete);
    }

    #[tokio::test]
    async fn test_audio_before_open_is_ignored() {
        let transport = FakeTransport::silent();
        let (mut controller, _events, _states) = open_controller(transport).await;
        let (mut scheduler, output) = scheduler();

        let chunk = AudioTestGenerator::pcm_chunk(0.5, 24000);
        assert_eq!(controller.handle_event(TransportEvent::AudioChunk(chunk), &mut scheduler), InboundOutcome::Ignored);
        assert!(output.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_then_local_close() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, states) = open_controller(transport.clone()).await;
        let (mut scheduler, _output) = scheduler();
        controller.handle_event(events.recv().await.unwrap(), &mut scheduler);

        let outcome = controller.handle_event(TransportEvent::Closed { reason: Some("bye".into()) }, &mut scheduler);
        assert_eq!(outcome, InboundOutcome::Ended);
        assert_eq!(controller.state(), SessionState::Closing);

        controller.close().await;
        controller.close().await;
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(*states.borrow(), SessionState::Closed);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_error_while_connecting_is_an_open_failure() {
        let transport = FakeTransport::silent();
        let (mut controller, _events, states) = open_controller(transport).await;
        let (mut scheduler, _output) = scheduler();

        let outcome = controller.handle_event(TransportEvent::Error("handshake rejected".into()), &mut scheduler);
        assert!(matches!(outcome, InboundOutcome::Failed(AudioError::TransportOpen { .. })));
        assert_eq!(*states.borrow(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_error_while_open_is_a_transport_failure() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, _states) = open_controller(transport).await;
        let (mut scheduler, _output) = scheduler();
        controller.handle_event(events.recv().await.unwrap(), &mut scheduler);

        let outcome = controller.handle_event(TransportEvent::Error("reset by peer".into()), &mut scheduler);
        assert!(matches!(outcome, InboundOutcome::Failed(AudioError::Transport { .. })));
        assert_eq!(controller.state(), SessionState::Errored);

        controller.close().await;
        assert_eq!(controller.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_failure_moves_to_errored() {
        let transport = FakeTransport::failing(AudioError::transport_open("connection refused"));
        let (reporter, states) = StateReporter::detached();
        let mut controller = StreamingSessionController::new("test", reporter);

        let result = controller.open(transport, SessionConfig::default(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AudioError::TransportOpen { .. })));
        assert_eq!(*states.borrow(), SessionState::Errored);
        assert!(!controller.has_handle());
    }

    #[tokio::test]
    async fn test_send_failure_errors_once_caller_fails_session() {
        let transport = FakeTransport::new();
        let (mut controller, mut events, _states) = open_controller(transport.clone()).await;
        let (mut scheduler, _output) = scheduler();
        controller.handle_event(events.recv().await.unwrap(), &mut scheduler);

        transport.fail_sends();
        let result = controller.send_frame(&frame(0)).await;
        assert!(matches!(result, Err(AudioError::Transport { .. })));
        assert_eq!(controller.state(), SessionState::Open);

        controller.fail();
        assert_eq!(controller.state(), SessionState::Errored);
        controller.fail();
        assert_eq!(controller.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_close_before_open_stays_idle() {
        let (reporter, states) = StateReporter::detached();
        let mut controller = StreamingSessionController::new("test", reporter);
        controller.close().await;
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(*states.borrow(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_open_closes_late_connection() {
        let transport = FakeTransport::with_open_delay(std::time::Duration::from_millis(50));
        let (reporter, _states) = StateReporter::detached();
        let mut controller = StreamingSessionController::new("test", reporter);
        let token = CancellationToken::new();
        token.cancel();

        let result = controller.open(transport.clone(), SessionConfig::default(), &token).await.unwrap();
        assert!(result.is_none());

        controller.close().await;
        assert_eq!(controller.state(), SessionState::Closed);

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_stale_reporter_is_ignored() {
        let (tx, rx) = watch::channel(SessionState::Idle);
        let live = Arc::new(AtomicU64::new(1));
        let old = StateReporter::new(1, live.clone(), Arc::new(tx));

        assert!(old.report(SessionState::Connecting));
        live.store(2, Ordering::Release);
        assert!(!old.report(SessionState::Errored));
        assert_eq!(*rx.borrow(), SessionState::Connecting);
    }
}
