use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::activity::{ActivityDetector, ActivitySnapshot, ActivityState};
use super::capture::AudioCaptureStage;
use super::device::{BufferId, CaptureDevice, OutputDevice};
use super::error::{create_error_context, AudioError, ErrorHandler, ErrorRecoveryAction};
use super::playback::PlaybackScheduler;
use super::session::{InboundOutcome, SessionState, StateReporter, StreamingSessionController};
use super::transport::{AgentTransport, TransportEvent};
use crate::config::SessionConfig;

/// Counters for the current (or most recent) session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
}

/// How a successful `start_session` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session is `Open` and streaming in both directions
    Open,
    /// `stop_session` ran before the session finished opening
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
enum EndReason {
    Stopped,
    RemoteClosed,
    Failed(AudioError),
}

/// Cancellation handle for one session generation
struct SessionGuard {
    token: CancellationToken,
    generation: u64,
}

impl SessionGuard {
    fn new(generation: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            generation,
        }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

struct RunningSession {
    guard: SessionGuard,
    task: JoinHandle<()>,
    session_id: String,
}

/// State visible from outside the session actor
struct SessionShared {
    state_tx: Arc<watch::Sender<SessionState>>,
    generation: Arc<AtomicU64>,
    activity: Arc<ActivityState>,
    last_error: parking_lot::Mutex<Option<AudioError>>,
    stats: parking_lot::Mutex<SessionStats>,
}

/// Sole owner of every live resource in a conversation.
///
/// Each `start_session` spawns a session actor that owns the capture stage,
/// the controller and the playback scheduler for that session. Every way a
/// session can end (explicit stop, remote close, fatal error) runs the same
/// teardown before the manager returns to `Idle`.
pub struct ResourceLifecycleManager {
    config: SessionConfig,
    capture_device: Arc<dyn CaptureDevice>,
    output_device: Arc<dyn OutputDevice>,
    transport: Arc<dyn AgentTransport>,
    shared: Arc<SessionShared>,
    error_handler: Arc<ErrorHandler>,
    running: Mutex<Option<RunningSession>>,
}

impl ResourceLifecycleManager {
    pub fn new(
        config: SessionConfig,
        capture_device: Arc<dyn CaptureDevice>,
        output_device: Arc<dyn OutputDevice>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            capture_device,
            output_device,
            transport,
            shared: Arc::new(SessionShared {
                state_tx: Arc::new(state_tx),
                generation: Arc::new(AtomicU64::new(0)),
                activity: Arc::new(ActivityState::new()),
                last_error: parking_lot::Mutex::new(None),
                stats: parking_lot::Mutex::new(SessionStats::default()),
            }),
            error_handler: Arc::new(ErrorHandler::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session and start streaming.
    ///
    /// Resolves once the session is `Open` with capture running, or once a
    /// failed or cancelled start has been fully torn down. A fatal failure
    /// is returned here and also kept as [`ResourceLifecycleManager::last_error`].
    pub async fn start_session(&self) -> Result<StartOutcome, AudioError> {
        let ready = {
            let mut running = self.running.lock().await;
            if let Some(session) = running.as_ref() {
                if !session.task.is_finished() {
                    return Err(AudioError::invalid_state(self.state(), "a session is already running"));
                }
            }
            if let Some(finished) = running.take() {
                if let Err(e) = finished.task.await {
                    warn!("[{}] Previous session task ended abnormally: {}", finished.session_id, e);
                }
            }

            self.config.validate()?;

            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let guard = SessionGuard::new(generation);
            let session_id = Uuid::new_v4().to_string();
            *self.shared.last_error.lock() = None;
            *self.shared.stats.lock() = SessionStats::default();

            info!("[{}] Starting session (generation {})", session_id, generation);

            let actor = SessionActor::new(self, &session_id, &guard);
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(actor.run(ready_tx));

            *running = Some(RunningSession { guard, task, session_id });
            ready_rx
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(AudioError::invalid_state(self.state(), "session task exited before it finished starting")),
        }
    }

    /// Stop the current session, whatever phase it is in, and wait until
    /// teardown has finished. Idempotent and never fails.
    pub async fn stop_session(&self) {
        let mut running = self.running.lock().await;
        if let Some(session) = running.take() {
            info!("[{}] Stopping session (generation {})", session.session_id, session.guard.generation);
            session.guard.cancel();
            if let Err(e) = session.task.await {
                error!("[{}] Session task ended abnormally: {}", session.session_id, e);
            }
        }

        self.shared.activity.reset();
        self.shared.state_tx.send_if_modified(|state| {
            if *state == SessionState::Idle {
                return false;
            }
            *state = SessionState::Idle;
            true
        });
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn activity(&self) -> ActivitySnapshot {
        self.shared.activity.snapshot()
    }

    pub fn last_error(&self) -> Option<AudioError> {
        self.shared.last_error.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.lock().clone()
    }

    pub fn error_handler(&self) -> Arc<ErrorHandler> {
        self.error_handler.clone()
    }

    /// True while a session task is alive, including while it is starting
    pub async fn is_running(&self) -> bool {
        let running = self.running.lock().await;
        running.as_ref().map(|s| !s.task.is_finished()).unwrap_or(false)
    }

    pub async fn session_id(&self) -> Option<String> {
        let running = self.running.lock().await;
        running.as_ref().map(|s| s.session_id.clone())
    }
}

/// One session's resources, owned by a single task
struct SessionActor {
    session_id: String,
    config: SessionConfig,
    token: CancellationToken,
    reporter: StateReporter,
    capture: AudioCaptureStage,
    controller: StreamingSessionController,
    scheduler: PlaybackScheduler,
    finished: mpsc::UnboundedReceiver<BufferId>,
    output_device: Arc<dyn OutputDevice>,
    transport: Arc<dyn AgentTransport>,
    shared: Arc<SessionShared>,
    error_handler: Arc<ErrorHandler>,
}

impl SessionActor {
    fn new(manager: &ResourceLifecycleManager, session_id: &str, guard: &SessionGuard) -> Self {
        let shared = manager.shared.clone();
        let config = manager.config.clone();
        let reporter = StateReporter::new(guard.generation, shared.generation.clone(), shared.state_tx.clone());

        let capture = AudioCaptureStage::new(
            manager.capture_device.clone(),
            ActivityDetector::new(config.activity_threshold),
            shared.activity.clone(),
        );
        let (scheduler, finished) = PlaybackScheduler::new(config.output_sample_rate, shared.activity.clone());

        Self {
            session_id: session_id.to_string(),
            controller: StreamingSessionController::new(session_id, reporter.clone()),
            config,
            token: guard.token(),
            reporter,
            capture,
            scheduler,
            finished,
            output_device: manager.output_device.clone(),
            transport: manager.transport.clone(),
            shared,
            error_handler: manager.error_handler.clone(),
        }
    }

    async fn run(mut self, ready: oneshot::Sender<Result<StartOutcome, AudioError>>) {
        let mut ready = Some(ready);

        let reason = match self.establish().await {
            Ok(Some(events)) => {
                info!("[{}] Session open, streaming", self.session_id);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(StartOutcome::Open));
                }
                self.pump(events).await
            }
            Ok(None) => EndReason::Stopped,
            Err(e) => EndReason::Failed(e),
        };

        if let EndReason::Failed(e) = &reason {
            let context = create_error_context("session", "run", Some(&self.session_id));
            self.error_handler.handle_error(e.clone(), context).await;
        }

        self.teardown().await;
        self.finish(&reason);

        if let Some(tx) = ready.take() {
            let _ = tx.send(match reason {
                EndReason::Failed(e) => Err(e),
                _ => Ok(StartOutcome::Cancelled),
            });
        }
    }

    /// Connect, wait for the ack, then acquire output and capture in that
    /// order. `Ok(None)` means the session was stopped part way.
    async fn establish(&mut self) -> Result<Option<mpsc::Receiver<TransportEvent>>, AudioError> {
        let token = self.token.clone();

        let mut events = match self.controller.open(self.transport.clone(), self.config.clone(), &token).await? {
            Some(events) => events,
            None => return Ok(None),
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(None),
                event = events.recv() => {
                    let event = event.unwrap_or_else(|| {
                        TransportEvent::Error("event stream ended before setup completed".to_string())
                    });
                    match self.controller.handle_event(event, &mut self.scheduler) {
                        InboundOutcome::Opened => break,
                        InboundOutcome::Failed(e) => return Err(e),
                        other => debug!("[{}] Event before setup completed: {:?}", self.session_id, other),
                    }
                }
            }
        }

        let output = self.output_device.clone();
        let output_rate = self.config.output_sample_rate;
        let mut pending = tokio::spawn(async move { output.acquire(output_rate).await });
        tokio::select! {
            joined = &mut pending => {
                let handle = joined.map_err(|e| AudioError::output_failed(format!("output acquisition task failed: {}", e)))??;
                self.scheduler.attach_output(self.output_device.clone(), handle);
            }
            _ = token.cancelled() => {
                let output = self.output_device.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = pending.await {
                        debug!("Releasing output acquisition {} that completed after teardown", handle.id());
                        output.release(handle);
                    }
                });
                return Ok(None);
            }
        }

        if !self.capture.start(self.config.capture_sample_rate, self.config.frame_size, &token).await? {
            return Ok(None);
        }

        Ok(Some(events))
    }

    /// Single consumer for the three producers: playback completions,
    /// transport events and capture frames.
    async fn pump(&mut self, mut events: mpsc::Receiver<TransportEvent>) -> EndReason {
        let token = self.token.clone();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return EndReason::Stopped,

                Some(id) = self.finished.recv() => {
                    self.scheduler.on_buffer_finished(id);
                }

                event = events.recv() => {
                    let event = event.unwrap_or_else(|| TransportEvent::Closed {
                        reason: Some("event stream ended".to_string()),
                    });
                    // Release the microphone before the session reports leaving Open
                    if event.ends_session() {
                        self.capture.stop();
                    }
                    match self.controller.handle_event(event, &mut self.scheduler) {
                        InboundOutcome::Scheduled(_) => self.shared.stats.lock().chunks_scheduled += 1,
                        InboundOutcome::Interrupted(_) => self.shared.stats.lock().interruptions += 1,
                        InboundOutcome::Dropped(e) => {
                            self.shared.stats.lock().chunks_dropped += 1;
                            let context = create_error_context("playback", "enqueue_chunk", Some(&self.session_id));
                            if self.error_handler.handle_error(e.clone(), context).await == ErrorRecoveryAction::Teardown {
                                return EndReason::Failed(e);
                            }
                        }
                        InboundOutcome::Ended => return EndReason::RemoteClosed,
                        InboundOutcome::Failed(e) => return EndReason::Failed(e),
                        InboundOutcome::Opened | InboundOutcome::TurnComplete | InboundOutcome::Ignored => {}
                    }
                }

                frame = self.capture.next_frame() => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => return EndReason::Failed(AudioError::device_unavailable(None, "capture stream ended")),
                    };
                    let encoded = self.capture.process_frame(&frame);
                    match self.controller.send_frame(&encoded).await {
                        Ok(true) => self.shared.stats.lock().frames_sent += 1,
                        Ok(false) => {}
                        Err(e) => {
                            self.capture.stop();
                            self.controller.fail();
                            return EndReason::Failed(e);
                        }
                    }
                }
            }
        }
    }

    /// Release everything in a fixed order. Each step is isolated so one
    /// failing step never skips the ones after it.
    async fn teardown(&mut self) {
        let session_id = self.session_id.clone();
        debug!("[{}] Tearing down session", session_id);

        run_step(&session_id, "stop capture", || self.capture.stop());

        if AssertUnwindSafe(self.controller.close()).catch_unwind().await.is_err() {
            error!("[{}] Teardown step 'close session' panicked, continuing", session_id);
        }

        run_step(&session_id, "flush playback", || {
            self.scheduler.flush();
        });
        run_step(&session_id, "release output", || self.scheduler.release_output());
        run_step(&session_id, "reset activity", || self.shared.activity.reset());
    }

    fn finish(&self, reason: &EndReason) {
        if !self.reporter.is_live() {
            debug!("[{}] Session superseded, not publishing final state", self.session_id);
            return;
        }

        match reason {
            EndReason::Failed(e) if e.is_fatal() => {
                *self.shared.last_error.lock() = Some(e.clone());
            }
            EndReason::Failed(e) => warn!("[{}] Session ended on a non-fatal error: {}", self.session_id, e),
            EndReason::RemoteClosed => info!("[{}] Session closed by the agent", self.session_id),
            EndReason::Stopped => info!("[{}] Session stopped", self.session_id),
        }

        self.reporter.report(SessionState::Idle);
    }
}

fn run_step<F: FnOnce()>(session_id: &str, step: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("[{}] Teardown step '{}' panicked, continuing", session_id, step);
    }
}
