use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use log::{error, warn, info, debug};

/// Error types for the duplex voice engine
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AudioError {
    #[error("Device acquisition error: {message}")]
    DeviceAcquisition { message: String, device: Option<String> },

    #[error("Output device error: {message}")]
    OutputDevice { message: String },

    #[error("Transport open error: {message}")]
    TransportOpen { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String, bytes: usize },

    #[error("Session state error: {message}")]
    SessionState { message: String, state: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String, field: String },
}

impl AudioError {
    pub fn device_unavailable(device: Option<&str>, reason: &str) -> Self {
        AudioError::DeviceAcquisition {
            message: match device {
                Some(name) => format!("Device '{}' unavailable: {}", name, reason),
                None => format!("Capture device unavailable: {}", reason),
            },
            device: device.map(str::to_string),
        }
    }

    pub fn output_failed(reason: impl Into<String>) -> Self {
        AudioError::OutputDevice { message: reason.into() }
    }

    pub fn transport_open(reason: impl Into<String>) -> Self {
        AudioError::TransportOpen { message: reason.into() }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        AudioError::Transport { message: reason.into() }
    }

    pub fn decode_failed(bytes: usize, reason: &str) -> Self {
        AudioError::Decode {
            message: format!("Failed to decode {} byte chunk: {}", bytes, reason),
            bytes,
        }
    }

    pub fn invalid_state(state: impl std::fmt::Display, reason: &str) -> Self {
        AudioError::SessionState {
            message: format!("{} (state: {})", reason, state),
            state: state.to_string(),
        }
    }

    pub fn invalid_config(field: &str, reason: &str) -> Self {
        AudioError::Configuration {
            message: format!("{}: {}", field, reason),
            field: field.to_string(),
        }
    }

    /// Fatal errors end the session; everything else is absorbed by the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AudioError::Decode { .. } | AudioError::SessionState { .. })
    }
}

/// What the session should do after an error has been recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorRecoveryAction {
    /// Tear the whole session down; no automatic retry
    Teardown,
    /// Drop the offending item and keep the session running
    DropAndContinue,
    /// Reject the request, leaving the running session untouched
    Reject,
}

/// Error context for better debugging
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub timestamp: u64,
    pub session_id: Option<String>,
}

/// Records errors per component and maps each one to a recovery action
pub struct ErrorHandler {
    error_counts: Arc<RwLock<HashMap<String, AtomicU32>>>,
    max_error_history: usize,
    error_history: Arc<RwLock<VecDeque<(AudioError, ErrorContext)>>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_history_limit(256)
    }

    pub fn with_history_limit(max_error_history: usize) -> Self {
        Self {
            error_counts: Arc::new(RwLock::new(HashMap::new())),
            max_error_history: max_error_history.max(1),
            error_history: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Handle an error and decide how the session reacts to it
    pub async fn handle_error(&self, error: AudioError, context: ErrorContext) -> ErrorRecoveryAction {
        self.increment_error_count(&context.component).await;
        self.log_error(&error, &context).await;

        let action = match &error {
            AudioError::Decode { .. } => ErrorRecoveryAction::DropAndContinue,
            AudioError::SessionState { .. } => ErrorRecoveryAction::Reject,
            _ => ErrorRecoveryAction::Teardown,
        };

        self.store_error_history(error, context).await;
        action
    }

    /// Log error with appropriate level
    async fn log_error(&self, error: &AudioError, context: &ErrorContext) {
        let error_count = self.get_error_count(&context.component).await;
        let session = context.session_id.as_deref().unwrap_or("-");

        match error {
            AudioError::Decode { .. } => {
                if error_count > 5 {
                    warn!("[{}/{}] Repeated decode error (count: {}): {}", session, context.component, error_count, error);
                } else {
                    debug!("[{}/{}] Dropping chunk (count: {}): {}", session, context.component, error_count, error);
                }
            }
            AudioError::SessionState { .. } => {
                info!("[{}/{}] Rejected: {}", session, context.component, error);
            }
            _ => {
                error!("[{}/{}] Fatal error during {}: {}", session, context.component, context.operation, error);
            }
        }
    }

    async fn store_error_history(&self, error: AudioError, context: ErrorContext) {
        let mut history = self.error_history.write().await;
        history.push_back((error, context));
        while history.len() > self.max_error_history {
            history.pop_front();
        }
    }

    async fn increment_error_count(&self, component: &str) {
        let mut counts = self.error_counts.write().await;
        let counter = counts.entry(component.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get error count for component
    pub async fn get_error_count(&self, component: &str) -> u32 {
        let counts = self.error_counts.read().await;
        counts.get(component)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Reset error count for component
    pub async fn reset_error_count(&self, component: &str) {
        let counts = self.error_counts.read().await;
        if let Some(counter) = counts.get(component) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub async fn get_error_statistics(&self) -> ErrorStatistics {
        let counts = self.error_counts.read().await;
        let history = self.error_history.read().await;

        let component_errors: HashMap<String, u32> = counts.iter()
            .map(|(component, counter)| (component.clone(), counter.load(Ordering::Relaxed)))
            .collect();
        let total_errors = component_errors.values().sum();
        let fatal_errors = history.iter().filter(|(error, _)| error.is_fatal()).count() as u32;

        ErrorStatistics {
            total_errors,
            fatal_errors,
            component_errors,
            error_history_size: history.len(),
        }
    }

    /// Most recent errors first
    pub async fn get_recent_errors(&self, limit: usize) -> Vec<(AudioError, ErrorContext)> {
        let history = self.error_history.read().await;
        history.iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Error statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u32,
    pub fatal_errors: u32,
    pub component_errors: HashMap<String, u32>,
    pub error_history_size: usize,
}

pub fn create_error_context(component: &str, operation: &str, session_id: Option<&str>) -> ErrorContext {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    ErrorContext {
        component: component.to_string(),
        operation: operation.to_string(),
        timestamp: now,
        session_id: session_id.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_errors_are_dropped() {
        let handler = ErrorHandler::new();

        let error = AudioError::decode_failed(3, "odd byte count");
        let context = create_error_context("playback", "decode", Some("s1"));

        let action = handler.handle_error(error, context).await;
        assert_eq!(action, ErrorRecoveryAction::DropAndContinue);
    }

    #[tokio::test]
    async fn test_fatal_errors_tear_down() {
        let handler = ErrorHandler::new();

        for error in [
            AudioError::device_unavailable(None, "permission denied"),
            AudioError::transport_open("connection refused"),
            AudioError::transport("broken pipe"),
            AudioError::output_failed("no output device"),
        ] {
            assert!(error.is_fatal());
            let context = create_error_context("session", "run", None);
            assert_eq!(handler.handle_error(error, context).await, ErrorRecoveryAction::Teardown);
        }

        let stats = handler.get_error_statistics().await;
        assert_eq!(stats.total_errors, 4);
        assert_eq!(stats.fatal_errors, 4);
    }

    #[tokio::test]
    async fn test_rejected_open_does_not_tear_down() {
        let handler = ErrorHandler::new();
        let error = AudioError::invalid_state("Open", "session already active");
        assert!(!error.is_fatal());

        let context = create_error_context("controller", "open", None);
        assert_eq!(handler.handle_error(error, context).await, ErrorRecoveryAction::Reject);
    }

    #[tokio::test]
    async fn test_error_count_tracking() {
        let handler = ErrorHandler::new();

        for i in 0..5 {
            let error = AudioError::decode_failed(i, "truncated");
            let context = create_error_context("playback", "decode", None);
            handler.handle_error(error, context).await;
        }

        assert_eq!(handler.get_error_count("playback").await, 5);
        handler.reset_error_count("playback").await;
        assert_eq!(handler.get_error_count("playback").await, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let handler = ErrorHandler::with_history_limit(3);

        for i in 0..10 {
            let error = AudioError::decode_failed(i, "truncated");
            handler.handle_error(error, create_error_context("playback", "decode", None)).await;
        }

        let recent = handler.get_recent_errors(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].0, AudioError::decode_failed(9, "truncated"));
    }
}
