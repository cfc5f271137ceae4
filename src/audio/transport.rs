//! Boundary to the remote conversational agent.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::encode::EncodedFrame;
use super::error::AudioError;
use crate::config::SessionConfig;

/// Something the agent side of the connection did
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The agent acknowledged the session setup
    Opened,
    /// Encoded agent speech, in arrival order
    AudioChunk(Bytes),
    /// The agent detected barge-in and abandoned its current utterance
    Interrupted,
    TurnComplete,
    Closed { reason: Option<String> },
    Error(String),
}

impl TransportEvent {
    /// The connection is gone after this event
    pub fn ends_session(&self) -> bool {
        matches!(self, TransportEvent::Closed { .. } | TransportEvent::Error(_))
    }
}

/// Outbound half of an open connection
#[async_trait]
pub trait TransportHandle: Send {
    async fn send(&mut self, frame: &EncodedFrame) -> Result<(), AudioError>;

    /// Graceful close. Must tolerate being called after the remote side left.
    async fn close(&mut self) -> Result<(), AudioError>;
}

/// A freshly opened connection: the send handle plus the inbound event stream
pub struct TransportConnection {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> Result<TransportConnection, AudioError>;
}
