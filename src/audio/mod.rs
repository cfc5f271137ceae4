// src/audio/mod.rs
pub mod core;
pub mod activity;
pub mod capture;
pub mod device;
pub mod encode;
pub mod error;
pub mod lifecycle;
pub mod playback;
pub mod session;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub mod tests;

pub use core::{
    audio_to_mono, default_input_device, default_output_device, list_audio_devices,
    AudioDevice, CaptureFramer, CpalCaptureDevice, CpalOutputDevice, DeviceType,
};
pub use activity::{
    calculate_mean_amplitude, ActivityDetector, ActivitySnapshot, ActivityState, DEFAULT_ACTIVITY_THRESHOLD
};
pub use capture::AudioCaptureStage;
pub use device::{
    AudioFrame, BufferId, CaptureDevice, CompletionCallback, FrameStream, OutputDevice, OutputHandle
};
pub use encode::{
    decode_pcm16, encode_pcm16, float_to_i16, EncodedFrame, PcmFormat
};
pub use error::{
    AudioError, ErrorHandler, ErrorRecoveryAction, ErrorContext, ErrorStatistics, create_error_context
};
pub use lifecycle::{
    ResourceLifecycleManager, SessionStats, StartOutcome
};
pub use playback::{
    PlaybackBuffer, PlaybackScheduler, PlaybackState
};
pub use session::{
    InboundOutcome, SessionState, StateReporter, StreamingSessionController
};
pub use transport::{
    AgentTransport, TransportConnection, TransportEvent, TransportHandle
};
pub use websocket::WebSocketTransport;
