use std::sync::Arc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::activity::{ActivityDetector, ActivityState};
use super::device::{AudioFrame, CaptureDevice, FrameStream};
use super::encode::{encode_pcm16, EncodedFrame, PcmFormat};
use super::error::AudioError;

/// Turns microphone frames into activity updates and wire-format PCM
pub struct AudioCaptureStage {
    device: Arc<dyn CaptureDevice>,
    detector: ActivityDetector,
    activity: Arc<ActivityState>,
    stream: Option<FrameStream>,
    format: PcmFormat,
    next_sequence: u64,
}

impl AudioCaptureStage {
    pub fn new(device: Arc<dyn CaptureDevice>, detector: ActivityDetector, activity: Arc<ActivityState>) -> Self {
        Self {
            device,
            detector,
            activity,
            stream: None,
            format: PcmFormat::mono(0),
            next_sequence: 0,
        }
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Acquire the microphone.
    ///
    /// Returns `Ok(false)` if `cancel` fired first. The acquisition is left to
    /// finish in the background and whatever it yields is released at once.
    pub async fn start(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        cancel: &CancellationToken,
    ) -> Result<bool, AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::invalid_state("capturing", "capture already started"));
        }

        let device = self.device.clone();
        let mut pending = tokio::spawn(async move { device.acquire(sample_rate, frame_size).await });

        tokio::select! {
            joined = &mut pending => {
                let stream = joined
                    .map_err(|e| AudioError::device_unavailable(None, &format!("acquisition task failed: {}", e)))??;
                info!("Capture started: {} Hz, {} samples per frame", sample_rate, frame_size);
                self.format = PcmFormat::mono(stream.sample_rate());
                self.stream = Some(stream);
                Ok(true)
            }
            _ = cancel.cancelled() => {
                debug!("Capture start cancelled while the device was still being acquired");
                let device = self.device.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(stream)) = pending.await {
                        debug!("Releasing capture stream acquired after teardown");
                        device.release(stream);
                    }
                });
                Ok(false)
            }
        }
    }

    /// Next raw frame; pends forever while capture is stopped
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        match self.stream.as_mut() {
            Some(stream) => stream.next_frame().await,
            None => std::future::pending().await,
        }
    }

    /// Update `UserSpeaking` from the frame and encode it for the wire
    pub fn process_frame(&mut self, frame: &[f32]) -> EncodedFrame {
        self.activity.set_user_speaking(self.detector.is_speech(frame));

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        EncodedFrame {
            data: encode_pcm16(frame),
            format: self.format,
            sequence,
        }
    }

    /// Release the microphone. Safe to call repeatedly and before `start`.
    pub fn stop(&mut self) {
        match self.stream.take() {
            Some(stream) => {
                self.device.release(stream);
                self.activity.set_user_speaking(false);
                info!("Capture stopped after {} frames", self.next_sequence);
            }
            None => {
                if self.next_sequence > 0 {
                    warn!("Capture stop requested but no stream is held");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::test_utils::{AudioTestGenerator, FakeCaptureDevice};
    use std::time::Duration;

    fn stage(device: Arc<FakeCaptureDevice>, activity: Arc<ActivityState>) -> AudioCaptureStage {
        AudioCaptureStage::new(device, ActivityDetector::new(0.01), activity)
    }

    #[tokio::test]
    async fn test_frames_set_user_speaking() {
        let device = FakeCaptureDevice::new();
        let activity = Arc::new(ActivityState::new());
        let mut capture = stage(device.clone(), activity.clone());
        let generator = AudioTestGenerator::new(16000, 256);

        assert!(capture.start(16000, 4096, &CancellationToken::new()).await.unwrap());

        capture.process_frame(&generator.generate_constant(0.3));
        assert!(activity.user_speaking());

        capture.process_frame(&generator.generate_silence());
        assert!(!activity.user_speaking());
    }

    #[tokio::test]
    async fn test_encoded_frames_keep_capture_order() {
        let device = FakeCaptureDevice::new();
        let mut capture = stage(device.clone(), Arc::new(ActivityState::new()));
        capture.start(16000, 4, &CancellationToken::new()).await.unwrap();

        assert!(device.push_frame(vec![0.0, 0.5, -0.5, 1.0]).await);
        assert!(device.push_frame(vec![0.1; 4]).await);

        let first = capture.next_frame().await.unwrap();
        let second = capture.next_frame().await.unwrap();
        let a = capture.process_frame(&first);
        let b = capture.process_frame(&second);

        assert_eq!((a.sequence, b.sequence), (0, 1));
        assert_eq!(a.format, PcmFormat::mono(16000));
        assert_eq!(a.data.as_ref(), &[0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let device = FakeCaptureDevice::new();
        let mut capture = stage(device.clone(), Arc::new(ActivityState::new()));

        capture.stop();
        assert_eq!(device.release_count(), 0);

        capture.start(16000, 4096, &CancellationToken::new()).await.unwrap();
        capture.stop();
        capture.stop();

        assert_eq!(device.acquire_count(), 1);
        assert_eq!(device.release_count(), 1);
        assert!(!capture.is_started());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let device = FakeCaptureDevice::new();
        let mut capture = stage(device.clone(), Arc::new(ActivityState::new()));
        let token = CancellationToken::new();

        capture.start(16000, 4096, &token).await.unwrap();
        let second = capture.start(16000, 4096, &token).await;

        assert!(matches!(second, Err(AudioError::SessionState { .. })));
        assert_eq!(device.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_surfaced() {
        let device = FakeCaptureDevice::failing(AudioError::device_unavailable(None, "permission denied"));
        let mut capture = stage(device.clone(), Arc::new(ActivityState::new()));

        let result = capture.start(16000, 4096, &CancellationToken::new()).await;

        assert!(matches!(result, Err(AudioError::DeviceAcquisition { .. })));
        assert!(!capture.is_started());
        assert_eq!(device.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquisition_is_released_when_it_lands() {
        let device = FakeCaptureDevice::with_delay(Duration::from_millis(50));
        let mut capture = stage(device.clone(), Arc::new(ActivityState::new()));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        assert!(!capture.start(16000, 4096, &token).await.unwrap());
        assert!(!capture.is_started());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(device.acquire_count(), 1);
        assert_eq!(device.release_count(), 1);
    }
}
