use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::{fmt, thread};
use tokio::sync::{mpsc, oneshot};

use super::device::{AudioFrame, BufferId, CaptureDevice, CompletionCallback, FrameStream, OutputDevice, OutputHandle};
use super::error::AudioError;

/// Frames buffered between the capture thread and the session before new
/// frames start being dropped
const FRAME_CHANNEL_CAPACITY: usize = 32;
const RESAMPLER_CHUNK_SIZE: usize = 1024;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Debug, Deserialize)]
pub enum DeviceType {
    Input,
    Output,
}

#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct AudioDevice {
    pub name: String,
    pub device_type: DeviceType,
}

impl AudioDevice {
    pub fn new(name: String, device_type: DeviceType) -> Self {
        AudioDevice { name, device_type }
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.name,
            match self.device_type {
                DeviceType::Input => "input",
                DeviceType::Output => "output",
            }
        )
    }
}

pub async fn list_audio_devices() -> Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            devices.push(AudioDevice::new(name, DeviceType::Input));
        }
    }
    for device in host.output_devices()? {
        if let Ok(name) = device.name() {
            devices.push(AudioDevice::new(name, DeviceType::Output));
        }
    }

    Ok(devices)
}

pub fn default_input_device() -> Result<AudioDevice> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No default input device found"))?;
    Ok(AudioDevice::new(device.name()?, DeviceType::Input))
}

pub fn default_output_device() -> Result<AudioDevice> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No default output device found"))?;
    Ok(AudioDevice::new(device.name()?, DeviceType::Output))
}

/// Average interleaved channels down to one
pub fn audio_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn find_device(host: &cpal::Host, name: Option<&str>, device_type: DeviceType) -> Result<cpal::Device, AudioError> {
    let unavailable = |reason: &str| match device_type {
        DeviceType::Input => AudioError::device_unavailable(name, reason),
        DeviceType::Output => AudioError::output_failed(format!("{} ({})", reason, name.unwrap_or("default"))),
    };

    match name {
        None => {
            let device = match device_type {
                DeviceType::Input => host.default_input_device(),
                DeviceType::Output => host.default_output_device(),
            };
            device.ok_or_else(|| unavailable("no default device"))
        }
        Some(wanted) => {
            let devices = match device_type {
                DeviceType::Input => host.input_devices(),
                DeviceType::Output => host.output_devices(),
            }
            .map_err(|e| unavailable(&format!("failed to enumerate devices: {}", e)))?;

            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            Err(unavailable("device not found"))
        }
    }
}

fn join_in_background(label: &'static str, handle: thread::JoinHandle<()>) {
    let join = move || {
        if handle.join().is_err() {
            error!("{} thread panicked", label);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

enum StreamControl {
    Stop,
}

/// Resamples device-rate mono audio to the capture rate and cuts it into
/// fixed-size frames
pub struct CaptureFramer {
    resampler: Option<FftFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    frame_size: usize,
}

impl CaptureFramer {
    pub fn new(device_rate: u32, target_rate: u32, frame_size: usize) -> Result<Self, AudioError> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                device_rate as usize,
                target_rate as usize,
                RESAMPLER_CHUNK_SIZE,
                2,
                1,
            )
            .map_err(|e| AudioError::device_unavailable(None, &format!("cannot resample {} Hz to {} Hz: {}", device_rate, target_rate, e)))?;
            info!("Resampling capture from {} Hz to {} Hz", device_rate, target_rate);
            Some(resampler)
        };

        Ok(Self {
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::with_capacity(frame_size * 2),
            frame_size,
        })
    }

    /// Feed one callback's samples, returning every frame that completed
    pub fn push(&mut self, mono: &[f32]) -> Vec<AudioFrame> {
        match self.resampler.as_mut() {
            Some(resampler) => {
                self.pending_in.extend_from_slice(mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending_out.extend_from_slice(&channel);
                            }
                        }
                        Err(e) => warn!("Resampling failed, dropping {} samples: {}", needed, e),
                    }
                }
            }
            None => self.pending_out.extend_from_slice(mono),
        }

        let mut frames = Vec::new();
        while self.pending_out.len() >= self.frame_size {
            frames.push(self.pending_out.drain(..self.frame_size).collect());
        }
        frames
    }
}

struct CaptureThread {
    control: std_mpsc::Sender<StreamControl>,
    thread: thread::JoinHandle<()>,
}

/// Microphone input through cpal.
///
/// cpal streams are not `Send`, so each acquisition owns a dedicated thread
/// that builds the stream, plays it and parks until it is told to stop.
pub struct CpalCaptureDevice {
    device_name: Option<String>,
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, CaptureThread>>,
}

impl CpalCaptureDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CaptureDevice for CpalCaptureDevice {
    async fn acquire(&self, sample_rate: u32, frame_size: usize) -> Result<FrameStream, AudioError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("duplex-capture".to_string())
            .spawn(move || run_capture_thread(device_name, sample_rate, frame_size, frames_tx, control_rx, ready_tx))
            .map_err(|e| AudioError::device_unavailable(self.device_name.as_deref(), &format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                join_in_background("capture", thread);
                return Err(e);
            }
            Err(_) => {
                join_in_background("capture", thread);
                return Err(AudioError::device_unavailable(self.device_name.as_deref(), "capture thread exited during startup"));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, CaptureThread { control: control_tx, thread });
        Ok(FrameStream::new(id, sample_rate, frame_size, frames_rx))
    }

    fn release(&self, stream: FrameStream) {
        let id = stream.id();
        drop(stream);

        let capture = self.streams.lock().remove(&id);
        match capture {
            Some(capture) => {
                if capture.control.send(StreamControl::Stop).is_err() {
                    debug!("Capture thread {} already gone", id);
                }
                join_in_background("capture", capture.thread);
            }
            None => warn!("Release requested for unknown capture stream {}", id),
        }
    }
}

fn run_capture_thread(
    device_name: Option<String>,
    target_rate: u32,
    frame_size: usize,
    frames: mpsc::Sender<AudioFrame>,
    control: std_mpsc::Receiver<StreamControl>,
    ready: oneshot::Sender<Result<(), AudioError>>,
) {
    let stream = match open_input_stream(device_name.as_deref(), target_rate, frame_size, frames) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            error!("Failed to start capture: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    match control.recv() {
        Ok(StreamControl::Stop) => info!("Stopping capture stream"),
        Err(_) => warn!("Capture control channel closed, stopping stream"),
    }
    if let Err(e) = stream.pause() {
        warn!("Failed to pause capture stream: {}", e);
    }
    drop(stream);
}

fn open_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    frame_size: usize,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, DeviceType::Input)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::device_unavailable(Some(&name), &format!("no input config: {}", e)))?;
    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();
    info!(
        "Opening capture on {}: {} Hz, {} channels, {:?}",
        name, stream_config.sample_rate.0, channels, sample_format
    );

    let mut framer = CaptureFramer::new(stream_config.sample_rate.0, target_rate, frame_size)?;
    let mut deliver = move |mono: Vec<f32>| {
        for frame in framer.push(&mono) {
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => warn!("Capture consumer is behind, dropping frame"),
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    };

    let error_name = name.clone();
    let error_callback = move |err: StreamError| {
        error!("Capture stream error on {}: {}", error_name, err);
    };

    let built = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &_| deliver(audio_to_mono(data, channels)),
            error_callback,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &_| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                deliver(audio_to_mono(&floats, channels))
            },
            error_callback,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _: &_| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 2_147_483_648.0).collect();
                deliver(audio_to_mono(&floats, channels))
            },
            error_callback,
            None,
        ),
        other => {
            return Err(AudioError::device_unavailable(Some(&name), &format!("unsupported sample format: {}", other)));
        }
    };

    let stream = built.map_err(|e| AudioError::device_unavailable(Some(&name), &format!("failed to build input stream: {}", e)))?;
    stream.play().map_err(|e| {
        let message = e.to_string();
        if message.to_lowercase().contains("permission") {
            error!("Permission error detected. Please check microphone permissions");
        }
        AudioError::device_unavailable(Some(&name), &format!("failed to start stream: {}", message))
    })?;

    Ok(stream)
}

struct Voice {
    samples: Arc<[f32]>,
    source_rate: u32,
    start_at: f64,
    on_finished: Option<CompletionCallback>,
}

impl Voice {
    fn end_at(&self) -> f64 {
        self.start_at + self.samples.len() as f64 / self.source_rate as f64
    }

    /// Linearly interpolated sample at output time `t`, if the voice covers it
    fn sample_at(&self, t: f64) -> Option<f32> {
        if t < self.start_at || t >= self.end_at() {
            return None;
        }
        let position = (t - self.start_at) * self.source_rate as f64;
        let index = position.floor() as usize;
        let current = *self.samples.get(index)?;
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        let fraction = (position - index as f64) as f32;
        Some(current + (next - current) * fraction)
    }
}

/// Output clock plus the set of scheduled voices
struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    clock_offset: f64,
    voices: HashMap<BufferId, Voice>,
}

impl Mixer {
    fn new() -> Self {
        Self {
            device_rate: 48000,
            frames_rendered: 0,
            clock_offset: 0.0,
            voices: HashMap::new(),
        }
    }

    fn now(&self) -> f64 {
        self.clock_offset + self.frames_rendered as f64 / self.device_rate as f64
    }

    /// Switch to a new device rate without moving the clock backwards
    fn rebase(&mut self, device_rate: u32) {
        self.clock_offset = self.now();
        self.frames_rendered = 0;
        self.device_rate = device_rate.max(1);
    }

    /// Add a voice no earlier than the current clock and return its start.
    /// A start already in the past would otherwise cut off the head of the
    /// buffer.
    fn add_voice(&mut self, id: BufferId, samples: Arc<[f32]>, source_rate: u32, start_at: f64, on_finished: CompletionCallback) -> f64 {
        let start_at = start_at.max(self.now());
        self.voices.insert(id, Voice {
            samples,
            source_rate,
            start_at,
            on_finished: Some(on_finished),
        });
        start_at
    }

    /// Fill an interleaved buffer and return the callbacks of voices that
    /// played out. Callers fire them after releasing the mixer lock.
    fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<CompletionCallback> {
        let channels = channels.max(1);
        let rate = self.device_rate as f64;

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = self.clock_offset + (self.frames_rendered + i as u64) as f64 / rate;
            let mixed: f32 = self.voices.values().filter_map(|v| v.sample_at(t)).sum();
            frame.fill(mixed.clamp(-1.0, 1.0));
        }
        self.frames_rendered += (out.len() / channels) as u64;

        let now = self.now();
        let done: Vec<BufferId> = self
            .voices
            .iter()
            .filter(|(_, voice)| voice.end_at() <= now)
            .map(|(id, _)| *id)
            .collect();

        done.into_iter()
            .filter_map(|id| self.voices.remove(&id))
            .filter_map(|mut voice| voice.on_finished.take())
            .collect()
    }
}

struct PlaybackThread {
    control: std_mpsc::Sender<StreamControl>,
    thread: thread::JoinHandle<()>,
}

impl PlaybackThread {
    fn stop(self) {
        if self.control.send(StreamControl::Stop).is_err() {
            debug!("Playback thread already gone");
        }
        join_in_background("playback", self.thread);
    }
}

/// A running playback stream and the mixer it renders
struct ActiveOutput {
    handle: OutputHandle,
    mixer: Arc<Mutex<Mixer>>,
    playback: PlaybackThread,
}

/// Which acquisition owns the speakers.
///
/// `reserved` is the newest acquisition still starting; only it may become
/// `active`. Reserving again supersedes both the pending reservation and the
/// active stream.
#[derive(Default)]
struct OutputSlot {
    reserved: Option<OutputHandle>,
    active: Option<ActiveOutput>,
}

impl OutputSlot {
    /// Claim the slot for `handle`, returning the stream it displaces
    fn reserve(&mut self, handle: OutputHandle) -> Option<ActiveOutput> {
        if let Some(previous) = self.reserved.replace(handle) {
            debug!("Output acquisition {} superseded by {}", previous.id(), handle.id());
        }
        self.active.take()
    }

    /// Install a started stream. Hands it back if its reservation was superseded.
    fn install(&mut self, active: ActiveOutput) -> Result<(), ActiveOutput> {
        if self.reserved != Some(active.handle) {
            return Err(active);
        }
        self.reserved = None;
        self.active = Some(active);
        Ok(())
    }

    fn abandon(&mut self, handle: OutputHandle) {
        if self.reserved == Some(handle) {
            self.reserved = None;
        }
    }

    fn take(&mut self, handle: OutputHandle) -> Option<ActiveOutput> {
        match self.active.as_ref() {
            Some(active) if active.handle == handle => self.active.take(),
            _ => None,
        }
    }

    fn mixer(&self) -> Option<Arc<Mutex<Mixer>>> {
        self.active.as_ref().map(|active| active.mixer.clone())
    }
}

/// Speaker output through cpal, with a software mixer driving the clock.
///
/// Every acquisition gets its own playback thread and mixer, so a stream
/// that is still starting for a torn-down session never renders into, or
/// releases, the live one.
pub struct CpalOutputDevice {
    device_name: Option<String>,
    next_handle: AtomicU64,
    slot: Mutex<OutputSlot>,
}

impl CpalOutputDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            next_handle: AtomicU64::new(1),
            slot: Mutex::new(OutputSlot::default()),
        }
    }

    fn active_mixer(&self) -> Option<Arc<Mutex<Mixer>>> {
        self.slot.lock().mixer()
    }
}

#[async_trait]
impl OutputDevice for CpalOutputDevice {
    async fn acquire(&self, sample_rate: u32) -> Result<OutputHandle, AudioError> {
        let handle = OutputHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let displaced = self.slot.lock().reserve(handle);
        if let Some(displaced) = displaced {
            warn!("Output acquisition {} was still held, stopping it", displaced.handle.id());
            displaced.playback.stop();
        }

        let (control_tx, control_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();
        let mixer = Arc::new(Mutex::new(Mixer::new()));
        let thread_mixer = mixer.clone();

        let spawned = thread::Builder::new()
            .name("duplex-playback".to_string())
            .spawn(move || run_playback_thread(device_name, thread_mixer, control_rx, ready_tx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.slot.lock().abandon(handle);
                return Err(AudioError::output_failed(format!("failed to spawn playback thread: {}", e)));
            }
        };

        match ready_rx.await {
            Ok(Ok(device_rate)) => {
                if device_rate != sample_rate {
                    debug!("Output device runs at {} Hz, agent audio is {} Hz; interpolating", device_rate, sample_rate);
                }
                let active = ActiveOutput {
                    handle,
                    mixer,
                    playback: PlaybackThread { control: control_tx, thread },
                };
                let installed = self.slot.lock().install(active);
                match installed {
                    Ok(()) => {
                        info!("Output acquisition {} active", handle.id());
                        Ok(handle)
                    }
                    Err(superseded) => {
                        superseded.playback.stop();
                        Err(AudioError::output_failed("output acquisition superseded by a newer one"))
                    }
                }
            }
            Ok(Err(e)) => {
                self.slot.lock().abandon(handle);
                join_in_background("playback", thread);
                Err(e)
            }
            Err(_) => {
                self.slot.lock().abandon(handle);
                join_in_background("playback", thread);
                Err(AudioError::output_failed("playback thread exited during startup"))
            }
        }
    }

    fn now(&self) -> f64 {
        let Some(mixer) = self.active_mixer() else {
            return 0.0;
        };
        let now = mixer.lock().now();
        now
    }

    fn schedule(
        &self,
        id: BufferId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_at: f64,
        on_finished: CompletionCallback,
    ) -> Result<f64, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::output_failed("sample rate must be non-zero"));
        }
        let mixer = self
            .active_mixer()
            .ok_or_else(|| AudioError::output_failed("output device not acquired"))?;
        let started = mixer.lock().add_voice(id, samples, sample_rate, start_at, on_finished);
        Ok(started)
    }

    fn cancel(&self, id: BufferId) {
        if let Some(mixer) = self.active_mixer() {
            if mixer.lock().voices.remove(&id).is_some() {
                debug!("Cancelled voice {}", id);
            }
        }
    }

    fn release(&self, handle: OutputHandle) {
        let active = self.slot.lock().take(handle);
        match active {
            Some(active) => {
                active.mixer.lock().voices.clear();
                active.playback.stop();
                info!("Output acquisition {} released", handle.id());
            }
            None => debug!("Output acquisition {} already released or superseded", handle.id()),
        }
    }
}

fn run_playback_thread(
    device_name: Option<String>,
    mixer: Arc<Mutex<Mixer>>,
    control: std_mpsc::Receiver<StreamControl>,
    ready: oneshot::Sender<Result<u32, AudioError>>,
) {
    let (stream, device_rate) = match open_output_stream(device_name.as_deref(), mixer) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to start playback: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(device_rate));

    match control.recv() {
        Ok(StreamControl::Stop) => info!("Stopping playback stream"),
        Err(_) => warn!("Playback control channel closed, stopping stream"),
    }
    if let Err(e) = stream.pause() {
        warn!("Failed to pause playback stream: {}", e);
    }
    drop(stream);
}

fn open_output_stream(device_name: Option<&str>, mixer: Arc<Mutex<Mixer>>) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, DeviceType::Output)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::output_failed(format!("no output config on {}: {}", name, e)))?;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();
    let device_rate = stream_config.sample_rate.0;
    info!("Opening playback on {}: {} Hz, {} channels, {:?}", name, device_rate, channels, sample_format);

    {
        let mut mixer = mixer.lock();
        mixer.rebase(device_rate);
    }

    let error_name = name.clone();
    let error_callback = move |err: StreamError| {
        error!("Playback stream error on {}: {}", error_name, err);
    };

    let built = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &_| {
                let finished = mixer.lock().render(data, channels);
                for callback in finished {
                    callback();
                }
            },
            error_callback,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &_| {
                    scratch.resize(data.len(), 0.0);
                    let finished = mixer.lock().render(&mut scratch, channels);
                    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = super::encode::float_to_i16(*sample);
                    }
                    for callback in finished {
                        callback();
                    }
                },
                error_callback,
                None,
            )
        }
        other => {
            return Err(AudioError::output_failed(format!("unsupported output sample format on {}: {}", name, other)));
        }
    };

    let stream = built.map_err(|e| AudioError::output_failed(format!("failed to build output stream on {}: {}", name, e)))?;
    stream
        .play()
        .map_err(|e| AudioError::output_failed(format!("failed to start playback on {}: {}", name, e)))?;

    Ok((stream, device_rate))
}
