//! Audio device handles.
//!
//! Devices are acquired when a session opens and released when it closes;
//! the session owns them exclusively for its lifetime. cpal streams are not
//! `Send`, so each one lives on a dedicated thread that drops it on stop.

use crate::audio_utils::{
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, StreamResampler, resample_frame,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use ringbuf::{
    HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// About two seconds of mono audio at common device rates.
const RING_BUFFER_SAMPLES: usize = 96_000;
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No input device available")]
    NoInputDevice,
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Failed to open input stream: {0}")]
    Input(String),
    #[error("Failed to open output stream: {0}")]
    Output(String),
}

/// A running capture stream. Stopping (or dropping) it releases the device.
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

/// A playback device with its own clock.
pub trait AudioOutput: Send + Sync {
    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Queues 24 kHz mono samples to begin playing at device time `start`.
    fn schedule(&self, samples: Vec<f32>, start: f64);

    /// Drops every queued frame that has not finished playing.
    fn cancel_pending(&self);
}

/// Acquires the microphone and speaker for a session.
pub trait AudioDevices: Send + Sync {
    /// Starts delivering `frame_samples`-long 16 kHz mono frames to `frames`.
    fn open_microphone(
        &self,
        frame_samples: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError>;

    fn open_speaker(&self) -> Result<Arc<dyn AudioOutput>, DeviceError>;
}

// --- Fallback output ---

/// An output that plays nothing but keeps wall-clock time.
///
/// Used when no speaker can be acquired so scheduling and talking detection
/// still behave.
pub struct SilentOutput {
    epoch: Instant,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SilentOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for SilentOutput {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&self, _samples: Vec<f32>, _start: f64) {}

    fn cancel_pending(&self) {}
}

// --- cpal implementation ---

/// The system's default input and output devices via cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn open_microphone(
        &self,
        frame_samples: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        Ok(Box::new(CpalMicrophone::start(frame_samples, frames)?))
    }

    fn open_speaker(&self) -> Result<Arc<dyn AudioOutput>, DeviceError> {
        Ok(Arc::new(CpalSpeaker::start()?))
    }
}

/// Spawns a thread that owns a cpal stream until `running` is cleared.
///
/// `build` runs on the new thread; its result is reported back before this
/// function returns.
fn spawn_stream_thread<B, L>(
    name: &str,
    running: Arc<AtomicBool>,
    build: B,
    mut tick: L,
) -> Result<JoinHandle<()>, String>
where
    B: FnOnce() -> Result<Stream, String> + Send + 'static,
    L: FnMut() + Send + 'static,
{
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let thread_running = running.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|stream| {
                stream.play().map_err(|e| e.to_string())?;
                Ok(stream)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            while thread_running.load(Ordering::Acquire) {
                tick();
                thread::sleep(DRAIN_INTERVAL);
            }
            drop(stream);
        })
        .map_err(|e| e.to_string())?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            running.store(false, Ordering::Release);
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err("audio thread exited during startup".to_string()),
    }
}

struct CpalMicrophone {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    fn start(frame_samples: usize, frames: mpsc::Sender<Vec<f32>>) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(DeviceError::NoInputDevice)?;
        let config = device
            .default_input_config()
            .map_err(|e| DeviceError::Input(e.to_string()))?;
        let sample_rate = config.sample_rate().0;
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels(),
            format = ?config.sample_format(),
            "Opening microphone"
        );

        let mut resampler = StreamResampler::new(sample_rate, CAPTURE_SAMPLE_RATE)
            .map_err(|e| DeviceError::Input(e.to_string()))?;
        let (producer, mut consumer) = HeapRb::<f32>::new(RING_BUFFER_SAMPLES).split();
        let running = Arc::new(AtomicBool::new(true));

        let mut framer = Framer::new(frame_samples);
        let mut scratch = vec![0.0f32; 4096];
        let drain = move || {
            let read = consumer.pop_slice(&mut scratch);
            if read == 0 {
                return;
            }
            for frame in framer.push(&resampler.process(&scratch[..read])) {
                if frames.try_send(frame).is_err() {
                    debug!("Capture frame dropped: pipeline is not keeping up or has stopped");
                }
            }
        };

        let thread = spawn_stream_thread(
            "voiceboard-mic",
            running.clone(),
            move || build_input_stream(&device, &config, producer),
            drain,
        )
        .map_err(DeviceError::Input)?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }
}

impl CaptureHandle for CpalMicrophone {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Microphone released");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an input stream whose callback only pushes the first channel into
/// the ring buffer.
fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<Stream, String> {
    let channels = config.channels() as usize;
    let err_fn = |err: cpal::StreamError| error!("Microphone stream error: {}", err);
    let stream_config = config.config();

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(channels) {
                    let _ = producer.try_push(chunk[0]);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(channels) {
                    let _ = producer.try_push(chunk[0] as f32 / 32768.0);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(channels) {
                    let _ = producer.try_push(chunk[0] as f32 / 2147483648.0);
                }
            },
            err_fn,
            None,
        ),
        other => return Err(format!("unsupported sample format {other:?}")),
    };
    stream.map_err(|e| e.to_string())
}

/// Cuts a continuous sample stream into fixed-size frames.
struct Framer {
    size: usize,
    buffer: Vec<f32>,
}

impl Framer {
    fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            buffer: Vec::with_capacity(size),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() == self.size {
                frames.push(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.size),
                ));
            }
        }
        frames
    }
}

// --- Speaker ---

/// A frame waiting in (or playing from) the speaker queue.
struct QueuedFrame {
    start_sample: u64,
    samples: Vec<f32>,
    cursor: usize,
}

/// Playback state shared between the scheduling side and the output callback.
struct SpeakerShared {
    queue: Mutex<VecDeque<QueuedFrame>>,
    /// Samples rendered since the stream started: the device clock.
    rendered: AtomicU64,
    sample_rate: u32,
}

impl SpeakerShared {
    fn new(sample_rate: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            rendered: AtomicU64::new(0),
            sample_rate,
        }
    }

    /// Fills one callback buffer of mono samples and advances the clock.
    fn render(&self, out: &mut [f32]) {
        let position = self.rendered.load(Ordering::Acquire);
        match self.queue.try_lock() {
            Ok(mut queue) => render_queue(&mut queue, position, self.slack(), out),
            // Never block the audio thread on the scheduler.
            Err(_) => out.fill(0.0),
        }
        self.rendered.fetch_add(out.len() as u64, Ordering::Release);
    }

    /// Queues a 24 kHz frame that should start at `start` seconds on the
    /// device clock.
    ///
    /// Each frame is converted on its own to exactly the device samples its
    /// slot spans, so back-to-back frames stay back to back at any device rate.
    fn enqueue(&self, samples: &[f32], start: f64) {
        let samples = match resample_frame(samples, PLAYBACK_SAMPLE_RATE, self.sample_rate) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "Dropping playback frame that failed to resample");
                return;
            }
        };
        let frame = QueuedFrame {
            start_sample: (start * self.sample_rate as f64).round() as u64,
            samples,
            cursor: 0,
        };
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(frame);
        }
    }

    /// Early-start tolerance for start samples that rounded up by one.
    fn slack(&self) -> u64 {
        (self.sample_rate / 100) as u64
    }
}

/// Renders queued frames into `out`, where `out[0]` is device sample `position`.
///
/// A frame that has not started waits for its start sample (minus `slack`);
/// once started it plays to the end, and its successor follows immediately
/// if due.
fn render_queue(queue: &mut VecDeque<QueuedFrame>, position: u64, slack: u64, out: &mut [f32]) {
    for (offset, sample) in out.iter_mut().enumerate() {
        let now = position + offset as u64;
        *sample = loop {
            let Some(front) = queue.front_mut() else {
                break 0.0;
            };
            if front.cursor == 0 && now + slack < front.start_sample {
                break 0.0;
            }
            if let Some(&s) = front.samples.get(front.cursor) {
                front.cursor += 1;
                break s;
            }
            queue.pop_front();
        };
    }
}

struct CpalSpeaker {
    shared: Arc<SpeakerShared>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSpeaker {
    fn start() -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| DeviceError::Output(e.to_string()))?;
        let sample_rate = config.sample_rate().0;
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels(),
            format = ?config.sample_format(),
            "Opening speaker"
        );

        let shared = Arc::new(SpeakerShared::new(sample_rate));
        let running = Arc::new(AtomicBool::new(true));

        let stream_shared = shared.clone();
        let thread = spawn_stream_thread(
            "voiceboard-speaker",
            running.clone(),
            move || build_output_stream(&device, &config, stream_shared),
            || {},
        )
        .map_err(DeviceError::Output)?;

        Ok(Self {
            shared,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl AudioOutput for CpalSpeaker {
    fn now(&self) -> f64 {
        self.shared.rendered.load(Ordering::Acquire) as f64 / self.shared.sample_rate as f64
    }

    fn schedule(&self, samples: Vec<f32>, start: f64) {
        self.shared.enqueue(&samples, start);
    }

    fn cancel_pending(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
            let _ = thread.join();
            info!("Speaker released");
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    shared: Arc<SpeakerShared>,
) -> Result<Stream, String> {
    let channels = config.channels() as usize;
    let err_fn = |err: cpal::StreamError| error!("Speaker stream error: {}", err);
    let stream_config = config.config();
    let mut mono = Vec::<f32>::new();

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                shared.render(&mut mono);
                for (frame, &s) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill(s);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                shared.render(&mut mono);
                for (frame, &s) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                }
            },
            err_fn,
            None,
        ),
        other => {
            warn!(format = ?other, "Unsupported output sample format");
            return Err(format!("unsupported sample format {other:?}"));
        }
    };
    stream.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(start_sample: u64, samples: &[f32]) -> QueuedFrame {
        QueuedFrame {
            start_sample,
            samples: samples.to_vec(),
            cursor: 0,
        }
    }

    #[test]
    fn test_framer_emits_fixed_size_frames() {
        let mut framer = Framer::new(4);
        assert!(framer.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = framer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(framer.push(&[]).len(), 0);
    }

    #[test]
    fn test_render_waits_for_start_sample() {
        let mut queue = VecDeque::from([frame(4, &[1.0, 1.0])]);
        let mut out = [9.0f32; 8];

        render_queue(&mut queue, 0, 0, &mut out);

        assert_eq!(out, [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_render_plays_back_to_back_frames_without_gap() {
        let mut queue = VecDeque::from([frame(0, &[0.1, 0.2]), frame(2, &[0.3, 0.4])]);
        let mut out = [0.0f32; 3];
        render_queue(&mut queue, 0, 0, &mut out);
        assert_eq!(out, [0.1, 0.2, 0.3]);

        // The second frame continues across callback boundaries.
        let mut out = [0.0f32; 2];
        render_queue(&mut queue, 3, 0, &mut out);
        assert_eq!(out, [0.4, 0.0]);
    }

    #[test]
    fn test_render_slack_closes_small_gaps() {
        // Rounding put the second frame's start one sample past the first's end.
        let mut queue = VecDeque::from([frame(0, &[0.1, 0.2]), frame(3, &[0.3])]);
        let mut out = [0.0f32; 3];
        render_queue(&mut queue, 0, 1, &mut out);
        assert_eq!(out, [0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_late_frame_plays_immediately() {
        let mut queue = VecDeque::from([frame(2, &[0.5, 0.5])]);
        let mut out = [0.0f32; 2];
        render_queue(&mut queue, 10, 0, &mut out);
        assert_eq!(out, [0.5, 0.5]);
    }

    #[test]
    fn test_speaker_shared_advances_clock() {
        let shared = SpeakerShared::new(100);
        shared.queue.lock().unwrap().push_back(frame(0, &[0.25; 3]));

        let mut out = [0.0f32; 5];
        shared.render(&mut out);

        assert_eq!(out, [0.25, 0.25, 0.25, 0.0, 0.0]);
        assert_eq!(shared.rendered.load(Ordering::Acquire), 5);
    }

    #[test]
    fn test_burst_plays_gapless_at_48k() {
        let shared = SpeakerShared::new(48_000);
        // Five 40 ms frames arriving at once, scheduled back to back.
        for i in 0..5 {
            shared.enqueue(&[0.5; 960], i as f64 * 0.04);
        }
        {
            let queue = shared.queue.lock().unwrap();
            let spans: Vec<_> = queue
                .iter()
                .map(|f| (f.start_sample, f.samples.len()))
                .collect();
            assert_eq!(
                spans,
                vec![(0, 1920), (1920, 1920), (3840, 1920), (5760, 1920), (7680, 1920)]
            );
        }

        let mut out = vec![0.0f32; 9599];
        shared.render(&mut out);
        // One sample of the last frame is still due: nothing was skipped or stalled.
        {
            let queue = shared.queue.lock().unwrap();
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].samples.len() - queue[0].cursor, 1);
        }
        let mut last = [0.0f32; 481];
        shared.render(&mut last);
        assert!(shared.queue.lock().unwrap().is_empty());
        assert!(last[1..].iter().all(|&s| s == 0.0));

        // Frame boundaries carry signal, not silence.
        for boundary in [1920, 3840, 5760, 7680] {
            assert_ne!(out[boundary - 1], 0.0, "gap before {boundary}");
            assert_ne!(out[boundary], 0.0, "gap at {boundary}");
        }
        assert!(out[1012..=1439].iter().all(|&s| s.abs() > 0.1));
    }

    #[test]
    fn test_cancel_leaves_nothing_for_next_turn() {
        let shared = SpeakerShared::new(44_100);
        shared.enqueue(&[0.5; 1000], 0.0);
        shared.queue.lock().unwrap().clear();

        shared.enqueue(&[0.25; 960], 0.0);
        let queue = shared.queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].samples.len(), 1764);
    }

    #[test]
    fn test_silent_output_clock_advances() {
        let output = SilentOutput::new();
        let first = output.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(output.now() > first);
    }
}
