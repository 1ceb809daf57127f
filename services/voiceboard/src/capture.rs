//! Capture Pipeline
//!
//! Turns raw microphone frames into outbound audio: each frame is measured
//! for loudness, the user-talking flag is derived from it, and the frame is
//! encoded and forwarded to the session transport.

use crate::{
    audio_utils::encode_pcm16,
    device::{AudioDevices, CaptureHandle, DeviceError},
    state::EngineState,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};
use voiceboard_core::generic_types::ClientEvent;

/// Samples per captured frame in the reference cadence (256 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;
/// Empirical gain mapping RMS onto a 0..1 level meter.
pub const LEVEL_GAIN: f32 = 10.0;
/// Level above which the user is considered to be talking.
pub const TALKING_THRESHOLD: f32 = 0.05;

const FRAME_QUEUE_DEPTH: usize = 16;

/// Loudness measurements for one captured frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLevel {
    pub rms: f32,
    pub level: f32,
    pub talking: bool,
}

/// Computes RMS, the clamped level meter value and the talking flag.
pub fn analyze(samples: &[f32]) -> FrameLevel {
    if samples.is_empty() {
        return FrameLevel {
            rms: 0.0,
            level: 0.0,
            talking: false,
        };
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_square.sqrt();
    let level = (rms * LEVEL_GAIN).min(1.0);
    FrameLevel {
        rms,
        level,
        talking: level > TALKING_THRESHOLD,
    }
}

/// An encoded frame ready for the transport, with its measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub pcm: Vec<u8>,
    pub level: FrameLevel,
}

pub fn process_frame(samples: &[f32]) -> CapturedFrame {
    CapturedFrame {
        pcm: encode_pcm16(samples),
        level: analyze(samples),
    }
}

/// A running microphone plus the task that encodes and forwards its frames.
pub struct CapturePipeline {
    device: Box<dyn CaptureHandle>,
    task: JoinHandle<()>,
}

impl CapturePipeline {
    /// Acquires the microphone and starts forwarding frames to `outbound`.
    ///
    /// Updates the user level and talking flag on every frame.
    pub fn start(
        devices: &dyn AudioDevices,
        frame_samples: usize,
        state: EngineState,
        outbound: mpsc::Sender<ClientEvent>,
    ) -> Result<Self, DeviceError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let device = devices.open_microphone(frame_samples, frames_tx)?;
        let task = tokio::spawn(forward_frames(frames_rx, state, outbound));
        info!(frame_samples, "Capture pipeline started");
        Ok(Self { device, task })
    }

    /// Releases the microphone and discards any frame still being forwarded.
    ///
    /// Returns once the forwarding task is gone, so no level update can land
    /// after the caller resets the observable state.
    pub async fn stop(mut self) {
        self.device.stop();
        self.task.abort();
        let _ = self.task.await;
        info!("Capture pipeline stopped");
    }
}

async fn forward_frames(
    mut frames: mpsc::Receiver<Vec<f32>>,
    state: EngineState,
    outbound: mpsc::Sender<ClientEvent>,
) {
    while let Some(samples) = frames.recv().await {
        let frame = process_frame(&samples);
        state.update(|s| {
            s.user_audio_level = frame.level.level;
            s.user_talking = frame.level.talking;
        });
        if outbound.send(ClientEvent::Audio(frame.pcm)).await.is_err() {
            debug!("Outbound channel closed; capture forwarding ends");
            break;
        }
    }
    state.update(|s| {
        s.user_audio_level = 0.0;
        s.user_talking = false;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AudioOutput;
    use approx::assert_abs_diff_eq;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_silence_is_not_talking() {
        let level = analyze(&[0.0; CAPTURE_FRAME_SAMPLES]);
        assert_eq!(level.level, 0.0);
        assert!(!level.talking);
    }

    #[test]
    fn test_full_scale_clamps_to_one() {
        let level = analyze(&[1.0; CAPTURE_FRAME_SAMPLES]);
        assert_abs_diff_eq!(level.rms, 1.0);
        assert_eq!(level.level, 1.0);
        assert!(level.talking);
    }

    #[test]
    fn test_threshold_boundary() {
        // RMS 0.004 -> level 0.04: quiet room noise.
        let quiet = analyze(&[0.004; 64]);
        assert_abs_diff_eq!(quiet.level, 0.04, epsilon = 1e-6);
        assert!(!quiet.talking);

        // RMS 0.01 -> level 0.1: speech.
        let speech = analyze(&[0.01, -0.01, 0.01, -0.01]);
        assert_abs_diff_eq!(speech.level, 0.1, epsilon = 1e-6);
        assert!(speech.talking);
    }

    #[test]
    fn test_empty_frame() {
        assert!(!analyze(&[]).talking);
    }

    #[test]
    fn test_process_frame_encodes_pcm16() {
        let frame = process_frame(&[0.5, -0.5]);
        assert_eq!(frame.pcm.len(), 4);
        assert!(frame.level.talking);
    }

    /// Hands the frame sender to the test instead of opening hardware.
    struct ChannelMic {
        sender: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    }

    struct NoopHandle;

    impl CaptureHandle for NoopHandle {
        fn stop(&mut self) {}
    }

    impl AudioDevices for Arc<ChannelMic> {
        fn open_microphone(
            &self,
            _frame_samples: usize,
            frames: mpsc::Sender<Vec<f32>>,
        ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
            *self.sender.lock().unwrap() = Some(frames);
            Ok(Box::new(NoopHandle))
        }

        fn open_speaker(&self) -> Result<Arc<dyn AudioOutput>, DeviceError> {
            Err(DeviceError::NoOutputDevice)
        }
    }

    #[tokio::test]
    async fn test_pipeline_forwards_frames_and_updates_state() {
        let mic = Arc::new(ChannelMic {
            sender: Mutex::new(None),
        });
        let state = EngineState::new();
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let pipeline = CapturePipeline::start(&mic, 4, state.clone(), out_tx).unwrap();
        let frames = mic.sender.lock().unwrap().clone().unwrap();

        frames.send(vec![0.5; 4]).await.unwrap();
        match out_rx.recv().await {
            Some(ClientEvent::Audio(pcm)) => assert_eq!(pcm.len(), 8),
            other => panic!("expected audio, got {other:?}"),
        }
        let snapshot = state.snapshot();
        assert!(snapshot.user_talking);
        assert_eq!(snapshot.user_audio_level, 1.0);

        frames.send(vec![0.0; 4]).await.unwrap();
        out_rx.recv().await.unwrap();
        assert!(!state.snapshot().user_talking);

        pipeline.stop().await;
    }
}
