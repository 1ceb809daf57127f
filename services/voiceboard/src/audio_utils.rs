//! Audio codec helpers.
//!
//! The remote service consumes 16 kHz and produces 24 kHz 16-bit mono PCM.
//! This module is the one place that asymmetry is spelled out.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate of captured audio sent to the service.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of assistant audio received from the service.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

const RESAMPLER_CHUNK_SIZE: usize = 512;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),
    #[error("Invalid base64 audio payload: {0}")]
    Base64(String),
}

/// Quantizes float samples to 16-bit little-endian PCM.
///
/// Samples are clamped to [-1, 1] and scaled by 32767, so out-of-range or
/// non-finite input never wraps.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Converts 16-bit little-endian PCM back into float samples in [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, CodecError> {
    base64::engine::general_purpose::STANDARD
        .decode(fragment)
        .map_err(|e| CodecError::Base64(e.to_string()))
}

/// Playback duration in seconds of `samples` mono samples at `sample_rate`.
pub fn frame_duration(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples one self-contained mono frame to exactly
/// `round(len * out_rate / in_rate)` samples.
///
/// The filter delay is trimmed from the front and the tail is flushed, so
/// the output covers the same span of time as the input and nothing is
/// carried into the next frame.
pub fn resample_frame(input: &[f32], in_rate: u32, out_rate: u32) -> anyhow::Result<Vec<f32>> {
    if in_rate == out_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let expected = ((input.len() as u64 * out_rate as u64 + in_rate as u64 / 2)
        / in_rate as u64) as usize;
    let mut resampler = create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK_SIZE)?;
    let delay = resampler.output_delay();
    let wanted = delay + expected;

    let mut output = Vec::with_capacity(wanted);
    let mut consumed = 0;
    while output.len() < wanted {
        let needed = resampler.input_frames_next();
        let remaining = input.len() - consumed;
        let res = if remaining >= needed {
            let chunk = &input[consumed..consumed + needed];
            consumed += needed;
            resampler.process(&[chunk], None)?
        } else if remaining > 0 {
            let tail: [&[f32]; 1] = [&input[consumed..]];
            consumed = input.len();
            resampler.process_partial(Some(&tail[..]), None)?
        } else {
            resampler.process_partial(None::<&[&[f32]]>, None)?
        };
        output.extend_from_slice(&res[0]);
    }
    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}

/// A mono resampler for arbitrarily sized input slices.
///
/// Input that does not fill a whole resampler chunk is carried over to the
/// next call. When both rates are equal, samples pass straight through.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                RESAMPLER_CHUNK_SIZE,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return input.to_vec();
        };
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }
            let chunk = &self.pending[consumed..consumed + needed];
            match resampler.process(&[chunk], None) {
                Ok(res) => output.extend_from_slice(&res[0]),
                Err(e) => tracing::warn!(error = %e, "Resampler rejected chunk"),
            }
            consumed += needed;
        }
        self.pending.drain(..consumed);
        output
    }
}
