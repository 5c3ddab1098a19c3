//! Normalization of captured audio into the recognizer's input format
//!
//! Steps run in a fixed order and each is idempotent on its own output:
//! coerce to `f32`, scale down if the peak exceeds 1.0, fold channels to
//! mono, resample by linear interpolation.

use std::time::Duration;

use crate::{Error, Result};

/// Sample rate the recognition engine expects (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Magnitude of a full-scale 16-bit sample
const I16_FULL_SCALE: f32 = 32768.0;

/// Samples as delivered by a capture device or file
#[derive(Debug, Clone, PartialEq)]
pub enum RawSamples {
    /// Floating-point samples
    F32(Vec<f32>),
    /// 16-bit integer samples
    I16(Vec<i16>),
}

impl RawSamples {
    /// Step 1: real-valued samples
    ///
    /// Integer samples are scaled by `1 / 32768`, keeping their level.
    #[must_use]
    pub fn into_f32(self) -> Vec<f32> {
        match self {
            Self::F32(samples) => samples,
            Self::I16(samples) => samples
                .into_iter()
                .map(|s| f32::from(s) / I16_FULL_SCALE)
                .collect(),
        }
    }
}

/// Interleaved audio buffer with its format
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples
    pub samples: Vec<f32>,
    /// Samples per second per channel
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl AudioFrame {
    /// Build a frame from raw samples
    #[must_use]
    pub fn new(samples: RawSamples, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into_f32(),
            sample_rate,
            channels,
        }
    }

    /// Mono frame from `f32` samples
    #[must_use]
    pub const fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of frames (samples per channel)
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playback duration
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Largest absolute sample value
    #[must_use]
    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Whether the frame has no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Converts frames to mono at the target rate with peak at most 1.0
#[derive(Debug, Clone, Copy)]
pub struct AudioNormalizer {
    target_rate: u32,
}

impl Default for AudioNormalizer {
    fn default() -> Self {
        Self {
            target_rate: SAMPLE_RATE,
        }
    }
}

impl AudioNormalizer {
    /// Create a normalizer for a target sample rate
    ///
    /// # Errors
    ///
    /// Returns error if the target rate is zero
    pub fn new(target_rate: u32) -> Result<Self> {
        if target_rate == 0 {
            return Err(Error::Config("target sample rate must be non-zero".to_string()));
        }
        Ok(Self { target_rate })
    }

    /// Target sample rate
    #[must_use]
    pub const fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Run every normalization step
    ///
    /// # Errors
    ///
    /// Returns error if the frame declares zero channels or a zero sample rate
    pub fn normalize(&self, frame: AudioFrame) -> Result<AudioFrame> {
        if frame.channels == 0 {
            return Err(Error::Audio("frame has zero channels".to_string()));
        }
        if frame.sample_rate == 0 {
            return Err(Error::Audio("frame has zero sample rate".to_string()));
        }

        let AudioFrame {
            mut samples,
            sample_rate,
            channels,
        } = frame;

        normalize_amplitude(&mut samples);
        let mono = fold_channels(&samples, channels);
        let resampled = resample_linear(&mono, sample_rate, self.target_rate);

        tracing::debug!(
            input_rate = sample_rate,
            input_channels = channels,
            output_samples = resampled.len(),
            target_rate = self.target_rate,
            "audio normalized"
        );

        Ok(AudioFrame::mono(resampled, self.target_rate))
    }
}

/// Largest absolute sample value (0.0 for an empty buffer)
#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0_f32, f32::max)
}

/// Step 2: scale the buffer by `1 / peak` when the peak exceeds 1.0
pub fn normalize_amplitude(samples: &mut [f32]) {
    let peak = peak(samples);
    if peak > 1.0 {
        let scale = peak.recip();
        for s in samples.iter_mut() {
            *s *= scale;
        }
        // Guard against rounding leaving the peak a hair above 1.0
        for s in samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

/// Step 3: average interleaved channels into one
///
/// Spatial information is discarded. A trailing partial frame is dropped.
#[must_use]
pub fn fold_channels(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }

    #[allow(clippy::cast_precision_loss)]
    let divisor = channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / divisor)
        .collect()
}

/// Number of samples after converting `len` samples between rates
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return 0;
    }
    (len as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize
}

/// Step 4: resample by linear interpolation
///
/// Output sample `i` sits at input position `i * from_rate / to_rate`,
/// interpolated between its two neighbours and clamped to the last input
/// sample. Interpolation never exceeds the input's peak.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = resampled_len(samples.len(), from_rate, to_rate);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = (i as f64 * step).min(last as f64);
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            (b - a).mul_add(frac, a)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, seconds: f32, amplitude: f32) -> Vec<f32> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let n = (rate as f32 * seconds) as usize;
        #[allow(clippy::cast_precision_loss)]
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_i16_coercion_keeps_level() {
        let frame = AudioFrame::new(RawSamples::I16(vec![0, 8192, -8192, -32768]), 16000, 1);
        assert_eq!(frame.samples, vec![0.0, 0.25, -0.25, -1.0]);
    }

    #[test]
    fn test_i16_dither_stays_quiet() {
        let frame = AudioFrame::new(RawSamples::I16(vec![1, -1, 1, -1]), 16000, 1);
        let out = AudioNormalizer::default().normalize(frame).unwrap();

        assert!(out.peak() < 1e-4);
        assert!((out.samples[0] - 1.0 / 32768.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_two_scales_to_one() {
        let mut samples = vec![0.5, -2.0, 1.0, 0.25];
        normalize_amplitude(&mut samples);

        assert!((peak(&samples) - 1.0).abs() < f32::EPSILON);
        assert!((samples[0] - 0.25).abs() < 1e-6);
        assert!((samples[1] + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_quiet_buffer_unchanged() {
        let mut samples = vec![0.1, -0.3, 0.9];
        let before = samples.clone();
        normalize_amplitude(&mut samples);
        assert_eq!(samples, before);
    }

    #[test]
    fn test_fold_stereo() {
        let mono = fold_channels(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_fold_drops_partial_frame() {
        let mono = fold_channels(&[1.0, 1.0, 0.5], 2);
        assert_eq!(mono, vec![1.0]);
    }

    #[test]
    fn test_resample_one_second_44100_to_16000() {
        let input = sine(44100, 1.0, 0.5);
        let output = resample_linear(&input, 44100, 16000);

        assert!(output.len().abs_diff(16000) <= 1);
        assert!(peak(&output) <= 0.5 + 1e-6);
    }

    #[test]
    fn test_resample_upsamples() {
        let output = resample_linear(&[0.0, 1.0], 8000, 16000);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
        assert!((output[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resample_preserves_energy_roughly() {
        let input = sine(48000, 0.5, 0.8);
        let output = resample_linear(&input, 48000, 16000);

        #[allow(clippy::cast_precision_loss)]
        let rms = |s: &[f32]| (s.iter().map(|x| x * x).sum::<f32>() / s.len() as f32).sqrt();
        assert!((rms(&input) - rms(&output)).abs() < 0.05);
    }

    #[test]
    fn test_normalize_full_pipeline() {
        let stereo: Vec<f32> = sine(44100, 1.0, 2.0)
            .into_iter()
            .flat_map(|s| [s, s])
            .collect();
        let frame = AudioFrame::new(RawSamples::F32(stereo), 44100, 2);

        let out = AudioNormalizer::default().normalize(frame).unwrap();

        assert_eq!(out.channels, 1);
        assert_eq!(out.sample_rate, SAMPLE_RATE);
        assert!(out.peak() <= 1.0);
        assert!(out.samples.len().abs_diff(16000) <= 1);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = AudioNormalizer::default();
        let frame = AudioFrame::new(RawSamples::I16(vec![1200, -30000, 250, 8000]), 22050, 1);

        let once = normalizer.normalize(frame).unwrap();
        let twice = normalizer.normalize(once.clone()).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_rejects_zero_channels() {
        let frame = AudioFrame {
            samples: vec![0.0],
            sample_rate: 16000,
            channels: 0,
        };
        assert!(AudioNormalizer::default().normalize(frame).is_err());
    }

    #[test]
    fn test_empty_frame_stays_empty() {
        let out = AudioNormalizer::default()
            .normalize(AudioFrame::mono(Vec::new(), 44100))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_duration() {
        let frame = AudioFrame::new(RawSamples::F32(vec![0.0; 32000]), 16000, 2);
        assert_eq!(frame.duration(), Duration::from_secs(1));
    }
}
