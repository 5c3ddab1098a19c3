//! Audio capture from microphone

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio_util::sync::CancellationToken;

use super::{AudioFrame, AudioSource, RawSamples};
use crate::{Error, Result};

/// How often a blocking recording checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Samples accumulated by the input callback
#[derive(Debug, Default)]
enum CaptureBuffer {
    #[default]
    Empty,
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl CaptureBuffer {
    fn take(&mut self) -> RawSamples {
        match std::mem::take(self) {
            Self::Empty => RawSamples::F32(Vec::new()),
            Self::F32(samples) => RawSamples::F32(samples),
            Self::I16(samples) => RawSamples::I16(samples),
        }
    }
}

/// Captures audio from the default input device at its native format
///
/// The stream runs at whatever rate and channel count the device prefers;
/// `AudioNormalizer` brings the result to the recognizer's format.
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    buffer: Arc<Mutex<CaptureBuffer>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnavailable` if no input device can be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::CaptureUnavailable("no input device available".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

        let sample_format = supported.sample_format();
        if !matches!(sample_format, SampleFormat::F32 | SampleFormat::I16) {
            return Err(Error::CaptureUnavailable(format!(
                "unsupported input sample format {sample_format:?}"
            )));
        }

        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
            buffer: Arc::new(Mutex::new(CaptureBuffer::Empty)),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "audio capture error");

        let stream = match self.sample_format {
            SampleFormat::I16 => {
                let buffer = Arc::clone(&self.buffer);
                self.device.build_input_stream(
                    &self.config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if let Ok(mut buf) = buffer.lock() {
                            match &mut *buf {
                                CaptureBuffer::I16(samples) => samples.extend_from_slice(data),
                                other => *other = CaptureBuffer::I16(data.to_vec()),
                            }
                        }
                    },
                    on_error,
                    None,
                )
            }
            _ => {
                let buffer = Arc::clone(&self.buffer);
                self.device.build_input_stream(
                    &self.config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if let Ok(mut buf) = buffer.lock() {
                            match &mut *buf {
                                CaptureBuffer::F32(samples) => samples.extend_from_slice(data),
                                other => *other = CaptureBuffer::F32(data.to_vec()),
                            }
                        }
                    },
                    on_error,
                    None,
                )
            }
        }
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Take everything captured so far as a frame
    #[must_use]
    pub fn take_frame(&self) -> AudioFrame {
        let samples = self
            .buffer
            .lock()
            .map(|mut buf| buf.take())
            .unwrap_or(RawSamples::F32(Vec::new()));
        AudioFrame::new(samples, self.config.sample_rate.0, self.config.channels)
    }

    /// Native sample rate of the device
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Native channel count of the device
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Record for `duration` on the calling thread
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `cancel` fires first, or a capture error
    pub fn record_blocking(
        &mut self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<AudioFrame> {
        self.start()?;
        let started = Instant::now();

        while started.elapsed() < duration {
            if cancel.is_cancelled() {
                self.stop();
                return Err(Error::Cancelled);
            }
            std::thread::sleep(POLL_INTERVAL.min(duration.saturating_sub(started.elapsed())));
        }

        self.stop();
        let frame = self.take_frame();
        tracing::debug!(
            samples = frame.samples.len(),
            seconds = frame.duration().as_secs_f32(),
            "recording complete"
        );
        Ok(frame)
    }
}

/// `AudioSource` backed by the default microphone
///
/// cpal streams are not `Send`, so each capture opens the device on a
/// blocking thread and records there.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    /// Create a microphone source
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn capture(&self, duration: Duration, cancel: &CancellationToken) -> Result<AudioFrame> {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut capture = AudioCapture::new()?;
            capture.record_blocking(duration, &cancel)
        })
        .await
        .map_err(|e| Error::CaptureUnavailable(format!("capture task failed: {e}")))?
    }
}

/// Convert f32 samples to 16-bit mono WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
