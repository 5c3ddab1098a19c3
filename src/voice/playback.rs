//! Audio playback to speakers

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use tokio_util::sync::CancellationToken;

use super::AudioFrame;
use super::normalize::{fold_channels, normalize_amplitude, resample_linear};
use crate::{Error, Result};

/// Plays audio to the default output device
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioPlayback {
    /// Open the default output device at its native config
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    /// Device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Play an audio file (WAV or MP3) on the calling thread
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub fn play_file_blocking(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let frame = decode_audio_file(path)?;
        self.play_blocking(frame, cancel)
    }

    /// Play a frame on the calling thread until it ends or `cancel` fires
    ///
    /// The frame is folded to mono, resampled to the device rate and copied
    /// to every output channel.
    ///
    /// # Errors
    ///
    /// Returns error if the output stream fails
    pub fn play_blocking(&self, frame: AudioFrame, cancel: &CancellationToken) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let mono = fold_channels(&frame.samples, frame.channels);
        let samples = resample_linear(&mono, frame.sample_rate, self.sample_rate());
        let sample_count = samples.len();

        let cursor = Arc::new(PlaybackCursor {
            samples,
            position: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        });

        let stream = match self.sample_format {
            SampleFormat::I16 => self.build_stream::<i16>(Arc::clone(&cursor))?,
            SampleFormat::U16 => self.build_stream::<u16>(Arc::clone(&cursor))?,
            _ => self.build_stream::<f32>(Arc::clone(&cursor))?,
        };
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(self.sample_rate().max(1));
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = Instant::now();

        while !cursor.finished.load(Ordering::Acquire) {
            if cancel.is_cancelled() {
                tracing::debug!("playback cancelled");
                return Ok(());
            }
            if start.elapsed() > timeout {
                tracing::warn!("playback did not drain before timeout");
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Let the device flush its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");
        Ok(())
    }

    fn build_stream<T>(&self, cursor: Arc<PlaybackCursor>) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(self.config.channels.max(1));

        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = cursor.advance().unwrap_or(0.0);
                        for out in frame.iter_mut() {
                            *out = T::from_sample(sample);
                        }
                    }
                },
                |err: cpal::StreamError| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))
    }
}

/// Shared read position for the output callback
struct PlaybackCursor {
    samples: Vec<f32>,
    position: AtomicUsize,
    finished: AtomicBool,
}

impl PlaybackCursor {
    fn advance(&self) -> Option<f32> {
        let pos = self.position.fetch_add(1, Ordering::AcqRel);
        let sample = self.samples.get(pos).copied();
        if sample.is_none() {
            self.finished.store(true, Ordering::Release);
        }
        sample
    }
}

/// Decode a WAV or MP3 file into a frame
///
/// The format is picked by extension, falling back to the RIFF magic.
///
/// # Errors
///
/// Returns error if the file cannot be read or decoded
pub fn decode_audio_file(path: &Path) -> Result<AudioFrame> {
    let bytes = std::fs::read(path)?;

    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or_else(|| bytes.starts_with(b"RIFF"), |ext| ext.eq_ignore_ascii_case("wav"));

    if is_wav {
        decode_wav(&bytes)
    } else {
        decode_mp3(&bytes)
    }
}

/// Decode WAV bytes, scaling integer samples to [-1.0, 1.0]
fn decode_wav(bytes: &[u8]) -> Result<AudioFrame> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = v as f32;
                    v / scale
                }))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let mut frame = AudioFrame::mono(samples, spec.sample_rate);
    frame.channels = spec.channels;
    normalize_amplitude(&mut frame.samples);
    Ok(frame)
}

/// Decode MP3 bytes, keeping the stream's rate and channel layout
fn decode_mp3(bytes: &[u8]) -> Result<AudioFrame> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;
    let mut channels = 1;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                channels = u16::try_from(frame.channels).unwrap_or(1);
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("MP3 contained no frames".to_string()));
    }

    Ok(AudioFrame {
        samples,
        sample_rate,
        channels,
    })
}
