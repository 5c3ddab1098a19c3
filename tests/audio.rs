//! Audio pipeline integration tests
//!
//! Exercises normalization and WAV encoding without audio hardware

use std::io::Cursor;

use kamen::voice::{AudioFrame, AudioNormalizer, RawSamples, SAMPLE_RATE, samples_to_wav};

/// Generate an interleaved sine wave
fn generate_sine(frequency: f32, secs: f32, rate: u32, channels: u16, amplitude: f32) -> Vec<f32> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let frames = (rate as f32 * secs) as usize;
    #[allow(clippy::cast_precision_loss)]
    (0..frames)
        .flat_map(|i| {
            let t = i as f32 / rate as f32;
            let s = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
            std::iter::repeat_n(s, usize::from(channels))
        })
        .collect()
}

#[test]
fn test_device_capture_becomes_recognizer_input() {
    let normalizer = AudioNormalizer::default();
    let frame = AudioFrame::mono(Vec::new(), 48_000);
    assert!(normalizer.normalize(frame).unwrap().is_empty());

    let samples = generate_sine(440.0, 1.0, 48_000, 2, 0.8);
    let frame = AudioFrame {
        samples,
        sample_rate: 48_000,
        channels: 2,
    };

    let out = normalizer.normalize(frame).unwrap();
    assert_eq!(out.channels, 1);
    assert_eq!(out.sample_rate, SAMPLE_RATE);
    assert!(out.frames().abs_diff(16_000) <= 1);
    assert!(out.peak() <= 1.0);
}

#[test]
#[allow(clippy::cast_possible_truncation)]
fn test_integer_capture_keeps_its_level() {
    let raw: Vec<i16> = generate_sine(220.0, 0.5, 16_000, 1, 1.0)
        .into_iter()
        .map(|s| (s * 8192.0) as i16)
        .collect();

    let frame = AudioFrame::new(RawSamples::I16(raw), 16_000, 1);
    assert!(frame.peak() <= 0.25);

    // A quarter-scale utterance stays quarter-scale
    let out = AudioNormalizer::default().normalize(frame).unwrap();
    assert!((out.peak() - 0.25).abs() < 1e-3);
    assert_eq!(out.frames(), 8_000);
}

#[test]
fn test_integer_dither_is_near_silent() {
    let raw: Vec<i16> = (0..1600).map(|i| if i % 2 == 0 { 1 } else { -1 }).collect();

    let out = AudioNormalizer::default()
        .normalize(AudioFrame::new(RawSamples::I16(raw), 16_000, 1))
        .unwrap();

    assert!(out.peak() < 1e-4);
}

#[test]
fn test_normalized_audio_encodes_to_wav() {
    let samples = generate_sine(440.0, 0.25, 44_100, 1, 0.5);
    let out = AudioNormalizer::default()
        .normalize(AudioFrame::mono(samples, 44_100))
        .unwrap();

    let wav = samples_to_wav(&out.samples, out.sample_rate).unwrap();
    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();

    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(reader.len() as usize, out.samples.len());
}

#[test]
fn test_custom_target_rate() {
    let normalizer = AudioNormalizer::new(8_000).unwrap();
    let out = normalizer
        .normalize(AudioFrame::mono(vec![0.1; 16_000], 16_000))
        .unwrap();

    assert_eq!(out.sample_rate, 8_000);
    assert!(out.frames().abs_diff(8_000) <= 1);
    assert!(AudioNormalizer::new(0).is_err());
}
