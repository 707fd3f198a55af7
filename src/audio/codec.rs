//! Conversion between float sample blocks and the 16-bit PCM frames carried
//! on the wire, plus the base64 text encoding the transport needs.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{ParleyError, Result};

/// Rate of outbound (captured) audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Rate of inbound (synthesized) audio when the remote does not say otherwise.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

const PCM_MIME_PREFIX: &str = "audio/pcm";

/// An immutable block of mono float samples at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration, rounded down to the nanosecond.
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Little-endian 16-bit PCM bytes tagged with their sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    data: Vec<u8>,
    sample_rate: u32,
}

impl WireFrame {
    #[must_use]
    pub const fn new(data: Vec<u8>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// Build a frame from a base64 payload and its MIME type, as received
    /// from the remote service.
    pub fn from_transport(mime: &str, payload: &str) -> Result<Self> {
        let sample_rate = parse_mime_rate(mime).unwrap_or(PLAYBACK_SAMPLE_RATE);
        Ok(Self::new(decode_transport(payload)?, sample_rate))
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn mime_type(&self) -> String {
        mime_type(self.sample_rate)
    }

    /// The payload as transport text.
    #[must_use]
    pub fn to_transport(&self) -> String {
        encode_transport(&self.data)
    }
}

#[must_use]
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (samples as u128 * 1_000_000_000) / u128::from(sample_rate);
    Duration::from_nanos(nanos as u64)
}

/// Encode float samples as 16-bit little-endian PCM. Out-of-range input is
/// clamped, never wrapped.
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<WireFrame> {
    if samples.is_empty() {
        return Err(ParleyError::MalformedFrame(
            "cannot encode an empty frame".to_string(),
        ));
    }

    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32768.0)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX));
        data.extend_from_slice(&(scaled as i16).to_le_bytes());
    }

    Ok(WireFrame::new(data, sample_rate))
}

/// Decode 16-bit little-endian PCM back into float samples.
pub fn decode(frame: &WireFrame) -> Result<AudioFrame> {
    let data = frame.data();
    if data.is_empty() {
        return Err(ParleyError::MalformedFrame("empty audio payload".to_string()));
    }
    if data.len() % 2 != 0 {
        return Err(ParleyError::MalformedFrame(format!(
            "PCM payload length {} is not a multiple of 2",
            data.len()
        )));
    }

    let samples = data
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioFrame::new(samples, frame.sample_rate()))
}

#[must_use]
pub fn encode_transport(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_transport(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text)
        .map_err(|e| ParleyError::MalformedFrame(format!("invalid base64 payload: {e}")))
}

#[must_use]
pub fn mime_type(sample_rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={sample_rate}")
}

/// Extract the `rate=` parameter from an `audio/pcm` MIME type.
#[must_use]
pub fn parse_mime_rate(mime: &str) -> Option<u32> {
    let mut parts = mime.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_quantization() {
        let input: Vec<f32> = (0..480)
            .map(|i| (i as f32 / 480.0 * std::f32::consts::TAU).sin() * 0.9)
            .collect();
        let frame = encode(&input, CAPTURE_SAMPLE_RATE).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(frame.data().len(), input.len() * 2);

        let decoded = decode(&frame).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(decoded.sample_rate(), CAPTURE_SAMPLE_RATE);
        assert_eq!(decoded.len(), input.len());
        for (a, b) in input.iter().zip(decoded.samples()) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} vs {b}");
        }
    }

    #[test]
    fn encode_clamps_out_of_range() {
        let frame = encode(&[1.5, -1.5, 0.0, 1.0, -1.0], 16000).unwrap_or_else(|e| panic!("{e}"));
        let values: Vec<i16> = frame
            .data()
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, 0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn encode_rejects_empty() {
        assert!(matches!(
            encode(&[], 16000),
            Err(ParleyError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_odd_length() {
        let frame = WireFrame::new(vec![0, 1, 2], 24000);
        assert!(matches!(decode(&frame), Err(ParleyError::MalformedFrame(_))));
    }

    #[test]
    fn transport_round_trip_all_byte_values() {
        let bytes: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        for len in [0, 1, 2, 3, 511, 512] {
            let slice = &bytes[..len];
            let text = encode_transport(slice);
            assert_eq!(decode_transport(&text).unwrap_or_else(|e| panic!("{e}")), slice);
        }
    }

    #[test]
    fn decode_transport_rejects_garbage() {
        assert!(decode_transport("not base64!!").is_err());
    }

    #[test]
    fn mime_tags() {
        assert_eq!(mime_type(16000), "audio/pcm;rate=16000");
        assert_eq!(parse_mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_mime_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(parse_mime_rate("audio/pcm"), None);
        assert_eq!(parse_mime_rate("audio/wav;rate=8000"), None);
    }

    #[test]
    fn from_transport_defaults_rate() {
        let frame = WireFrame::from_transport("audio/pcm", &encode_transport(&[0, 0]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(frame.sample_rate(), PLAYBACK_SAMPLE_RATE);
    }

    #[test]
    fn frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 2400], 24000);
        assert_eq!(frame.duration(), Duration::from_millis(100));
        let frame = AudioFrame::new(vec![0.0; 4096], 16000);
        assert_eq!(frame.duration(), Duration::from_micros(256_000));
    }
}
