//! PCM16 wire codec.
//!
//! Realtime APIs carry audio as base64-encoded 16-bit little-endian PCM.
//! The transforms here are pure and stateless:
//!
//! - `encode`: normalized `f32` samples -> PCM16 LE bytes -> base64
//! - `decode`: base64 -> PCM16 LE bytes -> `i16` samples
//!
//! Encoding does not clamp. Out-of-range samples wrap per two's-complement
//! after truncation toward zero, so callers that need saturation must clamp
//! before encoding.

use base64::prelude::*;
use thiserror::Error;

/// Errors raised while decoding wire audio.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(String),
    #[error("Audio payload length {0} is not a whole number of 16-bit samples")]
    OddLength(usize),
}

/// Scale one normalized sample to its PCM16 value.
///
/// Negative samples scale by 32768 and non-negative samples by 32767. The
/// scaled value is truncated toward zero and wrapped into `i16`.
#[inline]
pub fn sample_to_pcm16(sample: f32) -> i16 {
    let sample = f64::from(sample);
    if !sample.is_finite() {
        return 0;
    }
    let scaled = if sample < 0.0 {
        sample * 32768.0
    } else {
        sample * 32767.0
    };
    // `as i64` truncates toward zero; `as i16` keeps the low 16 bits.
    (scaled as i64) as i16
}

/// Convert one PCM16 sample back to a normalized float.
#[inline]
pub fn pcm16_to_sample(value: i16) -> f32 {
    if value < 0 {
        f32::from(value) / 32768.0
    } else {
        f32::from(value) / 32767.0
    }
}

/// Convert float samples to PCM16 little-endian bytes.
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }
    bytes
}

/// Parse PCM16 little-endian bytes into samples.
pub fn pcm16_bytes_to_i16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Convert PCM16 samples to normalized floats.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(pcm16_to_sample).collect()
}

/// Encode float samples as base64 PCM16.
pub fn encode(samples: &[f32]) -> String {
    BASE64_STANDARD.encode(f32_to_pcm16_bytes(samples))
}

/// Decode a base64 PCM16 payload into raw bytes, checking sample alignment.
pub fn decode_bytes(payload: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes)
}

/// Decode a base64 PCM16 payload into samples.
pub fn decode(payload: &str) -> Result<Vec<i16>, CodecError> {
    pcm16_bytes_to_i16(&decode_bytes(payload)?)
}

/// Decode a base64 PCM16 payload straight to normalized floats.
pub fn decode_to_f32(payload: &str) -> Result<Vec<f32>, CodecError> {
    Ok(pcm16_to_f32(&decode(payload)?))
}

/// Root-mean-square level of a block, clamped to `[0, 1]`.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let s = f64::from(s);
            s * s
        })
        .sum();
    let rms = (sum / samples.len() as f64).sqrt() as f32;
    if rms.is_finite() { rms.clamp(0.0, 1.0) } else { 0.0 }
}
