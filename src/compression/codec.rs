//! Texture payload codec.
//!
//! 8-bit formats are quantized by dropping low bits and bit-packed; float
//! formats have low mantissa bits cleared and are split into byte planes so
//! that LZ4 sees long runs of similar exponent bytes.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use thiserror::Error;

use super::CompressionLevel;
use crate::device::TextureFormat;

/// Codec failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("LZ4 decompression failed: {0}")]
    Lz4(String),

    #[error("Payload truncated: expected {expected} values, decoded {decoded}")]
    Truncated { expected: usize, decoded: usize },

    #[error("Raw length {len} is not a multiple of {unit}")]
    Misaligned { len: usize, unit: usize },
}

/// Low bits dropped from each 8-bit channel.
fn dropped_bits_u8(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fast => 2,
        CompressionLevel::Balanced => 3,
        CompressionLevel::Maximum => 4,
        CompressionLevel::None | CompressionLevel::Lossless => 0,
    }
}

/// Low mantissa bits cleared from each `f32`.
fn cleared_mantissa_bits(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fast => 8,
        CompressionLevel::Balanced => 12,
        CompressionLevel::Maximum => 16,
        CompressionLevel::None | CompressionLevel::Lossless => 0,
    }
}

/// Declared reconstruction tolerance.
///
/// Absolute per-channel error for 8-bit formats, relative error for float
/// formats. Zero means bit-identical.
pub fn tolerance(format: TextureFormat, level: CompressionLevel) -> f32 {
    if !level.is_lossy() {
        return 0.0;
    }
    if format.is_float() {
        2f32.powi(cleared_mantissa_bits(level) as i32 - 23)
    } else {
        (1u32 << (dropped_bits_u8(level) - 1)) as f32
    }
}

/// Encode raw texels at `level`.
pub fn encode(format: TextureFormat, level: CompressionLevel, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    if level == CompressionLevel::None {
        return Ok(raw.to_vec());
    }

    if format.is_float() {
        check_alignment(raw.len(), 4)?;
        let bits = cleared_mantissa_bits(level);
        let planes = if bits > 0 {
            let truncated: Vec<u8> = raw
                .chunks_exact(4)
                .flat_map(|c| truncate_mantissa(c, bits))
                .collect();
            shuffle_planes(&truncated)
        } else {
            shuffle_planes(raw)
        };
        Ok(compress_prepend_size(&planes))
    } else {
        let bits = dropped_bits_u8(level);
        if bits == 0 {
            return Ok(compress_prepend_size(raw));
        }
        let packed = pack_bits(raw.iter().map(|&b| b >> bits), 8 - bits, raw.len());
        Ok(compress_prepend_size(&packed))
    }
}

/// Decode a payload produced by [`encode`] back to `raw_len` bytes of texels.
pub fn decode(
    format: TextureFormat,
    level: CompressionLevel,
    payload: &[u8],
    raw_len: usize,
) -> Result<Vec<u8>, CodecError> {
    if level == CompressionLevel::None {
        return Ok(payload.to_vec());
    }

    let inflated = decompress_size_prepended(payload).map_err(|e| CodecError::Lz4(e.to_string()))?;

    if format.is_float() {
        check_alignment(raw_len, 4)?;
        if inflated.len() != raw_len {
            return Err(CodecError::Truncated {
                expected: raw_len,
                decoded: inflated.len(),
            });
        }
        return Ok(unshuffle_planes(&inflated));
    }

    let bits = dropped_bits_u8(level);
    if bits == 0 {
        if inflated.len() != raw_len {
            return Err(CodecError::Truncated {
                expected: raw_len,
                decoded: inflated.len(),
            });
        }
        return Ok(inflated);
    }

    let buckets = unpack_bits(&inflated, 8 - bits, raw_len)?;
    let midpoint = 1u8 << (bits - 1);
    Ok(buckets.into_iter().map(|b| (b << bits) | midpoint).collect())
}

fn check_alignment(len: usize, unit: usize) -> Result<(), CodecError> {
    if len % unit != 0 {
        return Err(CodecError::Misaligned { len, unit });
    }
    Ok(())
}

/// Clear the low `bits` mantissa bits of a normal finite little-endian `f32`.
/// Zero, subnormal and non-finite values pass through unchanged.
fn truncate_mantissa(bytes: &[u8], bits: u32) -> [u8; 4] {
    let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if !value.is_normal() {
        return value.to_le_bytes();
    }
    let mask = !((1u32 << bits) - 1);
    f32::from_bits(value.to_bits() & mask).to_le_bytes()
}

/// Group byte `i` of every 4-byte word into plane `i`.
fn shuffle_planes(raw: &[u8]) -> Vec<u8> {
    let words = raw.len() / 4;
    let mut out = vec![0u8; raw.len()];
    for (w, chunk) in raw.chunks_exact(4).enumerate() {
        for (plane, &b) in chunk.iter().enumerate() {
            out[plane * words + w] = b;
        }
    }
    out
}

fn unshuffle_planes(planes: &[u8]) -> Vec<u8> {
    let words = planes.len() / 4;
    let mut out = vec![0u8; planes.len()];
    for w in 0..words {
        for plane in 0..4 {
            out[w * 4 + plane] = planes[plane * words + w];
        }
    }
    out
}

fn pack_bits(values: impl Iterator<Item = u8>, bits: u32, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity((count * bits as usize + 7) / 8);
    let mut acc: u32 = 0;
    let mut filled: u32 = 0;
    for v in values {
        acc |= (v as u32) << filled;
        filled += bits;
        while filled >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            filled -= 8;
        }
    }
    if filled > 0 {
        out.push(acc as u8);
    }
    out
}

fn unpack_bits(packed: &[u8], bits: u32, count: usize) -> Result<Vec<u8>, CodecError> {
    let mask = (1u32 << bits) - 1;
    let mut out = Vec::with_capacity(count);
    let mut bytes = packed.iter();
    let mut acc: u32 = 0;
    let mut filled: u32 = 0;
    while out.len() < count {
        while filled < bits {
            let b = bytes.next().ok_or(CodecError::Truncated {
                expected: count,
                decoded: out.len(),
            })?;
            acc |= (*b as u32) << filled;
            filled += 8;
        }
        out.push((acc & mask) as u8);
        acc >>= bits;
        filled -= bits;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_u8(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn to_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_pack_unpack_bits() {
        let values: Vec<u8> = (0..37).map(|i| (i % 32) as u8).collect();
        let packed = pack_bits(values.iter().copied(), 5, values.len());
        assert_eq!(packed.len(), (37 * 5 + 7) / 8);
        assert_eq!(unpack_bits(&packed, 5, values.len()).unwrap(), values);
    }

    #[test]
    fn test_unpack_truncated() {
        let result = unpack_bits(&[0xFF], 6, 4);
        assert!(matches!(result, Err(CodecError::Truncated { expected: 4, .. })));
    }

    #[test]
    fn test_u8_lossy_within_tolerance() {
        let raw = gradient_u8(4096);
        for level in [CompressionLevel::Fast, CompressionLevel::Balanced, CompressionLevel::Maximum] {
            let tol = tolerance(TextureFormat::Rgba8, level);
            let payload = encode(TextureFormat::Rgba8, level, &raw).unwrap();
            let decoded = decode(TextureFormat::Rgba8, level, &payload, raw.len()).unwrap();
            for (a, b) in raw.iter().zip(&decoded) {
                assert!((*a as f32 - *b as f32).abs() <= tol, "{:?}: {} vs {}", level, a, b);
            }
        }
    }

    #[test]
    fn test_u8_tolerances() {
        assert_eq!(tolerance(TextureFormat::R8, CompressionLevel::Fast), 2.0);
        assert_eq!(tolerance(TextureFormat::R8, CompressionLevel::Balanced), 4.0);
        assert_eq!(tolerance(TextureFormat::R8, CompressionLevel::Maximum), 8.0);
        assert_eq!(tolerance(TextureFormat::R8, CompressionLevel::Lossless), 0.0);
    }

    #[test]
    fn test_float_lossless_bit_identical() {
        let raw = floats(&[0.0, -0.0, 1.5, f32::NAN, f32::INFINITY, 1e-40, 3.14159, -2.5e7]);
        let payload = encode(TextureFormat::R32F, CompressionLevel::Lossless, &raw).unwrap();
        let decoded = decode(TextureFormat::R32F, CompressionLevel::Lossless, &payload, raw.len()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_float_lossy_relative_error() {
        let values: Vec<f32> = (1..512).map(|i| i as f32 * 0.731 - 100.0).collect();
        let raw = floats(&values);
        let level = CompressionLevel::Maximum;
        let tol = tolerance(TextureFormat::Rgba32F, level);
        let payload = encode(TextureFormat::Rgba32F, level, &raw).unwrap();
        let decoded = to_f32(&decode(TextureFormat::Rgba32F, level, &payload, raw.len()).unwrap());
        for (a, b) in values.iter().zip(&decoded) {
            assert!((a - b).abs() <= tol * a.abs());
        }
    }

    #[test]
    fn test_float_non_finite_passthrough() {
        let raw = floats(&[f32::INFINITY, f32::NEG_INFINITY, 1e-42]);
        let payload = encode(TextureFormat::R32F, CompressionLevel::Maximum, &raw).unwrap();
        let decoded = decode(TextureFormat::R32F, CompressionLevel::Maximum, &payload, raw.len()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_none_is_identity() {
        let raw = gradient_u8(64);
        assert_eq!(encode(TextureFormat::Bgra8, CompressionLevel::None, &raw).unwrap(), raw);
    }

    #[test]
    fn test_misaligned_float_payload() {
        let result = encode(TextureFormat::R32F, CompressionLevel::Fast, &[0u8; 7]);
        assert!(matches!(result, Err(CodecError::Misaligned { len: 7, unit: 4 })));
    }

    #[test]
    fn test_corrupt_payload() {
        let result = decode(TextureFormat::R8, CompressionLevel::Lossless, &[1, 2, 3], 16);
        assert!(result.is_err());
    }
}
