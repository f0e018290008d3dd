//! Seed compression profiles and the synthetic benchmark that refines them.

use std::time::Instant;

use super::{codec, CompressionInfo, CompressionLevel};
use crate::device::TextureFormat;

const MIB: f64 = 1024.0 * 1024.0;

/// Levels that produce a distinct payload for every format.
pub(crate) const ENCODING_LEVELS: [CompressionLevel; 4] = [
    CompressionLevel::Fast,
    CompressionLevel::Balanced,
    CompressionLevel::Maximum,
    CompressionLevel::Lossless,
];

/// Expected ratio and cost (compress, decompress in µs per MiB) before any
/// benchmark has run.
fn seed_figures(format: TextureFormat, level: CompressionLevel) -> (f32, f32, f32) {
    match (format.is_float(), level) {
        (false, CompressionLevel::Fast) => (1.5, 1400.0, 600.0),
        (false, CompressionLevel::Balanced) => (1.9, 1500.0, 650.0),
        (false, CompressionLevel::Maximum) => (2.5, 1600.0, 700.0),
        (false, _) => (1.2, 1100.0, 450.0),
        (true, CompressionLevel::Fast) => (1.6, 1800.0, 900.0),
        (true, CompressionLevel::Balanced) => (2.0, 1850.0, 900.0),
        (true, CompressionLevel::Maximum) => (2.6, 1900.0, 950.0),
        (true, _) => (1.15, 1600.0, 850.0),
    }
}

pub(crate) fn seed_profile(format: TextureFormat, level: CompressionLevel) -> CompressionInfo {
    let (ratio, compress, decompress) = seed_figures(format, level);
    CompressionInfo {
        level,
        format,
        compression_ratio: ratio,
        compress_us_per_mib: compress,
        decompress_us_per_mib: decompress,
        is_lossy: level.is_lossy(),
        tolerance: codec::tolerance(format, level),
    }
}

/// Deterministic texel pattern: smooth gradients plus a little hashed noise,
/// roughly the entropy of decoded video frames.
pub(crate) fn synthetic_texels(format: TextureFormat, width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    let channels = match format {
        TextureFormat::R8 | TextureFormat::R32F => 1,
        _ => 4,
    };
    let mut out = Vec::with_capacity(pixels * format.bytes_per_pixel());
    for p in 0..pixels {
        let x = (p % width as usize) as u32;
        let y = (p / width as usize) as u32;
        for c in 0..channels as u32 {
            let noise = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503) ^ c) >> 29;
            let base = (x + y * 2 + c * 31) % 256;
            if format.is_float() {
                let v = base as f32 / 255.0 + noise as f32 * 1e-3;
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                out.push(((base + noise) % 256) as u8);
            }
        }
    }
    out
}

/// Measure one format/level pair on synthetic data.
pub(crate) fn measure(format: TextureFormat, level: CompressionLevel) -> Option<CompressionInfo> {
    let raw = synthetic_texels(format, 256, 256);
    let mib = raw.len() as f64 / MIB;

    let start = Instant::now();
    let payload = codec::encode(format, level, &raw).ok()?;
    let compress_us = start.elapsed().as_secs_f64() * 1e6;

    let start = Instant::now();
    codec::decode(format, level, &payload, raw.len()).ok()?;
    let decompress_us = start.elapsed().as_secs_f64() * 1e6;

    Some(CompressionInfo {
        level,
        format,
        compression_ratio: raw.len() as f32 / payload.len().max(1) as f32,
        compress_us_per_mib: (compress_us / mib) as f32,
        decompress_us_per_mib: (decompress_us / mib) as f32,
        is_lossy: level.is_lossy(),
        tolerance: codec::tolerance(format, level),
    })
}
