// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Texture compression for cache residency.
//!
//! Compression trades a decode on the next access for resident bytes. The
//! [`TextureCompression`] manager performs the device round trip (read,
//! encode, upload, destroy input) and keeps per-format profiles used by the
//! cache to decide whether a texture is worth compressing at all.

pub mod codec;
mod profiles;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceError, GraphicsDevice, TextureDesc, TextureFormat, TextureHandle};

pub use codec::CodecError;

const MIB: usize = 1024 * 1024;

/// Compression levels, ordered from cheapest to most thorough.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Raw texels, fastest access.
    #[default]
    None,
    Fast,
    Balanced,
    Maximum,
    /// Bit-identical round trip.
    Lossless,
}

impl CompressionLevel {
    pub fn is_lossy(self) -> bool {
        matches!(
            self,
            CompressionLevel::Fast | CompressionLevel::Balanced | CompressionLevel::Maximum
        )
    }
}

/// Compression errors.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unsupported format {format} for level {level:?}")]
    UnsupportedFormat {
        format: TextureFormat,
        level: CompressionLevel,
    },

    #[error("Texture {0} is already compressed")]
    AlreadyCompressed(TextureHandle),

    #[error("Compression ineffective: {original} bytes encoded to {compressed} bytes")]
    Ineffective { original: usize, compressed: usize },
}

/// Expected behaviour of one format/level pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionInfo {
    pub level: CompressionLevel,
    pub format: TextureFormat,
    /// Raw bytes divided by compressed bytes.
    pub compression_ratio: f32,
    pub compress_us_per_mib: f32,
    pub decompress_us_per_mib: f32,
    pub is_lossy: bool,
    /// See [`codec::tolerance`].
    pub tolerance: f32,
}

/// Thresholds deciding whether compressing a resident texture pays off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionPolicy {
    /// Textures smaller than this are never compressed.
    pub min_texture_bytes: usize,
    /// Idle time before a resident texture becomes a compression candidate.
    pub min_idle_ms: u64,
    /// Value, in milliseconds of decode time, assigned to each MiB saved.
    pub mib_value_ms: f32,
    /// Level used by the background pass.
    pub background_level: CompressionLevel,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            min_texture_bytes: MIB,
            min_idle_ms: 5_000,
            mib_value_ms: 0.5,
            background_level: CompressionLevel::Balanced,
        }
    }
}

/// Counters for compression activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    pub textures_compressed: u64,
    pub textures_decompressed: u64,
    pub bytes_saved: u64,
}

/// Device-backed compression manager.
pub struct TextureCompression {
    device: Arc<dyn GraphicsDevice>,
    profiles: RwLock<HashMap<(TextureFormat, CompressionLevel), CompressionInfo>>,
    policy: RwLock<CompressionPolicy>,
    compressed: AtomicU64,
    decompressed: AtomicU64,
    bytes_saved: AtomicU64,
}

impl TextureCompression {
    pub fn new(device: Arc<dyn GraphicsDevice>, policy: CompressionPolicy) -> Self {
        let mut profiles = HashMap::new();
        for format in TextureFormat::ALL {
            for level in profiles::ENCODING_LEVELS {
                profiles.insert((format, level), profiles::seed_profile(format, level));
            }
        }
        Self {
            device,
            profiles: RwLock::new(profiles),
            policy: RwLock::new(policy),
            compressed: AtomicU64::new(0),
            decompressed: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> CompressionPolicy {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: CompressionPolicy) {
        *self.policy.write() = policy;
    }

    /// Replace `input` with a compressed copy.
    ///
    /// On success the input texture has been destroyed and the returned
    /// handle owns the payload. On error the input is left untouched.
    pub fn compress_for_cache(
        &self,
        input: TextureHandle,
        level: CompressionLevel,
    ) -> Result<TextureHandle, CompressionError> {
        let output = self.compress_copy(input, level)?;
        self.retire(input, output)
    }

    /// Replace a compressed texture with a raw copy. Raw inputs are returned
    /// unchanged.
    pub fn decompress_for_use(&self, compressed: TextureHandle) -> Result<TextureHandle, CompressionError> {
        let output = self.decompress_copy(compressed)?;
        self.retire(compressed, output)
    }

    /// Create a compressed copy of `input`, leaving `input` alive.
    pub fn compress_copy(
        &self,
        input: TextureHandle,
        level: CompressionLevel,
    ) -> Result<TextureHandle, CompressionError> {
        if level == CompressionLevel::None {
            return Ok(input);
        }

        let desc = self.device.texture_desc(input)?;
        if desc.is_compressed() {
            return Err(CompressionError::AlreadyCompressed(input));
        }
        if !self.profiles.read().contains_key(&(desc.format, level)) {
            return Err(CompressionError::UnsupportedFormat {
                format: desc.format,
                level,
            });
        }

        let raw = self.device.read_texture(input)?;
        let start = Instant::now();
        let payload = codec::encode(desc.format, level, &raw)?;
        let elapsed = start.elapsed();

        if payload.len() >= raw.len() {
            return Err(CompressionError::Ineffective {
                original: raw.len(),
                compressed: payload.len(),
            });
        }

        let output = self
            .device
            .create_texture_with_data(&desc.with_compression(level), &payload)?;

        self.observe(desc.format, level, raw.len(), payload.len(), elapsed.as_secs_f64());
        self.compressed.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved
            .fetch_add((raw.len() - payload.len()) as u64, Ordering::Relaxed);

        tracing::debug!(
            input = %input,
            output = %output,
            format = %desc.format,
            ?level,
            raw = raw.len(),
            compressed = payload.len(),
            "Texture compressed"
        );
        Ok(output)
    }

    /// Create a raw copy of a compressed texture, leaving the input alive.
    pub fn decompress_copy(&self, compressed: TextureHandle) -> Result<TextureHandle, CompressionError> {
        let desc = self.device.texture_desc(compressed)?;
        if !desc.is_compressed() {
            return Ok(compressed);
        }

        let payload = self.device.read_texture(compressed)?;
        let raw = codec::decode(desc.format, desc.compression, &payload, desc.raw_size())?;
        let raw_desc = TextureDesc::new(desc.width, desc.height, desc.format);
        let output = self.device.create_texture_with_data(&raw_desc, &raw)?;

        self.decompressed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(input = %compressed, output = %output, "Texture decompressed");
        Ok(output)
    }

    /// Destroy `input` once `output` has replaced it.
    fn retire(&self, input: TextureHandle, output: TextureHandle) -> Result<TextureHandle, CompressionError> {
        if output == input {
            return Ok(output);
        }
        if let Err(e) = self.device.destroy_texture(input) {
            let _ = self.device.destroy_texture(output);
            return Err(e.into());
        }
        Ok(output)
    }

    /// Expected ratio for a format/level pair; 1.0 when no profile exists.
    pub fn get_compression_ratio(&self, format: TextureFormat, level: CompressionLevel) -> f32 {
        self.profiles
            .read()
            .get(&(format, level))
            .map(|p| p.compression_ratio)
            .unwrap_or(1.0)
    }

    /// Map a 0..1 quality requirement onto the best available level.
    pub fn recommend_compression_level(&self, format: TextureFormat, quality_requirement: f32) -> CompressionLevel {
        let desired = if quality_requirement >= 0.95 {
            CompressionLevel::Lossless
        } else if quality_requirement >= 0.8 {
            CompressionLevel::Fast
        } else if quality_requirement >= 0.5 {
            CompressionLevel::Balanced
        } else {
            CompressionLevel::Maximum
        };

        let profiles = self.profiles.read();
        if profiles.contains_key(&(format, desired)) {
            desired
        } else if profiles.contains_key(&(format, CompressionLevel::Lossless)) {
            CompressionLevel::Lossless
        } else {
            CompressionLevel::None
        }
    }

    /// Whether compressing a texture of `texture_size` bytes, accessed
    /// `access_frequency` times per second, saves more than it costs.
    pub fn is_compression_beneficial(&self, texture_size: usize, access_frequency: f32) -> bool {
        let policy = self.policy.read();
        if texture_size < policy.min_texture_bytes {
            return false;
        }
        let level = policy.background_level;
        // Worst case across formats: the caller does not say which one.
        let (ratio, decode_us) = self
            .profiles
            .read()
            .values()
            .filter(|p| p.level == level)
            .fold((f32::MAX, 0.0f32), |(r, d), p| {
                (r.min(p.compression_ratio), d.max(p.decompress_us_per_mib))
            });
        if ratio == f32::MAX || ratio <= 1.0 {
            return false;
        }

        let mib = texture_size as f32 / MIB as f32;
        let saved_mib = mib * (1.0 - 1.0 / ratio);
        let decode_ms = mib * decode_us / 1000.0;
        saved_mib * policy.mib_value_ms > decode_ms * access_frequency.max(0.0)
    }

    /// Profiles registered for a format, ordered by level.
    pub fn get_available_compressions(&self, format: TextureFormat) -> Vec<CompressionInfo> {
        let mut list: Vec<CompressionInfo> = self
            .profiles
            .read()
            .values()
            .filter(|p| p.format == format)
            .copied()
            .collect();
        list.sort_by_key(|p| p.level);
        list
    }

    pub fn add_compression_profile(&self, format: TextureFormat, info: CompressionInfo) {
        let info = CompressionInfo { format, ..info };
        self.profiles.write().insert((format, info.level), info);
    }

    /// Re-measure every registered profile on synthetic texels.
    pub fn benchmark_compression_methods(&self) -> Vec<CompressionInfo> {
        let keys: Vec<_> = self.profiles.read().keys().copied().collect();
        let mut results = Vec::with_capacity(keys.len());
        for (format, level) in keys {
            if let Some(info) = profiles::measure(format, level) {
                self.profiles.write().insert((format, level), info);
                results.push(info);
            }
        }
        results.sort_by_key(|p| (p.format as u8, p.level));
        tracing::info!(profiles = results.len(), "Compression benchmark complete");
        results
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            textures_compressed: self.compressed.load(Ordering::Relaxed),
            textures_decompressed: self.decompressed.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Blend an observed compression into the stored profile.
    fn observe(&self, format: TextureFormat, level: CompressionLevel, raw: usize, packed: usize, secs: f64) {
        let mut profiles = self.profiles.write();
        if let Some(p) = profiles.get_mut(&(format, level)) {
            let ratio = raw as f32 / packed.max(1) as f32;
            let us_per_mib = (secs * 1e6 / (raw as f64 / MIB as f64).max(1e-9)) as f32;
            p.compression_ratio = p.compression_ratio * 0.9 + ratio * 0.1;
            p.compress_us_per_mib = p.compress_us_per_mib * 0.9 + us_per_mib * 0.1;
        }
    }
}

#[cfg(test)]
#[path = "compression_tests.rs"]
mod tests;
