// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Graphics device boundary.
//!
//! The optimizer never owns GPU resources directly. Textures live in the
//! device behind opaque generation-checked handles; the cache only stores
//! handles plus metadata, so eviction is table removal followed by a
//! `destroy_texture` call.

mod mock;

use std::fmt;
use thiserror::Error;

use crate::compression::CompressionLevel;

pub use mock::MockDevice;

/// Pixel formats understood by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    R8,
    Rgba32F,
    R32F,
}

impl TextureFormat {
    pub const ALL: [TextureFormat; 5] = [
        TextureFormat::Rgba8,
        TextureFormat::Bgra8,
        TextureFormat::R8,
        TextureFormat::Rgba32F,
        TextureFormat::R32F,
    ];

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
            TextureFormat::R8 => 1,
            TextureFormat::Rgba32F => 16,
            TextureFormat::R32F => 4,
        }
    }

    /// True for formats whose channels are IEEE-754 `f32`.
    pub fn is_float(self) -> bool {
        matches!(self, TextureFormat::Rgba32F | TextureFormat::R32F)
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureFormat::Rgba8 => write!(f, "RGBA8"),
            TextureFormat::Bgra8 => write!(f, "BGRA8"),
            TextureFormat::R8 => write!(f, "R8"),
            TextureFormat::Rgba32F => write!(f, "RGBA32F"),
            TextureFormat::R32F => write!(f, "R32F"),
        }
    }
}

/// Texture creation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Encoding of the stored payload. `None` means raw texels.
    pub compression: CompressionLevel,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            compression: CompressionLevel::None,
        }
    }

    /// Size of the texture in bytes when stored uncompressed.
    pub fn raw_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionLevel::None
    }

    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.compression = level;
        self
    }
}

/// Opaque texture handle: slot index plus generation.
///
/// A handle outlives its texture safely: once the slot is reused the
/// generation no longer matches and every device call reports
/// [`DeviceError::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle {
    index: u32,
    generation: u32,
}

impl TextureHandle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}v{}", self.index, self.generation)
    }
}

/// Device-level memory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMemoryInfo {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub allocation_count: usize,
}

/// Device error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Out of device memory: required {required} bytes, available {available} bytes")]
    OutOfMemory { required: usize, available: usize },

    #[error("Stale or unknown texture handle: {0}")]
    StaleHandle(TextureHandle),

    #[error("Invalid texture descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Texture data size mismatch: expected {expected} bytes, got {actual} bytes")]
    DataSizeMismatch { expected: usize, actual: usize },

    #[error("Device operation failed: {0}")]
    OperationFailed(String),
}

/// Trait abstracting the graphics device collaborator.
///
/// Implementations must be callable from loader and background threads.
pub trait GraphicsDevice: Send + Sync {
    /// Create a zero-filled raw texture.
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle, DeviceError>;

    /// Create a texture and issue the upload of `data`.
    fn create_texture_with_data(
        &self,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<TextureHandle, DeviceError>;

    fn destroy_texture(&self, handle: TextureHandle) -> Result<(), DeviceError>;

    fn texture_desc(&self, handle: TextureHandle) -> Result<TextureDesc, DeviceError>;

    /// Bytes of VRAM held by the texture.
    fn texture_size(&self, handle: TextureHandle) -> Result<usize, DeviceError>;

    /// Read back the stored payload.
    fn read_texture(&self, handle: TextureHandle) -> Result<Vec<u8>, DeviceError>;

    fn memory_info(&self) -> DeviceMemoryInfo;
}

#[cfg(test)]
#[path = "mock_tests.rs"]
mod tests;
