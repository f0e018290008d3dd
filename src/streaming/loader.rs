//! Frame decode collaborator and a synthetic implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{DeviceError, GraphicsDevice, TextureDesc, TextureFormat, TextureHandle};

use super::StreamQuality;

/// A decoded frame uploaded to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedFrame {
    pub frame: u32,
    pub handle: TextureHandle,
    pub bytes: usize,
}

/// Decodes a frame and uploads it as a raw texture.
///
/// Called from loader threads. Ownership of the returned handle passes to
/// the caller. Implementations must not wait on GPU completion; an issued
/// upload counts as done.
pub trait FrameLoader: Send + Sync {
    fn load_frame(&self, frame: u32, quality: StreamQuality) -> Result<LoadedFrame, DeviceError>;
}

/// Generates deterministic frame content on a device, with optional delay.
pub struct SyntheticFrameLoader {
    device: Arc<dyn GraphicsDevice>,
    width: u32,
    height: u32,
    format: TextureFormat,
    delay: Duration,
    loads: AtomicU64,
}

impl SyntheticFrameLoader {
    pub fn new(device: Arc<dyn GraphicsDevice>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            device,
            width,
            height,
            format,
            delay: Duration::ZERO,
            loads: AtomicU64::new(0),
        }
    }

    /// Simulated decode time per frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn frame_bytes(&self) -> usize {
        TextureDesc::new(self.width, self.height, self.format).raw_size()
    }

    /// Completed load calls, successful or not.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl FrameLoader for SyntheticFrameLoader {
    fn load_frame(&self, frame: u32, _quality: StreamQuality) -> Result<LoadedFrame, DeviceError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let desc = TextureDesc::new(self.width, self.height, self.format);
        let data: Vec<u8> = (0..desc.raw_size())
            .map(|i| ((i / 256) as u32).wrapping_add(frame) as u8)
            .collect();
        let result = self.device.create_texture_with_data(&desc, &data);
        self.loads.fetch_add(1, Ordering::Relaxed);

        let handle = result?;
        Ok(LoadedFrame {
            frame,
            handle,
            bytes: data.len(),
        })
    }
}
