// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! In-process device backed by a generation-checked slot table.
//!
//! Used by tests and by hosts that run the optimizer without a real GPU
//! backend. Texture payloads are kept in host memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{DeviceError, DeviceMemoryInfo, GraphicsDevice, TextureDesc, TextureHandle};

struct StoredTexture {
    desc: TextureDesc,
    data: Vec<u8>,
}

struct Slot {
    generation: u32,
    texture: Option<StoredTexture>,
}

struct DeviceState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    used: usize,
    live: usize,
}

impl DeviceState {
    fn lookup(&self, handle: TextureHandle) -> Result<&StoredTexture, DeviceError> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.texture.as_ref())
            .ok_or(DeviceError::StaleHandle(handle))
    }
}

/// Mock graphics device with a fixed VRAM capacity.
pub struct MockDevice {
    capacity: usize,
    external_usage: AtomicUsize,
    fail_next: AtomicUsize,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            external_usage: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            state: Mutex::new(DeviceState {
                slots: Vec::new(),
                free: Vec::new(),
                used: 0,
                live: 0,
            }),
        }
    }

    /// Simulate VRAM held by other consumers (effects pipeline, other apps).
    pub fn set_external_usage(&self, bytes: usize) {
        self.external_usage.store(bytes, Ordering::SeqCst);
    }

    /// Make the next `count` texture creations fail with `OperationFailed`.
    pub fn fail_next_allocations(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Count of live (un-destroyed) textures, useful for leak detection.
    pub fn leak_count(&self) -> usize {
        self.state.lock().live
    }

    /// Bytes held by textures created through this device.
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert(&self, desc: TextureDesc, data: Vec<u8>) -> Result<TextureHandle, DeviceError> {
        if self.take_injected_failure() {
            return Err(DeviceError::OperationFailed("injected allocation failure".into()));
        }

        let size = data.len();
        let mut s = self.state.lock();
        let in_use = s.used + self.external_usage.load(Ordering::SeqCst);
        if in_use + size > self.capacity {
            return Err(DeviceError::OutOfMemory {
                required: size,
                available: self.capacity.saturating_sub(in_use),
            });
        }

        let texture = StoredTexture { desc, data };
        let handle = match s.free.pop() {
            Some(index) => {
                let slot = &mut s.slots[index as usize];
                slot.texture = Some(texture);
                TextureHandle::new(index, slot.generation)
            }
            None => {
                let index = s.slots.len() as u32;
                s.slots.push(Slot {
                    generation: 1,
                    texture: Some(texture),
                });
                TextureHandle::new(index, 1)
            }
        };
        s.used += size;
        s.live += 1;
        Ok(handle)
    }
}

fn validate_desc(desc: &TextureDesc) -> Result<(), DeviceError> {
    if desc.width == 0 || desc.height == 0 {
        return Err(DeviceError::InvalidDescriptor(format!(
            "zero-sized texture {}x{}",
            desc.width, desc.height
        )));
    }
    Ok(())
}

impl GraphicsDevice for MockDevice {
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle, DeviceError> {
        validate_desc(desc)?;
        if desc.is_compressed() {
            return Err(DeviceError::InvalidDescriptor(
                "compressed textures require a payload".into(),
            ));
        }
        self.insert(*desc, vec![0u8; desc.raw_size()])
    }

    fn create_texture_with_data(
        &self,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<TextureHandle, DeviceError> {
        validate_desc(desc)?;
        if desc.is_compressed() {
            if data.is_empty() {
                return Err(DeviceError::DataSizeMismatch { expected: 1, actual: 0 });
            }
        } else if data.len() != desc.raw_size() {
            return Err(DeviceError::DataSizeMismatch {
                expected: desc.raw_size(),
                actual: data.len(),
            });
        }
        self.insert(*desc, data.to_vec())
    }

    fn destroy_texture(&self, handle: TextureHandle) -> Result<(), DeviceError> {
        let mut s = self.state.lock();
        let slot = s
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(DeviceError::StaleHandle(handle))?;
        let texture = slot.texture.take().ok_or(DeviceError::StaleHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        s.free.push(handle.index());
        s.used -= texture.data.len();
        s.live -= 1;
        Ok(())
    }

    fn texture_desc(&self, handle: TextureHandle) -> Result<TextureDesc, DeviceError> {
        self.state.lock().lookup(handle).map(|t| t.desc)
    }

    fn texture_size(&self, handle: TextureHandle) -> Result<usize, DeviceError> {
        self.state.lock().lookup(handle).map(|t| t.data.len())
    }

    fn read_texture(&self, handle: TextureHandle) -> Result<Vec<u8>, DeviceError> {
        self.state.lock().lookup(handle).map(|t| t.data.clone())
    }

    fn memory_info(&self) -> DeviceMemoryInfo {
        let s = self.state.lock();
        let used = (s.used + self.external_usage.load(Ordering::SeqCst)).min(self.capacity);
        DeviceMemoryInfo {
            total: self.capacity,
            used,
            available: self.capacity - used,
            allocation_count: s.live,
        }
    }
}
