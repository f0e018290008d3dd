//! RAII lease pinning a cache entry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::device::TextureHandle;

/// Keeps an entry's reference count raised while alive.
///
/// A leased entry is skipped by every eviction path. Dropping the lease
/// releases the pin.
pub struct TextureLease {
    hash: u64,
    handle: TextureHandle,
    refs: Arc<AtomicU32>,
}

impl TextureLease {
    /// Caller must already have incremented `refs`.
    pub(crate) fn new(hash: u64, handle: TextureHandle, refs: Arc<AtomicU32>) -> Self {
        Self { hash, handle, refs }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }
}

impl Drop for TextureLease {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TextureLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureLease")
            .field("hash", &self.hash)
            .field("handle", &self.handle)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .finish()
    }
}
