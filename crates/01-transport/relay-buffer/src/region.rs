//! Local mappings of relay buffers.
//!
//! A relay buffer is either a real mapping of a device or shm file (native
//! `mmap` via `memmap2`) or a frame on the in-process simulated bus. Both are
//! exposed through [`MappedRegion`] so the buffer and protocol code never see
//! which backend produced the bytes.

use std::sync::Arc;

use crate::bus::BusFrame;

#[derive(Debug)]
enum Backing {
    #[cfg(unix)]
    Mapped(memmap2::MmapMut),
    Bus(Arc<BusFrame>),
}

/// Process-local view of a physically addressed buffer.
#[derive(Debug)]
pub struct MappedRegion {
    len: usize,
    backing: Backing,
}

impl MappedRegion {
    #[cfg(unix)]
    pub(crate) fn mapped(map: memmap2::MmapMut) -> Self {
        Self {
            len: map.len(),
            backing: Backing::Mapped(map),
        }
    }

    pub(crate) fn bus(frame: Arc<BusFrame>, len: usize) -> Self {
        debug_assert!(len <= frame.len(), "bus view exceeds frame");
        Self {
            len,
            backing: Backing::Bus(frame),
        }
    }

    /// Total number of bytes visible through this mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            #[cfg(unix)]
            Backing::Mapped(map) => map.as_ptr(),
            Backing::Bus(frame) => frame.as_ptr(),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.backing {
            #[cfg(unix)]
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Bus(frame) => frame.as_ptr(),
        }
    }

    /// View the full mapping as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backing keeps `len` bytes alive for as long as `self`.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// View the full mapping as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; the remote side only touches the bytes while the
        // handshake has handed the buffer over, never while this borrow is live.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}
