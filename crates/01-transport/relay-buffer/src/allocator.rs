//! Host allocator contract backing relay buffers.
//!
//! The relay only depends on this contract: open a handle, allocate one
//! buffer on it, ask for the buffer's physical address and map it locally.
//! Closing the handle releases the allocation. Backends live in sibling
//! modules; none of them carry protocol logic.

use std::sync::Arc;

use crate::region::MappedRegion;
use crate::{AllocResult, AllocationError};

/// Allocator device node opened when no other path is configured.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/relay_mem";

/// Opaque identifier the allocator assigns to an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Source of allocator handles.
pub trait Allocator: Send + Sync {
    /// Opens a fresh handle. Each relay buffer holds exactly one open handle.
    fn open(&self) -> AllocResult<Box<dyn AllocatorHandle>>;

    /// Short human-readable description used in logs.
    fn describe(&self) -> String;
}

/// One open allocator handle holding at most one allocation.
pub trait AllocatorHandle: Send {
    /// Allocates `size` bytes of physically contiguous, cache-coherent memory.
    fn alloc(&mut self, size: usize) -> AllocResult<BufferId>;

    /// Physical address of the allocation, as the remote endpoint sees it.
    fn physical_address(&mut self) -> AllocResult<u64>;

    /// Maps the first `size` bytes of the allocation into this process.
    fn map(&mut self, size: usize) -> AllocResult<MappedRegion>;

    /// Releases the allocation and the handle. Calling it again is a no-op.
    fn close(&mut self);
}

/// By-address access to physical memory, as seen from the remote endpoint.
///
/// Implementations copy bytes; callers are expected to touch a buffer only
/// while the handshake hands it to them.
pub trait PhysicalMemory: Send + Sync {
    /// Copies `dst.len()` bytes starting at `address` into `dst`.
    fn read(&self, address: u64, dst: &mut [u8]) -> AllocResult<()>;

    /// Copies `src` into physical memory starting at `address`.
    fn write(&self, address: u64, src: &[u8]) -> AllocResult<()>;
}

impl<T: PhysicalMemory + ?Sized> PhysicalMemory for Arc<T> {
    fn read(&self, address: u64, dst: &mut [u8]) -> AllocResult<()> {
        (**self).read(address, dst)
    }

    fn write(&self, address: u64, src: &[u8]) -> AllocResult<()> {
        (**self).write(address, src)
    }
}

/// Rejects addresses that are not strictly positive when read as a signed value.
pub(crate) fn validate_physical_address(raw: u64) -> AllocResult<u64> {
    if raw == 0 || raw > i64::MAX as u64 {
        return Err(AllocationError::InvalidPhysicalAddress { address: raw });
    }
    Ok(raw)
}
