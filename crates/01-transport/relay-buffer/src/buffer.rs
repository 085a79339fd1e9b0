//! The relay buffer: one physically addressed region with one local view.
//!
//! A [`RelayBuffer`] owns its allocator handle and its mapping. It is created
//! by [`RelayBuffer::acquire`] and released exactly once, either explicitly via
//! [`RelayBuffer::release`] or when dropped, whichever comes first.

use std::fmt;

use tracing::debug;

use crate::allocator::{validate_physical_address, Allocator, AllocatorHandle};
use crate::region::MappedRegion;
use crate::{AllocResult, AllocationError};

/// Default relay buffer capacity (3 MiB), the largest chunk a transfer moves per handshake.
pub const DEFAULT_CAPACITY: usize = 0x30_0000;

/// Physically contiguous, cache-coherent buffer shared with the remote endpoint.
pub struct RelayBuffer {
    region: Option<MappedRegion>,
    handle: Option<Box<dyn AllocatorHandle>>,
    physical_address: u64,
    capacity: usize,
}

impl RelayBuffer {
    /// Acquires `capacity` bytes from `allocator` and maps them locally.
    ///
    /// On failure every partially acquired resource is released before the
    /// error is returned.
    pub fn acquire(allocator: &dyn Allocator, capacity: usize) -> AllocResult<Self> {
        if capacity == 0 || capacity > i64::MAX as usize {
            return Err(AllocationError::InvalidCapacity {
                requested: capacity,
            });
        }

        let mut handle = allocator.open()?;
        let (physical_address, region) = match establish(handle.as_mut(), capacity) {
            Ok(parts) => parts,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };

        debug!(
            allocator = %allocator.describe(),
            capacity,
            physical_address = format_args!("{physical_address:#x}"),
            "acquired relay buffer"
        );

        Ok(Self {
            region: Some(region),
            handle: Some(handle),
            physical_address,
            capacity,
        })
    }

    /// Maximum number of bytes a single chunk may occupy.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical address of the buffer as seen by the remote endpoint.
    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// Overwrites the whole buffer with zeroes.
    pub fn zero_fill(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// View the full buffer as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            Some(region) => &region.as_slice()[..self.capacity],
            None => &[],
        }
    }

    /// View the full buffer as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        match &mut self.region {
            Some(region) => &mut region.as_mut_slice()[..capacity],
            None => &mut [],
        }
    }

    /// Returns the first `len` bytes, the payload of a chunk of that length.
    pub fn chunk(&self, len: usize) -> AllocResult<&[u8]> {
        if len > self.capacity {
            return Err(AllocationError::InvalidCapacity { requested: len });
        }
        Ok(&self.as_slice()[..len])
    }

    /// Returns the first `len` bytes mutably.
    pub fn chunk_mut(&mut self, len: usize) -> AllocResult<&mut [u8]> {
        if len > self.capacity {
            return Err(AllocationError::InvalidCapacity { requested: len });
        }
        Ok(&mut self.as_mut_slice()[..len])
    }

    /// Unmaps the local view and closes the allocator handle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // The mapping must go before the handle that backs it.
        drop(self.region.take());
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(
                physical_address = format_args!("{:#x}", self.physical_address),
                "released relay buffer"
            );
        }
    }
}

impl Drop for RelayBuffer {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("capacity", &self.capacity)
            .field(
                "physical_address",
                &format_args!("{:#x}", self.physical_address),
            )
            .field("mapped", &self.region.is_some())
            .finish()
    }
}

fn establish(handle: &mut dyn AllocatorHandle, capacity: usize) -> AllocResult<(u64, MappedRegion)> {
    handle.alloc(capacity)?;
    let physical_address = validate_physical_address(handle.physical_address()?)?;
    let region = handle.map(capacity)?;
    if region.len() < capacity {
        return Err(AllocationError::Map {
            size: capacity,
            source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        });
    }
    Ok((physical_address, region))
}
