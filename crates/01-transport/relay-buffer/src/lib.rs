//! Relay buffer management for the bulk-data relay.
//!
//! This crate owns the memory side of the relay:
//! * [`RelayBuffer`] – one physically addressed, cache-coherent region with a single local view.
//! * [`Allocator`] / [`AllocatorHandle`] – the host allocator contract the buffer is carved from.
//! * [`DeviceAllocator`], [`ShmAllocator`], [`BusAllocator`] – concrete allocator backends.
//! * [`PhysicalMemory`] – the remote endpoint's by-address view of the same bytes.
//! * [`AllocationError`] – error surface for acquisition, mapping and addressing failures.

mod allocator;
mod buffer;
mod bus;
#[cfg(target_os = "linux")]
mod device;
mod error;
mod region;
#[cfg(unix)]
mod shm;

pub use allocator::{Allocator, AllocatorHandle, BufferId, PhysicalMemory, DEFAULT_DEVICE_PATH};
pub use buffer::{RelayBuffer, DEFAULT_CAPACITY};
pub use bus::{BusAllocator, PhysBus, BUS_BASE_ADDRESS};
#[cfg(target_os = "linux")]
pub use device::{DeviceAllocator, RELAY_IOC_ALLOC, RELAY_IOC_PHYS_ADDR};
pub use error::{AllocResult, AllocationError};
pub use region::MappedRegion;
#[cfg(unix)]
pub use shm::{ShmAllocator, ShmMemory, DEFAULT_SHM_DIR};
