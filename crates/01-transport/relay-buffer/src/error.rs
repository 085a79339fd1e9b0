//! Error surface for relay buffer acquisition and physical addressing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience result alias for fallible allocator operations.
pub type AllocResult<T, E = AllocationError> = Result<T, E>;

/// Errors surfaced while acquiring, mapping or addressing a relay buffer.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The allocator handle (device node, shm directory) could not be opened.
    #[error("failed to open allocator {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The allocator refused to hand out `size` bytes.
    #[error("allocation of {size} bytes failed: {source}")]
    Alloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Requested capacity is zero or exceeds what the allocator can describe.
    #[error("invalid relay buffer capacity {requested}")]
    InvalidCapacity { requested: usize },

    /// The physical address query itself failed.
    #[error("failed to query physical address: {0}")]
    PhysicalAddress(#[source] io::Error),

    /// The allocator reported an address that is not strictly positive.
    #[error("allocator reported non-positive physical address {address:#x}")]
    InvalidPhysicalAddress { address: u64 },

    /// Mapping the buffer into the process failed or came back short.
    #[error("failed to map {size} bytes: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Handle operations were issued out of order (e.g. map before alloc).
    #[error("allocator handle used out of order: {0}")]
    OutOfOrder(&'static str),

    /// A by-address access does not fall inside any live buffer.
    #[error("physical range {address:#x}+{len} is not backed by a live buffer")]
    Unmapped { address: u64, len: usize },

    /// The handle has already been closed.
    #[error("allocator handle is closed")]
    Closed,
}
