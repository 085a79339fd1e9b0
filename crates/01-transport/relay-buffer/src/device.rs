//! Character-device allocator backend.
//!
//! The kernel driver behind the device node hands out one physically
//! contiguous, cache-coherent allocation per open file. The allocation is
//! requested with `RELAY_IOC_ALLOC`, its bus address is read back with
//! `RELAY_IOC_PHYS_ADDR`, and the device fd is then mapped to reach it.
//! Closing the fd frees the allocation.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::allocator::{Allocator, AllocatorHandle, BufferId, DEFAULT_DEVICE_PATH};
use crate::region::MappedRegion;
use crate::{AllocResult, AllocationError};

const IOC_NRBITS: u64 = 8;
const IOC_TYPEBITS: u64 = 8;
const IOC_SIZEBITS: u64 = 14;
const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u64 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u64 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const RELAY_IOC_MAGIC: u8 = b'R';

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u64) << IOC_TYPESHIFT)
        | ((nr as u64) << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

/// `_IOW('R', 1, u64)`: allocate `*arg` bytes on this fd; returns the buffer id.
pub const RELAY_IOC_ALLOC: u64 = ioc(IOC_WRITE, RELAY_IOC_MAGIC, 1, std::mem::size_of::<u64>());
/// `_IOR('R', 2, u64)`: store the allocation's physical address into `*arg`.
pub const RELAY_IOC_PHYS_ADDR: u64 =
    ioc(IOC_READ, RELAY_IOC_MAGIC, 2, std::mem::size_of::<u64>());

/// Allocator backed by the relay memory character device.
#[derive(Clone, Debug)]
pub struct DeviceAllocator {
    path: PathBuf,
}

impl DeviceAllocator {
    /// Uses the device node at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for DeviceAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_PATH)
    }
}

impl Allocator for DeviceAllocator {
    fn open(&self) -> AllocResult<Box<dyn AllocatorHandle>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| AllocationError::Open {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), "opened relay memory device");
        Ok(Box::new(DeviceHandle {
            file: Some(file),
            allocated: None,
        }))
    }

    fn describe(&self) -> String {
        format!("device {}", self.path.display())
    }
}

struct DeviceHandle {
    file: Option<File>,
    allocated: Option<usize>,
}

impl DeviceHandle {
    fn file(&self) -> AllocResult<&File> {
        self.file.as_ref().ok_or(AllocationError::Closed)
    }
}

impl AllocatorHandle for DeviceHandle {
    fn alloc(&mut self, size: usize) -> AllocResult<BufferId> {
        if self.allocated.is_some() {
            return Err(AllocationError::OutOfOrder("handle already holds a buffer"));
        }
        let fd = self.file()?.as_raw_fd();
        let mut arg = size as u64;
        // SAFETY: `fd` is open for the lifetime of `self.file`, and the driver
        // reads exactly one u64 from `arg`.
        let ret = unsafe { libc::ioctl(fd, RELAY_IOC_ALLOC as _, &mut arg as *mut u64) };
        if ret < 0 {
            return Err(AllocationError::Alloc {
                size,
                source: io::Error::last_os_error(),
            });
        }
        self.allocated = Some(size);
        Ok(BufferId(ret as u64))
    }

    fn physical_address(&mut self) -> AllocResult<u64> {
        if self.allocated.is_none() {
            return Err(AllocationError::OutOfOrder("physical address queried before alloc"));
        }
        let fd = self.file()?.as_raw_fd();
        let mut address: u64 = 0;
        // SAFETY: the driver writes exactly one u64 into `address`.
        let ret = unsafe { libc::ioctl(fd, RELAY_IOC_PHYS_ADDR as _, &mut address as *mut u64) };
        if ret < 0 {
            return Err(AllocationError::PhysicalAddress(io::Error::last_os_error()));
        }
        Ok(address)
    }

    fn map(&mut self, size: usize) -> AllocResult<MappedRegion> {
        let allocated = self
            .allocated
            .ok_or(AllocationError::OutOfOrder("map issued before alloc"))?;
        if size > allocated {
            return Err(AllocationError::Map {
                size,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        let file = self.file()?;
        // SAFETY: the driver backs the mapping with the allocation made on this
        // fd; it stays valid until the fd is closed, which `close` orders after
        // the region has been dropped by its owner.
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(file) }
            .map_err(|source| AllocationError::Map { size, source })?;
        Ok(MappedRegion::mapped(map))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("closed relay memory device handle");
        }
        self.allocated = None;
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
