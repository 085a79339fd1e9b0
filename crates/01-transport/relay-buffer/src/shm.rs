//! Shared-memory-file allocator backend.
//!
//! Stands in for the device allocator when two relay processes share one
//! host. Each buffer is a file named after its synthetic physical base
//! address, so the remote process can attach to any address inside it through
//! [`ShmMemory`]. Within one process, segment address ranges never overlap.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::allocator::{Allocator, AllocatorHandle, BufferId, PhysicalMemory};
use crate::region::MappedRegion;
use crate::{AllocResult, AllocationError};

/// Directory used when no other shm directory is configured.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

const SEGMENT_PREFIX: &str = "relay-";
const SHM_ADDRESS_TAG: u64 = 0x1000_0000;
const SHM_WINDOW_END: u64 = 1 << 32;
const SHM_PAGE: u64 = 4096;

static NEXT_OFFSET: AtomicU64 = AtomicU64::new(SHM_ADDRESS_TAG);

/// Reserves a page-aligned span of `size` bytes in this process's address window.
///
/// The window wraps once exhausted; `create_new` still rejects a base that is in use.
fn synthetic_address(size: usize) -> AllocResult<u64> {
    let span = (size as u64)
        .checked_next_multiple_of(SHM_PAGE)
        .filter(|&span| span <= SHM_WINDOW_END - SHM_ADDRESS_TAG)
        .ok_or(AllocationError::InvalidCapacity { requested: size })?;
    let start = |next: u64| {
        if next + span > SHM_WINDOW_END {
            SHM_ADDRESS_TAG
        } else {
            next
        }
    };
    let offset = match NEXT_OFFSET.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
        Some(start(next) + span)
    }) {
        Ok(prev) | Err(prev) => start(prev),
    };
    let pid = u64::from(std::process::id());
    Ok((pid << 32) | offset)
}

fn segment_path(dir: &Path, address: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{address:016x}"))
}

fn segment_base(file_name: &str) -> Option<u64> {
    let hex = file_name.strip_prefix(SEGMENT_PREFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Allocator that backs buffers with files in a shared-memory directory.
#[derive(Clone, Debug)]
pub struct ShmAllocator {
    dir: PathBuf,
}

impl ShmAllocator {
    /// Places segment files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Default for ShmAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl Allocator for ShmAllocator {
    fn open(&self) -> AllocResult<Box<dyn AllocatorHandle>> {
        let meta = fs::metadata(&self.dir).map_err(|source| AllocationError::Open {
            path: self.dir.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(AllocationError::Open {
                path: self.dir.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        Ok(Box::new(ShmHandle {
            dir: self.dir.clone(),
            segment: None,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        format!("shm {}", self.dir.display())
    }
}

struct Segment {
    path: PathBuf,
    file: File,
    address: u64,
    size: usize,
}

struct ShmHandle {
    dir: PathBuf,
    segment: Option<Segment>,
    closed: bool,
}

impl AllocatorHandle for ShmHandle {
    fn alloc(&mut self, size: usize) -> AllocResult<BufferId> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        if self.segment.is_some() {
            return Err(AllocationError::OutOfOrder("handle already holds a buffer"));
        }
        if size == 0 {
            return Err(AllocationError::InvalidCapacity { requested: size });
        }
        let address = synthetic_address(size)?;
        let path = segment_path(&self.dir, address);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| AllocationError::Alloc { size, source })?;
        if let Err(source) = file.set_len(size as u64) {
            let _ = fs::remove_file(&path);
            return Err(AllocationError::Alloc { size, source });
        }
        debug!(path = %path.display(), size, "created shm segment");
        self.segment = Some(Segment {
            path,
            file,
            address,
            size,
        });
        Ok(BufferId(address))
    }

    fn physical_address(&mut self) -> AllocResult<u64> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        self.segment
            .as_ref()
            .map(|segment| segment.address)
            .ok_or(AllocationError::OutOfOrder("physical address queried before alloc"))
    }

    fn map(&mut self, size: usize) -> AllocResult<MappedRegion> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        let segment = self
            .segment
            .as_ref()
            .ok_or(AllocationError::OutOfOrder("map issued before alloc"))?;
        if size > segment.size {
            return Err(AllocationError::Map {
                size,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        // SAFETY: the segment file is sized to `segment.size` and only shrinks
        // when the handle is closed, after the owner has dropped the mapping.
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&segment.file) }
            .map_err(|source| AllocationError::Map { size, source })?;
        Ok(MappedRegion::mapped(map))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(segment) = self.segment.take() {
            drop(segment.file);
            match fs::remove_file(&segment.path) {
                Ok(()) => debug!(path = %segment.path.display(), "removed shm segment"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %segment.path.display(), "failed to remove shm segment: {err}"),
            }
        }
    }
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// By-address access to shm segments created by [`ShmAllocator`], possibly in another process.
#[derive(Clone, Debug)]
pub struct ShmMemory {
    dir: PathBuf,
}

impl ShmMemory {
    /// Resolves addresses against segment files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Opens the segment containing `[address, address + len)` and returns it
    /// with the file offset of `address`.
    fn attach(&self, address: u64, len: usize) -> AllocResult<(File, u64)> {
        let unmapped = || AllocationError::Unmapped { address, len };
        let entries = fs::read_dir(&self.dir).map_err(|_| unmapped())?;
        for entry in entries.flatten() {
            let Some(base) = entry.file_name().to_str().and_then(segment_base) else {
                continue;
            };
            if base > address {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let offset = address - base;
            let fits = offset
                .checked_add(len as u64)
                .is_some_and(|end| offset < meta.len() && end <= meta.len());
            if !fits {
                continue;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(entry.path())
                .map_err(|_| unmapped())?;
            return Ok((file, offset));
        }
        Err(unmapped())
    }
}

impl PhysicalMemory for ShmMemory {
    fn read(&self, address: u64, dst: &mut [u8]) -> AllocResult<()> {
        let len = dst.len();
        let (file, offset) = self.attach(address, len)?;
        file.read_exact_at(dst, offset)
            .map_err(|_| AllocationError::Unmapped { address, len })
    }

    fn write(&self, address: u64, src: &[u8]) -> AllocResult<()> {
        let len = src.len();
        let (file, offset) = self.attach(address, len)?;
        file.write_all_at(src, offset)
            .map_err(|_| AllocationError::Unmapped { address, len })
    }
}
