//! In-process simulated physical address space.
//!
//! [`PhysBus`] hands out zeroed, page-aligned frames at synthetic physical
//! addresses and resolves by-address accesses from an emulated remote
//! endpoint. It also counts open handles and live frames so callers can check
//! that every buffer was released.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{validate_physical_address, Allocator, AllocatorHandle, BufferId};
use crate::region::MappedRegion;
use crate::{AllocResult, AllocationError, PhysicalMemory};

/// First synthetic physical address handed out by a bus.
pub const BUS_BASE_ADDRESS: u64 = 0x8000_0000;

const FRAME_ALIGNMENT: usize = 4096;

/// Zeroed heap frame standing in for physically contiguous memory.
#[derive(Debug)]
pub(crate) struct BusFrame {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the frame is a plain byte allocation; exclusive use is arbitrated by
// the relay handshake, which never lets both sides touch it at once.
unsafe impl Send for BusFrame {}
// SAFETY: as above.
unsafe impl Sync for BusFrame {}

impl BusFrame {
    fn zeroed(len: usize) -> AllocResult<Self> {
        let layout = Layout::from_size_align(len, FRAME_ALIGNMENT)
            .map_err(|_| AllocationError::InvalidCapacity { requested: len })?;
        // SAFETY: `layout` has a non-zero size; callers reject empty frames.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| AllocationError::Alloc {
            size: len,
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for BusFrame {
    fn drop(&mut self) {
        // SAFETY: `ptr` was produced by `alloc_zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct BusState {
    next_address: u64,
    frames: BTreeMap<u64, Arc<BusFrame>>,
}

/// Simulated physical address space shared by local buffers and an emulated peer.
pub struct PhysBus {
    state: Mutex<BusState>,
    open_handles: AtomicUsize,
}

impl PhysBus {
    /// Creates a bus whose first frame lives at [`BUS_BASE_ADDRESS`].
    pub fn new() -> Arc<Self> {
        Self::with_base(BUS_BASE_ADDRESS)
    }

    /// Creates a bus whose first frame lives at `base`.
    ///
    /// A base of zero produces frames the relay buffer rejects, which is
    /// useful for exercising the address validation path.
    pub fn with_base(base: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                next_address: base,
                frames: BTreeMap::new(),
            }),
            open_handles: AtomicUsize::new(0),
        })
    }

    /// Returns an allocator carving buffers out of this bus.
    pub fn allocator(self: &Arc<Self>) -> BusAllocator {
        BusAllocator {
            bus: Arc::clone(self),
        }
    }

    /// Number of allocator handles currently open on this bus.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    /// Number of frames still registered at a physical address.
    pub fn live_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    fn insert(&self, len: usize) -> AllocResult<(u64, Arc<BusFrame>)> {
        let frame = Arc::new(BusFrame::zeroed(len)?);
        let span = len.div_ceil(FRAME_ALIGNMENT) * FRAME_ALIGNMENT;
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address = address.wrapping_add(span as u64);
        state.frames.insert(address, Arc::clone(&frame));
        Ok((address, frame))
    }

    fn remove(&self, address: u64) {
        self.state.lock().frames.remove(&address);
    }

    fn resolve(&self, address: u64, len: usize) -> AllocResult<(Arc<BusFrame>, usize)> {
        let state = self.state.lock();
        let unmapped = AllocationError::Unmapped { address, len };
        let (base, frame) = state
            .frames
            .range(..=address)
            .next_back()
            .ok_or(unmapped)?;
        let offset = (address - base) as usize;
        if offset.checked_add(len).is_none_or(|end| end > frame.len()) {
            return Err(AllocationError::Unmapped { address, len });
        }
        Ok((Arc::clone(frame), offset))
    }
}

impl PhysicalMemory for PhysBus {
    fn read(&self, address: u64, dst: &mut [u8]) -> AllocResult<()> {
        let (frame, offset) = self.resolve(address, dst.len())?;
        // SAFETY: `resolve` bounds-checked `offset + dst.len()` against the frame.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn write(&self, address: u64, src: &[u8]) -> AllocResult<()> {
        let (frame, offset) = self.resolve(address, src.len())?;
        // SAFETY: as in `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), frame.as_ptr().add(offset), src.len());
        }
        Ok(())
    }
}

/// Allocator backend over a [`PhysBus`].
#[derive(Clone)]
pub struct BusAllocator {
    bus: Arc<PhysBus>,
}

impl BusAllocator {
    /// The bus this allocator carves frames from.
    pub fn bus(&self) -> &Arc<PhysBus> {
        &self.bus
    }
}

impl Allocator for BusAllocator {
    fn open(&self) -> AllocResult<Box<dyn AllocatorHandle>> {
        self.bus.open_handles.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(BusHandle {
            bus: Arc::clone(&self.bus),
            frame: None,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "simulated bus".to_string()
    }
}

struct BusHandle {
    bus: Arc<PhysBus>,
    frame: Option<(u64, Arc<BusFrame>)>,
    closed: bool,
}

impl AllocatorHandle for BusHandle {
    fn alloc(&mut self, size: usize) -> AllocResult<BufferId> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        if self.frame.is_some() {
            return Err(AllocationError::OutOfOrder("handle already holds a buffer"));
        }
        if size == 0 {
            return Err(AllocationError::InvalidCapacity { requested: size });
        }
        let (address, frame) = self.bus.insert(size)?;
        self.frame = Some((address, frame));
        Ok(BufferId(address))
    }

    fn physical_address(&mut self) -> AllocResult<u64> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        let (address, _) = self
            .frame
            .as_ref()
            .ok_or(AllocationError::OutOfOrder("physical address queried before alloc"))?;
        Ok(*address)
    }

    fn map(&mut self, size: usize) -> AllocResult<MappedRegion> {
        if self.closed {
            return Err(AllocationError::Closed);
        }
        let (_, frame) = self
            .frame
            .as_ref()
            .ok_or(AllocationError::OutOfOrder("map issued before alloc"))?;
        if size > frame.len() {
            return Err(AllocationError::Map {
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            });
        }
        Ok(MappedRegion::bus(Arc::clone(frame), size))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some((address, _)) = self.frame.take() {
            self.bus.remove(address);
        }
        self.bus.open_handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.close();
    }
}
