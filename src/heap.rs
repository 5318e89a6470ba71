use std::{
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::{
    mmap::Reservation,
    util::{align_down, align_up},
    Pointer,
};

/// Contiguous heap inside a fixed address space reservation.
///
/// `[start, start + old_gen_size)` holds the old generation. The allocation arena runs
/// from `nursery` to `start + available_size` and is handed out in chunks by advancing
/// `frontier`. Everything past `start + size` is reserved but unused.
pub struct Heap {
    region: Option<Reservation>,
    page_size: usize,
    pub(crate) start: Pointer,
    pub(crate) capacity: usize,
    pub(crate) size: usize,
    pub(crate) available_size: usize,
    pub(crate) old_gen_size: usize,
    pub(crate) nursery: Pointer,
    /// Whether the nursery was placed so that a minor collection can copy all of it.
    pub(crate) can_minor: bool,
    pub(crate) frontier: CachePadded<AtomicPtr<u8>>,
}

impl Heap {
    pub const fn uninit() -> Self {
        Self {
            region: None,
            page_size: 0,
            start: null_mut(),
            capacity: 0,
            size: 0,
            available_size: 0,
            old_gen_size: 0,
            nursery: null_mut(),
            can_minor: false,
            frontier: CachePadded::new(AtomicPtr::new(null_mut())),
        }
    }

    /// Reserves `capacity` bytes and makes the first `size` of them usable.
    pub fn create(capacity: usize, size: usize, page_size: usize) -> Option<Self> {
        let size = align_down(size.min(capacity), page_size);
        let region = Reservation::new(capacity)?;
        let start = region.start();
        log::debug!(
            "[GC: Created heap at {:p} of size {} bytes (capacity {} bytes).]",
            start,
            size,
            capacity
        );
        Some(Self {
            region: Some(region),
            page_size,
            start,
            capacity,
            size,
            available_size: size,
            old_gen_size: 0,
            nursery: start,
            can_minor: false,
            frontier: CachePadded::new(AtomicPtr::new(start)),
        })
    }

    pub fn is_init(&self) -> bool {
        self.region.is_some()
    }

    /// Unmaps the reservation.
    pub fn release(&mut self) {
        if self.is_init() {
            log::debug!("[GC: Releasing heap at {:p} of size {} bytes.]", self.start, self.size);
        }
        *self = Self::uninit();
    }

    /// Changes the usable size. Pages dropped off the end are handed back to the OS.
    pub fn resize(&mut self, new_size: usize) {
        debug_assert!(new_size <= self.capacity);
        debug_assert!(self.old_gen_size <= new_size);
        if new_size < self.size {
            if let Some(region) = &self.region {
                let keep = align_up(new_size, self.page_size).min(self.size);
                region.decommit(unsafe { self.start.add(keep) }, self.size - keep);
            }
        }
        self.size = new_size;
        self.available_size = new_size;
    }

    #[inline(always)]
    pub fn old_gen_end(&self) -> Pointer {
        unsafe { self.start.add(self.old_gen_size) }
    }

    /// End of the allocation arena.
    #[inline(always)]
    pub fn limit(&self) -> Pointer {
        unsafe { self.start.add(self.available_size) }
    }

    #[inline(always)]
    pub fn frontier(&self) -> Pointer {
        self.frontier.load(Ordering::Acquire)
    }

    pub fn contains(&self, addr: Pointer) -> bool {
        let addr = addr as usize;
        addr >= self.start as usize && addr < self.start as usize + self.size
    }

    pub fn nursery_size(&self) -> usize {
        self.limit() as usize - self.nursery as usize
    }
}
