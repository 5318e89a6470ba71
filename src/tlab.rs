//! Chunked bump allocation.
//!
//! Every processor owns an [AllocationCursor] into a chunk of the arena. Chunks are
//! carved off a frontier shared by all processors with a single compare-and-swap, so
//! refilling a cursor never takes a lock.
use std::{
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    filler::fill_gap,
    globals::{BONUS_SLOP, FRONTIER_ALIGNMENT, HEAP_LIMIT_SLOP},
    util::{align_up, distance, is_aligned},
    Pointer,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationCursor {
    /// Base of the current chunk.
    pub start: Pointer,
    pub frontier: Pointer,
    /// Soft limit checked by the allocation fast path.
    pub limit: Pointer,
    /// Hard end of the chunk. The shared frontier sits [BONUS_SLOP] bytes further when
    /// this cursor made the most recent grant.
    pub limit_plus_slop: Pointer,
}

impl AllocationCursor {
    pub const fn empty() -> Self {
        Self {
            start: null_mut(),
            frontier: null_mut(),
            limit: null_mut(),
            limit_plus_slop: null_mut(),
        }
    }

    /// Cursor over a freshly granted chunk `[start, limit_plus_slop)`.
    pub fn over(start: Pointer, limit_plus_slop: Pointer) -> Self {
        Self {
            start,
            frontier: start,
            limit: limit_plus_slop.wrapping_sub(HEAP_LIMIT_SLOP),
            limit_plus_slop,
        }
    }

    /// Bytes left before the hard limit.
    #[inline(always)]
    pub fn bytes_free(&self) -> usize {
        (self.limit_plus_slop as usize).saturating_sub(self.frontier as usize)
    }

    /// Bytes left before the soft limit.
    #[inline(always)]
    pub fn bytes_below_limit(&self) -> usize {
        (self.limit as usize).saturating_sub(self.frontier as usize)
    }

    #[inline(always)]
    pub fn bump(&mut self, size: usize) -> Pointer {
        let result = self.frontier;
        self.frontier = self.frontier.wrapping_add(size);
        result
    }

    /// Start of the hole this cursor leaves behind when it moves to another chunk.
    pub fn unused_tail(&self) -> (Pointer, Pointer) {
        (self.frontier, self.limit_plus_slop.wrapping_add(BONUS_SLOP))
    }

    pub fn is_consistent(&self) -> bool {
        if self.frontier.is_null() {
            return true;
        }
        self.start <= self.frontier
            && self.frontier <= self.limit_plus_slop
            && is_aligned(self.frontier as usize, FRONTIER_ALIGNMENT)
            && (self.limit.is_null()
                || self.limit == self.limit_plus_slop.wrapping_sub(HEAP_LIMIT_SLOP))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refill {
    /// The cursor already had room.
    Satisfied,
    /// The shared frontier moved over `[claimed_start, claimed_end)`.
    Refilled {
        contiguous: bool,
        claimed_start: usize,
        claimed_end: usize,
    },
    /// Not enough room left in the arena. The caller has to collect.
    Declined,
}

/// One attempt of the refill protocol against a frontier value read once by the caller.
/// On a lost race returns the frontier value that won.
pub fn try_refill_once(
    shared: &AtomicPtr<u8>,
    old_frontier: Pointer,
    arena_end: Pointer,
    cursor: &mut AllocationCursor,
    bytes: usize,
) -> Result<Refill, Pointer> {
    debug_assert!(cursor.limit_plus_slop >= cursor.frontier);
    if bytes <= distance(cursor.frontier, cursor.limit_plus_slop) {
        return Ok(Refill::Satisfied);
    }
    let available = (arena_end as usize).saturating_sub(old_frontier as usize);
    if bytes.saturating_add(BONUS_SLOP) > available {
        return Ok(Refill::Declined);
    }

    let contiguous = !cursor.frontier.is_null()
        && old_frontier == cursor.limit_plus_slop.wrapping_add(BONUS_SLOP);
    let (new_start, new_frontier, new_heap_frontier) = if contiguous {
        (
            cursor.start,
            cursor.frontier,
            cursor.frontier.wrapping_add(bytes + BONUS_SLOP),
        )
    } else {
        // Seal the tail of the previous chunk before the new frontier is published.
        let (tail_start, tail_end) = cursor.unused_tail();
        fill_gap(tail_start, tail_end);
        (
            old_frontier,
            old_frontier,
            old_frontier.wrapping_add(bytes + BONUS_SLOP),
        )
    };

    match shared.compare_exchange(
        old_frontier,
        new_heap_frontier,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            log::trace!("[GC: Allocated chunk @ {:p}.]", new_frontier);
            let limit_plus_slop = new_heap_frontier.wrapping_sub(BONUS_SLOP);
            *cursor = AllocationCursor {
                start: new_start,
                frontier: new_frontier,
                limit: limit_plus_slop.wrapping_sub(HEAP_LIMIT_SLOP),
                limit_plus_slop,
            };
            debug_assert!(is_aligned(cursor.frontier as usize, FRONTIER_ALIGNMENT));
            Ok(Refill::Refilled {
                contiguous,
                claimed_start: old_frontier as usize,
                claimed_end: new_heap_frontier as usize,
            })
        }
        Err(current) => {
            log::trace!("[GC: Contention for allocation (frontier is {:p}).]", current);
            Err(current)
        }
    }
}

/// Makes sure `cursor` has at least `bytes` free, taking a new chunk off `shared` if
/// needed. Lost races are retried against the fresher frontier.
pub fn refill(
    shared: &AtomicPtr<u8>,
    arena_end: Pointer,
    cursor: &mut AllocationCursor,
    bytes: usize,
) -> Refill {
    if bytes > usize::MAX - FRONTIER_ALIGNMENT {
        log::debug!("[GC: Aborting local alloc: {} bytes cannot be aligned.]", bytes);
        return Refill::Declined;
    }
    let bytes = align_up(bytes, FRONTIER_ALIGNMENT);
    loop {
        let old_frontier = shared.load(Ordering::Acquire);
        if let Ok(result) = try_refill_once(shared, old_frontier, arena_end, cursor, bytes) {
            if result == Refill::Declined {
                log::debug!("[GC: Aborting local alloc: no space for {} bytes.]", bytes);
            }
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        globals::HEADER_SIZE,
        object::{for_each_object_in_range, object_size, write_byte_vector},
    };

    fn arena(words: usize) -> (Vec<u64>, Pointer, Pointer) {
        let mut buf = vec![0u64; words];
        let start = buf.as_mut_ptr().cast::<u8>();
        let end = unsafe { start.add(words * 8) };
        (buf, start, end)
    }

    #[test]
    fn first_refill_claims_a_chunk() {
        let (_buf, start, end) = arena(512);
        let shared = AtomicPtr::new(start);
        let mut cursor = AllocationCursor::empty();
        let result = refill(&shared, end, &mut cursor, 1024);
        assert!(matches!(result, Refill::Refilled { contiguous: false, .. }));
        assert_eq!(cursor.frontier, start);
        assert_eq!(cursor.bytes_free(), 1024);
        assert_eq!(shared.load(Ordering::Relaxed), unsafe { start.add(1024 + BONUS_SLOP) });
        assert!(cursor.is_consistent());
        assert_eq!(refill(&shared, end, &mut cursor, 1024), Refill::Satisfied);
    }

    #[test]
    fn most_recent_allocator_extends_in_place() {
        let (_buf, start, end) = arena(1024);
        let shared = AtomicPtr::new(start);
        let mut cursor = AllocationCursor::empty();
        refill(&shared, end, &mut cursor, 1024);
        cursor.bump(1000);
        let frontier = cursor.frontier;
        let result = refill(&shared, end, &mut cursor, 2048);
        assert!(matches!(result, Refill::Refilled { contiguous: true, .. }));
        assert_eq!(cursor.start, start);
        assert_eq!(cursor.frontier, frontier);
        assert_eq!(cursor.bytes_free(), 2048);
    }

    #[test]
    fn abandoned_tail_is_filled() {
        let (_buf, start, end) = arena(1024);
        let shared = AtomicPtr::new(start);
        let mut a = AllocationCursor::empty();
        let mut b = AllocationCursor::empty();
        refill(&shared, end, &mut a, 512);
        refill(&shared, end, &mut b, 512);
        unsafe {
            let obj = write_byte_vector(a.bump(HEADER_SIZE * 5), b"abcdefghijklmnop");
            assert_eq!(object_size(obj), 40);
        }
        // `b` made the last grant, so `a` has to skip past it.
        let result = refill(&shared, end, &mut a, 1024);
        assert!(matches!(result, Refill::Refilled { contiguous: false, .. }));
        let tail_end = unsafe { start.add(512 + BONUS_SLOP) };
        let mut count = 0;
        unsafe { for_each_object_in_range(start, tail_end, |_| count += 1) };
        assert_eq!(count, 2);
    }

    #[test]
    fn declines_when_arena_is_exhausted() {
        let (_buf, start, end) = arena(128);
        let shared = AtomicPtr::new(start);
        let mut cursor = AllocationCursor::empty();
        assert_eq!(refill(&shared, end, &mut cursor, 1024), Refill::Declined);
        assert_eq!(shared.load(Ordering::Relaxed), start);
        assert_eq!(cursor, AllocationCursor::empty());
    }
}
