//! Cheney-style copying, shared by the minor collection, the major copying collection
//! and closure serialization.
use std::ptr;

use hashbrown::HashMap;

use crate::{
    object::{
        advance_to_object_data, for_each_ref_slot, forwarding_address, is_forwarded,
        object_size, object_start, set_header_word,
    },
    util::distance,
    Pointer,
};

/// Where a copied object leaves its new address.
pub trait Forwarding {
    unsafe fn forwarded(&self, obj: Pointer) -> Option<Pointer>;
    unsafe fn forward(&mut self, obj: Pointer, to: Pointer);
}

/// Overwrites the header of the old copy. The from-space is garbage afterwards.
pub struct InHeader;

impl Forwarding for InHeader {
    #[inline(always)]
    unsafe fn forwarded(&self, obj: Pointer) -> Option<Pointer> {
        if is_forwarded(obj) {
            Some(forwarding_address(obj))
        } else {
            None
        }
    }

    #[inline(always)]
    unsafe fn forward(&mut self, obj: Pointer, to: Pointer) {
        set_header_word(obj, to as u64);
    }
}

/// Keeps forwarding addresses on the side, leaving the originals untouched.
#[derive(Default)]
pub struct SideTable {
    table: HashMap<usize, Pointer>,
}

impl Forwarding for SideTable {
    unsafe fn forwarded(&self, obj: Pointer) -> Option<Pointer> {
        self.table.get(&(obj as usize)).copied()
    }

    unsafe fn forward(&mut self, obj: Pointer, to: Pointer) {
        self.table.insert(obj as usize, to);
    }
}

pub struct Cheney<F: Forwarding> {
    from_start: usize,
    from_end: usize,
    to_start: Pointer,
    back: Pointer,
    to_limit: Pointer,
    forwarding: F,
}

impl<F: Forwarding> Cheney<F> {
    /// Copies objects with data in `[from_start, from_end)` to `[to_start, to_limit)`.
    pub fn new(
        from_start: Pointer,
        from_end: Pointer,
        to_start: Pointer,
        to_limit: Pointer,
        forwarding: F,
    ) -> Self {
        Self {
            from_start: from_start as usize,
            from_end: from_end as usize,
            to_start,
            back: to_start,
            to_limit,
            forwarding,
        }
    }

    /// Copies anything non-null that is reachable.
    pub fn everything(to_start: Pointer, to_limit: Pointer, forwarding: F) -> Self {
        Self::new(1 as Pointer, usize::MAX as Pointer, to_start, to_limit, forwarding)
    }

    #[inline(always)]
    fn in_from_space(&self, obj: Pointer) -> bool {
        let addr = obj as usize;
        addr >= self.from_start && addr < self.from_end
    }

    /// Updates the reference in `slot`, copying its target if it was not copied yet.
    pub unsafe fn copy_slot(&mut self, slot: *mut Pointer) {
        let obj = *slot;
        if obj.is_null() || !self.in_from_space(obj) {
            return;
        }
        *slot = match self.forwarding.forwarded(obj) {
            Some(to) => to,
            None => self.copy(obj),
        };
    }

    unsafe fn copy(&mut self, obj: Pointer) -> Pointer {
        let start = object_start(obj);
        let size = object_size(obj);
        gc_assert!(
            distance(self.back, self.to_limit) >= size,
            "to-space exhausted copying {} bytes at {:p}",
            size,
            obj
        );
        ptr::copy_nonoverlapping(start, self.back, size);
        let to = self.back.add(distance(start, obj));
        self.back = self.back.add(size);
        self.forwarding.forward(obj, to);
        to
    }

    /// Scans the copied objects, copying what they refer to, until the scan catches up.
    pub unsafe fn scan(&mut self) {
        let mut cur = self.to_start;
        while cur < self.back {
            let obj = advance_to_object_data(cur);
            let size = object_size(obj);
            for_each_ref_slot(obj, |slot| self.copy_slot(slot));
            cur = cur.add(size);
        }
    }

    pub fn back(&self) -> Pointer {
        self.back
    }

    pub fn bytes_copied(&self) -> usize {
        distance(self.to_start, self.back)
    }
}
