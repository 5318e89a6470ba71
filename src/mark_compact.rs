//! Sliding mark-compact collection of the old generation.
//!
//! Marking uses the header mark bit. New addresses are assigned in address order and kept
//! in a side table, references are updated through it, then every live object slides
//! down. Hash-consing merges live byte vectors with equal contents during marking: the
//! first one reached becomes canonical and later ones are never marked.
use std::ptr;

use hashbrown::HashMap;

use crate::{
    gc_state::GcState,
    header::ObjectTag,
    object::{
        byte_vector_bytes, for_each_object_in_range, for_each_ref_slot, header, object_size,
        object_start, set_header, tag,
    },
    util::{distance, CommaSeparated},
    Pointer,
};

unsafe fn is_marked(obj: Pointer) -> bool {
    header(obj).marked()
}

unsafe fn set_marked(obj: Pointer, marked: bool) {
    let mut h = header(obj);
    h.set_marked(marked);
    set_header(obj, h);
}

struct Marker<'a> {
    start: usize,
    end: usize,
    stack: Vec<Pointer>,
    canonical: Option<HashMap<&'a [u8], Pointer>>,
    bytes_hash_consed: usize,
}

impl<'a> Marker<'a> {
    #[inline]
    fn in_range(&self, obj: Pointer) -> bool {
        let addr = obj as usize;
        addr >= self.start && addr < self.end
    }

    unsafe fn mark_slot(&mut self, slot: *mut Pointer) {
        let obj = *slot;
        if obj.is_null() || !self.in_range(obj) || is_marked(obj) {
            return;
        }
        if let Some(canonical) = &mut self.canonical {
            if tag(obj) == ObjectTag::ByteVector {
                let bytes: &'a [u8] = byte_vector_bytes(obj);
                match canonical.get(bytes) {
                    Some(&existing) => {
                        *slot = existing;
                        self.bytes_hash_consed += object_size(obj);
                        return;
                    }
                    None => {
                        canonical.insert(bytes, obj);
                    }
                }
            }
        }
        set_marked(obj, true);
        self.stack.push(obj);
    }

    unsafe fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            for_each_ref_slot(obj, |slot| self.mark_slot(slot));
        }
    }
}

/// Maps the old data address of every live object to its new one, sorted by old address.
struct ForwardingTable {
    entries: Vec<(usize, Pointer)>,
}

impl ForwardingTable {
    fn lookup(&self, obj: Pointer) -> Option<Pointer> {
        self.entries
            .binary_search_by_key(&(obj as usize), |&(old, _)| old)
            .ok()
            .map(|index| self.entries[index].1)
    }

    unsafe fn update_slot(&self, slot: *mut Pointer, start: Pointer, end: Pointer) {
        let obj = *slot;
        if obj.is_null() || obj < start || obj >= end {
            return;
        }
        match self.lookup(obj) {
            Some(to) => *slot = to,
            None => gc_assert!(false, "live reference to unmarked object {:p}", obj),
        }
    }
}

impl GcState {
    /// Compacts the old generation in place.
    ///
    /// # Safety
    /// Inside a synchronized section with an empty nursery.
    pub(crate) unsafe fn mark_compact(&self, hash_cons: bool) {
        let heap = self.heap_mut();
        let start = heap.start;
        let end = heap.old_gen_end();

        let mut marker = Marker {
            start: start as usize,
            end: end as usize,
            stack: Vec::new(),
            canonical: if hash_cons { Some(HashMap::new()) } else { None },
            bytes_hash_consed: 0,
        };
        for proc in 0..self.num_procs() {
            marker.mark_slot(&mut self.proc_mut(proc).current_thread);
            marker.drain();
        }
        let bytes_hash_consed = marker.bytes_hash_consed;
        drop(marker);

        let mut table = ForwardingTable {
            entries: Vec::new(),
        };
        let mut free = start;
        for_each_object_in_range(start, end, |obj| {
            let size = object_size(obj);
            if is_marked(obj) {
                let offset = distance(object_start(obj), obj);
                table.entries.push((obj as usize, free.add(offset)));
                free = free.add(size);
            }
        });

        for &(old, _) in table.entries.iter() {
            for_each_ref_slot(old as Pointer, |slot| table.update_slot(slot, start, end));
        }
        for proc in 0..self.num_procs() {
            table.update_slot(&mut self.proc_mut(proc).current_thread, start, end);
        }

        for &(old, new) in table.entries.iter() {
            let old = old as Pointer;
            let from = object_start(old);
            let size = object_size(old);
            let to = new.sub(distance(from, old));
            ptr::copy(from, to, size);
            set_marked(new, false);
        }

        let live = distance(start, free);
        heap.old_gen_size = live;
        logln_if!(
            self.config.verbose,
            "[GC: Mark-compact kept {} of {} bytes{}.]",
            CommaSeparated(live),
            CommaSeparated(distance(start, end)),
            if hash_cons { ", hash-consing" } else { "" }
        );
        let mut stats = self.stats();
        stats.cumulative.num_mark_compact_gcs += 1;
        stats.cumulative.bytes_mark_compacted += live;
        if hash_cons {
            stats.cumulative.num_hash_cons_gcs += 1;
            stats.cumulative.bytes_hash_consed += bytes_hash_consed;
        }
    }
}
