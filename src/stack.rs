//! Heap-resident mutator stacks.
//!
//! A stack is never resized in place. Growing it allocates a larger stack object, copies
//! the used part over and repoints the owning thread.
use std::ptr;

use crate::{
    gc_state::GcState,
    globals::{OBJPTR_SIZE, WORD_SIZE},
    object::{self, set_thread_stack, stack_size},
    util::{align_up, CommaSeparated},
    Config, Pointer,
};

#[inline(always)]
pub unsafe fn reserved(stack: Pointer) -> usize {
    *stack.cast::<u64>() as usize
}

#[inline(always)]
pub unsafe fn used(stack: Pointer) -> usize {
    *stack.add(WORD_SIZE).cast::<u64>() as usize
}

#[inline(always)]
pub unsafe fn set_used(stack: Pointer, used: usize) {
    *stack.add(WORD_SIZE).cast::<u64>() = used as u64;
}

#[inline(always)]
pub unsafe fn slots(stack: Pointer) -> *mut Pointer {
    stack.add(2 * WORD_SIZE).cast()
}

/// A stack satisfies the mutator invariant while one more frame of the largest size fits.
pub unsafe fn invariant_for_mutator_stack(config: &Config, stack: Pointer) -> bool {
    used(stack) + config.max_frame_size <= reserved(stack)
}

pub unsafe fn sizeof_stack_grow_reserved(config: &Config, stack: Pointer) -> usize {
    let grown = (reserved(stack) as f64 * config.ratios.stack_grow) as usize;
    let needed = used(stack) + config.max_frame_size;
    align_up(grown.max(needed), OBJPTR_SIZE)
}

/// Bytes a grown copy of `stack` occupies in the heap.
pub unsafe fn sizeof_stack_grow(config: &Config, stack: Pointer) -> usize {
    stack_size(sizeof_stack_grow_reserved(config, stack))
}

pub unsafe fn copy_stack(from: Pointer, to: Pointer) {
    let used = used(from);
    debug_assert!(used <= reserved(to));
    ptr::copy_nonoverlapping(slots(from).cast::<u8>(), slots(to).cast::<u8>(), used);
    set_used(to, used);
}

/// Replaces the current stack of processor `proc` by a larger copy.
///
/// The space must already be there: in the old generation right after its end when
/// `alloc_in_old_gen` is set, otherwise in the processor's nursery chunk.
pub(crate) unsafe fn grow_stack_current(gc: &GcState, proc: usize, alloc_in_old_gen: bool) {
    let old = gc.proc(proc).current_stack;
    let new_reserved = sizeof_stack_grow_reserved(&gc.config, old);
    let size = stack_size(new_reserved);
    logln_if!(
        gc.config.verbose,
        "[GC: Growing stack of size {} bytes to size {} bytes, using {} bytes.]",
        CommaSeparated(reserved(old)),
        CommaSeparated(new_reserved),
        CommaSeparated(used(old))
    );
    let at = if alloc_in_old_gen {
        gc_assert!(
            gc.has_heap_bytes_free(proc, size, 0),
            "no room for a stack of {} bytes after the old generation",
            size
        );
        let heap = gc.heap_mut();
        let at = heap.old_gen_end();
        heap.old_gen_size += size;
        at
    } else {
        gc_assert!(
            gc.has_heap_bytes_free(proc, 0, size),
            "no room for a stack of {} bytes in the nursery chunk",
            size
        );
        gc.proc_mut(proc).cursor.bump(size)
    };
    let new = object::write_stack(at, new_reserved);
    copy_stack(old, new);
    let thread = gc.proc(proc).current_thread;
    set_thread_stack(thread, new);
    gc.card_table().mark(thread);
}
