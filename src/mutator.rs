//! Per-processor handle used by the program running on top of the collector.
//!
//! A [Mutator] owns one processor slot of a [GcState] for as long as it lives and takes
//! part in every synchronized section while attached. Objects are handed out as raw data
//! pointers; anything that has to survive a collection must be kept on the root stack,
//! since every allocation may move every object.
use std::{cell::Cell, marker::PhantomData, sync::Arc};

use crate::{
    error::{fatal, GcError},
    gate::{ensure_invariants, EnsureRequest},
    gc_state::GcState,
    globals::{FRONTIER_ALIGNMENT, HEAP_LIMIT_SLOP, OBJPTR_SIZE},
    object::{
        self, byte_vector_size, field, normal_size, raw_word, ref_array_size,
        set_thread_bytes_needed, set_thread_exn_stack,
    },
    stack,
    tlab::Refill,
    util::align_up,
    Pointer,
};

/// Bytes a thread declares it needs when it asks for `bytes`: at least one chunk, and
/// room for the limit slop above that. Requests no heap could ever hold are exhaustion.
pub(crate) fn collect_request_size(
    bytes: usize,
    chunk: usize,
    capacity: usize,
) -> Result<usize, GcError> {
    let needed = if bytes < chunk {
        Some(chunk)
    } else {
        bytes.checked_add(HEAP_LIMIT_SLOP)
    };
    match needed {
        Some(needed) if needed <= capacity => Ok(align_up(needed, FRONTIER_ALIGNMENT)),
        _ => Err(GcError::ResourceExhaustion {
            needed: bytes.saturating_add(HEAP_LIMIT_SLOP),
            limit: capacity,
        }),
    }
}

pub struct Mutator {
    pub(crate) gc: Arc<GcState>,
    pub(crate) proc: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl GcState {
    /// Attaches the calling thread as processor `proc`. Returns `None` if the slot does
    /// not exist or is taken.
    pub fn mutator(self: &Arc<Self>, proc: usize) -> Option<Mutator> {
        if !self.claim(proc) {
            return None;
        }
        self.rendezvous.attach();
        log::debug!("[GC: Processor {} attached.]", proc);
        Some(Mutator {
            gc: self.clone(),
            proc,
            _not_sync: PhantomData,
        })
    }
}

impl Mutator {
    pub fn gc(&self) -> &Arc<GcState> {
        &self.gc
    }

    pub fn proc(&self) -> usize {
        self.proc
    }

    /// Runs a collection if needed so that afterwards `bytes` can be allocated, or always
    /// when `force` is set. Delivers pending signals on the way out.
    pub fn collect(&self, bytes: usize, force: bool) {
        let gc = &*self.gc;
        let bytes = collect_request_size(bytes, gc.config.alloc_chunk_size, gc.heap().capacity)
            .unwrap_or_else(|err| fatal(err));
        unsafe {
            let state = gc.proc(self.proc);
            set_thread_bytes_needed(state.current_thread, bytes);
            set_thread_exn_stack(state.current_thread, state.exn_stack);
            ensure_invariants(
                gc,
                self.proc,
                EnsureRequest {
                    force_major: force,
                    ensure_frontier: true,
                    ensure_stack: true,
                    from_gc_collect: true,
                    ..EnsureRequest::default()
                },
            );
        }
    }

    /// Joins a synchronized section if another processor is waiting in one.
    #[inline]
    pub fn safepoint(&self) {
        if self.gc.rendezvous.thread_in_section() {
            unsafe {
                ensure_invariants(&self.gc, self.proc, EnsureRequest::default());
            }
        }
    }

    fn allocate_raw(&self, size: usize) -> Pointer {
        self.safepoint();
        unsafe {
            if self.gc.proc(self.proc).cursor.bytes_below_limit() < size {
                self.collect(size, false);
            }
            self.gc.proc_mut(self.proc).cursor.bump(size)
        }
    }

    /// Allocates a zeroed object with `num_refs` reference fields and `raw_words`
    /// non-reference words.
    pub fn allocate(&self, num_refs: usize, raw_words: usize) -> Pointer {
        let at = self.allocate_raw(normal_size(num_refs, raw_words));
        unsafe { object::write_normal(at, num_refs, raw_words) }
    }

    pub fn allocate_byte_vector(&self, bytes: &[u8]) -> Pointer {
        let at = self.allocate_raw(byte_vector_size(bytes.len()));
        unsafe { object::write_byte_vector(at, bytes) }
    }

    /// Allocates an array of `len` null references.
    pub fn allocate_ref_array(&self, len: usize) -> Pointer {
        let at = self.allocate_raw(ref_array_size(len));
        unsafe { object::write_ref_array(at, len) }
    }

    /// Allocates a byte vector in the shared heap. It is never moved or reclaimed.
    /// Returns `None` once the shared heap is full or when there is none.
    pub fn allocate_shared_bytes(&self, bytes: &[u8]) -> Option<Pointer> {
        let size = byte_vector_size(bytes.len());
        unsafe {
            if self.gc.refill_shared(self.proc, size) == Refill::Declined {
                return None;
            }
            let at = self.gc.proc_mut(self.proc).shared_cursor.bump(size);
            Some(object::write_byte_vector(at, bytes))
        }
    }

    /// Pushes `obj` on the root stack. The stack is grown once it runs out of headroom,
    /// which may collect.
    pub fn push_root(&self, obj: Pointer) {
        unsafe {
            let gc = &*self.gc;
            let stack = gc.proc(self.proc).current_stack;
            let used = stack::used(stack);
            gc_assert!(
                used + OBJPTR_SIZE <= stack::reserved(stack),
                "root stack overflow on processor {}",
                self.proc
            );
            *stack::slots(stack).add(used / OBJPTR_SIZE) = obj;
            stack::set_used(stack, used + OBJPTR_SIZE);
            if !gc.invariant_for_mutator_stack(self.proc) {
                ensure_invariants(
                    gc,
                    self.proc,
                    EnsureRequest {
                        ensure_stack: true,
                        ..EnsureRequest::default()
                    },
                );
            }
        }
    }

    pub fn pop_root(&self) -> Pointer {
        unsafe {
            let stack = self.gc.proc(self.proc).current_stack;
            let used = stack::used(stack);
            gc_assert!(used > 0, "root stack underflow on processor {}", self.proc);
            stack::set_used(stack, used - OBJPTR_SIZE);
            *stack::slots(stack).add(used / OBJPTR_SIZE - 1)
        }
    }

    pub fn roots_len(&self) -> usize {
        unsafe { stack::used(self.gc.proc(self.proc).current_stack) / OBJPTR_SIZE }
    }

    /// Root `index`, counted from the bottom of the stack.
    pub fn root(&self, index: usize) -> Pointer {
        gc_assert!(index < self.roots_len());
        unsafe { *stack::slots(self.gc.proc(self.proc).current_stack).add(index) }
    }

    pub fn set_root(&self, index: usize, obj: Pointer) {
        gc_assert!(index < self.roots_len());
        unsafe {
            *stack::slots(self.gc.proc(self.proc).current_stack).add(index) = obj;
        }
    }

    /// # Safety
    /// `obj` must be a live normal object or reference array with more than `index`
    /// reference fields.
    pub unsafe fn read_ref(&self, obj: Pointer, index: usize) -> Pointer {
        *field(obj, index)
    }

    /// Stores `value` and dirties the card of `obj`.
    ///
    /// # Safety
    /// See [Mutator::read_ref].
    pub unsafe fn write_ref(&self, obj: Pointer, index: usize, value: Pointer) {
        *field(obj, index) = value;
        self.gc.card_table().mark(obj);
    }

    /// # Safety
    /// `obj` must be a live normal object with more than `index` raw words.
    pub unsafe fn read_word(&self, obj: Pointer, index: usize) -> u64 {
        *raw_word(obj, index)
    }

    /// # Safety
    /// See [Mutator::read_word].
    pub unsafe fn write_word(&self, obj: Pointer, index: usize, value: u64) {
        *raw_word(obj, index) = value;
    }

    /// # Safety
    /// `obj` must be a live byte vector.
    pub unsafe fn read_bytes(&self, obj: Pointer) -> Vec<u8> {
        object::byte_vector_bytes(obj).to_vec()
    }

    pub fn set_exn_stack(&self, exn_stack: usize) {
        unsafe {
            self.gc.proc_mut(self.proc).exn_stack = exn_stack;
        }
    }

    /// Opaque argument/result pointer for foreign calls. The collector never follows it.
    pub fn ffi_op_args_res_ptr(&self) -> Pointer {
        unsafe { self.gc.proc(self.proc).ffi_op_args_res_ptr }
    }

    pub fn set_ffi_op_args_res_ptr(&self, ptr: Pointer) {
        unsafe {
            self.gc.proc_mut(self.proc).ffi_op_args_res_ptr = ptr;
        }
    }

    pub fn raise_signal(&self) {
        self.gc.raise_signal();
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> crate::tlab::AllocationCursor {
        unsafe { self.gc.proc(self.proc).cursor }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.gc.rendezvous.detach();
        self.gc.release(self.proc);
        log::debug!("[GC: Processor {} detached.]", self.proc);
    }
}
