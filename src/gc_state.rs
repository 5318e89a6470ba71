//! Process-wide collector state.
//!
//! Everything here is shared between the processors. Heap layout fields and every
//! processor's [ProcState] are only written by the owning processor outside of a
//! synchronized section, or by whoever runs inside one. The arena frontier is the
//! exception: any processor advances it at any time with a compare-and-swap.
use std::{
    cell::UnsafeCell,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    card_table::CardTable,
    error::{fatal, GcError},
    gate::SyncReason,
    globals::{BONUS_SLOP, CARD_SIZE, FRONTIER_ALIGNMENT},
    heap::Heap,
    mmap,
    object::{
        self, for_each_object_in_range, for_each_ref_slot, set_thread_bytes_needed, stack_size,
        thread_bytes_needed, thread_stack, THREAD_SIZE,
    },
    safepoint::Rendezvous,
    stack,
    statistics::Statistics,
    tlab::{refill, AllocationCursor, Refill},
    util::{align_down, align_up, distance, formatted_size, is_aligned, CommaSeparated},
    Config, Pointer,
};

/// Facts about the host, probed once.
#[derive(Clone, Copy, Debug)]
pub struct SysVals {
    pub ram: usize,
    pub page_size: usize,
}

impl SysVals {
    pub fn probe(config: &Config) -> Self {
        Self {
            ram: config.ram.unwrap_or_else(mmap::physical_memory),
            page_size: mmap::page_size(),
        }
    }
}

/// Passed to the signal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalInfo {
    /// Processor the handler runs on.
    pub proc: usize,
    /// Whether a collection finished since the last delivery.
    pub gc_signal: bool,
}

pub type SignalHandler = Box<dyn Fn(&SignalInfo) + Send + Sync>;

pub(crate) struct Signals {
    handler: Mutex<Option<SignalHandler>>,
    pub(crate) gc_signal_handled: AtomicBool,
    pub(crate) signal_pending: AtomicBool,
    pub(crate) gc_signal_pending: AtomicBool,
    pub(crate) in_handler: AtomicBool,
}

impl Signals {
    fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            gc_signal_handled: AtomicBool::new(false),
            signal_pending: AtomicBool::new(false),
            gc_signal_pending: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.signal_pending.load(Ordering::Acquire)
    }

    /// Called at the end of a collection. Delivery happens later, at a safe point.
    pub(crate) fn mark_gc_signal_pending(&self) {
        if !self.gc_signal_handled.load(Ordering::Acquire) {
            return;
        }
        log::debug!("[GC: GC signal pending.]");
        self.gc_signal_pending.store(true, Ordering::Release);
        if !self.in_handler.load(Ordering::Acquire) {
            self.signal_pending.store(true, Ordering::Release);
        }
    }

    /// Runs the handler on `proc` if a signal is pending. Returns whether it ran.
    pub(crate) fn deliver(&self, proc: usize) -> bool {
        if self.in_handler.load(Ordering::Acquire)
            || !self.signal_pending.swap(false, Ordering::AcqRel)
        {
            return false;
        }
        let info = SignalInfo {
            proc,
            gc_signal: self.gc_signal_pending.swap(false, Ordering::AcqRel),
        };
        self.in_handler.store(true, Ordering::Release);
        if let Some(handler) = &*self.handler.lock() {
            handler(&info);
        }
        self.in_handler.store(false, Ordering::Release);
        true
    }
}

pub(crate) struct ProcState {
    pub(crate) number: usize,
    pub(crate) cursor: AllocationCursor,
    pub(crate) shared_cursor: AllocationCursor,
    pub(crate) current_thread: Pointer,
    /// Cached copy of the current thread's stack field.
    pub(crate) current_stack: Pointer,
    pub(crate) exn_stack: usize,
    pub(crate) sync_reason: Option<SyncReason>,
    pub(crate) ffi_op_args_res_ptr: Pointer,
}

impl ProcState {
    fn new(number: usize) -> Self {
        Self {
            number,
            cursor: AllocationCursor::empty(),
            shared_cursor: AllocationCursor::empty(),
            current_thread: null_mut(),
            current_stack: null_mut(),
            exn_stack: 0,
            sync_reason: None,
            ffi_op_args_res_ptr: null_mut(),
        }
    }
}

struct ProcSlot {
    claimed: AtomicBool,
    state: UnsafeCell<ProcState>,
}

pub struct GcState {
    pub(crate) config: Config,
    pub(crate) sysvals: SysVals,
    pub(crate) rendezvous: Rendezvous,
    pub(crate) signals: Signals,
    heap: UnsafeCell<Heap>,
    secondary_heap: UnsafeCell<Heap>,
    shared_heap: Heap,
    card_table: UnsafeCell<CardTable>,
    procs: Box<[ProcSlot]>,
    stats: Mutex<Statistics>,
    pub(crate) am_in_gc: AtomicBool,
    pub(crate) last_sync_reason: atomic::Atomic<Option<SyncReason>>,
}

unsafe impl Send for GcState {}
unsafe impl Sync for GcState {}

impl GcState {
    pub fn new(config: Config) -> Arc<Self> {
        gc_assert!(config.num_procs > 0, "at least one processor is required");
        let sysvals = SysVals::probe(&config);
        let page = sysvals.page_size;
        let capacity = align_up(config.max_heap_size, page);
        let initial = align_up(config.initial_heap_size.min(capacity), page);
        let heap = Heap::create(capacity, initial, page).unwrap_or_else(|| {
            fatal(GcError::ResourceExhaustion {
                needed: capacity,
                limit: sysvals.ram,
            })
        });
        let shared_heap = if config.shared_heap_size > 0 {
            let size = align_up(config.shared_heap_size, page);
            Heap::create(size, size, page).unwrap_or_else(|| {
                fatal(GcError::ResourceExhaustion {
                    needed: size,
                    limit: sysvals.ram,
                })
            })
        } else {
            Heap::uninit()
        };
        let card_table = CardTable::new(heap.start, capacity).unwrap_or_else(|err| {
            log::error!("cannot map card table: {}", err);
            fatal(GcError::ResourceExhaustion {
                needed: capacity / CARD_SIZE,
                limit: sysvals.ram,
            })
        });
        let procs = (0..config.num_procs)
            .map(|number| ProcSlot {
                claimed: AtomicBool::new(false),
                state: UnsafeCell::new(ProcState::new(number)),
            })
            .collect();

        let this = Self {
            config,
            sysvals,
            rendezvous: Rendezvous::new(),
            signals: Signals::new(),
            heap: UnsafeCell::new(heap),
            secondary_heap: UnsafeCell::new(Heap::uninit()),
            shared_heap,
            card_table: UnsafeCell::new(card_table),
            procs,
            stats: Mutex::new(Statistics::default()),
            am_in_gc: AtomicBool::new(false),
            last_sync_reason: atomic::Atomic::new(None),
        };
        unsafe {
            this.init_threads();
        }
        logln_if!(
            this.config.verbose,
            "[GC: Created heap of size {} bytes ({} reserved) for {} processors.]",
            CommaSeparated(this.heap().size),
            formatted_size(capacity),
            this.num_procs()
        );
        Arc::new(this)
    }

    /// Places every processor's initial thread and stack in the old generation and hands
    /// out the first chunks.
    unsafe fn init_threads(&self) {
        let reserved = align_up(
            self.config.initial_stack_size.max(self.config.max_frame_size),
            FRONTIER_ALIGNMENT,
        );
        let per_proc = stack_size(reserved) + THREAD_SIZE;
        let chunk = align_up(self.config.alloc_chunk_size, FRONTIER_ALIGNMENT);
        let demand = self.num_procs() * (per_proc + chunk + BONUS_SLOP);
        if demand > self.heap().available_size {
            self.resize_heap(demand);
        }

        for proc in 0..self.num_procs() {
            let heap = self.heap_mut();
            let stack = object::write_stack(heap.old_gen_end(), reserved);
            heap.old_gen_size += stack_size(reserved);
            let thread = object::write_thread(heap.old_gen_end(), stack);
            heap.old_gen_size += THREAD_SIZE;
            set_thread_bytes_needed(thread, chunk);

            let state = self.proc_mut(proc);
            state.current_thread = thread;
            state.current_stack = stack;
        }
        self.set_current_local_heap(0);
        gc_assert!(self.invariant_for_gc());
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sysvals(&self) -> SysVals {
        self.sysvals
    }

    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.lock().clone()
    }

    pub(crate) fn stats(&self) -> MutexGuard<'_, Statistics> {
        self.stats.lock()
    }

    pub fn last_sync_reason(&self) -> Option<SyncReason> {
        self.last_sync_reason.load(Ordering::Acquire)
    }

    pub fn in_gc(&self) -> bool {
        self.am_in_gc.load(Ordering::Acquire)
    }

    /// Installs the handler run at the next safe point after a collection or a raised
    /// signal. The handler must not install another handler.
    pub fn set_gc_signal_handler(&self, handler: impl Fn(&SignalInfo) + Send + Sync + 'static) {
        *self.signals.handler.lock() = Some(Box::new(handler));
        self.signals.gc_signal_handled.store(true, Ordering::Release);
    }

    pub fn raise_signal(&self) {
        self.signals.signal_pending.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn heap(&self) -> &Heap {
        unsafe { &*self.heap.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub(crate) unsafe fn heap_mut(&self) -> &mut Heap {
        &mut *self.heap.get()
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn secondary_heap_mut(&self) -> &mut Heap {
        &mut *self.secondary_heap.get()
    }

    /// Swaps the heap with the secondary heap after a copying collection.
    pub(crate) unsafe fn swap_heaps(&self) {
        std::mem::swap(self.heap_mut(), self.secondary_heap_mut());
    }

    pub(crate) fn shared_heap(&self) -> &Heap {
        &self.shared_heap
    }

    #[inline(always)]
    pub(crate) fn card_table(&self) -> &CardTable {
        unsafe { &*self.card_table.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn card_table_mut(&self) -> &mut CardTable {
        &mut *self.card_table.get()
    }

    #[inline(always)]
    pub(crate) unsafe fn proc(&self, proc: usize) -> &ProcState {
        &*self.procs[proc].state.get()
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub(crate) unsafe fn proc_mut(&self, proc: usize) -> &mut ProcState {
        &mut *self.procs[proc].state.get()
    }

    pub(crate) fn claim(&self, proc: usize) -> bool {
        self.procs.get(proc).map_or(false, |slot| {
            slot.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    pub(crate) fn release(&self, proc: usize) {
        self.procs[proc].claimed.store(false, Ordering::Release);
    }

    /// Whether `old_gen` bytes fit between the old generation and the nursery and
    /// `nursery` bytes fit in the chunk of `proc`.
    pub(crate) unsafe fn has_heap_bytes_free(
        &self,
        proc: usize,
        old_gen: usize,
        nursery: usize,
    ) -> bool {
        let heap = self.heap();
        old_gen <= distance(heap.old_gen_end(), heap.nursery)
            && nursery <= self.proc(proc).cursor.bytes_free()
    }

    pub(crate) unsafe fn invariant_for_mutator_frontier(&self, proc: usize) -> bool {
        let state = self.proc(proc);
        thread_bytes_needed(state.current_thread) <= state.cursor.bytes_free()
    }

    pub(crate) unsafe fn invariant_for_mutator_stack(&self, proc: usize) -> bool {
        stack::invariant_for_mutator_stack(&self.config, self.proc(proc).current_stack)
    }

    pub(crate) unsafe fn refill_local(&self, proc: usize, bytes: usize) -> Refill {
        let heap = self.heap();
        refill(&heap.frontier, heap.limit(), &mut self.proc_mut(proc).cursor, bytes)
    }

    pub(crate) unsafe fn refill_shared(&self, proc: usize, bytes: usize) -> Refill {
        let heap = self.shared_heap();
        if !heap.is_init() {
            return Refill::Declined;
        }
        refill(&heap.frontier, heap.limit(), &mut self.proc_mut(proc).shared_cursor, bytes)
    }

    pub(crate) unsafe fn set_current_thread_and_stack(&self, proc: usize) {
        let state = self.proc_mut(proc);
        state.current_stack = thread_stack(state.current_thread);
    }

    /// Lays out the nursery after a collection and gives every processor a chunk sized to
    /// its thread's `bytes_needed`. `old_gen_bytes` stay free right after the old
    /// generation.
    pub(crate) unsafe fn set_current_local_heap(&self, old_gen_bytes: usize) {
        let needs: Vec<usize> = (0..self.num_procs())
            .map(|proc| {
                align_up(
                    thread_bytes_needed(self.proc(proc).current_thread),
                    FRONTIER_ALIGNMENT,
                )
            })
            .collect();
        let demand = needs
            .iter()
            .fold(0usize, |sum, need| sum.saturating_add(*need).saturating_add(BONUS_SLOP));

        let heap = self.heap_mut();
        let old_end = heap.old_gen_end().add(old_gen_bytes);
        let limit = heap.limit();
        gc_assert!(
            old_end <= limit,
            "old generation ends at {:p}, past the heap limit {:p}",
            old_end,
            limit
        );
        let free = distance(old_end, limit);
        let half = align_down(free / 2, FRONTIER_ALIGNMENT);
        heap.can_minor = self.config.generational && demand <= half;
        heap.nursery = if heap.can_minor {
            limit.sub(half)
        } else {
            old_end
        };
        if demand > distance(heap.nursery, limit) {
            fatal(GcError::ResourceExhaustion {
                needed: heap.old_gen_size.saturating_add(old_gen_bytes).saturating_add(demand),
                limit: heap.available_size,
            });
        }

        let mut frontier = heap.nursery;
        for (proc, need) in needs.into_iter().enumerate() {
            let limit_plus_slop = frontier.add(need);
            self.proc_mut(proc).cursor = AllocationCursor::over(frontier, limit_plus_slop);
            frontier = limit_plus_slop.add(BONUS_SLOP);
        }
        heap.frontier.store(frontier, Ordering::Release);
        log::debug!(
            "[GC: Nursery at {:p} of size {} bytes ({} minor collections), {} bytes handed out.]",
            heap.nursery,
            heap.nursery_size(),
            if heap.can_minor { "with" } else { "without" },
            demand
        );
    }

    /// Structural checks of the heap layout and every processor's cursor. Debug builds
    /// also parse the old generation.
    pub(crate) unsafe fn invariant_for_gc(&self) -> bool {
        let heap = self.heap();
        let layout_ok = is_aligned(heap.size, self.sysvals.page_size)
            && is_aligned(heap.start as usize, CARD_SIZE)
            && is_aligned(heap.old_gen_end() as usize, FRONTIER_ALIGNMENT)
            && is_aligned(heap.nursery as usize, FRONTIER_ALIGNMENT)
            && heap.old_gen_end() <= heap.nursery
            && heap.nursery <= heap.limit()
            && heap.available_size <= heap.size
            && heap.frontier() <= heap.limit();
        if !layout_ok {
            log::error!(
                "bad heap layout: start {:p}, old gen {} bytes, nursery {:p}, frontier {:p}, available {} of {} bytes",
                heap.start,
                heap.old_gen_size,
                heap.nursery,
                heap.frontier(),
                heap.available_size,
                heap.size
            );
            return false;
        }
        for proc in 0..self.num_procs() {
            let state = self.proc(proc);
            let cursor = &state.cursor;
            if !cursor.is_consistent()
                || (!cursor.frontier.is_null()
                    && (cursor.frontier < heap.nursery || cursor.limit_plus_slop > heap.frontier()))
            {
                log::error!("bad cursor on processor {}: {:?}", proc, cursor);
                return false;
            }
            if state.current_stack != thread_stack(state.current_thread) {
                log::error!("stale stack cache on processor {}", proc);
                return false;
            }
        }
        if cfg!(debug_assertions) {
            let shared = self.shared_heap();
            let mut ok = true;
            for_each_object_in_range(heap.start, heap.old_gen_end(), |obj| {
                for_each_ref_slot(obj, |slot| {
                    let target = *slot;
                    if !target.is_null() && !heap.contains(target) && !shared.contains(target) {
                        log::error!("object {:p} refers to {:p} outside of the heap", obj, target);
                        ok = false;
                    }
                });
            });
            return ok;
        }
        true
    }
}

impl Drop for GcState {
    fn drop(&mut self) {
        logln_if!(self.config.summary, "{}", self.stats.lock());
    }
}
