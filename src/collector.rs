use std::{sync::atomic::Ordering, time::Instant};

use crate::{
    cheney::{Cheney, InHeader},
    filler::fill_gap,
    gc_state::GcState,
    globals::{BONUS_SLOP, HEAP_LIMIT_SLOP},
    object::{
        for_each_object_in_range, for_each_ref_slot, object_size, object_start,
        set_thread_bytes_needed, thread_bytes_needed,
    },
    stack::{grow_stack_current, sizeof_stack_grow},
    util::{distance, CommaSeparated},
};

impl GcState {
    fn enter_gc(&self) {
        self.am_in_gc.store(true, Ordering::Release);
    }

    fn leave_gc(&self) {
        self.am_in_gc.store(false, Ordering::Release);
    }

    fn log_heap_layout(&self, finished: bool) {
        let heap = self.heap();
        let size = heap.size.max(1) as f64;
        let nursery_size = heap.nursery_size();
        logln_if!(
            self.config.verbose,
            "[GC:\theap at {:p} of size {} bytes,]",
            heap.start,
            CommaSeparated(heap.size)
        );
        logln_if!(
            self.config.verbose,
            "[GC:\twith nursery of size {} bytes ({:.1}% of heap),]",
            CommaSeparated(nursery_size),
            100.0 * nursery_size as f64 / size
        );
        logln_if!(
            self.config.verbose,
            "[GC:\tand old-gen of size {} bytes ({:.1}% of heap){}]",
            CommaSeparated(heap.old_gen_size),
            100.0 * heap.old_gen_size as f64 / size,
            if finished { "." } else { "," }
        );
        if !finished {
            let used = distance(heap.nursery, heap.frontier());
            logln_if!(
                self.config.verbose,
                "[GC:\tand nursery using {} bytes ({:.1}% of heap, {:.1}% of nursery).]",
                CommaSeparated(used),
                100.0 * used as f64 / size,
                100.0 * used as f64 / nursery_size.max(1) as f64
            );
        }
    }

    /// Runs one collection on behalf of processor `proc` so that afterwards
    /// `old_gen_bytes` fit after the old generation and `nursery_bytes` fit in its chunk.
    /// Every other processor gets a chunk of its own `bytes_needed`.
    ///
    /// # Safety
    /// Exclusive access to the whole state, i.e. inside a synchronized section.
    pub(crate) unsafe fn perform_gc(
        &self,
        proc: usize,
        old_gen_bytes: usize,
        nursery_bytes: usize,
        force_major: bool,
        may_resize: bool,
    ) {
        self.enter_gc();
        let reason = self.proc(proc).sync_reason;
        let num_gcs = {
            let mut stats = self.stats();
            stats.cumulative.num_gcs += 1;
            stats.last_gc_reason = reason;
            stats.cumulative.num_gcs
        };
        logln_if!(
            self.config.verbose,
            "[GC: Starting gc #{} ({:?}); requesting {} nursery bytes and {} old-gen bytes,]",
            CommaSeparated(num_gcs),
            reason,
            CommaSeparated(nursery_bytes),
            CommaSeparated(old_gen_bytes)
        );
        self.log_heap_layout(false);
        gc_assert!(self.invariant_for_gc(), "heap invariant violated before gc #{}", num_gcs);

        let start = Instant::now();
        self.minor_gc();

        let stack_top_ok = self.invariant_for_mutator_stack(proc);
        let stack_bytes = if stack_top_ok {
            0
        } else {
            sizeof_stack_grow(&self.config, self.proc(proc).current_stack)
        };
        let old_gen_and_stack = old_gen_bytes.saturating_add(stack_bytes);
        let mut total_bytes = old_gen_and_stack;
        set_thread_bytes_needed(self.proc(proc).current_thread, nursery_bytes);
        for other in 0..self.num_procs() {
            // A processor that has not asked for anything may still need a little.
            let thread = self.proc(other).current_thread;
            if thread_bytes_needed(thread) == 0 {
                set_thread_bytes_needed(thread, HEAP_LIMIT_SLOP);
            }
            total_bytes = total_bytes
                .saturating_add(thread_bytes_needed(thread))
                .saturating_add(BONUS_SLOP);
        }

        let heap = self.heap();
        if force_major || total_bytes > heap.available_size - heap.old_gen_size {
            self.major_gc(total_bytes, may_resize);
        }
        self.set_current_local_heap(old_gen_and_stack);
        gc_assert!(self.has_heap_bytes_free(proc, old_gen_and_stack, nursery_bytes));
        if !stack_top_ok {
            grow_stack_current(self, proc, true);
        }
        for other in 0..self.num_procs() {
            self.set_current_thread_and_stack(other);
        }

        let pause = start.elapsed();
        {
            let mut stats = self.stats();
            stats.cumulative.gc_time += pause;
            stats.cumulative.max_pause = stats.cumulative.max_pause.max(pause);
        }
        logln_if!(
            self.config.verbose,
            "[GC: Finished gc #{}; time {} ms,]",
            CommaSeparated(num_gcs),
            CommaSeparated(pause.as_millis() as usize)
        );
        self.log_heap_layout(true);

        self.signals.mark_gc_signal_pending();
        gc_assert!(self.has_heap_bytes_free(proc, old_gen_bytes, nursery_bytes));
        gc_assert!(self.invariant_for_gc(), "heap invariant violated after gc #{}", num_gcs);
        self.leave_gc();
    }

    /// Moves everything reachable in the nursery to the end of the old generation.
    ///
    /// When the nursery was placed without room for a copy it is absorbed in place
    /// instead: the unused tail of every chunk gets a filler and the old generation is
    /// extended over it.
    pub(crate) unsafe fn minor_gc(&self) {
        let heap = self.heap_mut();
        let frontier = heap.frontier();
        let allocated = distance(heap.nursery, frontier);

        if !heap.can_minor {
            for proc in 0..self.num_procs() {
                let (tail_start, tail_end) = self.proc(proc).cursor.unused_tail();
                if !tail_start.is_null() {
                    fill_gap(tail_start, tail_end);
                }
                self.proc_mut(proc).cursor = crate::tlab::AllocationCursor::empty();
            }
            fill_gap(heap.old_gen_end(), heap.nursery);
            heap.old_gen_size = distance(heap.start, frontier);
            heap.nursery = frontier;
            log::debug!(
                "[GC: Absorbing {} nursery bytes into the old generation.]",
                allocated
            );
        } else if allocated > 0 {
            logln_if!(
                self.config.verbose,
                "[GC: Starting minor GC, {} nursery bytes allocated.]",
                CommaSeparated(allocated)
            );
            let old_end = heap.old_gen_end();
            let mut cheney = Cheney::new(
                heap.nursery,
                frontier,
                old_end,
                heap.nursery,
                InHeader,
            );

            for proc in 0..self.num_procs() {
                let state = self.proc_mut(proc);
                cheney.copy_slot(&mut state.current_thread);
                let thread = state.current_thread;
                for_each_ref_slot(thread, |slot| cheney.copy_slot(slot));
                let stack = crate::object::thread_stack(thread);
                for_each_ref_slot(stack, |slot| cheney.copy_slot(slot));
            }

            // Old objects on dirty cards may point into the nursery.
            let cards = self.card_table();
            for_each_object_in_range(heap.start, old_end, |obj| {
                let start = object_start(obj);
                let end = start.add(object_size(obj));
                if cards.is_dirty_range(start, end) {
                    for_each_ref_slot(obj, |slot| cheney.copy_slot(slot));
                }
            });

            cheney.scan();
            let copied = cheney.bytes_copied();
            heap.old_gen_size = distance(heap.start, cheney.back());
            heap.nursery = frontier;
            for proc in 0..self.num_procs() {
                self.proc_mut(proc).cursor = crate::tlab::AllocationCursor::empty();
            }
            let mut stats = self.stats();
            stats.cumulative.num_minor_gcs += 1;
            stats.cumulative.bytes_copied_minor += copied;
            stats.last_major.num_minor_gcs += 1;
            logln_if!(
                self.config.verbose,
                "[GC: Finished minor GC, {} bytes copied.]",
                CommaSeparated(copied)
            );
        }
        heap.frontier.store(heap.nursery, Ordering::Release);
        for proc in 0..self.num_procs() {
            self.set_current_thread_and_stack(proc);
        }
        self.card_table_mut().clear_all();
    }
}
