//! Entry point for every request that may need a collection.
//!
//! [ensure_invariants] first tries to satisfy a request with the processor's own cursor,
//! taking another chunk off the shared frontier if needed. Only if that is not enough,
//! or somebody else is already waiting, does it join the synchronized section in which a
//! collection may run.
use std::sync::atomic::Ordering;

use crate::{
    gc_state::GcState,
    globals::{CARD_SIZE, FRONTIER_ALIGNMENT, HEAP_LIMIT_SLOP},
    object::set_thread_bytes_needed,
    stack::{grow_stack_current, sizeof_stack_grow},
    util::is_aligned,
};

/// Why a processor asked for a synchronized section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncReason {
    Signals,
    Stack,
    Heap,
    Force,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncTrigger {
    Reason(SyncReason),
    /// Another processor is waiting. Join it without work of our own.
    JoinSection,
}

/// Conditions checked, in priority order, after the local fast path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncConditions {
    pub signal_pending: bool,
    pub stack_invariant_unmet: bool,
    pub heap_invariant_unmet: bool,
    pub other_in_section: bool,
    pub force_major: bool,
}

impl SyncConditions {
    pub fn ordered(&self) -> [(bool, SyncTrigger); 5] {
        [
            (self.signal_pending, SyncTrigger::Reason(SyncReason::Signals)),
            (self.stack_invariant_unmet, SyncTrigger::Reason(SyncReason::Stack)),
            (self.heap_invariant_unmet, SyncTrigger::Reason(SyncReason::Heap)),
            (self.other_in_section, SyncTrigger::JoinSection),
            (self.force_major, SyncTrigger::Reason(SyncReason::Force)),
        ]
    }

    pub fn first_trigger(&self) -> Option<SyncTrigger> {
        self.ordered()
            .iter()
            .find(|(holds, _)| *holds)
            .map(|(_, trigger)| *trigger)
    }
}

/// What the caller needs to hold when [ensure_invariants] returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnsureRequest {
    pub force_major: bool,
    /// Add the current thread's `bytes_needed` to the nursery request.
    pub ensure_frontier: bool,
    pub ensure_stack: bool,
    pub old_gen_bytes: usize,
    pub nursery_bytes: usize,
    /// The request comes through [Mutator::collect](crate::mutator::Mutator::collect),
    /// so pending signals are delivered on the way out.
    pub from_gc_collect: bool,
}

/// Returns once processor `proc` can allocate the requested bytes and, if asked, has a
/// stack with room for another frame.
///
/// # Safety
/// Must be called by the thread owning `proc`, attached to the rendezvous.
pub(crate) unsafe fn ensure_invariants(gc: &GcState, proc: usize, request: EnsureRequest) {
    let mut nursery_bytes = request.nursery_bytes;
    let old_gen_bytes = request.old_gen_bytes;
    if request.ensure_frontier {
        let needed = crate::object::thread_bytes_needed(gc.proc(proc).current_thread);
        nursery_bytes = nursery_bytes.saturating_add(needed);
    }

    let stack_top_ok = !request.ensure_stack || gc.invariant_for_mutator_stack(proc);
    let stack_bytes = if stack_top_ok {
        0
    } else {
        sizeof_stack_grow(&gc.config, gc.proc(proc).current_stack)
    };

    gc.refill_local(proc, nursery_bytes.saturating_add(stack_bytes));

    if !stack_top_ok && gc.has_heap_bytes_free(proc, 0, stack_bytes) {
        logln_if!(gc.config.verbose, "[GC: Growing stack locally. [{}]]", proc);
        grow_stack_current(gc, proc, false);
        gc.set_current_thread_and_stack(proc);
    }

    let conditions = SyncConditions {
        signal_pending: gc.signals.is_pending(),
        stack_invariant_unmet: request.ensure_stack && !gc.invariant_for_mutator_stack(proc),
        heap_invariant_unmet: !gc.has_heap_bytes_free(proc, old_gen_bytes, nursery_bytes),
        other_in_section: gc.rendezvous.thread_in_section(),
        force_major: request.force_major,
    };
    logln_if!(
        gc.config.verbose,
        "[GC: stack invariant unmet: {}, heap invariant unmet: {}, in section: {}, force: {}. [{}]]",
        conditions.stack_invariant_unmet,
        conditions.heap_invariant_unmet,
        conditions.other_in_section,
        conditions.force_major,
        proc
    );

    match conditions.first_trigger() {
        Some(trigger) => {
            if let SyncTrigger::Reason(reason) = trigger {
                gc.proc_mut(proc).sync_reason = Some(reason);
                gc.last_sync_reason.store(Some(reason), Ordering::Release);
            }
            // Published so that whoever collects inside the section provides for us too.
            set_thread_bytes_needed(gc.proc(proc).current_thread, nursery_bytes);

            gc.rendezvous.section(|| {
                if (request.ensure_stack && !gc.invariant_for_mutator_stack(proc))
                    || !gc.has_heap_bytes_free(proc, old_gen_bytes, nursery_bytes)
                    || request.force_major
                {
                    gc.perform_gc(proc, old_gen_bytes, nursery_bytes, request.force_major, true);
                } else {
                    log::debug!("[GC: Skipping GC (inside of sync). [{}]]", proc);
                }
            });
            gc.proc_mut(proc).sync_reason = None;

            if request.from_gc_collect {
                gc.signals.deliver(proc);
            }
        }
        None => {
            log::trace!(
                "[GC: Skipping GC (invariants already hold / request satisfied locally). [{}]]",
                proc
            );
            let heap = gc.heap();
            let cursor = &gc.proc(proc).cursor;
            gc_assert!(is_aligned(heap.size, gc.sysvals.page_size));
            gc_assert!(is_aligned(heap.start as usize, CARD_SIZE));
            gc_assert!(is_aligned(heap.old_gen_end() as usize, FRONTIER_ALIGNMENT));
            gc_assert!(is_aligned(heap.nursery as usize, FRONTIER_ALIGNMENT));
            gc_assert!(is_aligned(cursor.frontier as usize, FRONTIER_ALIGNMENT));
            gc_assert!(heap.old_gen_end() <= heap.nursery);
            gc_assert!(heap.nursery <= heap.limit());
            gc_assert!(heap.nursery <= cursor.frontier || cursor.frontier.is_null());
            gc_assert!(cursor.start <= cursor.frontier);
            if heap.size != 0 && !cursor.frontier.is_null() {
                gc_assert!(cursor.frontier <= cursor.limit_plus_slop);
                gc_assert!(
                    cursor.limit.is_null()
                        || cursor.limit == cursor.limit_plus_slop.wrapping_sub(HEAP_LIMIT_SLOP)
                );
                gc_assert!(gc.has_heap_bytes_free(proc, 0, 0));
            }
        }
    }

    let cursor = &gc.proc(proc).cursor;
    gc_assert!(
        cursor.frontier <= cursor.limit_plus_slop,
        "frontier {:p} past the chunk end {:p} on processor {}",
        cursor.frontier,
        cursor.limit_plus_slop,
        proc
    );
    gc_assert!(
        !request.ensure_frontier || gc.invariant_for_mutator_frontier(proc),
        "frontier invariant does not hold on processor {}",
        proc
    );
    gc_assert!(
        !request.ensure_stack || gc.invariant_for_mutator_stack(proc),
        "stack invariant does not hold on processor {}",
        proc
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_condition_means_no_sync() {
        assert_eq!(SyncConditions::default().first_trigger(), None);
    }

    #[test]
    fn conditions_are_checked_in_priority_order() {
        let all = SyncConditions {
            signal_pending: true,
            stack_invariant_unmet: true,
            heap_invariant_unmet: true,
            other_in_section: true,
            force_major: true,
        };
        assert_eq!(
            all.first_trigger(),
            Some(SyncTrigger::Reason(SyncReason::Signals))
        );
        let no_signal = SyncConditions {
            signal_pending: false,
            ..all
        };
        assert_eq!(
            no_signal.first_trigger(),
            Some(SyncTrigger::Reason(SyncReason::Stack))
        );
        let heap_and_force = SyncConditions {
            heap_invariant_unmet: true,
            force_major: true,
            ..SyncConditions::default()
        };
        assert_eq!(
            heap_and_force.first_trigger(),
            Some(SyncTrigger::Reason(SyncReason::Heap))
        );
        let join_and_force = SyncConditions {
            other_in_section: true,
            force_major: true,
            ..SyncConditions::default()
        };
        assert_eq!(join_and_force.first_trigger(), Some(SyncTrigger::JoinSection));
        let force = SyncConditions {
            force_major: true,
            ..SyncConditions::default()
        };
        assert_eq!(
            force.first_trigger(),
            Some(SyncTrigger::Reason(SyncReason::Force))
        );
    }
}
