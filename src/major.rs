//! Major collections and heap sizing.
//!
//! A major collection either copies the old generation into the secondary heap and
//! swaps the two, or compacts it in place. Copying is preferred; it needs a second heap
//! of the desired size, so it is skipped when memory is tight or when the collection
//! should also hash-cons, which only the compacting collector does.
use std::sync::atomic::Ordering;

use crate::{
    cheney::{Cheney, InHeader},
    error::{fatal, GcError},
    gc_state::GcState,
    heap::Heap,
    statistics::CumulativeStatistics,
    util::{align_up, distance, CommaSeparated},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MajorStrategy {
    Copying,
    MarkCompact,
}

/// Everything the strategy choice depends on besides the secondary heap.
#[derive(Clone, Copy, Debug)]
pub struct MajorInputs {
    pub force_mark_compact: bool,
    pub hash_cons: bool,
    pub heap_size: usize,
    pub ram: usize,
}

/// Whether the next major collection should hash-cons: only while hash-consing
/// collections stay below `ratio` of all major collections so far.
pub fn should_hash_cons(stats: &CumulativeStatistics, ratio: f64) -> bool {
    let majors = stats.num_major_gcs();
    majors > 0 && (stats.num_hash_cons_gcs as f64 / majors as f64) < ratio
}

/// Picks the collector. `create_secondary` is only called once everything else allows
/// copying and reports whether a secondary heap of the desired size is available.
pub fn choose_major_strategy(
    inputs: &MajorInputs,
    create_secondary: impl FnOnce() -> bool,
) -> MajorStrategy {
    if inputs.force_mark_compact
        || inputs.hash_cons
        || inputs.heap_size > inputs.ram
        || !create_secondary()
    {
        MajorStrategy::MarkCompact
    } else {
        MajorStrategy::Copying
    }
}

impl GcState {
    /// Collects the whole old generation so that afterwards `bytes_requested` fit after it.
    ///
    /// # Safety
    /// Inside a synchronized section, right after a minor collection.
    pub(crate) unsafe fn major_gc(&self, bytes_requested: usize, may_resize: bool) {
        let (hash_cons, last_live) = {
            let mut stats = self.stats();
            stats.last_major.num_minor_gcs = 0;
            (
                should_hash_cons(&stats.cumulative, self.config.ratios.hash_cons),
                stats.last_major.bytes_live,
            )
        };
        let desired = self.sizeof_heap_desired(last_live.saturating_add(bytes_requested));
        let heap = self.heap();
        let inputs = MajorInputs {
            force_mark_compact: self.config.force_mark_compact,
            hash_cons,
            heap_size: heap.size,
            ram: self.sysvals.ram,
        };
        let to_size = desired.max(heap.old_gen_size);
        let strategy = choose_major_strategy(&inputs, || self.create_secondary_heap(to_size));
        logln_if!(
            self.config.verbose,
            "[GC: Starting major {:?} GC{}; old generation of {} bytes.]",
            strategy,
            if hash_cons { " with hash-consing" } else { "" },
            CommaSeparated(heap.old_gen_size)
        );
        match strategy {
            MajorStrategy::Copying => self.major_cheney_copy(),
            MajorStrategy::MarkCompact => self.mark_compact(hash_cons),
        }

        let live = self.heap().old_gen_size;
        {
            let mut stats = self.stats();
            stats.last_major.bytes_live = live;
            stats.last_major.strategy = Some(strategy);
            stats.cumulative.max_bytes_live = stats.cumulative.max_bytes_live.max(live);
        }
        if may_resize {
            self.resize_heap(live.saturating_add(bytes_requested));
        }
        let heap = self.heap_mut();
        heap.nursery = heap.old_gen_end();
        heap.can_minor = false;
        heap.frontier.store(heap.nursery, Ordering::Release);
        self.card_table_mut().rebase(heap.start);
        self.resize_secondary_heap();
        for proc in 0..self.num_procs() {
            self.set_current_thread_and_stack(proc);
        }
        logln_if!(
            self.config.verbose,
            "[GC: Finished major GC; {} bytes live, heap of {} bytes.]",
            CommaSeparated(live),
            CommaSeparated(heap.size)
        );
        gc_assert!(
            heap.old_gen_size + bytes_requested <= heap.available_size,
            "{} live bytes and {} requested bytes do not fit a heap of {} bytes",
            heap.old_gen_size,
            bytes_requested,
            heap.available_size
        );
    }

    /// Heap size to aim for with `live` bytes in use.
    pub(crate) fn sizeof_heap_desired(&self, live: usize) -> usize {
        let capacity = self.heap().capacity;
        if live > capacity {
            fatal(GcError::ResourceExhaustion {
                needed: live,
                limit: capacity,
            });
        }
        let ram = self.sysvals.ram as f64;
        let ratios = &self.config.ratios;
        let by_ratio = live as f64 * ratios.live;
        let desired = if by_ratio <= ram {
            by_ratio
        } else {
            ram.max(live as f64 * ratios.min_live)
        };
        let page = self.sysvals.page_size;
        align_up(desired as usize, page)
            .max(align_up(live, page))
            .max(page)
            .min(capacity)
    }

    /// Grows or shrinks the heap to the desired size for `min_size` live bytes.
    pub(crate) unsafe fn resize_heap(&self, min_size: usize) {
        let desired = self.sizeof_heap_desired(min_size);
        let heap = self.heap_mut();
        if desired == heap.size {
            return;
        }
        logln_if!(
            self.config.verbose,
            "[GC: Resizing heap from {} bytes to {} bytes.]",
            CommaSeparated(heap.size),
            CommaSeparated(desired)
        );
        heap.resize(desired);
    }

    /// Makes the secondary heap at least `size` bytes. Returns false if it cannot be mapped.
    pub(crate) unsafe fn create_secondary_heap(&self, size: usize) -> bool {
        let capacity = self.heap().capacity;
        let size = align_up(size, self.sysvals.page_size).min(capacity);
        let secondary = self.secondary_heap_mut();
        if secondary.is_init() {
            if secondary.size < size {
                secondary.resize(size);
            }
            return true;
        }
        match Heap::create(capacity, size, self.sysvals.page_size) {
            Some(heap) => {
                *secondary = heap;
                true
            }
            None => {
                log::debug!("[GC: Cannot create secondary heap of {} bytes.]", size);
                false
            }
        }
    }

    /// Keeps the secondary heap as large as the heap, unless two heaps would not fit in RAM.
    pub(crate) unsafe fn resize_secondary_heap(&self) {
        let size = self.heap().size;
        let secondary = self.secondary_heap_mut();
        if !secondary.is_init() {
            return;
        }
        if size.saturating_mul(2) > self.sysvals.ram {
            secondary.release();
        } else if secondary.size != size {
            secondary.resize(size);
        }
    }

    unsafe fn major_cheney_copy(&self) {
        let heap = self.heap();
        let to = self.secondary_heap_mut();
        let mut cheney = Cheney::new(
            heap.start,
            heap.old_gen_end(),
            to.start,
            to.start.add(to.size),
            InHeader,
        );
        for proc in 0..self.num_procs() {
            cheney.copy_slot(&mut self.proc_mut(proc).current_thread);
        }
        cheney.scan();
        let copied = cheney.bytes_copied();
        to.old_gen_size = distance(to.start, cheney.back());

        self.swap_heaps();
        let from = self.secondary_heap_mut();
        from.old_gen_size = 0;
        from.nursery = from.start;
        from.frontier.store(from.start, Ordering::Release);

        let mut stats = self.stats();
        stats.cumulative.num_copying_gcs += 1;
        stats.cumulative.bytes_copied += copied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn stats(copying: usize, mark_compact: usize, hash_cons: usize) -> CumulativeStatistics {
        CumulativeStatistics {
            num_copying_gcs: copying,
            num_mark_compact_gcs: mark_compact,
            num_hash_cons_gcs: hash_cons,
            ..CumulativeStatistics::default()
        }
    }

    #[test]
    fn hash_consing_is_throttled_by_ratio() {
        assert!(!should_hash_cons(&stats(0, 0, 0), 1.0));
        assert!(should_hash_cons(&stats(1, 0, 0), 0.5));
        assert!(!should_hash_cons(&stats(1, 1, 1), 0.5));
        assert!(should_hash_cons(&stats(2, 1, 1), 0.5));
        assert!(!should_hash_cons(&stats(10, 0, 0), 0.0));
    }

    #[test]
    fn copying_is_preferred() {
        let inputs = MajorInputs {
            force_mark_compact: false,
            hash_cons: false,
            heap_size: 1 << 20,
            ram: 1 << 30,
        };
        assert_eq!(choose_major_strategy(&inputs, || true), MajorStrategy::Copying);
        assert_eq!(
            choose_major_strategy(&inputs, || false),
            MajorStrategy::MarkCompact
        );
    }

    #[test]
    fn mark_compact_when_copying_is_ruled_out() {
        let base = MajorInputs {
            force_mark_compact: false,
            hash_cons: false,
            heap_size: 1 << 20,
            ram: 1 << 30,
        };
        let cases = [
            MajorInputs {
                force_mark_compact: true,
                ..base
            },
            MajorInputs {
                hash_cons: true,
                ..base
            },
            MajorInputs {
                heap_size: 2 << 30,
                ..base
            },
        ];
        for inputs in cases.iter() {
            let strategy = choose_major_strategy(inputs, || panic!("secondary heap requested"));
            assert_eq!(strategy, MajorStrategy::MarkCompact, "{:?}", inputs);
        }
    }

    #[test]
    fn desired_heap_size_follows_ratios() {
        let mib = 1024 * 1024;
        let gc = GcState::new(Config {
            ram: Some(16 * mib),
            max_heap_size: 64 * mib,
            ..Config::default()
        });
        assert_eq!(gc.sizeof_heap_desired(mib), 8 * mib);
        assert_eq!(gc.sizeof_heap_desired(4 * mib), 16 * mib);
        assert_eq!(gc.sizeof_heap_desired(20 * mib), 25 * mib);
        assert_eq!(gc.sizeof_heap_desired(60 * mib), 64 * mib);
        assert_eq!(gc.sizeof_heap_desired(0), gc.sysvals().page_size);
    }
}
