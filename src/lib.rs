//! Allocation and collection orchestration for a parallel, generational, relocating
//! garbage collector.
//!
//! A fixed set of processors allocates out of one heap. Each processor bumps through a
//! chunk of the nursery and takes new chunks off a shared frontier with a single
//! compare-and-swap. When a request cannot be met locally every processor meets in a
//! synchronized section and one of them runs a collection: always a minor Cheney copy
//! of the nursery, escalated to a major collection (copying, or sliding mark-compact
//! when memory is tight) when the old generation has no room left.
//!
//! ```no_run
//! use comet_mp::{gc_state::GcState, Config};
//!
//! let gc = GcState::new(Config::default());
//! let mutator = gc.mutator(0).unwrap();
//! let pair = mutator.allocate(2, 0);
//! mutator.push_root(pair);
//! mutator.collect(0, true);
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

#[macro_use]
pub mod error;
pub mod card_table;
pub mod cheney;
pub mod collector;
pub mod filler;
pub mod gate;
pub mod gc_state;
pub mod globals;
pub mod header;
pub mod heap;
pub mod major;
pub mod mark_compact;
pub mod mmap;
pub mod mutator;
pub mod object;
pub mod safepoint;
pub mod stack;
pub mod statistics;
pub mod tlab;
pub mod transfer;
pub mod util;

#[cfg(test)]
mod tests;

/// Address of a heap byte. Object references are data pointers, see [object].
pub type Pointer = *mut u8;

/// Tuning ratios of the heap and stack sizing policies.
#[derive(Clone, Debug)]
pub struct Ratios {
    /// Desired heap size as a multiple of the live data.
    pub live: f64,
    /// Lower bound for the heap as a multiple of the live data when RAM is tight.
    pub min_live: f64,
    /// Target ratio of hash-consing major collections to all major collections.
    pub hash_cons: f64,
    /// Growth factor of a mutator stack.
    pub stack_grow: f64,
}

impl Default for Ratios {
    fn default() -> Self {
        Self {
            live: 8.0,
            min_live: 1.25,
            hash_cons: 0.0,
            stack_grow: 2.0,
        }
    }
}

/// Configuration for [GcState](gc_state::GcState) constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Enables `[GC: ...]` diagnostics at `info` level.
    pub verbose: bool,
    /// Logs cumulative statistics when the collector is dropped.
    pub summary: bool,
    /// Number of processors sharing the heap.
    pub num_procs: usize,
    pub initial_heap_size: usize,
    /// Address space reserved per heap. The heap never grows past it.
    pub max_heap_size: usize,
    /// Size of the uncollected heap shared by all processors. `0` disables it.
    pub shared_heap_size: usize,
    /// Bytes handed to a processor when it asks for less.
    pub alloc_chunk_size: usize,
    pub initial_stack_size: usize,
    /// Largest amount of stack a mutator may push between two stack checks.
    pub max_frame_size: usize,
    /// Overrides the detected amount of physical memory.
    pub ram: Option<usize>,
    pub force_mark_compact: bool,
    /// Allows minor collections. When disabled the nursery is absorbed into the old
    /// generation at every collection.
    pub generational: bool,
    pub ratios: Ratios,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            summary: false,
            num_procs: 1,
            initial_heap_size: 1024 * 1024,
            max_heap_size: 64 * 1024 * 1024,
            shared_heap_size: 256 * 1024,
            alloc_chunk_size: 4096,
            initial_stack_size: 1024,
            max_frame_size: 64,
            ram: None,
            force_mark_compact: false,
            generational: true,
            ratios: Ratios::default(),
        }
    }
}
