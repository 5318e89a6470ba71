use std::{fmt, time::Duration};

use crate::{
    gate::SyncReason,
    major::MajorStrategy,
    util::{formatted_size, CommaSeparated},
};

/// Counters accumulated over the whole lifetime of a collector.
#[derive(Clone, Debug, Default)]
pub struct CumulativeStatistics {
    pub num_gcs: usize,
    pub num_minor_gcs: usize,
    pub num_copying_gcs: usize,
    pub num_mark_compact_gcs: usize,
    pub num_hash_cons_gcs: usize,
    pub bytes_copied_minor: usize,
    pub bytes_copied: usize,
    pub bytes_mark_compacted: usize,
    pub bytes_hash_consed: usize,
    pub max_bytes_live: usize,
    pub max_pause: Duration,
    pub gc_time: Duration,
}

impl CumulativeStatistics {
    pub fn num_major_gcs(&self) -> usize {
        self.num_copying_gcs + self.num_mark_compact_gcs
    }
}

#[derive(Clone, Debug, Default)]
pub struct LastMajorStatistics {
    pub bytes_live: usize,
    /// Minor collections since the last major one.
    pub num_minor_gcs: usize,
    pub strategy: Option<MajorStrategy>,
}

#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub cumulative: CumulativeStatistics,
    pub last_major: LastMajorStatistics,
    /// What the processor that ran the latest collection was waiting for.
    pub last_gc_reason: Option<SyncReason>,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.cumulative;
        writeln!(f, "GC statistics:")?;
        writeln!(f, "  collections: {}", CommaSeparated(c.num_gcs))?;
        writeln!(f, "  minor collections: {}", CommaSeparated(c.num_minor_gcs))?;
        writeln!(
            f,
            "  copying collections: {} ({} copied)",
            CommaSeparated(c.num_copying_gcs),
            formatted_size(c.bytes_copied)
        )?;
        writeln!(
            f,
            "  mark-compact collections: {} ({} compacted)",
            CommaSeparated(c.num_mark_compact_gcs),
            formatted_size(c.bytes_mark_compacted)
        )?;
        writeln!(
            f,
            "  hash-consing collections: {} ({} merged)",
            CommaSeparated(c.num_hash_cons_gcs),
            formatted_size(c.bytes_hash_consed)
        )?;
        writeln!(
            f,
            "  bytes copied by minor collections: {}",
            formatted_size(c.bytes_copied_minor)
        )?;
        writeln!(f, "  max live: {}", formatted_size(c.max_bytes_live))?;
        writeln!(f, "  total GC time: {:.3} ms", c.gc_time.as_secs_f64() * 1000.0)?;
        writeln!(f, "  max pause: {:.3} ms", c.max_pause.as_secs_f64() * 1000.0)?;
        write!(
            f,
            "  live after last major collection: {}",
            formatted_size(self.last_major.bytes_live)
        )
    }
}
