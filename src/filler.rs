//! Gap filling.
//!
//! Any byte range that a scanner might walk but that holds no object gets a filler
//! written into it, so that walking by object size from the start of the range lands
//! exactly on its end.
use crate::{
    error::{fatal, GcError},
    globals::*,
    header::{Header, ObjectTag},
    util::distance,
    Pointer,
};

/// Writes a filler into `[start, end)` and returns the number of bytes covered.
///
/// A null `start` denotes a cursor that never owned a chunk and covers nothing.
pub fn try_fill_gap(start: Pointer, end: Pointer) -> Result<usize, GcError> {
    if start.is_null() {
        return Ok(0);
    }
    let diff = distance(start, end);
    if diff == 0 {
        return Ok(0);
    }
    log::trace!("[GC: Filling gap between {:p} and {:p} (size = {}).]", start, end, diff);
    unsafe {
        let words = start.cast::<u64>();
        if diff >= ARRAY_HEADER_SIZE + OBJPTR_SIZE {
            words.write(0);
            words.add(1).write((diff - ARRAY_HEADER_SIZE) as u64);
            words.add(2).write(Header::with(ObjectTag::ByteVector).to_word());
        } else if diff == HEADER_SIZE {
            words.write(Header::with(ObjectTag::HeaderOnly).to_word());
        } else if diff >= BONUS_SLOP {
            words.write(Header::with(ObjectTag::Fill).to_word());
            words
                .add(1)
                .write((diff - (HEADER_SIZE + SMALL_GAP_SIZE_SIZE)) as u64);
        } else {
            return Err(GcError::corruption(format!(
                "found a gap of {} bytes at {:p}",
                diff, start
            )));
        }
    }
    Ok(diff)
}

/// Same as [try_fill_gap] but treats an unfillable gap as heap corruption.
#[track_caller]
pub fn fill_gap(start: Pointer, end: Pointer) -> usize {
    match try_fill_gap(start, end) {
        Ok(filled) => filled,
        Err(err) => fatal(err),
    }
}
