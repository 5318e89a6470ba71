//! Layout constants shared by the allocator, the collectors and the object model.

use std::mem::size_of;

pub const WORD_SIZE: usize = size_of::<usize>();
pub const OBJPTR_SIZE: usize = size_of::<usize>();
pub const HEADER_SIZE: usize = size_of::<u64>();

pub const ARRAY_COUNTER_SIZE: usize = WORD_SIZE;
pub const ARRAY_LENGTH_SIZE: usize = WORD_SIZE;
/// Counter, length and header word of an array object.
pub const ARRAY_HEADER_SIZE: usize = ARRAY_COUNTER_SIZE + ARRAY_LENGTH_SIZE + HEADER_SIZE;

pub const SMALL_GAP_SIZE_SIZE: usize = WORD_SIZE;

/// Space left between consecutive chunks of the shared frontier. Always large enough
/// to hold the smallest filler that carries an explicit size.
pub const BONUS_SLOP: usize = HEADER_SIZE + SMALL_GAP_SIZE_SIZE;
/// Distance between `limit` and `limit_plus_slop` of a cursor.
pub const HEAP_LIMIT_SLOP: usize = 512;

pub const FRONTIER_ALIGNMENT: usize = WORD_SIZE;

/// `reserved` and `used` words at the beginning of a stack object.
pub const STACK_META_SIZE: usize = 2 * WORD_SIZE;

pub const CARD_SHIFT: usize = 10;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
