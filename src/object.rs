//! Object layout.
//!
//! Objects are addressed by their data pointer, the first byte after the header word.
//! References are stored as absolute addresses, `0` is the null reference.
//!
//! ```text
//! normal / thread:  [header][ref 0 .. ref n][raw 0 .. raw m]
//! stack:            [header][reserved][used][slot 0 .. slot reserved/8]
//! byte vector:      [counter = 0][length in bytes][header][bytes, padded to a word]
//! ref array:        [counter = 0][length in elements][header][ref 0 .. ref len]
//! fill:             [header][remaining bytes][..]
//! header only:      [header]
//! ```
use std::ptr::{self, null_mut};

use crate::{
    error::{fatal, GcError},
    globals::*,
    header::{Header, ObjectTag},
    util::align_up,
    Pointer,
};

pub const THREAD_STACK_FIELD: usize = 0;
pub const THREAD_BYTES_NEEDED_WORD: usize = 0;
pub const THREAD_EXN_STACK_WORD: usize = 1;
pub const THREAD_SIZE: usize = HEADER_SIZE + 3 * WORD_SIZE;

#[inline(always)]
unsafe fn word_at(p: Pointer) -> *mut u64 {
    p.cast::<u64>()
}

#[inline(always)]
pub unsafe fn header_word(obj: Pointer) -> u64 {
    *word_at(obj.sub(HEADER_SIZE))
}

#[inline(always)]
pub unsafe fn set_header_word(obj: Pointer, word: u64) {
    *word_at(obj.sub(HEADER_SIZE)) = word;
}

#[inline(always)]
pub unsafe fn header(obj: Pointer) -> Header {
    Header::from_word(header_word(obj))
}

#[inline(always)]
pub unsafe fn set_header(obj: Pointer, header: Header) {
    set_header_word(obj, header.to_word());
}

pub unsafe fn tag(obj: Pointer) -> ObjectTag {
    let header = header(obj);
    match header.tag_or_err() {
        Ok(tag) if header.valid() => tag,
        _ => fatal(GcError::corruption(format!(
            "invalid header {:#x} for object at {:p}",
            header.to_word(),
            obj
        ))),
    }
}

#[inline(always)]
pub unsafe fn array_length(obj: Pointer) -> usize {
    *word_at(obj.sub(HEADER_SIZE + ARRAY_LENGTH_SIZE)) as usize
}

#[inline(always)]
pub unsafe fn is_forwarded(obj: Pointer) -> bool {
    Header::is_forwarding_word(header_word(obj))
}

#[inline(always)]
pub unsafe fn forwarding_address(obj: Pointer) -> Pointer {
    header_word(obj) as usize as Pointer
}

pub const fn normal_size(num_refs: usize, raw_words: usize) -> usize {
    HEADER_SIZE + WORD_SIZE * (num_refs + raw_words)
}

pub const fn byte_vector_size(len: usize) -> usize {
    ARRAY_HEADER_SIZE + align_up(len, WORD_SIZE)
}

pub const fn ref_array_size(len: usize) -> usize {
    ARRAY_HEADER_SIZE + len * OBJPTR_SIZE
}

/// Size of a stack object with room for `reserved` bytes of slots, header included.
pub const fn stack_size(reserved: usize) -> usize {
    HEADER_SIZE + STACK_META_SIZE + reserved
}

/// Total size of the object whose data starts at `obj`, including any array prefix.
pub unsafe fn object_size(obj: Pointer) -> usize {
    let header = header(obj);
    match tag(obj) {
        ObjectTag::Normal | ObjectTag::Thread => {
            normal_size(header.num_refs() as usize, header.raw_words() as usize)
        }
        ObjectTag::Stack => stack_size(*word_at(obj) as usize),
        ObjectTag::ByteVector => byte_vector_size(array_length(obj)),
        ObjectTag::RefArray => ref_array_size(array_length(obj)),
        ObjectTag::Fill => HEADER_SIZE + SMALL_GAP_SIZE_SIZE + *word_at(obj) as usize,
        ObjectTag::HeaderOnly => HEADER_SIZE,
    }
}

/// First byte of the object whose data starts at `obj`.
pub unsafe fn object_start(obj: Pointer) -> Pointer {
    if tag(obj).is_array() {
        obj.sub(ARRAY_HEADER_SIZE)
    } else {
        obj.sub(HEADER_SIZE)
    }
}

/// Moves from the first byte of an object to its data.
#[inline]
pub unsafe fn advance_to_object_data(start: Pointer) -> Pointer {
    if Header::is_forwarding_word(*word_at(start)) {
        start.add(ARRAY_HEADER_SIZE)
    } else {
        start.add(HEADER_SIZE)
    }
}

/// Calls `visit` with the address of every reference slot of `obj`.
pub unsafe fn for_each_ref_slot(obj: Pointer, mut visit: impl FnMut(*mut Pointer)) {
    let (first, count) = match tag(obj) {
        ObjectTag::Normal | ObjectTag::Thread => (obj, header(obj).num_refs() as usize),
        ObjectTag::Stack => (
            obj.add(STACK_META_SIZE),
            *word_at(obj.add(WORD_SIZE)) as usize / OBJPTR_SIZE,
        ),
        ObjectTag::RefArray => (obj, array_length(obj)),
        _ => return,
    };
    let slots = first.cast::<Pointer>();
    for i in 0..count {
        visit(slots.add(i));
    }
}

/// Walks the objects laid out back to back in `[start, end)`, handing each data pointer
/// to `visit`. The walk must land exactly on `end`.
pub unsafe fn for_each_object_in_range(
    start: Pointer,
    end: Pointer,
    mut visit: impl FnMut(Pointer),
) {
    let mut cur = start;
    while cur < end {
        let obj = advance_to_object_data(cur);
        let size = object_size(obj);
        visit(obj);
        cur = cur.add(size);
    }
    gc_assert!(
        cur == end,
        "object walk of [{:p}, {:p}) overran to {:p}",
        start,
        end,
        cur
    );
}

#[inline(always)]
pub unsafe fn field(obj: Pointer, index: usize) -> *mut Pointer {
    obj.cast::<Pointer>().add(index)
}

/// Raw word `index` of a normal object, counted after its reference fields.
#[inline(always)]
pub unsafe fn raw_word(obj: Pointer, index: usize) -> *mut u64 {
    let refs = header(obj).num_refs() as usize;
    word_at(obj).add(refs + index)
}

pub unsafe fn byte_vector_bytes<'a>(obj: Pointer) -> &'a [u8] {
    std::slice::from_raw_parts(obj, array_length(obj))
}

pub unsafe fn write_normal(at: Pointer, num_refs: usize, raw_words: usize) -> Pointer {
    *word_at(at) = Header::normal(num_refs, raw_words).to_word();
    let obj = at.add(HEADER_SIZE);
    ptr::write_bytes(obj, 0, WORD_SIZE * (num_refs + raw_words));
    obj
}

pub unsafe fn write_thread(at: Pointer, stack: Pointer) -> Pointer {
    *word_at(at) = Header::with(ObjectTag::Thread)
        .with_num_refs(1)
        .with_raw_words(2)
        .to_word();
    let obj = at.add(HEADER_SIZE);
    *field(obj, THREAD_STACK_FIELD) = stack;
    *raw_word(obj, THREAD_BYTES_NEEDED_WORD) = 0;
    *raw_word(obj, THREAD_EXN_STACK_WORD) = 0;
    obj
}

pub unsafe fn write_stack(at: Pointer, reserved: usize) -> Pointer {
    *word_at(at) = Header::with(ObjectTag::Stack).to_word();
    let obj = at.add(HEADER_SIZE);
    *word_at(obj) = reserved as u64;
    *word_at(obj.add(WORD_SIZE)) = 0;
    obj
}

unsafe fn write_array_prefix(at: Pointer, len: usize, tag: ObjectTag) -> Pointer {
    *word_at(at) = 0;
    *word_at(at.add(ARRAY_COUNTER_SIZE)) = len as u64;
    *word_at(at.add(ARRAY_COUNTER_SIZE + ARRAY_LENGTH_SIZE)) = Header::with(tag).to_word();
    at.add(ARRAY_HEADER_SIZE)
}

pub unsafe fn write_byte_vector(at: Pointer, bytes: &[u8]) -> Pointer {
    let obj = write_array_prefix(at, bytes.len(), ObjectTag::ByteVector);
    ptr::copy_nonoverlapping(bytes.as_ptr(), obj, bytes.len());
    let padded = align_up(bytes.len(), WORD_SIZE);
    ptr::write_bytes(obj.add(bytes.len()), 0, padded - bytes.len());
    obj
}

pub unsafe fn write_ref_array(at: Pointer, len: usize) -> Pointer {
    let obj = write_array_prefix(at, len, ObjectTag::RefArray);
    ptr::write_bytes(obj.cast::<Pointer>(), 0, len);
    obj
}

pub unsafe fn thread_stack(thread: Pointer) -> Pointer {
    *field(thread, THREAD_STACK_FIELD)
}

pub unsafe fn set_thread_stack(thread: Pointer, stack: Pointer) {
    *field(thread, THREAD_STACK_FIELD) = stack;
}

pub unsafe fn thread_bytes_needed(thread: Pointer) -> usize {
    *raw_word(thread, THREAD_BYTES_NEEDED_WORD) as usize
}

pub unsafe fn set_thread_bytes_needed(thread: Pointer, bytes: usize) {
    *raw_word(thread, THREAD_BYTES_NEEDED_WORD) = bytes as u64;
}

pub unsafe fn set_thread_exn_stack(thread: Pointer, exn_stack: usize) {
    *raw_word(thread, THREAD_EXN_STACK_WORD) = exn_stack as u64;
}

pub unsafe fn thread_exn_stack(thread: Pointer) -> usize {
    *raw_word(thread, THREAD_EXN_STACK_WORD) as usize
}

#[inline(always)]
pub fn null() -> Pointer {
    null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_walk_back_to_back() {
        let mut buf = vec![0u64; 64];
        let base = buf.as_mut_ptr().cast::<u8>();
        unsafe {
            let a = write_normal(base, 2, 1);
            let b = write_byte_vector(a.add(normal_size(2, 1) - HEADER_SIZE), b"hello");
            let c_at = object_start(b).add(byte_vector_size(5));
            let c = write_ref_array(c_at, 3);
            let end = object_start(c).add(ref_array_size(3));
            *field(a, 0) = b;
            *field(c, 2) = a;

            let mut seen = vec![];
            for_each_object_in_range(base, end, |obj| seen.push(obj));
            assert_eq!(seen, vec![a, b, c]);
            assert_eq!(byte_vector_bytes(b), b"hello");
            assert_eq!(object_size(b), 24 + 8);

            let mut refs = vec![];
            for_each_ref_slot(c, |slot| refs.push(*slot));
            assert_eq!(refs, vec![null(), null(), a]);
        }
    }

    #[test]
    fn stack_slots_are_bounded_by_used() {
        let mut buf = vec![0u64; 16];
        let base = buf.as_mut_ptr().cast::<u8>();
        unsafe {
            let stack = write_stack(base, 64);
            assert_eq!(object_size(stack), stack_size(64));
            *stack.add(WORD_SIZE).cast::<u64>() = 16;
            let mut count = 0;
            for_each_ref_slot(stack, |_| count += 1);
            assert_eq!(count, 2);
        }
    }
}
