use modular_bitfield::prelude::*;

// Header word prepended to every heap object.
//
// +-----------+------+----------------------------------------------+
// | name      | bits |                                              |
// +-----------+------+----------------------------------------------+
// | valid     |    1 | Always set. A clear bit 0 in a header slot   |
// |           |      | means the slot holds a forwarding pointer.   |
// | tag       |    3 | See [ObjectTag].                             |
// | mark bit  |    1 | Used by the mark-compact collector only.     |
// | unused    |    3 |                                              |
// | num_refs  |   24 | Leading reference fields of normal objects.  |
// | raw_words |   32 | Trailing non-reference words.                |
// +-----------+------+----------------------------------------------+
//
// Arrays are additionally preceded by a counter word (always zero) and a
// length word, so a scanner that finds bit 0 clear at an object start knows
// it is looking at an array.
#[bitfield(bits = 64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub struct Header {
    pub valid: bool,
    #[bits = 3]
    pub tag: ObjectTag,
    pub marked: bool,
    #[skip]
    __: B3,
    pub num_refs: B24,
    pub raw_words: B32,
}

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[bits = 3]
pub enum ObjectTag {
    Normal,
    Thread,
    Stack,
    ByteVector,
    RefArray,
    /// Gap of at least two words. The word after the header holds the number of
    /// remaining bytes.
    Fill,
    /// Gap of exactly one word.
    HeaderOnly,
}

impl ObjectTag {
    #[inline(always)]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::ByteVector | Self::RefArray)
    }
}

impl Header {
    pub fn with(tag: ObjectTag) -> Self {
        Self::new().with_valid(true).with_tag(tag)
    }

    pub fn normal(num_refs: usize, raw_words: usize) -> Self {
        Self::with(ObjectTag::Normal)
            .with_num_refs(num_refs as u32)
            .with_raw_words(raw_words as u32)
    }

    #[inline(always)]
    pub fn from_word(word: u64) -> Self {
        Self::from(word)
    }

    #[inline(always)]
    pub fn to_word(self) -> u64 {
        u64::from(self)
    }

    /// Header slots whose low bit is clear hold a forwarding address.
    #[inline(always)]
    pub const fn is_forwarding_word(word: u64) -> bool {
        word & 1 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_word_has_low_bit_set() {
        for tag in [
            ObjectTag::Normal,
            ObjectTag::Thread,
            ObjectTag::Stack,
            ObjectTag::ByteVector,
            ObjectTag::RefArray,
            ObjectTag::Fill,
            ObjectTag::HeaderOnly,
        ] {
            let word = Header::with(tag).to_word();
            assert!(!Header::is_forwarding_word(word));
            assert_eq!(Header::from_word(word).tag(), tag);
        }
        assert!(Header::is_forwarding_word(0x1000));
    }

    #[test]
    fn normal_header_fields() {
        let header = Header::normal(3, 5).with_marked(true);
        let decoded = Header::from_word(header.to_word());
        assert_eq!(decoded.num_refs(), 3);
        assert_eq!(decoded.raw_words(), 5);
        assert!(decoded.marked());
        assert!(decoded.valid());
    }
}
