use std::fmt;

use crate::Pointer;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr + align - 1, align)
}
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Number of bytes between `from` and `to`. `to` must not be below `from`.
#[inline(always)]
pub fn distance(from: Pointer, to: Pointer) -> usize {
    debug_assert!(to as usize >= from as usize);
    to as usize - from as usize
}

/// Human readable byte count with one decimal and a binary unit suffix.
pub struct FormattedSize(pub usize);

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const UNITS: [&str; 3] = ["K", "M", "G"];
        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }
        let mut scaled = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while scaled >= 1024.0 && unit + 1 < UNITS.len() {
            scaled /= 1024.0;
            unit += 1;
        }
        write!(f, "{:.1}{}", scaled, UNITS[unit])
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize(size)
}

/// `1234567` is displayed as `1,234,567`.
pub struct CommaSeparated(pub usize);

impl fmt::Display for CommaSeparated {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let digits = self.0.to_string();
        let len = digits.len();
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (len - i) % 3 == 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
