use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::{globals::CARD_SHIFT, Pointer};

/// One byte per [CARD_SIZE](crate::globals::CARD_SIZE) bytes of heap, dirtied by the
/// write barrier. A dirty card tells the minor collector that old objects overlapping
/// it may point into the nursery.
pub struct CardTable {
    mem_map: MmapMut,
    base: usize,
    covered: usize,
}

impl CardTable {
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;

    /// Creates a table covering `covered` bytes starting at `base`.
    pub fn new(base: Pointer, covered: usize) -> std::io::Result<Self> {
        let cards = (covered >> CARD_SHIFT) + 1;
        Ok(Self {
            mem_map: MmapMut::map_anon(cards)?,
            base: base as usize,
            covered,
        })
    }

    /// Points the table at a new heap of the same capacity. All cards become clean.
    pub fn rebase(&mut self, base: Pointer) {
        self.base = base as usize;
        self.clear_all();
    }

    #[inline(always)]
    fn card(&self, addr: Pointer) -> Option<&AtomicU8> {
        let offset = (addr as usize).wrapping_sub(self.base);
        if offset >= self.covered {
            return None;
        }
        let index = offset >> CARD_SHIFT;
        unsafe { Some(&*self.mem_map.as_ptr().add(index).cast::<AtomicU8>()) }
    }

    /// Dirties the card holding `addr`. Addresses outside the covered range are ignored.
    #[inline]
    pub fn mark(&self, addr: Pointer) {
        if let Some(card) = self.card(addr) {
            card.store(Self::CARD_DIRTY, Ordering::Relaxed);
        }
    }

    pub fn is_dirty(&self, addr: Pointer) -> bool {
        self.card(addr)
            .map(|card| card.load(Ordering::Relaxed) == Self::CARD_DIRTY)
            .unwrap_or(false)
    }

    /// Whether any card overlapping `[start, end)` is dirty.
    pub fn is_dirty_range(&self, start: Pointer, end: Pointer) -> bool {
        if end <= start {
            return false;
        }
        let first = (start as usize).wrapping_sub(self.base) >> CARD_SHIFT;
        let last = (end as usize - 1).wrapping_sub(self.base) >> CARD_SHIFT;
        let cards = self.mem_map.len();
        if first >= cards {
            return false;
        }
        self.mem_map[first..=last.min(cards - 1)]
            .iter()
            .any(|&card| card == Self::CARD_DIRTY)
    }

    pub fn clear_all(&mut self) {
        self.mem_map.fill(Self::CARD_CLEAN);
    }
}
