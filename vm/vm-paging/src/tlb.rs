//! # Software TLB
//!
//! A 16-entry associative cache from virtual page base to leaf
//! [`PageEntry`], sitting in front of the table walker.
//!
//! ## Lookup path
//!
//! 1. **Fast slot**: slot 0 is the most recently used page; a single
//!    compare serves tight loops over one page.
//! 2. **Hint probe**: a parallel key array holds one byte per slot equal
//!    to `(page >> 12) & 0xff`, packed into two 64-bit words. Broadcasting
//!    the query's hint byte and running a SWAR equality compare inspects
//!    eight slots at a time; only matching lanes pay a full page compare.
//! 3. **Promotion**: a hit outside slot 0 swaps one step toward the
//!    front, so sustained reuse migrates to the fast slot without any
//!    per-entry age bookkeeping.
//! 4. **Miss**: the caller walks the tree and installs the result at the
//!    last slot, the probation seat every newcomer must earn its way out
//!    of.
//!
//! Empty slots are all-zero; a zero entry has no present bit and can
//! never satisfy a lookup, so page 0 needs no special casing.

use crate::PageEntry;
use vm_memory_addresses::{FRAME_SHIFT, VirtualAddress};

/// Number of cache slots. Power of two, divisible by 8 so the hint bytes
/// fill whole words.
pub const TLB_ENTRIES: usize = 16;

const HINT_WORDS: usize = TLB_ENTRIES / 8;

const LANE_LO: u64 = 0x0101_0101_0101_0101;
const LANE_HI: u64 = 0x8080_8080_8080_8080;

/// High bit set in every byte lane where `word` equals the broadcast
/// `needle`.
///
/// The classic zero-byte trick applied to `word ^ needle`. Lanes adjacent
/// to a real match can light up spuriously (borrow propagation), which is
/// fine: every candidate lane is verified with a full page compare.
#[inline]
const fn lane_matches(word: u64, needle: u64) -> u64 {
    let x = word ^ needle;
    x.wrapping_sub(LANE_LO) & !x & LANE_HI
}

#[derive(Copy, Clone)]
struct TlbSlot {
    page: VirtualAddress,
    entry: PageEntry,
}

impl TlbSlot {
    const EMPTY: Self = Self {
        page: VirtualAddress::zero(),
        entry: PageEntry::new(),
    };
}

/// The translation cache. One per guest CPU; never shared.
pub struct Tlb {
    slots: [TlbSlot; TLB_ENTRIES],
    /// One hint byte per slot, packed little-lane-first into words.
    /// Invariant: byte `i` equals `(slots[i].page >> 12) & 0xff`.
    hints: [u64; HINT_WORDS],
    hits_fast: u64,
    hits_probe: u64,
    misses: u64,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [TlbSlot::EMPTY; TLB_ENTRIES],
            hints: [0; HINT_WORDS],
            hits_fast: 0,
            hits_probe: 0,
            misses: 0,
        }
    }

    /// Look up the leaf entry for a page base.
    ///
    /// `page` must be frame-aligned. Hits outside slot 0 promote one slot
    /// toward the front.
    pub fn lookup(&mut self, page: VirtualAddress) -> Option<PageEntry> {
        debug_assert_eq!(page.frame_offset(), 0);
        let first = self.slots[0];
        if first.page == page && first.entry.present() {
            self.hits_fast += 1;
            return Some(first.entry);
        }
        let needle = u64::from(Self::hint_byte(page)) * LANE_LO;
        for word in 0..HINT_WORDS {
            let mut lanes = lane_matches(self.hints[word], needle);
            while lanes != 0 {
                let i = word * 8 + (lanes.trailing_zeros() / 8) as usize;
                let slot = self.slots[i];
                if slot.page == page && slot.entry.present() {
                    self.hits_probe += 1;
                    if i > 0 {
                        self.promote(i);
                    }
                    return Some(slot.entry);
                }
                lanes &= lanes - 1;
            }
        }
        self.misses += 1;
        None
    }

    /// Install a freshly walked entry at the insertion slot (the last
    /// one).
    pub fn insert(&mut self, page: VirtualAddress, entry: PageEntry) {
        debug_assert_eq!(page.frame_offset(), 0);
        self.set(TLB_ENTRIES - 1, TlbSlot { page, entry });
    }

    /// Drop every cached translation.
    pub fn reset(&mut self) {
        self.slots = [TlbSlot::EMPTY; TLB_ENTRIES];
        self.hints = [0; HINT_WORDS];
    }

    /// (fast-slot hits, probe hits, misses) counters.
    #[must_use]
    pub const fn hit_counts(&self) -> (u64, u64, u64) {
        (self.hits_fast, self.hits_probe, self.misses)
    }

    /// Swap slot `i` one step toward the front, hint bytes included.
    fn promote(&mut self, i: usize) {
        self.slots.swap(i, i - 1);
        let (a, b) = (self.hint_at(i), self.hint_at(i - 1));
        self.set_hint(i, b);
        self.set_hint(i - 1, a);
    }

    /// Write a slot and maintain the hint-byte invariant.
    fn set(&mut self, i: usize, slot: TlbSlot) {
        self.slots[i] = slot;
        self.set_hint(i, Self::hint_byte(slot.page));
    }

    const fn hint_byte(page: VirtualAddress) -> u8 {
        ((page.as_u64() >> FRAME_SHIFT) & 0xff) as u8
    }

    fn hint_at(&self, i: usize) -> u8 {
        (self.hints[i / 8] >> ((i % 8) * 8)) as u8
    }

    fn set_hint(&mut self, i: usize, hint: u8) {
        let shift = (i % 8) * 8;
        let word = &mut self.hints[i / 8];
        *word = (*word & !(0xff << shift)) | (u64::from(hint) << shift);
    }
}
