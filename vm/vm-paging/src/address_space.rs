//! # Address Space Engine
//!
//! Reservation, commit and release over the guest's PML4-rooted tree.
//!
//! ## Design
//!
//! - [`translate`] is the **read-only** walker: it never touches the
//!   tree, so idle queries cannot commit anything. It classifies the leaf
//!   it lands on as mapped, reserved or unmapped.
//! - [`AddressSpace`] is a short-lived mutable view over the pool and the
//!   CR3 register; the machine layer constructs one under the system
//!   write lock for every mutating operation.
//! - Reservation is lazy and idempotent: intermediate tables are built on
//!   the way down, leaves get the caller's key only when still clear, and
//!   no frame is committed until the first access faults one in.
//!
//! ## Safety
//!
//! Nothing here hands out host pointers; everything is pool-offset
//! arithmetic. Projection happens at the machine layer.

use crate::{LEVEL_SHIFTS, PageEntry, PagingError};
use log::trace;
use vm_memory_addresses::{FRAME_SIZE, PhysicalAddress, VIRT_END, VirtualAddress, align_up};
use vm_pool::{PhysicalPool, PoolError};

/// The result of a read-only walk.
#[derive(Copy, Clone, Debug)]
pub enum Walk {
    /// A present leaf.
    Mapped(PageEntry),
    /// A reserved-but-uncommitted leaf, with its slot location so a
    /// committing caller can rewrite it without re-walking.
    Reserved {
        /// Pool offset of the L1 table frame.
        table: PhysicalAddress,
        /// Entry index within that table.
        index: u64,
        /// The reservation key found there.
        entry: PageEntry,
    },
    /// Nothing mapped at this address.
    Unmapped,
}

/// Read-only 4-level walk of `va` through the tree rooted at `cr3`.
///
/// A zero `cr3` means "no address space". Non-canonical addresses miss
/// without touching the pool. Intermediate entries are bounds-checked
/// against the pool's live region before being followed, so a corrupted
/// table degrades to a miss instead of wild reads.
#[must_use]
pub fn translate(pool: &PhysicalPool, cr3: PhysicalAddress, va: VirtualAddress) -> Walk {
    if !va.is_canonical() || cr3.as_u64() == 0 {
        return Walk::Unmapped;
    }
    let mut table = cr3;
    for shift in [LEVEL_SHIFTS[0], LEVEL_SHIFTS[1], LEVEL_SHIFTS[2]] {
        if !pool.contains_frame(table) {
            return Walk::Unmapped;
        }
        let entry = PageEntry::from_bits(pool.read_u64(table + va.index_at(shift) * 8));
        if !entry.present() {
            return Walk::Unmapped;
        }
        table = entry.addr();
    }
    if !pool.contains_frame(table) {
        return Walk::Unmapped;
    }
    let index = va.index_at(LEVEL_SHIFTS[3]);
    let entry = PageEntry::from_bits(pool.read_u64(table + index * 8));
    if entry.present() {
        Walk::Mapped(entry)
    } else if entry.reserved_page() {
        Walk::Reserved {
            table,
            index,
            entry,
        }
    } else {
        Walk::Unmapped
    }
}

/// Mutable view over one guest address space.
///
/// Borrows the pool and the CR3 register for the duration of a single
/// operation. All bookkeeping (reserved/committed/pagetable counters)
/// flows through the pool's statistics.
pub struct AddressSpace<'a> {
    pool: &'a mut PhysicalPool,
    cr3: &'a mut PhysicalAddress,
}

impl<'a> AddressSpace<'a> {
    #[inline]
    pub const fn new(pool: &'a mut PhysicalPool, cr3: &'a mut PhysicalAddress) -> Self {
        Self { pool, cr3 }
    }

    /// Reserve every page in `[va, va + size)` with `key`.
    ///
    /// Intermediate tables are allocated as needed (`addr | 7` entries);
    /// pre-existing leaves are left untouched, making reservation
    /// idempotent. The key is expected to carry the reservation bit and
    /// not the present bit. Allocates the root table on first use.
    ///
    /// Consecutive leaves within one L1 table are filled without
    /// re-walking; the walk restarts when the index wraps at 512.
    ///
    /// # Errors
    /// Out-of-memory from the pool, or a range escaping the canonical
    /// space.
    pub fn reserve(
        &mut self,
        va: VirtualAddress,
        size: u64,
        key: PageEntry,
    ) -> Result<(), PagingError> {
        debug_assert!(key.reserved_page() && !key.present());
        if size == 0 {
            return Ok(());
        }
        let end = Self::range_end(va, size)?;
        self.ensure_root()?;
        let mut v = va.page();
        while v.as_i64() < end {
            let table = self.walk_alloc(v)?;
            let mut index = v.index_at(LEVEL_SHIFTS[3]);
            loop {
                let slot = table + index * 8;
                if self.pool.read_u64(slot) == 0 {
                    self.pool.write_u64(slot, key.into_bits());
                    self.pool.stats_mut().reserved += 1;
                }
                v += FRAME_SIZE as i64;
                index += 1;
                if index == 512 || v.as_i64() >= end {
                    break;
                }
            }
        }
        trace!("reserved {size} bytes at {va}");
        Ok(())
    }

    /// Release every page in `[va, va + size)`.
    ///
    /// Ranges with nothing mapped are skipped at the stride of the first
    /// absent level. Reserved leaves just drop the reservation; committed
    /// pool-backed leaves return their frame to the free list. Host-backed
    /// leaves are cleared without touching the pool (their memory is not
    /// ours to recycle).
    ///
    /// # Errors
    /// A range escaping the canonical space.
    pub fn release(&mut self, va: VirtualAddress, size: u64) -> Result<(), PagingError> {
        if size == 0 || self.cr3.as_u64() == 0 {
            return Ok(());
        }
        let end = Self::range_end(va, size)?;
        let mut v = va.page();
        'pages: while v.as_i64() < end {
            let mut table = *self.cr3;
            for shift in [LEVEL_SHIFTS[0], LEVEL_SHIFTS[1], LEVEL_SHIFTS[2]] {
                if !self.pool.contains_frame(table) {
                    v = Self::next_boundary(v, shift);
                    continue 'pages;
                }
                let entry = PageEntry::from_bits(self.pool.read_u64(table + v.index_at(shift) * 8));
                if !entry.present() {
                    v = Self::next_boundary(v, shift);
                    continue 'pages;
                }
                table = entry.addr();
            }
            if self.pool.contains_frame(table) {
                self.clear_leaf(table + v.index_at(LEVEL_SHIFTS[3]) * 8);
            }
            v += FRAME_SIZE as i64;
        }
        trace!("released {size} bytes at {va}");
        Ok(())
    }

    /// Scan upward from `hint` for `size` bytes of contiguous unmapped
    /// virtual space.
    ///
    /// Wholly absent subtrees are credited at their level's stride, so
    /// the scan crosses empty terabytes in a handful of probes. Any
    /// occupied leaf (present *or* reserved) restarts accumulation past
    /// it.
    ///
    /// # Errors
    /// Out-of-memory once the scan reaches the canonical ceiling.
    pub fn find_free(&self, hint: VirtualAddress, size: u64) -> Result<VirtualAddress, PagingError> {
        let need = align_up(size.max(1), FRAME_SIZE);
        let mut virt =
            VirtualAddress::new(((hint.as_u64() + (FRAME_SIZE - 1)) & !(FRAME_SIZE - 1)) as i64);
        let mut got: u64 = 0;
        while got < need {
            let probe = virt + got as i64;
            if probe.as_i64() >= VIRT_END {
                return Err(PagingError::OutOfMemory(PoolError::OutOfMemory));
            }
            match self.absent_span(probe) {
                Some(span) => got += span,
                None => {
                    virt = Self::next_boundary(probe, LEVEL_SHIFTS[3]);
                    got = 0;
                }
            }
        }
        Ok(virt)
    }

    /// Commit the reserved leaf covering `va`.
    ///
    /// Allocates a zeroed frame, rewrites the leaf with the present bit
    /// and returns the new entry. Racing committers are tolerated: a leaf
    /// found already present is simply returned. `None` when `va` is
    /// unmapped or the pool is exhausted.
    pub fn commit(&mut self, va: VirtualAddress) -> Option<PageEntry> {
        match translate(self.pool, *self.cr3, va) {
            Walk::Mapped(entry) => Some(entry),
            Walk::Reserved {
                table,
                index,
                entry,
            } => {
                let frame = self.pool.alloc_frame()?;
                let stats = self.pool.stats_mut();
                stats.reserved -= 1;
                stats.committed += 1;
                let entry = entry.committed(frame);
                self.pool.write_u64(table + index * 8, entry.into_bits());
                trace!("committed page at {va}");
                Some(entry)
            }
            Walk::Unmapped => None,
        }
    }

    /// Map `[va, va + size)` onto host memory starting at the page-aligned
    /// host address `host`.
    ///
    /// Installs present host-backed leaves; whatever was mapped there
    /// before is released first. This is the surface for exposing
    /// host-owned regions (for example memory-mapped host files) to the
    /// guest.
    ///
    /// # Errors
    /// Out-of-memory from intermediate tables, or a range escaping the
    /// canonical space.
    pub fn map_host(
        &mut self,
        va: VirtualAddress,
        host: u64,
        size: u64,
    ) -> Result<(), PagingError> {
        debug_assert_eq!(host & (FRAME_SIZE - 1), 0);
        if size == 0 {
            return Ok(());
        }
        let end = Self::range_end(va, align_up(size, FRAME_SIZE))?;
        self.ensure_root()?;
        let mut v = va.page();
        let mut offset = 0u64;
        while v.as_i64() < end {
            let table = self.walk_alloc(v)?;
            let slot = table + v.index_at(LEVEL_SHIFTS[3]) * 8;
            self.clear_leaf(slot);
            self.pool
                .write_u64(slot, PageEntry::host(host + offset).into_bits());
            v += FRAME_SIZE as i64;
            offset += FRAME_SIZE;
        }
        trace!("mapped {size} host bytes at {va}");
        Ok(())
    }

    /// Exclusive end of `[va, va + size)`, validated against the
    /// canonical space.
    fn range_end(va: VirtualAddress, size: u64) -> Result<i64, PagingError> {
        if !va.is_canonical() {
            return Err(PagingError::NonCanonical(va));
        }
        let room = (VIRT_END - va.as_i64()) as u64;
        if size > room {
            return Err(PagingError::NonCanonical(va));
        }
        Ok(va.as_i64() + size as i64)
    }

    /// First address past `va` at the stride of the level at `shift`.
    fn next_boundary(va: VirtualAddress, shift: u32) -> VirtualAddress {
        VirtualAddress::new((((va.as_u64() >> shift) + 1) << shift) as i64)
    }

    /// Allocate the root table on first use.
    fn ensure_root(&mut self) -> Result<(), PagingError> {
        if self.cr3.as_u64() == 0 {
            let frame = self.pool.alloc_frame().ok_or(PoolError::OutOfMemory)?;
            self.pool.stats_mut().pagetables += 1;
            *self.cr3 = frame;
        }
        Ok(())
    }

    /// Descend to the L1 table for `va`, allocating absent intermediates.
    fn walk_alloc(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, PagingError> {
        let mut table = *self.cr3;
        for shift in [LEVEL_SHIFTS[0], LEVEL_SHIFTS[1], LEVEL_SHIFTS[2]] {
            let slot = table + va.index_at(shift) * 8;
            let entry = PageEntry::from_bits(self.pool.read_u64(slot));
            if entry.present() {
                table = entry.addr();
            } else {
                let frame = self.pool.alloc_frame().ok_or(PoolError::OutOfMemory)?;
                self.pool
                    .write_u64(slot, PageEntry::table(frame).into_bits());
                self.pool.stats_mut().pagetables += 1;
                table = frame;
            }
        }
        Ok(table)
    }

    /// Bytes of guaranteed-unmapped space starting at `va`, or `None`
    /// when a leaf occupies it.
    ///
    /// An absent entry at a level credits the distance to that level's
    /// next stride boundary.
    fn absent_span(&self, va: VirtualAddress) -> Option<u64> {
        let span_to =
            |shift: u32| Self::next_boundary(va, shift).as_u64().wrapping_sub(va.as_u64());
        if self.cr3.as_u64() == 0 {
            return Some(span_to(LEVEL_SHIFTS[0]));
        }
        let mut table = *self.cr3;
        for shift in [LEVEL_SHIFTS[0], LEVEL_SHIFTS[1], LEVEL_SHIFTS[2]] {
            if !self.pool.contains_frame(table) {
                return Some(span_to(shift));
            }
            let entry = PageEntry::from_bits(self.pool.read_u64(table + va.index_at(shift) * 8));
            if !entry.present() {
                return Some(span_to(shift));
            }
            table = entry.addr();
        }
        if !self.pool.contains_frame(table) {
            return Some(span_to(LEVEL_SHIFTS[3]));
        }
        let occupied = self.pool.read_u64(table + va.index_at(LEVEL_SHIFTS[3]) * 8) != 0;
        if occupied {
            None
        } else {
            Some(span_to(LEVEL_SHIFTS[3]))
        }
    }

    /// Clear one leaf slot, undoing its state's bookkeeping.
    fn clear_leaf(&mut self, slot: PhysicalAddress) {
        let entry = PageEntry::from_bits(self.pool.read_u64(slot));
        if entry.present() {
            if !entry.host_backed() {
                self.pool.stats_mut().committed -= 1;
                self.pool.free_frame(entry.addr());
            }
            self.pool.write_u64(slot, 0);
        } else if entry.reserved_page() {
            self.pool.stats_mut().reserved -= 1;
            self.pool.write_u64(slot, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_pool::PoolConfig;

    fn pool() -> PhysicalPool {
        PhysicalPool::new(PoolConfig {
            initial_capacity: 64 * 1024,
            max_capacity: 1024 * FRAME_SIZE,
        })
    }

    #[test]
    fn reserve_then_translate_classifies_reserved() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let va = VirtualAddress::new(0x4000);
        AddressSpace::new(&mut pool, &mut cr3)
            .reserve(va, FRAME_SIZE, PageEntry::reservation())
            .unwrap();
        assert_ne!(cr3.as_u64(), 0);
        assert!(matches!(
            translate(&pool, cr3, va),
            Walk::Reserved { .. }
        ));
        // Root + three intermediates.
        assert_eq!(pool.stats().pagetables, 4);
        assert_eq!(pool.stats().reserved, 1);
    }

    #[test]
    fn reservation_is_idempotent() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let va = VirtualAddress::new(0x4000);
        let mut space = AddressSpace::new(&mut pool, &mut cr3);
        space.reserve(va, 4 * FRAME_SIZE, PageEntry::reservation()).unwrap();
        space.reserve(va, 4 * FRAME_SIZE, PageEntry::reservation()).unwrap();
        assert_eq!(pool.stats().reserved, 4);
    }

    #[test]
    fn commit_backs_a_reserved_page() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let va = VirtualAddress::new(0x4000);
        let mut space = AddressSpace::new(&mut pool, &mut cr3);
        space.reserve(va, FRAME_SIZE, PageEntry::reservation()).unwrap();
        let entry = space.commit(va).unwrap();
        assert!(entry.present());
        assert!(matches!(translate(&pool, cr3, va), Walk::Mapped(_)));
        let stats = pool.stats();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.committed, 1);
        // A second commit is a no-op returning the live entry.
        let again = AddressSpace::new(&mut pool, &mut cr3).commit(va).unwrap();
        assert_eq!(again.into_bits(), entry.into_bits());
    }

    #[test]
    fn commit_of_unmapped_address_fails() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        assert!(AddressSpace::new(&mut pool, &mut cr3)
            .commit(VirtualAddress::new(0x9000))
            .is_none());
    }

    #[test]
    fn release_returns_reservation_counts_and_frames() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let va = VirtualAddress::new(0x4000);
        let mut space = AddressSpace::new(&mut pool, &mut cr3);
        space.reserve(va, 2 * FRAME_SIZE, PageEntry::reservation()).unwrap();
        space.commit(va).unwrap();
        space.release(va, 2 * FRAME_SIZE).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.freed, 1);
        assert!(matches!(translate(&pool, cr3, va), Walk::Unmapped));
    }

    #[test]
    fn release_of_unmapped_range_is_a_noop() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        AddressSpace::new(&mut pool, &mut cr3)
            .release(VirtualAddress::new(0x10_0000), 1 << 30)
            .unwrap();
        assert_eq!(pool.stats(), Default::default());
    }

    #[test]
    fn translate_rejects_non_canonical_and_extreme_addresses() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        AddressSpace::new(&mut pool, &mut cr3)
            .reserve(VirtualAddress::new(0), FRAME_SIZE, PageEntry::reservation())
            .unwrap();
        assert!(matches!(
            translate(&pool, cr3, VirtualAddress::new(VIRT_END)),
            Walk::Unmapped
        ));
        assert!(matches!(
            translate(&pool, cr3, VirtualAddress::new(VIRT_END - 1)),
            Walk::Unmapped
        ));
        // The very bottom of the canonical range walks without underflow.
        assert!(matches!(
            translate(&pool, cr3, VirtualAddress::new(-(1 << 47))),
            Walk::Unmapped
        ));
    }

    #[test]
    fn find_free_skips_reserved_ranges() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let mut space = AddressSpace::new(&mut pool, &mut cr3);
        let base = VirtualAddress::new(0x10_0000);
        space.reserve(base, 3 * FRAME_SIZE, PageEntry::reservation()).unwrap();
        let found = space.find_free(base, 2 * FRAME_SIZE).unwrap();
        assert!(found.as_i64() >= base.as_i64() + 3 * FRAME_SIZE as i64);
        // And the hole it found really is free.
        assert!(matches!(translate(&pool, cr3, found), Walk::Unmapped));
    }

    #[test]
    fn find_free_fails_at_the_canonical_ceiling() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let space = AddressSpace::new(&mut pool, &mut cr3);
        let hint = VirtualAddress::new(VIRT_END - FRAME_SIZE as i64);
        assert!(space.find_free(hint, 2 * FRAME_SIZE).is_err());
    }

    #[test]
    fn reserve_rejects_ranges_leaving_the_canonical_space() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let mut space = AddressSpace::new(&mut pool, &mut cr3);
        let va = VirtualAddress::new(VIRT_END - FRAME_SIZE as i64);
        assert!(space.reserve(va, 2 * FRAME_SIZE, PageEntry::reservation()).is_err());
    }

    #[test]
    fn host_mapping_translates_to_host_pointer() {
        let mut pool = pool();
        let mut cr3 = PhysicalAddress::default();
        let mut backing = vec![0u8; 2 * FRAME_SIZE as usize + FRAME_SIZE as usize];
        let aligned = {
            let p = backing.as_mut_ptr() as u64;
            (p + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)
        };
        let va = VirtualAddress::new(0x20_0000);
        AddressSpace::new(&mut pool, &mut cr3)
            .map_host(va, aligned, 2 * FRAME_SIZE)
            .unwrap();
        let Walk::Mapped(entry) = translate(&pool, cr3, va) else {
            panic!("expected a mapped leaf");
        };
        assert!(entry.host_backed());
        assert_eq!(
            entry.host_pointer(&pool).unwrap().as_ptr() as u64,
            aligned
        );
    }
}
