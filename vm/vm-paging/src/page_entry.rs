//! # Page Table Entry
//!
//! One 64-bit entry, used at every level of the tree.
//!
//! - Intermediate entries carry the next table's pool offset in the
//!   translation-address field and the literal `present|writable|user`
//!   low bits (the value 7).
//! - Leaf entries describe a 4 KiB mapping. The OS-available bits 9–11
//!   hold the emulator's private states: `reserved_page` (claimed but not
//!   backed), `host_backed` (translation address is a host pointer, not a
//!   pool offset), and `file_mapped` (backed by a host file mapping).
//!
//! The physical/host base occupies bits 47:12 and must be 4 KiB-aligned.

use bitfield_struct::bitfield;
use core::ptr::NonNull;
use vm_memory_addresses::PhysicalAddress;
use vm_pool::PhysicalPool;

/// A page-table entry (any level).
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (bit 0). A valid mapping; never set together with
    /// [`reserved_page`](Self::reserved_page).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3). Kept for guest visibility; the emulator
    /// does not act on it.
    pub write_through: bool,
    /// Cache Disable (bit 4). Kept for guest visibility.
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6).
    pub dirty: bool,
    /// PAT (bit 7). Kept for guest visibility.
    pub pat: bool,
    /// Global (bit 8).
    pub global: bool,
    /// Reserved-not-committed (bit 9, OS-available): the leaf is claimed
    /// by a reservation and commits a frame on first access.
    pub reserved_page: bool,
    /// Host-backed (bit 10, OS-available): the address field is a host
    /// pointer escaping the pool, valid and non-relocating.
    pub host_backed: bool,
    /// File-mapped (bit 11, OS-available).
    pub file_mapped: bool,
    /// Translation address bits 47:12 (4 KiB-aligned base).
    #[bits(36)]
    addr_47_12: u64,
    #[bits(15)]
    __: u64,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl PageEntry {
    /// Mask of the translation-address field (bits 47:12).
    pub const TA: u64 = ((1 << 36) - 1) << 12;

    /// A zero (unmapped) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// The translation address (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_47_12() << 12)
    }

    /// Set the translation address (must be 4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn with_addr(self, addr: PhysicalAddress) -> Self {
        debug_assert!(addr.is_frame_aligned());
        self.with_addr_47_12(addr.as_u64() >> 12)
    }

    /// An intermediate entry pointing at the next table frame.
    #[inline]
    #[must_use]
    pub const fn table(next: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_addr(next)
    }

    /// The default reservation key: a writable user leaf that commits on
    /// first access.
    #[inline]
    #[must_use]
    pub const fn reservation() -> Self {
        Self::new()
            .with_reserved_page(true)
            .with_writable(true)
            .with_user(true)
    }

    /// A present leaf whose address field is a page-aligned host pointer.
    #[inline]
    #[must_use]
    pub const fn host(addr: u64) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_host_backed(true)
            .with_addr(PhysicalAddress::new(addr))
    }

    /// Rewrite a reserved leaf as committed onto `frame`.
    ///
    /// Permission bits survive; the reservation bit is dropped and the
    /// present bit raised, keeping the two mutually exclusive.
    #[inline]
    #[must_use]
    pub const fn committed(self, frame: PhysicalAddress) -> Self {
        let bits =
            (frame.as_u64() & Self::TA) | (self.into_bits() & !(Self::TA | (1 << 9)));
        Self::from_bits(bits).with_present(true)
    }

    /// Project this leaf to a host pointer.
    ///
    /// Host-backed entries escape the pool: their address field *is* the
    /// pointer. Pool-backed entries project through the pool's live
    /// region and yield `None` outside it.
    #[inline]
    #[must_use]
    pub fn host_pointer(self, pool: &PhysicalPool) -> Option<NonNull<u8>> {
        if self.host_backed() {
            NonNull::new(self.addr().as_u64() as usize as *mut u8)
        } else {
            pool.host_at(self.addr())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_entry_has_low_bits_seven() {
        let e = PageEntry::table(PhysicalAddress::new(0x3000));
        assert_eq!(e.into_bits() & 0xfff, 7);
        assert_eq!(e.addr().as_u64(), 0x3000);
    }

    #[test]
    fn reservation_key_is_not_present() {
        let key = PageEntry::reservation();
        assert!(key.reserved_page());
        assert!(!key.present());
        assert!(key.writable());
    }

    #[test]
    fn commit_swaps_reserved_for_present_and_keeps_permissions() {
        let key = PageEntry::reservation().with_no_execute(true);
        let e = key.committed(PhysicalAddress::new(0x7000));
        assert!(e.present());
        assert!(!e.reserved_page());
        assert!(e.writable());
        assert!(e.user());
        assert!(e.no_execute());
        assert_eq!(e.addr().as_u64(), 0x7000);
    }

    #[test]
    fn ta_field_spans_bits_47_to_12() {
        assert_eq!(PageEntry::TA, 0x0000_FFFF_FFFF_F000);
        let e = PageEntry::zero().with_addr(PhysicalAddress::new(0x0000_FFFF_FFFF_F000));
        assert_eq!(e.addr().as_u64(), 0x0000_FFFF_FFFF_F000);
    }
}
