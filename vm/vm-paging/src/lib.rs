//! # Guest Paging
//!
//! The guest's 4-level paged address space, kept in guest-physical frames
//! of the [`vm_pool::PhysicalPool`] and rooted at a CR3 offset.
//!
//! ## x86-64 Virtual Address → Pool Offset Walk
//!
//! Each canonical 48-bit virtual address divides into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The walker uses the four 9-bit fields as indices into four levels of
//! 512-entry tables (shift 39 → 12, step −9). Unlike hardware paging
//! there are no huge pages here: every mapping terminates in a 4 KiB leaf.
//!
//! ## Entry states
//!
//! A leaf [`PageEntry`] is in exactly one of three states:
//!
//! - **clear** — unmapped; translation misses.
//! - **reserved** — address range claimed by [`AddressSpace::reserve`]
//!   but not yet backed; the first access commits a frame on the spot.
//! - **present** — backed either by a pool frame or, for host-backed
//!   entries, by memory the host process owns outright.
//!
//! The `present` and `reserved` bits are mutually exclusive by
//! construction.
//!
//! ## Pieces
//!
//! - [`PageEntry`]: the 64-bit entry bitfield.
//! - [`translate`]: the read-only walker, returning a [`Walk`].
//! - [`AddressSpace`]: the mutating engine (reserve, commit, release,
//!   free-range scan, host mappings).
//! - [`Tlb`]: the 16-entry software translation cache with a hint-byte
//!   prefilter.

mod address_space;
mod page_entry;
mod tlb;

pub use address_space::{AddressSpace, Walk, translate};
pub use page_entry::PageEntry;
pub use tlb::{TLB_ENTRIES, Tlb};

use vm_memory_addresses::VirtualAddress;
use vm_pool::PoolError;

/// Table-walk shifts, top level first. Each level indexes 512 entries by
/// `(virt >> shift) & 511`.
pub const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

/// A paging operation failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    #[error(transparent)]
    OutOfMemory(#[from] PoolError),
    #[error("virtual range at {0} leaves the canonical 48-bit space")]
    NonCanonical(VirtualAddress),
}
