//! # Guest Physical Memory Pool
//!
//! The emulator backs all guest "physical" RAM with one contiguous,
//! grow-on-demand host allocation. Guest-physical addresses are plain byte
//! offsets into that allocation, so a page-table entry's translation
//! address projects to a host pointer with a single add.
//!
//! ## What you get
//!
//! - [`PhysicalPool`]: the byte region itself, with bump allocation of
//!   4 KiB frames, 1.5× growth up to a configured maximum, and relocation
//!   on growth (the base pointer may move — see below).
//! - A frame-granular free list with head coalescing, feeding
//!   [`PhysicalPool::alloc_frame_raw`] before any bump allocation.
//! - [`MemoryStats`]: counters tracking the frame lifecycle.
//! - [`PoolConfig`]: initial and maximum capacity.
//!
//! ## Relocation hazard
//!
//! Growth reallocates the backing region, which invalidates every host
//! pointer previously projected out of the pool. Callers that cache such
//! pointers (the software TLB, in particular) watch the `resizes` counter
//! and drop their derivations when it moves. Growth is only ever triggered
//! synchronously from an allocating CPU while its peers hold no pool
//! pointers.

mod free_list;
mod pool;
mod stats;

pub use pool::PhysicalPool;
pub use stats::MemoryStats;

use vm_memory_addresses::{FRAME_SIZE, align_up};

/// Capacity bounds for a [`PhysicalPool`].
///
/// Both fields are rounded up to a frame multiple on use. The default
/// starts tiny (64 KiB) and allows growth to 4 GiB.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// Capacity allocated up front.
    pub initial_capacity: u64,
    /// Hard ceiling; allocation past it fails.
    pub max_capacity: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64 * 1024,
            max_capacity: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    /// Frame-align both bounds and make sure the ceiling covers the start.
    #[must_use]
    pub(crate) fn normalized(self) -> Self {
        let initial = align_up(self.initial_capacity.max(FRAME_SIZE), FRAME_SIZE);
        Self {
            initial_capacity: initial,
            max_capacity: align_up(self.max_capacity, FRAME_SIZE).max(initial),
        }
    }
}

/// Failure to satisfy a physical allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool reached its configured maximum capacity.
    #[error("out of guest physical memory")]
    OutOfMemory,
}
