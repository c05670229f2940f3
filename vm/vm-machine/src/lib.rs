//! # Guest Machine Memory
//!
//! The per-CPU and per-system containers tying the pool, the paging
//! engine and the TLB together, and the access API the instruction
//! interpreter talks to.
//!
//! ## Shape
//!
//! - [`System`]: shared state of one guest — the physical pool, the page
//!   tables rooted at CR3, and the statistics — behind a reader-writer
//!   lock. Mutations (reserve, free, reset, host mappings, pool growth)
//!   broadcast TLB invalidation to every machine of the system.
//! - [`Machine`]: one guest CPU. Owns a private [`vm_paging::Tlb`], the
//!   per-instruction stash for page-crossing accesses, the bag of
//!   host-side buffers backing page-crossed string loads, and the
//!   read/write range bookkeeping used by debuggers and signal delivery.
//!
//! ## Faults
//!
//! Translation misses surface as [`SegmentationFault`] values from the
//! resolving entry points; the interpreter's per-instruction driver
//! unwinds them. Plain queries ([`Machine::lookup_address`]) return
//! `None` instead and never mutate the address space, while resolving
//! accesses commit reserved pages on first touch.
//!
//! ## Pointer lifetime
//!
//! Host pointers handed out by this layer point into the pool and are
//! invalidated by pool growth. They are valid for the current
//! instruction only: growth happens synchronously under the system write
//! lock from a faulting machine, and peers are quiesced by the
//! interpreter before address-space mutations.

mod access;
mod machine;
mod system;

pub use access::CopyDirection;
pub use machine::{Machine, MachineMode};
pub use system::System;

use vm_memory_addresses::VirtualAddress;

/// A guest access faulted: the address resolves to nothing, even after
/// giving reservations the chance to commit.
///
/// This is the only non-local exit of the memory subsystem; bulk copies
/// are restartable at instruction granularity, so no partial state other
/// than the (discarded) stash survives a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("segmentation fault at guest address {addr}")]
pub struct SegmentationFault {
    /// The faulting guest virtual address.
    pub addr: VirtualAddress,
}
