//! # Guest CPU Container
//!
//! Per-CPU state and the translation entry points. The heavier access
//! API (copies, stash, string loaders) lives in the `access` module.

use crate::{SegmentationFault, System};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vm_memory_addresses::{PhysicalAddress, VirtualAddress};
use vm_paging::{AddressSpace, Tlb, Walk, translate};

/// Addressing mode of a guest CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MachineMode {
    /// Identity mapping inside the pool's backed window; no page tables.
    Real,
    /// 4-level paging rooted at the system's CR3.
    Paged,
}

/// The per-instruction scratch backing a page-crossing access.
pub(crate) struct Stash {
    pub(crate) addr: VirtualAddress,
    pub(crate) buf: Vec<u8>,
    pub(crate) writable: bool,
}

/// One guest CPU.
///
/// Owns everything translation-related that must not be shared: the TLB,
/// the stash, the string-buffer bag and the access-range bookkeeping.
/// The address space itself lives in the [`System`] shared by all
/// machines of a guest.
pub struct Machine {
    system: Arc<System>,
    mode: MachineMode,
    pub(crate) tlb: Tlb,
    /// Set by peers (or the system) when the address space changed under
    /// us; consumed at the top of the translation fast path.
    invalidated: Arc<AtomicBool>,
    pub(crate) stash: Option<Stash>,
    /// Host buffers backing page-crossed `load_str` results. Freed when
    /// the machine goes away.
    pub(crate) str_bufs: Vec<Box<[u8]>>,
    pub(crate) readaddr: VirtualAddress,
    pub(crate) readsize: u64,
    pub(crate) writeaddr: VirtualAddress,
    pub(crate) writesize: u64,
}

impl Machine {
    /// Attach a fresh CPU to `system`, starting out in paged mode.
    #[must_use]
    pub fn new(system: Arc<System>) -> Self {
        let invalidated = Arc::new(AtomicBool::new(false));
        system.register_machine(Arc::downgrade(&invalidated));
        Self {
            system,
            mode: MachineMode::Paged,
            tlb: Tlb::new(),
            invalidated,
            stash: None,
            str_bufs: Vec::new(),
            readaddr: VirtualAddress::zero(),
            readsize: 0,
            writeaddr: VirtualAddress::zero(),
            writesize: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> MachineMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MachineMode) {
        self.mode = mode;
        self.tlb.reset();
    }

    /// Range recorded by the last bookkept guest read.
    #[inline]
    #[must_use]
    pub const fn read_range(&self) -> (VirtualAddress, u64) {
        (self.readaddr, self.readsize)
    }

    /// Range recorded by the last bookkept guest write.
    #[inline]
    #[must_use]
    pub const fn write_range(&self) -> (VirtualAddress, u64) {
        (self.writeaddr, self.writesize)
    }

    /// Query the host pointer for `va` without touching the address
    /// space.
    ///
    /// Real mode maps identity inside the pool's backed window. Paged
    /// mode walks (through the TLB); reserved-but-uncommitted pages miss.
    /// Idempotent across repeated calls absent intervening mutation.
    pub fn lookup_address(&mut self, va: VirtualAddress) -> Option<NonNull<u8>> {
        self.address_of(va, false)
    }

    /// Like [`lookup_address`](Self::lookup_address), but short-circuits
    /// to the identity projection when the system runs linear-mapped.
    pub fn get_address(&mut self, va: VirtualAddress) -> Option<NonNull<u8>> {
        if self.system.is_linear() {
            return NonNull::new(va.as_u64() as usize as *mut u8);
        }
        self.lookup_address(va)
    }

    /// Resolve `va` for a guest access, committing a reserved page on
    /// first touch.
    ///
    /// # Errors
    /// [`SegmentationFault`] when nothing is mapped at `va` (or the pool
    /// cannot back a reservation anymore).
    pub fn resolve_address(&mut self, va: VirtualAddress) -> Result<NonNull<u8>, SegmentationFault> {
        if self.system.is_linear() {
            return NonNull::new(va.as_u64() as usize as *mut u8)
                .ok_or(SegmentationFault { addr: va });
        }
        self.address_of(va, true).ok_or(SegmentationFault { addr: va })
    }

    /// Mode-dispatched projection; `commit` selects the access path that
    /// backs reservations.
    pub(crate) fn address_of(&mut self, va: VirtualAddress, commit: bool) -> Option<NonNull<u8>> {
        match self.mode {
            MachineMode::Real => {
                if va.as_i64() < 0 {
                    return None;
                }
                self.system
                    .mem()
                    .pool
                    .host_within_capacity(PhysicalAddress::new(va.as_u64()))
            }
            MachineMode::Paged => {
                let entry = self.page_entry(va.page(), commit)?;
                let mem = self.system.mem();
                let base = entry.host_pointer(&mem.pool)?;
                // SAFETY: the projection points at a whole frame; the
                // offset stays inside it.
                Some(unsafe {
                    NonNull::new_unchecked(base.as_ptr().add(va.frame_offset() as usize))
                })
            }
        }
    }

    /// TLB-accelerated leaf fetch for a page base.
    ///
    /// Consumes the invalidation flag first, walks read-locked on a
    /// miss, and (when `commit` is set) takes the write lock to back a
    /// reserved leaf. A pool relocation during commit drops the whole
    /// TLB before the fresh entry is installed.
    fn page_entry(&mut self, page: VirtualAddress, commit: bool) -> Option<vm_paging::PageEntry> {
        if self.invalidated.swap(false, Ordering::Relaxed) {
            self.tlb.reset();
        }
        if let Some(entry) = self.tlb.lookup(page) {
            return Some(entry);
        }
        let walk = {
            let mem = self.system.mem();
            translate(&mem.pool, mem.cr3, page)
        };
        let entry = match walk {
            Walk::Mapped(entry) => entry,
            Walk::Reserved { .. } if commit => {
                let mut guard = self.system.mem_mut();
                let resizes = guard.pool.stats().resizes;
                let mem = &mut *guard;
                let entry = AddressSpace::new(&mut mem.pool, &mut mem.cr3).commit(page)?;
                let relocated = mem.pool.stats().resizes != resizes;
                drop(guard);
                if relocated {
                    self.tlb.reset();
                    self.system.broadcast_invalidation();
                }
                entry
            }
            _ => return None,
        };
        self.tlb.insert(page, entry);
        Some(entry)
    }
}
