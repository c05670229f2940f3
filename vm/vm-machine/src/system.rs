//! # System Container
//!
//! State shared by every CPU of one guest: the physical pool and the
//! page-table tree. A single reader-writer lock covers both; walkers
//! take the read side, reservation/commit/free and pool growth take the
//! write side (see the concurrency notes on the crate root).

use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use vm_memory_addresses::{PhysicalAddress, VirtualAddress};
use vm_paging::{AddressSpace, PageEntry, PagingError};
use vm_pool::{MemoryStats, PhysicalPool, PoolConfig, PoolError};

/// The lock-protected half of a [`System`].
pub(crate) struct SystemMem {
    pub(crate) pool: PhysicalPool,
    pub(crate) cr3: PhysicalAddress,
}

/// Shared memory state of one guest.
///
/// Create one, wrap it in an [`Arc`](std::sync::Arc), and hand clones to
/// each [`Machine`](crate::Machine).
pub struct System {
    mem: RwLock<SystemMem>,
    /// Invalidation flags of the machines attached to this system.
    machines: Mutex<Vec<Weak<AtomicBool>>>,
    /// When set, guest virtual addresses equal host addresses and
    /// translation short-circuits entirely.
    linear: bool,
}

impl System {
    /// A paged system backed by a pool with the given bounds.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            mem: RwLock::new(SystemMem {
                pool: PhysicalPool::new(config),
                cr3: PhysicalAddress::default(),
            }),
            machines: Mutex::new(Vec::new()),
            linear: false,
        }
    }

    /// Switch on linear mapping: guest virtual addresses are host
    /// addresses and bypass the page tables.
    #[must_use]
    pub const fn with_linear_mapping(mut self) -> Self {
        self.linear = true;
        self
    }

    #[inline]
    pub(crate) const fn is_linear(&self) -> bool {
        self.linear
    }

    /// Reserve `[va, va + size)` with `key` (lazily backed; see
    /// [`AddressSpace::reserve`]).
    ///
    /// # Errors
    /// Out-of-memory or a non-canonical range.
    pub fn reserve_virtual(
        &self,
        va: VirtualAddress,
        size: u64,
        key: PageEntry,
    ) -> Result<(), PagingError> {
        {
            let mut guard = self.mem_mut();
            let mem = &mut *guard;
            AddressSpace::new(&mut mem.pool, &mut mem.cr3).reserve(va, size, key)?;
        }
        self.broadcast_invalidation();
        Ok(())
    }

    /// Release `[va, va + size)`, returning committed frames to the free
    /// list.
    ///
    /// # Errors
    /// A non-canonical range.
    pub fn free_virtual(&self, va: VirtualAddress, size: u64) -> Result<(), PagingError> {
        {
            let mut guard = self.mem_mut();
            let mem = &mut *guard;
            AddressSpace::new(&mut mem.pool, &mut mem.cr3).release(va, size)?;
        }
        self.broadcast_invalidation();
        Ok(())
    }

    /// Find `size` bytes of unmapped virtual space at or above `hint`.
    ///
    /// # Errors
    /// Out-of-memory when the scan hits the canonical ceiling.
    pub fn find_virtual(
        &self,
        hint: VirtualAddress,
        size: u64,
    ) -> Result<VirtualAddress, PagingError> {
        let mut guard = self.mem_mut();
        let mem = &mut *guard;
        AddressSpace::new(&mut mem.pool, &mut mem.cr3).find_free(hint, size)
    }

    /// Map `[va, va + size)` onto host memory at the page-aligned address
    /// `host`.
    ///
    /// # Errors
    /// Out-of-memory or a non-canonical range.
    pub fn map_host(&self, va: VirtualAddress, host: u64, size: u64) -> Result<(), PagingError> {
        {
            let mut guard = self.mem_mut();
            let mem = &mut *guard;
            AddressSpace::new(&mut mem.pool, &mut mem.cr3).map_host(va, host, size)?;
        }
        self.broadcast_invalidation();
        Ok(())
    }

    /// Grow the pool's backed capacity to at least `bytes`.
    ///
    /// Also widens the real-mode identity window. Relocation invalidates
    /// every TLB.
    ///
    /// # Errors
    /// [`PoolError::OutOfMemory`] past the configured maximum.
    pub fn reserve_real(&self, bytes: u64) -> Result<(), PoolError> {
        let relocated = self.mem_mut().pool.reserve(bytes)?;
        if relocated {
            self.broadcast_invalidation();
        }
        Ok(())
    }

    /// Tear the whole address space down: free list, bump cursor,
    /// statistics and CR3 all return to their initial state.
    pub fn reset_mem(&self) {
        {
            let mut guard = self.mem_mut();
            guard.pool.reset();
            guard.cr3 = PhysicalAddress::default();
        }
        self.broadcast_invalidation();
        trace!("memory reset");
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.mem().pool.stats()
    }

    pub(crate) fn mem(&self) -> RwLockReadGuard<'_, SystemMem> {
        self.mem.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mem_mut(&self) -> RwLockWriteGuard<'_, SystemMem> {
        self.mem.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a machine's invalidation flag.
    pub(crate) fn register_machine(&self, flag: Weak<AtomicBool>) {
        self.machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flag);
    }

    /// Set every attached machine's invalidation flag, pruning the flags
    /// of machines that no longer exist.
    pub(crate) fn broadcast_invalidation(&self) {
        let mut machines = self.machines.lock().unwrap_or_else(PoisonError::into_inner);
        machines.retain(|flag| match flag.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        });
    }
}
