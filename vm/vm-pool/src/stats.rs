use core::fmt;
use core::fmt::{Display, Formatter};

/// Counters describing the guest frame lifecycle.
///
/// `allocated`, `reclaimed` and `resizes` are monotone; `committed`,
/// `reserved` and `freed` mirror state transitions and move both ways.
/// Over a machine's lifetime `allocated + reclaimed == committed + freed`
/// plus whatever page-table frames the tree itself consumed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    /// Frames handed out by bump allocation.
    pub allocated: u64,
    /// Frames returned to the free list.
    pub freed: u64,
    /// Frames re-used from the free list.
    pub reclaimed: u64,
    /// Times the pool relocated its base while growing.
    pub resizes: u64,
    /// Leaf pages currently committed (backed by a frame).
    pub committed: u64,
    /// Leaf pages currently reserved but not committed.
    pub reserved: u64,
    /// Frames consumed by intermediate page tables.
    pub pagetables: u64,
}

impl Display for MemoryStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocated:  {} frames", self.allocated)?;
        writeln!(f, "Freed:      {} frames", self.freed)?;
        writeln!(f, "Reclaimed:  {} frames", self.reclaimed)?;
        writeln!(f, "Resizes:    {}", self.resizes)?;
        writeln!(f, "Committed:  {} pages", self.committed)?;
        writeln!(f, "Reserved:   {} pages", self.reserved)?;
        writeln!(f, "PageTables: {} frames", self.pagetables)
    }
}
