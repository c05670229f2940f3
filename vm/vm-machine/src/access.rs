//! # Access API
//!
//! Bulk copies, the per-instruction stash, the two-page splice helpers
//! and the guest string loaders. Everything here routes through
//! [`Machine::resolve_address`]-style resolution, so a chunk never
//! crosses a frame boundary and reserved pages commit on first touch.

use crate::machine::Stash;
use crate::{Machine, SegmentationFault};
use core::ptr::{self, NonNull};
use core::slice;
use vm_memory_addresses::{FRAME_SIZE, VirtualAddress};

/// Direction of a [`Machine::virtual_copy`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CopyDirection {
    /// Host buffer → guest memory.
    IntoGuest,
    /// Guest memory → host buffer.
    FromGuest,
}

impl Machine {
    /// Copy `len` bytes between guest memory at `va` and the host buffer
    /// at `host`, in chunks that never cross a frame boundary.
    ///
    /// A zero `len` touches nothing and cannot fault, even on unmapped
    /// addresses.
    ///
    /// # Errors
    /// [`SegmentationFault`] at the first unmapped page; bytes before it
    /// have already been copied.
    ///
    /// # Safety
    /// `host .. host + len` must be valid for reads
    /// ([`CopyDirection::IntoGuest`]) or writes
    /// ([`CopyDirection::FromGuest`]).
    pub unsafe fn virtual_copy(
        &mut self,
        mut va: VirtualAddress,
        mut host: *mut u8,
        mut len: usize,
        direction: CopyDirection,
    ) -> Result<(), SegmentationFault> {
        while len > 0 {
            let chunk = len.min(va.frame_remainder() as usize);
            let guest = self.resolve_address(va)?;
            // SAFETY: `chunk` stays inside the resolved frame; the caller
            // vouches for the host side.
            unsafe {
                match direction {
                    CopyDirection::IntoGuest => {
                        ptr::copy_nonoverlapping(host.cast_const(), guest.as_ptr(), chunk);
                    }
                    CopyDirection::FromGuest => {
                        ptr::copy_nonoverlapping(guest.as_ptr().cast_const(), host, chunk);
                    }
                }
                host = host.add(chunk);
            }
            va += chunk as i64;
            len -= chunk;
        }
        Ok(())
    }

    /// Copy guest memory at `va` into `out`.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page in the range.
    pub fn copy_from_user(
        &mut self,
        va: VirtualAddress,
        out: &mut [u8],
    ) -> Result<(), SegmentationFault> {
        // SAFETY: `out` is a live exclusive buffer of the right length.
        unsafe { self.virtual_copy(va, out.as_mut_ptr(), out.len(), CopyDirection::FromGuest) }
    }

    /// [`copy_from_user`](Self::copy_from_user) plus read-range
    /// bookkeeping for debuggers and signal delivery.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page in the range.
    pub fn copy_from_user_read(
        &mut self,
        va: VirtualAddress,
        out: &mut [u8],
    ) -> Result<(), SegmentationFault> {
        self.set_read_addr(va, out.len() as u64);
        self.copy_from_user(va, out)
    }

    /// Copy `buf` into guest memory at `va`.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page in the range.
    pub fn copy_to_user(&mut self, va: VirtualAddress, buf: &[u8]) -> Result<(), SegmentationFault> {
        // SAFETY: `buf` is live for reads; the into-guest direction never
        // writes through the pointer.
        unsafe {
            self.virtual_copy(
                va,
                buf.as_ptr().cast_mut(),
                buf.len(),
                CopyDirection::IntoGuest,
            )
        }
    }

    /// [`copy_to_user`](Self::copy_to_user) plus write-range bookkeeping.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page in the range.
    pub fn copy_to_user_write(
        &mut self,
        va: VirtualAddress,
        buf: &[u8],
    ) -> Result<(), SegmentationFault> {
        self.set_write_addr(va, buf.len() as u64);
        self.copy_to_user(va, buf)
    }

    /// Record the range of a guest read.
    pub fn set_read_addr(&mut self, va: VirtualAddress, size: u64) {
        self.readaddr = va;
        self.readsize = size;
    }

    /// Record the range of a guest write.
    pub fn set_write_addr(&mut self, va: VirtualAddress, size: u64) {
        self.writeaddr = va;
        self.writesize = size;
    }

    /// Pin down a host view of `[va, va + size)` for the current
    /// instruction.
    ///
    /// Ranges inside one frame resolve directly. Page-crossing ranges are
    /// copied into the per-CPU stash; the returned pointer then addresses
    /// the stash, and [`commit_stash`](Self::commit_stash) writes it back
    /// at instruction retire when `writable` was set.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page in the range.
    pub fn reserve_address(
        &mut self,
        va: VirtualAddress,
        size: usize,
        writable: bool,
    ) -> Result<NonNull<u8>, SegmentationFault> {
        if va.frame_offset() + size as u64 <= FRAME_SIZE {
            return self.resolve_address(va);
        }
        let mut buf = vec![0u8; size];
        self.copy_from_user(va, &mut buf)?;
        let stash = self.stash.insert(Stash {
            addr: va,
            buf,
            writable,
        });
        // SAFETY: the range crosses a frame here, so the buffer is
        // non-empty and its pointer non-null.
        Ok(unsafe { NonNull::new_unchecked(stash.buf.as_mut_ptr()) })
    }

    /// Finalize the active stash, if any.
    ///
    /// Writable stashes are copied back to their guest range; the stash
    /// is cleared either way, so a faulted instruction leaves nothing
    /// behind.
    ///
    /// # Errors
    /// [`SegmentationFault`] when the write-back hits an unmapped page.
    pub fn commit_stash(&mut self) -> Result<(), SegmentationFault> {
        let Some(stash) = self.stash.take() else {
            return Ok(());
        };
        if stash.writable {
            self.copy_to_user(stash.addr, &stash.buf)?;
        }
        Ok(())
    }

    /// Two-page splice: a host view of `[va, va + size)` backed either
    /// directly (single frame) or by the caller's `copy` buffer.
    ///
    /// On a single-frame access the guest pointer comes back unchanged
    /// and `halves[1]` is null. Otherwise both frame pointers land in
    /// `halves`, `copy` receives the joined bytes when `copy_in` is set,
    /// and the result points at `copy`.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page.
    pub fn access_ram(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &mut [*mut u8; 2],
        copy: &mut [u8],
        copy_in: bool,
    ) -> Result<*mut u8, SegmentationFault> {
        debug_assert!(size <= copy.len());
        debug_assert!(size as u64 <= va.frame_remainder() + FRAME_SIZE);
        if size == 0 {
            *halves = [ptr::null_mut(); 2];
            return Ok(copy.as_mut_ptr());
        }
        let first = self.resolve_address(va)?;
        let remain = va.frame_remainder() as usize;
        if size <= remain {
            *halves = [first.as_ptr(), ptr::null_mut()];
            return Ok(first.as_ptr());
        }
        let second = self.resolve_address(va + remain as i64)?;
        *halves = [first.as_ptr(), second.as_ptr()];
        if copy_in {
            // SAFETY: both halves are resolved frames; the split sizes
            // match the frame remainders.
            unsafe {
                ptr::copy_nonoverlapping(first.as_ptr().cast_const(), copy.as_mut_ptr(), remain);
                ptr::copy_nonoverlapping(
                    second.as_ptr().cast_const(),
                    copy.as_mut_ptr().add(remain),
                    size - remain,
                );
            }
        }
        Ok(copy.as_mut_ptr())
    }

    /// Read-only splice with read-range bookkeeping.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page.
    pub fn load(
        &mut self,
        va: VirtualAddress,
        size: usize,
        copy: &mut [u8],
    ) -> Result<*const u8, SegmentationFault> {
        self.set_read_addr(va, size as u64);
        let mut halves = [ptr::null_mut(); 2];
        self.access_ram(va, size, &mut halves, copy, true)
            .map(<*mut u8>::cast_const)
    }

    /// Begin a store: splice without copy-in, write-range bookkeeping.
    ///
    /// The caller fills the returned buffer and finishes with
    /// [`end_store`](Self::end_store).
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page.
    pub fn begin_store(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &mut [*mut u8; 2],
        copy: &mut [u8],
    ) -> Result<*mut u8, SegmentationFault> {
        self.set_write_addr(va, size as u64);
        self.access_ram(va, size, halves, copy, false)
    }

    /// Null-tolerant [`begin_store`](Self::begin_store): a zero `va` is
    /// the guest's null-pointer convention and yields a null host
    /// pointer without touching memory.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page.
    pub fn begin_store_np(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &mut [*mut u8; 2],
        copy: &mut [u8],
    ) -> Result<*mut u8, SegmentationFault> {
        if va.is_null() {
            return Ok(ptr::null_mut());
        }
        self.begin_store(va, size, halves, copy)
    }

    /// Read-modify-write splice: copy-in plus both bookkeeping ranges.
    ///
    /// # Errors
    /// [`SegmentationFault`] on an unmapped page.
    pub fn begin_load_store(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &mut [*mut u8; 2],
        copy: &mut [u8],
    ) -> Result<*mut u8, SegmentationFault> {
        self.set_read_addr(va, size as u64);
        self.set_write_addr(va, size as u64);
        self.access_ram(va, size, halves, copy, true)
    }

    /// Finish a store begun with [`begin_store`](Self::begin_store).
    ///
    /// Direct (single-frame) stores already went through the guest
    /// pointer; spliced stores write the buffer back into both halves.
    pub fn end_store(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &[*mut u8; 2],
        copy: &[u8],
    ) {
        if halves[1].is_null() {
            return;
        }
        let remain = va.frame_remainder() as usize;
        debug_assert!(remain < size && size <= copy.len());
        // SAFETY: the halves were resolved by `access_ram` for this exact
        // (va, size) pair within the same instruction.
        unsafe {
            ptr::copy_nonoverlapping(copy.as_ptr(), halves[0], remain);
            ptr::copy_nonoverlapping(copy.as_ptr().add(remain), halves[1], size - remain);
        }
    }

    /// Null-tolerant [`end_store`](Self::end_store).
    pub fn end_store_np(
        &mut self,
        va: VirtualAddress,
        size: usize,
        halves: &[*mut u8; 2],
        copy: &[u8],
    ) {
        if va.is_null() {
            return;
        }
        self.end_store(va, size, halves, copy);
    }

    /// Load a NUL-terminated guest string, returning a host pointer.
    ///
    /// When the terminator sits in the first frame the guest memory is
    /// returned directly. Otherwise the string is copied frame by frame
    /// into a machine-owned buffer that lives until the machine is
    /// dropped. `None` for a guest null pointer or an unmapped page
    /// before the terminator. The recorded read range includes the
    /// terminator.
    pub fn load_str(&mut self, va: VirtualAddress) -> Option<NonNull<u8>> {
        if va.is_null() {
            return None;
        }
        let first = self.address_of(va, true)?;
        let remain = va.frame_remainder() as usize;
        // SAFETY: the frame remainder is resolved guest memory.
        let head = unsafe { slice::from_raw_parts(first.as_ptr().cast_const(), remain) };
        if let Some(nul) = head.iter().position(|&b| b == 0) {
            self.set_read_addr(va, (nul + 1) as u64);
            return Some(first);
        }
        let mut buf = head.to_vec();
        let mut v = va + remain as i64;
        loop {
            let page = self.address_of(v, true)?;
            // SAFETY: a resolved page is a whole readable frame.
            let chunk =
                unsafe { slice::from_raw_parts(page.as_ptr().cast_const(), FRAME_SIZE as usize) };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                buf.extend_from_slice(&chunk[..=nul]);
                self.set_read_addr(va, buf.len() as u64);
                let boxed = buf.into_boxed_slice();
                let str_ptr = NonNull::from(&boxed[0]);
                self.str_bufs.push(boxed);
                return Some(str_ptr);
            }
            buf.extend_from_slice(chunk);
            v += FRAME_SIZE as i64;
        }
    }

    /// Load a zero-word-terminated array of guest string pointers.
    ///
    /// Every element resolves through [`load_str`](Self::load_str); the
    /// returned vector owns itself, while the pointed-to buffers stay
    /// machine-owned. `None` for a guest null pointer, an unmapped
    /// element, or an unmapped string.
    pub fn load_str_list(&mut self, va: VirtualAddress) -> Option<Vec<NonNull<u8>>> {
        if va.is_null() {
            return None;
        }
        let mut list = Vec::new();
        let mut slot = va;
        loop {
            let mut word = [0u8; 8];
            self.read_guest(slot, &mut word)?;
            let elem = i64::from_le_bytes(word);
            if elem == 0 {
                return Some(list);
            }
            list.push(self.load_str(VirtualAddress::new(elem))?);
            slot += 8;
        }
    }

    /// Non-faulting committing read, for loaders that report misses as
    /// `None` instead of raising.
    fn read_guest(&mut self, mut va: VirtualAddress, out: &mut [u8]) -> Option<()> {
        let mut off = 0;
        while off < out.len() {
            let chunk = (out.len() - off).min(va.frame_remainder() as usize);
            let host = self.address_of(va, true)?;
            // SAFETY: `chunk` stays inside the resolved frame and `out`.
            unsafe {
                ptr::copy_nonoverlapping(
                    host.as_ptr().cast_const(),
                    out.as_mut_ptr().add(off),
                    chunk,
                );
            }
            off += chunk;
            va += chunk as i64;
        }
        Some(())
    }
}
