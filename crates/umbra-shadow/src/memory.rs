//! Anonymous mmap regions backing shadow blocks.
//!
//! Each region is laid out as `[GUARD][DATA][GUARD]`. Unlike OS guard pages
//! the guards here are ordinary readable bytes holding a sentinel pattern, so
//! a scan that runs off either end of a block terminates on the sentinel
//! instead of faulting or reading a neighbouring block.

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Block memory allocation error.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap failed: {0}")]
    MmapFailed(#[from] nix::Error),

    #[error("invalid region size: {0}")]
    InvalidSize(usize),
}

/// A guarded region of shadow memory.
///
/// Data bytes are exposed as `AtomicU8` so that concurrent unsynchronized
/// shadow updates from different threads stay well-defined.
pub struct BlockMemory {
    /// Start of the whole region (including the leading guard).
    region: NonNull<c_void>,
    /// Total mapped size.
    total_size: usize,
    /// Bytes in each guard.
    guard_size: usize,
    /// Bytes between the guards.
    data_size: usize,
    /// Region has been made read-only.
    sealed: bool,
}

impl BlockMemory {
    /// Map a new zero-filled region.
    ///
    /// # Errors
    ///
    /// Returns an error if `data_size` is zero, the total overflows, or mmap fails.
    pub fn new(data_size: usize, guard_size: usize) -> Result<Self, MemoryError> {
        if data_size == 0 {
            return Err(MemoryError::InvalidSize(data_size));
        }

        let total_size = guard_size
            .checked_mul(2)
            .and_then(|guards| guards.checked_add(data_size))
            .ok_or(MemoryError::InvalidSize(data_size))?;
        let total_size_nz =
            NonZeroUsize::new(total_size).ok_or(MemoryError::InvalidSize(data_size))?;

        let region = unsafe {
            mmap_anonymous(
                None,
                total_size_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };

        Ok(Self {
            region,
            total_size,
            guard_size,
            data_size,
            sealed: false,
        })
    }

    /// Pointer to the first data byte (after the leading guard).
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().cast::<u8>().add(self.guard_size) }
    }

    /// Size of the data area.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.data_size
    }

    /// Size of each guard.
    #[must_use]
    pub const fn guard_size(&self) -> usize {
        self.guard_size
    }

    /// Whether the region is read-only.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Data bytes as atomics.
    #[must_use]
    pub fn data(&self) -> &[AtomicU8] {
        // AtomicU8 has the same layout as u8 and the mapping lives as long as self.
        unsafe { std::slice::from_raw_parts(self.as_ptr().cast::<AtomicU8>(), self.data_size) }
    }

    /// The whole region, guards included.
    #[must_use]
    pub fn region(&self) -> &[AtomicU8] {
        unsafe {
            std::slice::from_raw_parts(self.region.as_ptr().cast::<AtomicU8>(), self.total_size)
        }
    }

    /// Fill the data area with `byte`.
    ///
    /// Requires exclusive access, so it can only run before the block is shared.
    pub fn fill(&mut self, byte: u8) {
        debug_assert!(!self.sealed, "fill on sealed block memory");
        unsafe {
            std::ptr::write_bytes(self.as_ptr(), byte, self.data_size);
        }
    }

    /// Fill both guards with `byte`.
    pub fn fill_guards(&mut self, byte: u8) {
        debug_assert!(!self.sealed, "fill on sealed block memory");
        let start = self.region.as_ptr().cast::<u8>();
        unsafe {
            std::ptr::write_bytes(start, byte, self.guard_size);
            std::ptr::write_bytes(self.as_ptr().add(self.data_size), byte, self.guard_size);
        }
    }

    /// Fill `len` data bytes at `offset` with `byte` while the block may be shared.
    pub fn fill_shared(&self, offset: usize, len: usize, byte: u8) {
        debug_assert!(!self.sealed, "write to sealed block memory");
        for cell in &self.data()[offset..offset + len] {
            cell.store(byte, Ordering::Relaxed);
        }
    }

    /// Make the whole region read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if mprotect fails.
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        unsafe {
            mprotect(self.region, self.total_size, ProtFlags::PROT_READ)?;
        }
        self.sealed = true;
        Ok(())
    }

    /// Whether `ptr` points into this region (guards included).
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.total_size
    }
}

impl Drop for BlockMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.region, self.total_size);
        }
    }
}

// All shared access goes through AtomicU8; exclusive mutation needs &mut self.
unsafe impl Send for BlockMemory {}
unsafe impl Sync for BlockMemory {}
