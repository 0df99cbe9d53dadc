//! Shadow blocks: the backing store for one 64 KiB unit.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use umbra_codec::{ShadowValue, get_4bits, set_2bits, set_4bits};

use crate::config::BlockLayout;
use crate::memory::{BlockMemory, MemoryError};

/// log2 of the unit size.
pub const UNIT_BITS: u32 = 16;
/// Application bytes covered by one table slot.
pub const UNIT_SIZE: u64 = 1 << UNIT_BITS;
/// Number of table slots over the 32-bit space.
pub const TABLE_ENTRIES: usize = 1 << (32 - UNIT_BITS);
/// Application bytes per shadow byte.
pub const SHADOW_GRANULARITY: u32 = 4;
/// Shadow bytes in a block's data area.
pub const BLOCK_SIZE: usize = (UNIT_SIZE / SHADOW_GRANULARITY as u64) as usize;
/// Exclusive end of the monitored address space.
pub const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Slot index of `addr`.
#[inline]
pub const fn unit_index(addr: u32) -> usize {
    (addr >> UNIT_BITS) as usize
}

/// Offset of `addr` within its unit.
#[inline]
pub const fn unit_offset(addr: u32) -> u32 {
    addr & (UNIT_SIZE as u32 - 1)
}

/// One unit's shadow bytes, bracketed by BitLevel guards.
///
/// Offsets passed to the accessors are application offsets within the unit
/// (`0..UNIT_SIZE`), not shadow byte indices.
pub struct ShadowBlock {
    mem: BlockMemory,
    layout: BlockLayout,
}

impl ShadowBlock {
    /// Allocate a writable block with every byte set to `fill`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    pub fn new(
        layout: BlockLayout,
        guard_size: usize,
        fill: ShadowValue,
    ) -> Result<Self, MemoryError> {
        let mut mem = BlockMemory::new(BLOCK_SIZE, guard_size)?;
        mem.fill_guards(layout.uniform_byte(ShadowValue::BitLevel));
        mem.fill(layout.uniform_byte(fill));
        Ok(Self { mem, layout })
    }

    /// Allocate a read-only block uniformly holding `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping or the protection change fails.
    pub fn new_special(
        layout: BlockLayout,
        guard_size: usize,
        value: ShadowValue,
    ) -> Result<Self, MemoryError> {
        let mut block = Self::new(layout, guard_size, value)?;
        block.mem.seal()?;
        Ok(block)
    }

    /// Refill an unshared block.
    pub fn refill(&mut self, value: ShadowValue) {
        self.mem.fill(self.layout.uniform_byte(value));
    }

    pub const fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Special blocks are read-only.
    pub const fn is_special(&self) -> bool {
        self.mem.is_sealed()
    }

    #[inline]
    fn cell(&self, offset: u32) -> &AtomicU8 {
        &self.mem.data()[(offset / SHADOW_GRANULARITY) as usize]
    }

    /// Raw shadow byte at shadow index `index` (`0..BLOCK_SIZE`).
    #[inline]
    pub fn shadow_byte(&self, index: usize) -> u8 {
        self.mem.data()[index].load(Ordering::Relaxed)
    }

    /// Value of the byte at `offset`.
    #[inline]
    pub fn get_byte(&self, offset: u32) -> ShadowValue {
        self.layout.decode(self.cell(offset).load(Ordering::Relaxed), offset)
    }

    /// Set the byte at `offset`.
    pub fn set_byte(&self, offset: u32, value: ShadowValue) {
        debug_assert!(!self.is_special(), "write to special block");
        let cell = self.cell(offset);
        match self.layout {
            BlockLayout::Bitmap2 => {
                let field = (offset % SHADOW_GRANULARITY) as u8;
                let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |byte| {
                    Some(set_2bits(byte, field, value))
                });
            }
            BlockLayout::Bytemap4to1 => cell.store(value.code(), Ordering::Relaxed),
        }
    }

    /// Packed shadow of the 2-byte group at `offset` (aligned backward to 2).
    ///
    /// Bitmap blocks return the 4-bit field; bytemap blocks return the group's code.
    pub fn get_word(&self, offset: u32) -> u8 {
        let byte = self.cell(offset).load(Ordering::Relaxed);
        match self.layout {
            BlockLayout::Bitmap2 => get_4bits(byte, (offset % SHADOW_GRANULARITY) as u8 & !1),
            BlockLayout::Bytemap4to1 => byte,
        }
    }

    /// Store a packed 2-byte group at `offset` (aligned backward to 2).
    pub fn set_word(&self, offset: u32, packed: u8) {
        debug_assert!(!self.is_special(), "write to special block");
        let cell = self.cell(offset);
        match self.layout {
            BlockLayout::Bitmap2 => {
                let field = (offset % SHADOW_GRANULARITY) as u8 & !1;
                let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |byte| {
                    Some(set_4bits(byte, field, packed))
                });
            }
            BlockLayout::Bytemap4to1 => cell.store(packed, Ordering::Relaxed),
        }
    }

    /// Raw shadow byte of the 4-byte group containing `offset`.
    #[inline]
    pub fn get_dword(&self, offset: u32) -> u8 {
        self.cell(offset).load(Ordering::Relaxed)
    }

    /// Store the raw shadow byte of the 4-byte group containing `offset`.
    pub fn set_dword(&self, offset: u32, packed: u8) {
        debug_assert!(!self.is_special(), "write to special block");
        self.cell(offset).store(packed, Ordering::Relaxed);
    }

    /// The four shadow bytes of the 16-byte group at `offset`, little-endian.
    pub fn get_dqword(&self, offset: u32) -> u32 {
        debug_assert!(offset % 16 == 0);
        let index = (offset / SHADOW_GRANULARITY) as usize;
        let data = &self.mem.data()[index..index + 4];
        u32::from_le_bytes([
            data[0].load(Ordering::Relaxed),
            data[1].load(Ordering::Relaxed),
            data[2].load(Ordering::Relaxed),
            data[3].load(Ordering::Relaxed),
        ])
    }

    /// Set `len` bytes at `offset` to `value`; both must be 4-aligned.
    pub fn fill_run(&self, offset: u32, len: u32, value: ShadowValue) {
        debug_assert!(offset % SHADOW_GRANULARITY == 0 && len % SHADOW_GRANULARITY == 0);
        self.mem.fill_shared(
            (offset / SHADOW_GRANULARITY) as usize,
            (len / SHADOW_GRANULARITY) as usize,
            self.layout.uniform_byte(value),
        );
    }

    /// Pointer to the shadow byte for `offset`.
    pub fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        NonNull::from(self.cell(offset)).cast()
    }

    /// Whether `ptr` lies within this block, guards included.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.mem.contains(ptr)
    }

    /// Raw guard bytes preceding and following the data.
    pub fn guards(&self) -> (&[AtomicU8], &[AtomicU8]) {
        let region = self.mem.region();
        let guard = self.mem.guard_size();
        (&region[..guard], &region[region.len() - guard..])
    }
}
