//! The shadow engine context.

use std::ptr::NonNull;

use tracing::debug;
use umbra_codec::{ShadowQuery, ShadowValue, tables};

use crate::block::{
    ADDRESS_SPACE_END, BLOCK_SIZE, SHADOW_GRANULARITY, ShadowBlock, unit_index, unit_offset,
};
use crate::config::{BlockLayout, ShadowConfig};
use crate::error::{Result, ShadowError};
use crate::metrics::{ShadowStats, StatsSnapshot};
use crate::register::{ThreadRegistry, ThreadShadow};
use crate::table::{ShadowTable, Slot};

/// Shadow memory for a 32-bit address space.
///
/// All operations take `&self` and may be called from any thread. Dropping
/// the engine releases every block.
pub struct ShadowEngine {
    config: ShadowConfig,
    pub(crate) table: ShadowTable,
    pub(crate) stats: ShadowStats,
    threads: ThreadRegistry,
}

impl ShadowEngine {
    /// Create an engine with every byte Unaddressable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the special blocks
    /// cannot be allocated.
    pub fn init(config: ShadowConfig) -> Result<Self> {
        config.validate()?;
        let table = ShadowTable::new(config.layout, config.guard_size)?;
        debug!(
            layout = config.layout.name(),
            guard_size = config.guard_size,
            "shadow engine initialized"
        );
        let threads = ThreadRegistry::new(config.thread_entry_defined.clone());
        Ok(Self {
            config,
            table,
            stats: ShadowStats::default(),
            threads,
        })
    }

    /// Tear down the engine, returning its final statistics.
    pub fn shutdown(self) -> StatsSnapshot {
        let stats = self.stats();
        debug!(
            blocks_allocated = stats.blocks_allocated,
            races_lost = stats.promotion_races_lost,
            "shadow engine shutdown"
        );
        stats
    }

    pub const fn config(&self) -> &ShadowConfig {
        &self.config
    }

    pub const fn layout(&self) -> BlockLayout {
        self.config.layout
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shadow bytes per block.
    pub const fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    #[inline]
    pub(crate) fn slot(&self, addr: u32) -> Slot<'_> {
        self.table.resolve(unit_index(addr))
    }

    /// Private block for `addr`'s unit, promoting it if needed.
    pub(crate) fn private_block(&self, addr: u32) -> Result<&ShadowBlock> {
        Ok(self.table.promote(unit_index(addr), &self.stats)?)
    }

    // ------------------------------------------------------------------
    // Single bytes and packed groups
    // ------------------------------------------------------------------

    /// Value of the byte at `addr`.
    #[inline]
    pub fn get_byte(&self, addr: u32) -> ShadowValue {
        match self.slot(addr) {
            Slot::Special(value) => value,
            Slot::Private(block) => block.get_byte(unit_offset(addr)),
        }
    }

    /// Set the byte at `addr`. A write matching a uniform unit is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit must be promoted and allocation fails.
    pub fn set_byte(&self, addr: u32, value: ShadowValue) -> Result<()> {
        let block = match self.slot(addr) {
            Slot::Special(current) if current == value => return Ok(()),
            Slot::Special(_) => self.private_block(addr)?,
            Slot::Private(block) => block,
        };
        block.set_byte(unit_offset(addr), value);
        Ok(())
    }

    /// Packed 2-byte group at `addr`; see [`ShadowBlock::get_word`].
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `addr` is 2-aligned.
    pub fn get_word(&self, addr: u32) -> Result<u8> {
        check_align(addr, 2)?;
        Ok(self.table.block(unit_index(addr)).get_word(unit_offset(addr)))
    }

    /// Store a packed 2-byte group at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `addr` is 2-aligned, or an allocation error.
    pub fn set_word(&self, addr: u32, packed: u8) -> Result<()> {
        check_align(addr, 2)?;
        let offset = unit_offset(addr);
        let block = match self.slot(addr) {
            Slot::Special(current) => {
                let uniform = self.table.special_block(current);
                if uniform.get_word(offset) == packed {
                    return Ok(());
                }
                self.private_block(addr)?
            }
            Slot::Private(block) => block,
        };
        block.set_word(offset, packed);
        Ok(())
    }

    /// Raw shadow byte of the 4-byte group containing `addr`.
    pub fn get_dword(&self, addr: u32) -> u8 {
        match self.slot(addr) {
            Slot::Special(value) => self.layout().uniform_byte(value),
            Slot::Private(block) => block.get_dword(unit_offset(addr)),
        }
    }

    /// Store the raw shadow byte of the 4-byte group at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `addr` is 4-aligned, or an allocation error.
    pub fn set_dword(&self, addr: u32, packed: u8) -> Result<()> {
        check_align(addr, 4)?;
        let block = match self.slot(addr) {
            Slot::Special(current) if self.layout().uniform_byte(current) == packed => {
                return Ok(());
            }
            Slot::Special(_) => self.private_block(addr)?,
            Slot::Private(block) => block,
        };
        block.set_dword(unit_offset(addr), packed);
        Ok(())
    }

    /// State of the aligned 16-byte group at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `addr` is 16-aligned.
    pub fn get_dqword_state(&self, addr: u32) -> Result<ShadowQuery> {
        check_align(addr, 16)?;
        Ok(match self.slot(addr) {
            Slot::Special(value) => ShadowQuery::Uniform(value),
            Slot::Private(block) => {
                let dqword = block.get_dqword(unit_offset(addr));
                match self.layout().dqword_value(dqword) {
                    Some(value) => ShadowQuery::Uniform(value),
                    None => ShadowQuery::Mixed,
                }
            }
        })
    }

    /// Whether every byte of the aligned `size`-byte access at `addr` is Defined.
    ///
    /// # Errors
    ///
    /// Returns `AccessSize` unless `size` is 1, 2 or 4, and `Misaligned`
    /// unless `addr` is aligned to `size`.
    pub fn is_access_defined(&self, addr: u32, size: u32) -> Result<bool> {
        self.classify_access(addr, size, AccessCheck::Defined)
    }

    /// Whether no byte of the aligned `size`-byte access at `addr` is Unaddressable.
    ///
    /// # Errors
    ///
    /// As for [`Self::is_access_defined`].
    pub fn is_access_addressable(&self, addr: u32, size: u32) -> Result<bool> {
        self.classify_access(addr, size, AccessCheck::Addressable)
    }

    fn classify_access(&self, addr: u32, size: u32, check: AccessCheck) -> Result<bool> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(ShadowError::AccessSize(size));
        }
        check_align(addr, size)?;
        let byte = match self.slot(addr) {
            Slot::Special(value) => return Ok(check.holds(value)),
            Slot::Private(block) => block.get_dword(unit_offset(addr)),
        };
        if self.layout() == BlockLayout::Bytemap4to1 {
            return Ok(check.holds(ShadowValue::from_low_bits(byte)));
        }
        let field = (addr % SHADOW_GRANULARITY) as u8;
        Ok(match (check, size) {
            (AccessCheck::Defined, 1) => tables::byte_defined(byte, field),
            (AccessCheck::Defined, 2) => tables::word_defined(byte, field),
            (AccessCheck::Defined, _) => byte == 0,
            (AccessCheck::Addressable, 1) => tables::byte_addressable(byte, field),
            (AccessCheck::Addressable, 2) => {
                tables::byte_addressable(byte, field) && tables::byte_addressable(byte, field + 1)
            }
            (AccessCheck::Addressable, _) => tables::DWORD_IS_ADDRESSABLE[usize::from(byte)],
        })
    }

    // ------------------------------------------------------------------
    // Translation and special blocks
    // ------------------------------------------------------------------

    /// The uniform value of `addr`'s unit, if it is backed by a special block.
    pub fn special_value(&self, addr: u32) -> Option<ShadowValue> {
        self.slot(addr).special_value()
    }

    pub fn is_special(&self, addr: u32) -> bool {
        self.slot(addr).is_special()
    }

    /// Pointer to the shadow byte for `addr`.
    ///
    /// The pointee is read-only when the unit is special.
    pub fn translate(&self, addr: u32) -> NonNull<u8> {
        self.table.block(unit_index(addr)).ptr_at(unit_offset(addr))
    }

    /// Promote `addr`'s unit to private and return a writable translation.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn replace_special(&self, addr: u32) -> Result<NonNull<u8>> {
        Ok(self.private_block(addr)?.ptr_at(unit_offset(addr)))
    }

    /// Start of the BitLevel special block's data.
    pub fn bitlevel_addr(&self) -> NonNull<u8> {
        self.table.special_block(ShadowValue::BitLevel).ptr_at(0)
    }

    /// Whether `ptr` points into one of the special blocks.
    pub fn is_in_special_block(&self, ptr: *const u8) -> bool {
        self.table.specials().iter().any(|block| block.contains(ptr))
    }

    /// Start of the slot array. Slot encoding is internal; for diagnostics only.
    pub fn table_base(&self) -> *const () {
        self.table.slots_ptr()
    }

    /// Number of private blocks currently mapped.
    pub fn private_blocks(&self) -> usize {
        self.table.private_count()
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Register the calling thread; the first registered thread starts Defined.
    pub fn thread_init(&self) -> ThreadShadow {
        self.stats.record_thread_init();
        self.threads.thread_init()
    }

    /// Register the calling thread with an explicit first-thread flag.
    pub fn init_thread(&self, is_first: bool) -> ThreadShadow {
        self.stats.record_thread_init();
        self.threads.init_thread(is_first)
    }

    /// The calling thread's register shadow in this engine.
    pub fn current_thread(&self) -> Option<ThreadShadow> {
        self.threads.current()
    }

    /// Detach the calling thread's register shadow. Other engines' records
    /// for this thread are left in place.
    pub fn thread_exit(&self) -> Option<ThreadShadow> {
        self.threads.thread_exit()
    }
}

impl Drop for ShadowEngine {
    fn drop(&mut self) {
        debug!(private_blocks = self.table.private_count(), "releasing shadow blocks");
    }
}

#[derive(Clone, Copy)]
enum AccessCheck {
    Defined,
    Addressable,
}

impl AccessCheck {
    const fn holds(self, value: ShadowValue) -> bool {
        match self {
            Self::Defined => matches!(value, ShadowValue::Defined),
            Self::Addressable => value.is_addressable(),
        }
    }
}

#[inline]
pub(crate) fn check_align(addr: u32, align: u32) -> Result<()> {
    if addr % align == 0 {
        Ok(())
    } else {
        Err(ShadowError::Misaligned { addr, align })
    }
}

/// Exclusive end of a range, rejecting ranges past the address space.
pub(crate) fn checked_end(start: u32, len: u64) -> Result<u64> {
    let end = u64::from(start) + len;
    if end > ADDRESS_SPACE_END {
        return Err(ShadowError::RangeOverflow { start, len });
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Gpr;

    fn engine() -> ShadowEngine {
        ShadowEngine::init(ShadowConfig::default()).expect("engine init should succeed")
    }

    #[test]
    fn test_init_all_unaddressable() {
        let e = engine();
        for addr in [0, 0x1234, 0x8000_0000, u32::MAX] {
            assert_eq!(e.get_byte(addr), ShadowValue::Unaddressable);
            assert_eq!(e.special_value(addr), Some(ShadowValue::Unaddressable));
        }
        assert_eq!(e.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ShadowConfig::default().with_guard_size(3);
        assert!(matches!(
            ShadowEngine::init(config),
            Err(ShadowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_set_byte_promotes_once() {
        let e = engine();
        e.set_byte(0x5000, ShadowValue::Defined).expect("set should succeed");
        e.set_byte(0x5001, ShadowValue::Undefined).expect("set should succeed");
        assert_eq!(e.get_byte(0x5000), ShadowValue::Defined);
        assert_eq!(e.get_byte(0x5001), ShadowValue::Undefined);
        assert_eq!(e.get_byte(0x5002), ShadowValue::Unaddressable);
        assert!(!e.is_special(0x5000));
        assert_eq!(e.stats().blocks_allocated, 1);
        assert_eq!(e.private_blocks(), 1);
    }

    #[test]
    fn test_matching_write_keeps_special() {
        let e = engine();
        e.set_byte(0x9000, ShadowValue::Unaddressable)
            .expect("set should succeed");
        e.set_dword(0x9000, ShadowValue::Unaddressable.byte_pattern())
            .expect("set should succeed");
        e.set_word(0x9002, 0x5).expect("set should succeed");
        assert!(e.is_special(0x9000));
        assert_eq!(e.stats().blocks_allocated, 0);
    }

    #[test]
    fn test_word_and_dword() {
        let e = engine();
        e.set_dword(0x100, 0x00).expect("set should succeed");
        assert_eq!(e.get_dword(0x103), 0x00);
        e.set_word(0x102, 0xf).expect("set should succeed");
        assert_eq!(e.get_word(0x102).expect("aligned"), 0xf);
        assert_eq!(e.get_word(0x100).expect("aligned"), 0x0);
        assert_eq!(e.get_byte(0x103), ShadowValue::Undefined);
        assert_eq!(e.get_dword(0x100), 0xf0);
    }

    #[test]
    fn test_alignment_errors() {
        let e = engine();
        assert!(matches!(
            e.set_dword(0x101, 0),
            Err(ShadowError::Misaligned { addr: 0x101, align: 4 })
        ));
        assert!(matches!(
            e.get_word(0x101),
            Err(ShadowError::Misaligned { align: 2, .. })
        ));
        assert!(e.get_dqword_state(0x108).is_err());
    }

    #[test]
    fn test_dqword_state() {
        let e = engine();
        assert_eq!(
            e.get_dqword_state(0x40).expect("aligned"),
            ShadowQuery::Uniform(ShadowValue::Unaddressable)
        );
        e.set_byte(0x45, ShadowValue::Defined).expect("set should succeed");
        assert_eq!(e.get_dqword_state(0x40).expect("aligned"), ShadowQuery::Mixed);
        assert_eq!(
            e.get_dqword_state(0x50).expect("aligned"),
            ShadowQuery::Uniform(ShadowValue::Unaddressable)
        );
    }

    #[test]
    fn test_translate_special_and_private() {
        let e = engine();
        let ptr = e.translate(0x2_0000);
        assert!(e.is_in_special_block(ptr.as_ptr()));

        let writable = e.replace_special(0x2_0010).expect("promotion should succeed");
        assert!(!e.is_in_special_block(writable.as_ptr()));
        assert_eq!(e.translate(0x2_0010), writable);
        assert_eq!(e.get_byte(0x2_0010), ShadowValue::Unaddressable);
        assert_eq!(unsafe { *writable.as_ptr() }, 0x55);
    }

    #[test]
    fn test_bitlevel_addr() {
        let e = engine();
        let ptr = e.bitlevel_addr();
        assert!(e.is_in_special_block(ptr.as_ptr()));
        assert_eq!(unsafe { *ptr.as_ptr() }, 0xaa);
        assert_eq!(unsafe { *ptr.as_ptr().sub(1) }, 0xaa);
        assert_eq!(e.block_size(), 0x4000);
    }

    #[test]
    fn test_access_checks_match_bytes() {
        for layout in [BlockLayout::Bitmap2, BlockLayout::Bytemap4to1] {
            let e = ShadowEngine::init(ShadowConfig::default().with_layout(layout))
                .expect("engine init should succeed");
            e.set_range(0x4000, 0x4010, ShadowValue::Undefined)
                .expect("set_range should succeed");
            e.set_byte(0x4002, ShadowValue::Defined).expect("set should succeed");
            e.set_byte(0x4003, ShadowValue::Defined).expect("set should succeed");
            e.set_byte(0x4005, ShadowValue::Unaddressable).expect("set should succeed");
            e.set_range(0x4008, 0x400c, ShadowValue::Defined)
                .expect("set_range should succeed");

            for size in [1u32, 2, 4] {
                for addr in (0x3ff0..0x4020).step_by(size as usize) {
                    let bytes: Vec<_> = (addr..addr + size).map(|a| e.get_byte(a)).collect();
                    assert_eq!(
                        e.is_access_defined(addr, size).expect("check should succeed"),
                        bytes.iter().all(|&v| v == ShadowValue::Defined),
                        "{} defined {addr:#x}/{size}",
                        layout.name()
                    );
                    assert_eq!(
                        e.is_access_addressable(addr, size).expect("check should succeed"),
                        bytes.iter().all(|v| v.is_addressable()),
                        "{} addressable {addr:#x}/{size}",
                        layout.name()
                    );
                }
            }
        }
    }

    #[test]
    fn test_access_check_bitmap_fields() {
        let e = engine();
        e.set_range(0x4000, 0x4008, ShadowValue::Undefined)
            .expect("set_range should succeed");
        e.set_byte(0x4002, ShadowValue::Defined).expect("set should succeed");
        e.set_byte(0x4003, ShadowValue::Defined).expect("set should succeed");
        e.set_byte(0x4005, ShadowValue::Unaddressable).expect("set should succeed");

        assert!(e.is_access_defined(0x4002, 2).expect("check should succeed"));
        assert!(!e.is_access_defined(0x4000, 2).expect("check should succeed"));
        assert!(!e.is_access_defined(0x4000, 4).expect("check should succeed"));
        assert!(e.is_access_addressable(0x4000, 4).expect("check should succeed"));
        assert!(!e.is_access_addressable(0x4004, 4).expect("check should succeed"));
        assert!(!e.is_access_addressable(0x4004, 2).expect("check should succeed"));
        assert!(e.is_access_addressable(0x4006, 2).expect("check should succeed"));
        assert!(!e.is_access_addressable(0x10_0000, 4).expect("check should succeed"));
    }

    #[test]
    fn test_access_check_rejects_bad_shape() {
        let e = engine();
        assert!(matches!(
            e.is_access_defined(0x4001, 2),
            Err(ShadowError::Misaligned { addr: 0x4001, align: 2 })
        ));
        assert!(matches!(
            e.is_access_addressable(0x4000, 3),
            Err(ShadowError::AccessSize(3))
        ));
    }

    #[test]
    fn test_bytemap_layout() {
        let config = ShadowConfig::default().with_layout(crate::BlockLayout::Bytemap4to1);
        let e = ShadowEngine::init(config).expect("engine init should succeed");
        e.set_byte(0x1001, ShadowValue::Defined).expect("set should succeed");
        assert_eq!(e.get_byte(0x1000), ShadowValue::Defined);
        assert_eq!(e.get_byte(0x1004), ShadowValue::Unaddressable);
        assert_eq!(e.get_dword(0x1000), 0x00);
        assert_eq!(e.get_dword(0x1004), 0x01);
    }

    #[test]
    fn test_thread_init_through_engine() {
        let e = engine();
        std::thread::scope(|s| {
            s.spawn(|| {
                let handle = e.thread_init();
                assert_eq!(handle.get_dword(Gpr::Ebx), 0x00);
                e.thread_exit();
            });
        });
        std::thread::scope(|s| {
            s.spawn(|| {
                let handle = e.thread_init();
                assert_eq!(handle.get_dword(Gpr::Ebx), 0xff);
                assert_eq!(handle.get_dword(Gpr::Esp), 0x00);
            });
        });
        assert_eq!(e.stats().threads_initialized, 2);
    }

    #[test]
    fn test_shutdown_reports_stats() {
        let e = engine();
        e.set_byte(0, ShadowValue::Defined).expect("set should succeed");
        let stats = e.shutdown();
        assert_eq!(stats.blocks_allocated, 1);
    }

    #[test]
    fn test_checked_end() {
        assert_eq!(checked_end(0xffff_fff0, 0x10).expect("in range"), ADDRESS_SPACE_END);
        assert!(matches!(
            checked_end(0xffff_fff0, 0x11),
            Err(ShadowError::RangeOverflow { .. })
        ));
    }
}
