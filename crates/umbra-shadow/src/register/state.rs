//! The `#[repr(C)]` register shadow record.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;
use umbra_codec::{ShadowValue, get_2bits, set_2bits, set_4bits};

use super::{Gpr, NUM_GPRS, RegSize};

/// Offset of the flags shadow within the record.
pub const FLAGS_OFFSET: usize = offset_of!(RegisterShadowSet, flags);
/// Offset of the reentrancy marker within the record.
pub const REENTRANCY_OFFSET: usize = offset_of!(RegisterShadowSet, reentrancy);

/// Byte offset of `reg`'s packed shadow within [`RegisterShadowSet`].
#[inline]
pub const fn slot_offset(reg: Gpr) -> usize {
    offset_of!(RegisterShadowSet, gprs) + reg.index()
}

/// Shadow state of one thread's registers.
///
/// Layout (12 bytes):
/// - `gprs`: packed shadow per register, `Gpr` order
/// - `flags`: flags shadow
/// - `reentrancy`: non-zero while the thread is inside a heap routine
#[repr(C)]
#[derive(Debug)]
pub struct RegisterShadowSet {
    gprs: [AtomicU8; NUM_GPRS],
    flags: AtomicU8,
    reentrancy: AtomicU8,
    _pad: [u8; 2],
}

impl RegisterShadowSet {
    /// Build a record for a new thread.
    ///
    /// The first thread starts fully Defined. Later threads start Undefined
    /// except for the registers in `entry_defined`.
    pub fn new(is_first: bool, entry_defined: &[Gpr]) -> Self {
        let set = Self {
            gprs: Default::default(),
            flags: AtomicU8::new(0),
            reentrancy: AtomicU8::new(0),
            _pad: [0; 2],
        };
        set.reset(is_first, entry_defined);
        set
    }

    /// Reinitialize in place.
    pub fn reset(&self, is_first: bool, entry_defined: &[Gpr]) {
        let defined = ShadowValue::Defined.byte_pattern();
        if is_first {
            for reg in &self.gprs {
                reg.store(defined, Ordering::Relaxed);
            }
            self.flags.store(ShadowValue::Defined.code(), Ordering::Relaxed);
        } else {
            let undefined = ShadowValue::Undefined.byte_pattern();
            for reg in &self.gprs {
                reg.store(undefined, Ordering::Relaxed);
            }
            for reg in entry_defined {
                self.gprs[reg.index()].store(defined, Ordering::Relaxed);
            }
            self.flags.store(ShadowValue::Undefined.code(), Ordering::Relaxed);
        }
        self.reentrancy.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn gpr(&self, reg: Gpr) -> &AtomicU8 {
        &self.gprs[reg.index()]
    }

    /// Packed shadow of the low `size` bytes of `reg`.
    #[inline]
    pub fn get(&self, reg: Gpr, size: RegSize) -> u8 {
        self.gpr(reg).load(Ordering::Relaxed) & size.mask()
    }

    /// Value of byte `byte_index` (0..4) of `reg`.
    pub fn get_byte(&self, reg: Gpr, byte_index: u8) -> ShadowValue {
        get_2bits(self.gpr(reg).load(Ordering::Relaxed), byte_index)
    }

    /// Packed shadow of the low word of `reg`.
    pub fn get_word(&self, reg: Gpr) -> u8 {
        self.get(reg, RegSize::Word)
    }

    /// Packed shadow of all of `reg`.
    pub fn get_dword(&self, reg: Gpr) -> u8 {
        self.get(reg, RegSize::Dword)
    }

    /// Set byte `byte_index` (0..4) of `reg`.
    pub fn set_byte(&self, reg: Gpr, byte_index: u8, value: ShadowValue) {
        debug_assert!(byte_index < 4);
        let _ = self
            .gpr(reg)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |packed| {
                Some(set_2bits(packed, byte_index, value))
            });
    }

    /// Set the low word of `reg` from a packed nibble.
    pub fn set_word(&self, reg: Gpr, packed: u8) {
        let _ = self
            .gpr(reg)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(set_4bits(current, 0, packed))
            });
    }

    /// Replace the whole packed shadow of `reg`.
    pub fn set_dword(&self, reg: Gpr, packed: u8) {
        self.gpr(reg).store(packed, Ordering::Relaxed);
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, packed: u8) {
        self.flags.store(packed, Ordering::Relaxed);
    }

    pub fn reentrancy(&self) -> u8 {
        self.reentrancy.load(Ordering::Relaxed)
    }

    pub fn set_reentrancy(&self, value: u8) {
        self.reentrancy.store(value, Ordering::Relaxed);
    }

    /// Pointer to the record, for generated code using [`slot_offset`].
    pub fn as_ptr(&self) -> *const u8 {
        std::ptr::from_ref(self).cast()
    }

    /// Log every register's packed shadow.
    pub fn log(&self) {
        for reg in Gpr::ALL {
            debug!(reg = reg.name(), shadow = self.get_dword(reg), "register shadow");
        }
        debug!(flags = self.flags(), reentrancy = self.reentrancy(), "flags shadow");
    }
}
