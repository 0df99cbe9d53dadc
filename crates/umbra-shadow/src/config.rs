//! Engine configuration.

use umbra_codec::ShadowValue;

use crate::error::{Result, ShadowError};
use crate::register::Gpr;

/// Default number of guard bytes on each side of a block.
pub const DEFAULT_GUARD_SIZE: usize = 512;

/// How shadow bytes encode application bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockLayout {
    /// 2 bits per application byte, four fields per shadow byte.
    #[default]
    Bitmap2,
    /// One shadow byte per aligned 4-byte group, holding a single code.
    Bytemap4to1,
}

impl BlockLayout {
    /// Shadow byte for 4 application bytes that all hold `value`.
    #[inline]
    pub const fn uniform_byte(self, value: ShadowValue) -> u8 {
        match self {
            Self::Bitmap2 => value.byte_pattern(),
            Self::Bytemap4to1 => value.code(),
        }
    }

    /// Four shadow bytes (read little-endian) for 16 application bytes of `value`.
    #[inline]
    pub const fn uniform_dqword(self, value: ShadowValue) -> u32 {
        match self {
            Self::Bitmap2 => value.dword_pattern(),
            Self::Bytemap4to1 => value.code() as u32 * 0x0101_0101,
        }
    }

    /// Value of the application byte at `offset` given its shadow byte.
    #[inline]
    pub const fn decode(self, shadow: u8, offset: u32) -> ShadowValue {
        match self {
            Self::Bitmap2 => umbra_codec::get_2bits(shadow, (offset % 4) as u8),
            Self::Bytemap4to1 => ShadowValue::from_low_bits(shadow),
        }
    }

    /// Uniform value of a 16-byte group, if there is one.
    pub const fn dqword_value(self, dqword: u32) -> Option<ShadowValue> {
        let value = ShadowValue::from_low_bits(dqword as u8);
        if self.uniform_dqword(value) == dqword {
            Some(value)
        } else {
            None
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bitmap2 => "bitmap2",
            Self::Bytemap4to1 => "bytemap4to1",
        }
    }
}

/// Registers that start Defined on a thread other than the first.
///
/// On Linux the stack pointer and the clone return value are set by the kernel.
pub fn default_thread_entry_defined() -> Vec<Gpr> {
    if cfg!(target_os = "linux") {
        vec![Gpr::Esp, Gpr::Eax]
    } else {
        vec![Gpr::Esp]
    }
}

/// Shadow engine configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Shadow block encoding.
    pub layout: BlockLayout,
    /// Guard bytes on each side of every block. Non-zero multiple of 4.
    pub guard_size: usize,
    /// Registers Defined on entry of non-first threads.
    pub thread_entry_defined: Vec<Gpr>,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            layout: BlockLayout::default(),
            guard_size: DEFAULT_GUARD_SIZE,
            thread_entry_defined: default_thread_entry_defined(),
        }
    }
}

impl ShadowConfig {
    /// Set the block layout.
    #[must_use]
    pub const fn with_layout(mut self, layout: BlockLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the guard size.
    #[must_use]
    pub const fn with_guard_size(mut self, guard_size: usize) -> Self {
        self.guard_size = guard_size;
        self
    }

    /// Set the registers Defined on non-first thread entry.
    #[must_use]
    pub fn with_thread_entry_defined(mut self, regs: Vec<Gpr>) -> Self {
        self.thread_entry_defined = regs;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the guard size is zero or not a multiple of 4.
    pub fn validate(&self) -> Result<()> {
        if self.guard_size == 0 || self.guard_size % 4 != 0 {
            return Err(ShadowError::InvalidConfig(format!(
                "guard size must be a non-zero multiple of 4, got {}",
                self.guard_size
            )));
        }
        Ok(())
    }
}
