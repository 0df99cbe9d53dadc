//! Per-thread shadow state of the general-purpose registers.
//!
//! Each monitored thread owns one [`RegisterShadowSet`]: a packed shadow byte
//! per 32-bit register (four 2-bit fields, one per register byte), the flags
//! shadow and a reentrancy marker. Generated code addresses the record by
//! [`slot_offset`], so its layout is fixed with `#[repr(C)]`.

mod state;
mod thread;

pub use state::*;
pub use thread::*;

use std::fmt;

/// Number of shadowed general-purpose registers.
pub const NUM_GPRS: usize = 8;

/// A 32-bit general-purpose register, in encoding order.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Self; NUM_GPRS] = [
        Self::Eax,
        Self::Ecx,
        Self::Edx,
        Self::Ebx,
        Self::Esp,
        Self::Ebp,
        Self::Esi,
        Self::Edi,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        if index < NUM_GPRS {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Eax => "eax",
            Self::Ecx => "ecx",
            Self::Edx => "edx",
            Self::Ebx => "ebx",
            Self::Esp => "esp",
            Self::Ebp => "ebp",
            Self::Esi => "esi",
            Self::Edi => "edi",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Width of a sub-register read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegSize {
    /// Low byte (al): one 2-bit field.
    Byte,
    /// Low word (ax): two fields.
    Word,
    /// Whole register: all four fields.
    Dword,
}

impl RegSize {
    /// Mask selecting the fields covered by this width.
    #[inline]
    pub const fn mask(self) -> u8 {
        match self {
            Self::Byte => 0x03,
            Self::Word => 0x0f,
            Self::Dword => 0xff,
        }
    }

    /// Width in bytes.
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }
}

/// A packed register shadow is fully defined only when every field is Defined.
#[inline]
pub const fn is_register_defined(packed: u8) -> bool {
    packed == 0
}
