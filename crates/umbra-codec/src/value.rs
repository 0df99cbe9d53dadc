//! The four per-byte shadow states and their packed patterns.

use std::fmt;

use crate::CodecError;

/// Shadow state of a single monitored byte.
///
/// The discriminants are the 2-bit codes stored in shadow memory and must not
/// be reordered: every pattern and lookup table is derived from them.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShadowValue {
    /// Addressable and initialized.
    Defined = 0,
    /// Not addressable: reads or writes here are errors.
    #[default]
    Unaddressable = 1,
    /// Partially defined; consult bit-level tracking.
    BitLevel = 2,
    /// Addressable but uninitialized.
    Undefined = 3,
}

impl ShadowValue {
    /// All values in code order.
    pub const ALL: [Self; 4] = [
        Self::Defined,
        Self::Unaddressable,
        Self::BitLevel,
        Self::Undefined,
    ];

    /// Number of bits per packed field.
    pub const BITS: u32 = 2;

    /// Mask of one packed field.
    pub const MASK: u8 = 0b11;

    /// Decode a 2-bit code.
    #[inline]
    pub const fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Self::Defined),
            1 => Ok(Self::Unaddressable),
            2 => Ok(Self::BitLevel),
            3 => Ok(Self::Undefined),
            _ => Err(CodecError::InvalidCode(code)),
        }
    }

    /// Decode the low two bits of `bits`, ignoring the rest.
    #[inline]
    pub const fn from_low_bits(bits: u8) -> Self {
        match bits & Self::MASK {
            0 => Self::Defined,
            1 => Self::Unaddressable,
            2 => Self::BitLevel,
            _ => Self::Undefined,
        }
    }

    /// The 2-bit code.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Packed byte shadowing 4 consecutive bytes of this value.
    #[inline]
    pub const fn byte_pattern(self) -> u8 {
        self.code() * 0x55
    }

    /// Packed `u16` shadowing 8 consecutive bytes of this value.
    #[inline]
    pub const fn word_pattern(self) -> u16 {
        self.code() as u16 * 0x5555
    }

    /// Packed `u32` shadowing 16 consecutive bytes of this value.
    #[inline]
    pub const fn dword_pattern(self) -> u32 {
        self.code() as u32 * 0x5555_5555
    }

    /// Inverse of [`Self::byte_pattern`]; `None` if the fields differ.
    pub const fn from_byte_pattern(pattern: u8) -> Option<Self> {
        let value = Self::from_low_bits(pattern);
        if value.byte_pattern() == pattern {
            Some(value)
        } else {
            None
        }
    }

    /// Inverse of [`Self::dword_pattern`]; `None` if the fields differ.
    pub const fn from_dword_pattern(pattern: u32) -> Option<Self> {
        let value = Self::from_low_bits(pattern as u8);
        if value.dword_pattern() == pattern {
            Some(value)
        } else {
            None
        }
    }

    /// True unless the value is [`ShadowValue::Unaddressable`].
    #[inline]
    pub const fn is_addressable(self) -> bool {
        !matches!(self, Self::Unaddressable)
    }

    /// Diagnostic name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Defined => "defined",
            Self::Unaddressable => "unaddressable",
            Self::BitLevel => "bitlevel",
            Self::Undefined => "undefined",
        }
    }
}

impl TryFrom<u8> for ShadowValue {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<ShadowValue> for u8 {
    fn from(value: ShadowValue) -> Self {
        value.code()
    }
}

impl fmt::Display for ShadowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a query over more than one byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowQuery {
    /// Every examined byte has this value.
    Uniform(ShadowValue),
    /// The examined bytes do not all agree.
    Mixed,
    /// Nothing was examined.
    Unknown,
}

impl ShadowQuery {
    /// Classify a packed 16-byte group.
    pub const fn from_dword_pattern(pattern: u32) -> Self {
        match ShadowValue::from_dword_pattern(pattern) {
            Some(value) => Self::Uniform(value),
            None => Self::Mixed,
        }
    }

    /// The uniform value, if any.
    pub const fn uniform(self) -> Option<ShadowValue> {
        match self {
            Self::Uniform(value) => Some(value),
            Self::Mixed | Self::Unknown => None,
        }
    }

    /// Fold one more byte's value into the query.
    #[must_use]
    pub const fn merge(self, value: ShadowValue) -> Self {
        match self {
            Self::Unknown => Self::Uniform(value),
            Self::Uniform(prev) if prev as u8 == value as u8 => self,
            Self::Uniform(_) | Self::Mixed => Self::Mixed,
        }
    }

    /// Diagnostic name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uniform(value) => value.name(),
            Self::Mixed => "mixed",
            Self::Unknown => "unknown",
        }
    }
}

impl From<ShadowValue> for ShadowQuery {
    fn from(value: ShadowValue) -> Self {
        Self::Uniform(value)
    }
}

impl fmt::Display for ShadowQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of a packed 16-byte pattern, or `"<mixed>"`.
pub const fn pattern_name(pattern: u32) -> &'static str {
    match ShadowValue::from_dword_pattern(pattern) {
        Some(value) => value.name(),
        None => "<mixed>",
    }
}
