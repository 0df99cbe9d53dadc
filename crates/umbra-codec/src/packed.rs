//! Sub-byte field access for packed shadow bytes.
//!
//! A packed byte holds four 2-bit fields. Field `i` occupies bits
//! `2*i..2*i+2` and shadows the `i`-th byte of an aligned 4-byte group.

use crate::{CodecError, ShadowValue};

/// Number of 2-bit fields in a packed byte.
pub const FIELDS_PER_BYTE: u8 = 4;

/// Extract 2-bit field `field` (0..4).
#[inline]
pub const fn get_2bits(byte: u8, field: u8) -> ShadowValue {
    debug_assert!(field < FIELDS_PER_BYTE);
    ShadowValue::from_low_bits(byte >> (field * 2))
}

/// Replace 2-bit field `field` (0..4) with `value`.
#[inline]
pub const fn set_2bits(byte: u8, field: u8, value: ShadowValue) -> u8 {
    debug_assert!(field < FIELDS_PER_BYTE);
    let shift = field * 2;
    (byte & !(ShadowValue::MASK << shift)) | (value.code() << shift)
}

/// Extract the 4-bit field shadowing a 2-byte group; `field` is 0 or 2.
#[inline]
pub const fn get_4bits(byte: u8, field: u8) -> u8 {
    debug_assert!(field == 0 || field == 2);
    (byte >> (field * 2)) & 0xf
}

/// Replace the 4-bit field at `field` (0 or 2) with the low nibble of `nibble`.
#[inline]
pub const fn set_4bits(byte: u8, field: u8, nibble: u8) -> u8 {
    debug_assert!(field == 0 || field == 2);
    let shift = field * 2;
    (byte & !(0xf << shift)) | ((nibble & 0xf) << shift)
}

/// Convert a bit offset within a packed byte to a field index.
///
/// `width` is the field width in bits (2 or 4); the offset must be aligned to it.
pub const fn field_from_bit_offset(bit_offset: u8, width: u8) -> Result<u8, CodecError> {
    let valid = match width {
        2 => bit_offset < 8 && bit_offset % 2 == 0,
        4 => bit_offset == 0 || bit_offset == 4,
        _ => false,
    };
    if valid {
        Ok(bit_offset / 2)
    } else {
        Err(CodecError::InvalidField {
            field: bit_offset,
            width,
        })
    }
}
