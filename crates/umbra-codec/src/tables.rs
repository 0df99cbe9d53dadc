//! Classification tables indexed by a packed shadow byte.
//!
//! Table lookup is the cheapest way to classify packed fields inside scanning
//! loops: one indexed load replaces a shift/mask/compare sequence. Each table
//! is generated at compile time from the codec in [`crate::value`].
//!
//! Tables with a leading `[4]` dimension are indexed by field number (the bit
//! offset divided by two). 4-bit tables only have meaningful rows 0 and 2;
//! rows 1 and 3 describe unaligned 2-byte groups and are all `false`.

use crate::ShadowValue;

const fn field(byte: u8, index: u8) -> u8 {
    (byte >> (index * 2)) & ShadowValue::MASK
}

const DEFINED: u8 = ShadowValue::Defined.code();
const UNADDRESSABLE: u8 = ShadowValue::Unaddressable.code();
const UNDEFINED: u8 = ShadowValue::Undefined.code();

#[derive(Clone, Copy)]
enum Pred {
    Defined,
    Addressable,
    AddrNotBit,
}

impl Pred {
    const fn test(self, code: u8) -> bool {
        match self {
            Self::Defined => code == DEFINED,
            Self::Addressable => code != UNADDRESSABLE,
            Self::AddrNotBit => code == DEFINED || code == UNDEFINED,
        }
    }
}

const fn build_byte_table(pred: Pred) -> [[bool; 256]; 4] {
    let mut table = [[false; 256]; 4];
    let mut f = 0;
    while f < 4 {
        let mut b = 0;
        while b < 256 {
            table[f][b] = pred.test(field(b as u8, f as u8));
            b += 1;
        }
        f += 1;
    }
    table
}

const fn build_word_table(pred: Pred) -> [[bool; 256]; 4] {
    let mut table = [[false; 256]; 4];
    let mut f = 0;
    while f < 4 {
        let mut b = 0;
        while b < 256 {
            let byte = b as u8;
            let index = f as u8;
            table[f][b] = pred.test(field(byte, index)) && pred.test(field(byte, index + 1));
            b += 1;
        }
        f += 2;
    }
    table
}

const fn build_dword_table(pred: Pred) -> [bool; 256] {
    let mut table = [false; 256];
    let mut b = 0;
    while b < 256 {
        let byte = b as u8;
        table[b] = pred.test(field(byte, 0))
            && pred.test(field(byte, 1))
            && pred.test(field(byte, 2))
            && pred.test(field(byte, 3));
        b += 1;
    }
    table
}

/// `BYTE_DEFINED[f][b]`: field `f` of `b` is Defined.
pub static BYTE_DEFINED: [[bool; 256]; 4] = build_byte_table(Pred::Defined);

/// `BYTE_ADDRESSABLE[f][b]`: field `f` of `b` is not Unaddressable.
pub static BYTE_ADDRESSABLE: [[bool; 256]; 4] = build_byte_table(Pred::Addressable);

/// `BYTE_ADDR_NOT_BIT[f][b]`: field `f` of `b` is Defined or Undefined.
pub static BYTE_ADDR_NOT_BIT: [[bool; 256]; 4] = build_byte_table(Pred::AddrNotBit);

/// `WORD_DEFINED[f][b]`: the 4-bit field starting at field `f` is all Defined.
pub static WORD_DEFINED: [[bool; 256]; 4] = build_word_table(Pred::Defined);

/// `WORD_ADDR_NOT_BIT[f][b]`: both 2-bit fields of the 4-bit field at `f`
/// are Defined or Undefined.
pub static WORD_ADDR_NOT_BIT: [[bool; 256]; 4] = build_word_table(Pred::AddrNotBit);

/// No field of the byte is Unaddressable.
pub static DWORD_IS_ADDRESSABLE: [bool; 256] = build_dword_table(Pred::Addressable);

/// Every field of the byte is Defined or Undefined.
pub static DWORD_IS_ADDR_NOT_BIT: [bool; 256] = build_dword_table(Pred::AddrNotBit);

const fn build_expand_2() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut b = 0;
    while b < 256 {
        let byte = b as u8;
        let mut nonzero = 0;
        let mut code = 0;
        let mut f = 0;
        while f < 4 {
            if field(byte, f) != 0 {
                nonzero += 1;
                code = field(byte, f);
            }
            f += 1;
        }
        if nonzero == 1 {
            table[b] = code * 0x55;
        }
        b += 1;
    }
    table
}

/// Sign-extend a 2-byte packed nibble to 4 bytes: the upper field repeats.
const fn extend_nibble(nibble: u8) -> u8 {
    let high = (nibble >> 2) & ShadowValue::MASK;
    nibble | (high << 4) | (high << 6)
}

const fn build_expand_4() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut b = 0;
    while b < 256 {
        let low = (b & 0xf) as u8;
        let high = (b >> 4) as u8;
        table[b] = if high == 0 {
            extend_nibble(low)
        } else if low == 0 {
            extend_nibble(high)
        } else {
            ShadowValue::BitLevel.byte_pattern()
        };
        b += 1;
    }
    table
}

/// Broadcast the single non-zero field of a byte to all four fields.
///
/// Bytes with zero or several non-zero fields map to 0.
pub static EXPAND_2_TO_DWORD: [u8; 256] = build_expand_2();

/// Extend a 4-bit field (stored in either nibble) to a full byte,
/// propagating its upper 2-bit field. Both nibbles set is an error and
/// maps to the BitLevel pattern.
pub static EXPAND_4_TO_DWORD: [u8; 256] = build_expand_4();

/// Field `field` of `byte` is Defined.
#[inline]
pub fn byte_defined(byte: u8, field: u8) -> bool {
    BYTE_DEFINED[usize::from(field)][usize::from(byte)]
}

/// Field `field` of `byte` is addressable.
#[inline]
pub fn byte_addressable(byte: u8, field: u8) -> bool {
    BYTE_ADDRESSABLE[usize::from(field)][usize::from(byte)]
}

/// The 4-bit field at `field` of `byte` is Defined.
#[inline]
pub fn word_defined(byte: u8, field: u8) -> bool {
    WORD_DEFINED[usize::from(field)][usize::from(byte)]
}
