use thiserror::Error;
use umbra_codec::CodecError;

use crate::memory::MemoryError;

/// Shadow engine errors.
#[derive(Error, Debug)]
pub enum ShadowError {
    #[error("shadow block allocation failed: {0}")]
    Alloc(#[from] MemoryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("address {addr:#x} is not {align}-byte aligned")]
    Misaligned { addr: u32, align: u32 },
    #[error("range at {start:#x} of {len:#x} bytes runs past the address space")]
    RangeOverflow { start: u32, len: u64 },
    #[error("invalid range [{start:#x}, {end:#x})")]
    InvalidRange { start: u64, end: u64 },
    #[error("unsupported access size {0}")]
    AccessSize(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ShadowError>;
