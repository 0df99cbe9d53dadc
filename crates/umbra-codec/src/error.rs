use thiserror::Error;

/// Codec errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid shadow value code: {0}")]
    InvalidCode(u8),
    #[error("invalid packed field index {field} for width {width}")]
    InvalidField { field: u8, width: u8 },
}
