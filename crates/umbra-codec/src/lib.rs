//! Shadow value encoding for the umbra shadow-memory engine.
//!
//! Every byte of the monitored address space carries one of four states,
//! packed two bits at a time. This crate owns that encoding: the value type,
//! its uniform fill patterns, sub-byte field helpers, and the 256-entry
//! classification tables used by hot scanning loops.
//!
//! The tables are generated at compile time from the codec rather than
//! written out by hand.

mod error;
mod packed;
pub mod tables;
mod value;

pub use error::*;
pub use packed::*;
pub use value::*;
