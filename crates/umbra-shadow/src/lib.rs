//! Shadow memory engine for a 32-bit address space.
//!
//! Every application byte has a 2-bit [`ShadowValue`]. The address space is
//! split into 64 KiB units; a unit whose bytes all share one value points at
//! a shared read-only special block, and is promoted to a private block on
//! the first write that breaks uniformity. Range operations exploit both
//! representations to avoid per-byte work where they can.
//!
//! ```no_run
//! use umbra_shadow::{ShadowConfig, ShadowEngine, ShadowValue};
//!
//! let engine = ShadowEngine::init(ShadowConfig::default())?;
//! engine.set_range(0x1000, 0x2000, ShadowValue::Undefined)?;
//! assert!(engine.check_range(0x1000, 0x1000, ShadowValue::Undefined)?.is_match());
//! # Ok::<(), umbra_shadow::ShadowError>(())
//! ```

mod block;
mod config;
mod engine;
mod error;
mod memory;
pub mod metrics;
mod range;
pub mod register;
mod table;

pub use block::{
    ADDRESS_SPACE_END, BLOCK_SIZE, SHADOW_GRANULARITY, ShadowBlock, TABLE_ENTRIES, UNIT_BITS,
    UNIT_SIZE, unit_index, unit_offset,
};
pub use config::{BlockLayout, DEFAULT_GUARD_SIZE, ShadowConfig, default_thread_entry_defined};
pub use engine::ShadowEngine;
pub use error::{Result, ShadowError};
pub use memory::{BlockMemory, MemoryError};
pub use metrics::{ShadowStats, StatsSnapshot};
pub use range::{BadRun, LARGE_RANGE, RangeCheck};
pub use register::{Gpr, RegSize, RegisterShadowSet, ThreadShadow, is_register_defined};
pub use table::{ShadowTable, Slot};
pub use umbra_codec::{CodecError, ShadowQuery, ShadowValue};
