//! The shadow table: one slot per 64 KiB unit of the address space.
//!
//! A slot either names one of the four shared special blocks (a unit whose
//! bytes all hold the same value) or owns a private block. Slots are read
//! lock-free; every slot mutation happens under the mapping lock. A private
//! block is set once and never taken back, so a `&ShadowBlock` handed out by
//! [`ShadowTable::resolve`] remains valid for the table's life.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};
use umbra_codec::ShadowValue;

use crate::block::{ShadowBlock, TABLE_ENTRIES};
use crate::config::BlockLayout;
use crate::memory::MemoryError;
use crate::metrics::ShadowStats;

/// Storage for one unit.
///
/// `special` is meaningful only while `private` is unset.
struct UnitSlot {
    special: AtomicU8,
    private: OnceLock<Box<ShadowBlock>>,
}

impl UnitSlot {
    const fn new(value: ShadowValue) -> Self {
        Self {
            special: AtomicU8::new(value.code()),
            private: OnceLock::new(),
        }
    }
}

/// Decoded slot contents.
#[derive(Clone, Copy)]
pub enum Slot<'a> {
    Special(ShadowValue),
    Private(&'a ShadowBlock),
}

impl Slot<'_> {
    pub const fn is_special(&self) -> bool {
        matches!(self, Self::Special(_))
    }

    pub const fn special_value(&self) -> Option<ShadowValue> {
        match self {
            Self::Special(value) => Some(*value),
            Self::Private(_) => None,
        }
    }
}

pub struct ShadowTable {
    slots: Box<[UnitSlot]>,
    specials: [ShadowBlock; 4],
    lock: Mutex<()>,
    layout: BlockLayout,
    guard_size: usize,
}

impl ShadowTable {
    /// Create the special blocks and point every slot at Unaddressable.
    ///
    /// # Errors
    ///
    /// Returns an error if a special block cannot be mapped or sealed.
    pub fn new(layout: BlockLayout, guard_size: usize) -> Result<Self, MemoryError> {
        let special = |value: ShadowValue| {
            debug!(value = %value, layout = layout.name(), "creating special block");
            ShadowBlock::new_special(layout, guard_size, value)
        };
        let specials = [
            special(ShadowValue::Defined)?,
            special(ShadowValue::Unaddressable)?,
            special(ShadowValue::BitLevel)?,
            special(ShadowValue::Undefined)?,
        ];
        let slots = (0..TABLE_ENTRIES)
            .map(|_| UnitSlot::new(ShadowValue::Unaddressable))
            .collect();

        Ok(Self {
            slots,
            specials,
            lock: Mutex::new(()),
            layout,
            guard_size,
        })
    }

    pub const fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// The shared block for `value`.
    pub const fn special_block(&self, value: ShadowValue) -> &ShadowBlock {
        &self.specials[value.code() as usize]
    }

    pub fn specials(&self) -> &[ShadowBlock; 4] {
        &self.specials
    }

    /// Start of the slot array. The slot layout is private to this module.
    pub fn slots_ptr(&self) -> *const () {
        self.slots.as_ptr().cast()
    }

    /// Current contents of slot `unit`.
    #[inline]
    pub fn resolve(&self, unit: usize) -> Slot<'_> {
        let slot = &self.slots[unit];
        match slot.private.get() {
            Some(block) => Slot::Private(block),
            None => Slot::Special(ShadowValue::from_low_bits(
                slot.special.load(Ordering::Acquire),
            )),
        }
    }

    /// Block backing slot `unit`, special or private.
    #[inline]
    pub fn block(&self, unit: usize) -> &ShadowBlock {
        match self.resolve(unit) {
            Slot::Special(value) => self.special_block(value),
            Slot::Private(block) => block,
        }
    }

    /// Point a special slot at the special block for `value`.
    ///
    /// Returns false, changing nothing, if the slot is private by the time
    /// the lock is held. The caller then falls back to private-block writes.
    pub fn set_special(&self, unit: usize, value: ShadowValue, stats: &ShadowStats) -> bool {
        if !self.resolve(unit).is_special() {
            return false;
        }
        let _guard = self.lock.lock();
        let slot = &self.slots[unit];
        if slot.private.get().is_some() {
            return false;
        }
        slot.special.store(value.code(), Ordering::Release);
        stats.record_special_swap(value);
        trace!(unit, value = %value, "slot set special");
        true
    }

    /// Make slot `unit` private, preserving its uniform value.
    ///
    /// The block is allocated and filled outside the lock. If another thread
    /// promoted the slot first the fresh block is dropped and the winner's
    /// block returned; if the uniform value changed meanwhile the fresh block
    /// is refilled before it is published.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be mapped.
    pub fn promote(&self, unit: usize, stats: &ShadowStats) -> Result<&ShadowBlock, MemoryError> {
        let prior = match self.resolve(unit) {
            Slot::Private(block) => return Ok(block),
            Slot::Special(value) => value,
        };

        let mut fresh = Box::new(ShadowBlock::new(self.layout, self.guard_size, prior)?);

        let slot = &self.slots[unit];
        let guard = self.lock.lock();
        if let Some(existing) = slot.private.get() {
            drop(guard);
            stats.record_race_lost();
            debug!(unit, "promotion race lost, discarding block");
            return Ok(existing);
        }
        let current = ShadowValue::from_low_bits(slot.special.load(Ordering::Acquire));
        if current != prior {
            fresh.refill(current);
        }
        // Every set happens under the lock, so the slot is still empty here.
        let block = slot.private.get_or_init(|| fresh);
        drop(guard);
        stats.record_block_allocated();
        debug!(unit, value = %current, "promoted unit to private block");
        Ok(block)
    }

    /// Number of private slots.
    pub fn private_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.private.get().is_some())
            .count()
    }
}
