//! Range operations: bulk set, memmove-style copy, checks and searches.
//!
//! Each operation walks the range unit by unit and takes the widest step the
//! current slot allows: a whole unit when it is special, a run of shadow bytes
//! when it is private and aligned, and single bytes otherwise.

use std::cmp::min;

use tracing::{debug, trace, warn};
use umbra_codec::{ShadowQuery, ShadowValue};

use crate::block::{
    ADDRESS_SPACE_END, BLOCK_SIZE, SHADOW_GRANULARITY, UNIT_SIZE, unit_index, unit_offset,
};
use crate::engine::{ShadowEngine, check_align, checked_end};
use crate::error::{Result, ShadowError};
use crate::table::Slot;

/// Ranges larger than this are logged as suspicious.
pub const LARGE_RANGE: u64 = 0x1000_0000;

const GRANULARITY: u64 = SHADOW_GRANULARITY as u64;
const DQWORD: u64 = 16;

/// A maximal run of bytes sharing one unexpected value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BadRun {
    /// First byte of the run.
    pub start: u32,
    /// One past the last byte of the run, clamped to the checked range.
    pub end: u64,
    /// The value found in the run.
    pub value: ShadowValue,
}

/// Outcome of [`ShadowEngine::check_range`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeCheck {
    /// Every byte held the expected value.
    Match,
    /// The first run of bytes that did not.
    Mismatch(BadRun),
}

impl RangeCheck {
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    pub const fn bad_run(&self) -> Option<BadRun> {
        match self {
            Self::Match => None,
            Self::Mismatch(run) => Some(*run),
        }
    }
}

#[inline]
const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Address of a position already known to lie below the address-space end.
#[inline]
const fn addr(pos: u64) -> u32 {
    debug_assert!(pos < ADDRESS_SPACE_END);
    pos as u32
}

impl ShadowEngine {
    /// Set every byte in `[start, end)` to `value`.
    ///
    /// Whole unit-aligned units that are still special are switched to the
    /// matching special block without allocating.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is inverted or runs past the address
    /// space, or if a block allocation fails.
    pub fn set_range(&self, start: u32, end: u64, value: ShadowValue) -> Result<()> {
        let begin = u64::from(start);
        if end < begin {
            return Err(ShadowError::InvalidRange { start: begin, end });
        }
        checked_end(start, end - begin)?;
        if end - begin > LARGE_RANGE {
            warn!(start, end, value = %value, "set_range over an unusually large range");
        }
        debug!(start, end, value = %value, "set_range");

        let mut pos = begin;
        while pos < end {
            let at = addr(pos);
            let unit = unit_index(at);
            let offset = u64::from(unit_offset(at));
            match self.table.resolve(unit) {
                Slot::Special(_) if offset == 0 && end - pos >= UNIT_SIZE => {
                    if self.table.set_special(unit, value, &self.stats) {
                        pos += UNIT_SIZE;
                    }
                    // Otherwise the slot went private; retry on the block.
                    continue;
                }
                Slot::Private(block) if pos % GRANULARITY == 0 => {
                    let unit_end = pos - offset + UNIT_SIZE;
                    let run_end = align_down(min(unit_end, end), GRANULARITY);
                    if run_end > pos {
                        let len = run_end - pos;
                        block.fill_run(offset as u32, len as u32, value);
                        self.stats.record_bulk_fill(len);
                        trace!(start = pos, end = run_end, "bulk fill");
                        pos = run_end;
                        continue;
                    }
                }
                _ => {}
            }
            self.set_byte(at, value)?;
            pos += 1;
        }
        Ok(())
    }

    /// Copy the shadow of `[src, src + size)` to `[dst, dst + size)`.
    ///
    /// Overlapping ranges behave like `memmove`. Unit-aligned units that are
    /// special on both sides are copied by switching the destination slot.
    ///
    /// # Errors
    ///
    /// Returns an error if either range runs past the address space or a
    /// block allocation fails.
    pub fn copy_range(&self, src: u32, dst: u32, size: u64) -> Result<()> {
        checked_end(src, size)?;
        checked_end(dst, size)?;
        if size == 0 || src == dst {
            return Ok(());
        }
        debug!(src, dst, size, "copy_range");

        let src = u64::from(src);
        let dst = u64::from(dst);
        if dst > src && dst < src + size {
            let mut pos = size;
            while pos > 0 {
                if pos >= UNIT_SIZE && self.copy_unit(src + pos - UNIT_SIZE, dst + pos - UNIT_SIZE)
                {
                    pos -= UNIT_SIZE;
                    continue;
                }
                pos -= 1;
                self.copy_byte(src + pos, dst + pos)?;
            }
        } else {
            let mut pos = 0;
            while pos < size {
                if size - pos >= UNIT_SIZE && self.copy_unit(src + pos, dst + pos) {
                    pos += UNIT_SIZE;
                    continue;
                }
                self.copy_byte(src + pos, dst + pos)?;
                pos += 1;
            }
        }
        Ok(())
    }

    /// Share a special source unit with a special destination unit.
    ///
    /// Both positions must start a unit. Returns false if either slot is
    /// private, leaving the caller to copy byte by byte.
    fn copy_unit(&self, src: u64, dst: u64) -> bool {
        if src % UNIT_SIZE != 0 || dst % UNIT_SIZE != 0 {
            return false;
        }
        let dst_unit = unit_index(addr(dst));
        match (self.slot(addr(src)), self.table.resolve(dst_unit)) {
            (Slot::Special(value), Slot::Special(_)) => {
                self.table.set_special(dst_unit, value, &self.stats)
            }
            _ => false,
        }
    }

    fn copy_byte(&self, src: u64, dst: u64) -> Result<()> {
        self.set_byte(addr(dst), self.get_byte(addr(src)))
    }

    /// Check that every byte of `[start, start + size)` holds `expect`.
    ///
    /// On mismatch, reports the first bad byte and extends the run while the
    /// bytes keep the same bad value. A zero-length range matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the range runs past the address space.
    pub fn check_range(&self, start: u32, size: u64, expect: ShadowValue) -> Result<RangeCheck> {
        let end = checked_end(start, size)?;
        let layout = self.layout();
        let mut bad: Option<(u64, ShadowValue)> = None;
        let mut pos = u64::from(start);

        while pos < end {
            let at = addr(pos);
            let (value, step) = if pos % DQWORD == 0 {
                match self.slot(at) {
                    Slot::Special(value) => (value, UNIT_SIZE - u64::from(unit_offset(at))),
                    Slot::Private(block) => {
                        let offset = unit_offset(at);
                        match layout.dqword_value(block.get_dqword(offset)) {
                            Some(value) => (value, DQWORD),
                            None => (block.get_byte(offset), 1),
                        }
                    }
                }
            } else {
                (self.get_byte(at), 1)
            };

            match bad {
                Some((bad_start, bad_value)) if value != bad_value => {
                    return Ok(RangeCheck::Mismatch(BadRun {
                        start: addr(bad_start),
                        end: pos,
                        value: bad_value,
                    }));
                }
                None if value != expect => bad = Some((pos, value)),
                _ => {}
            }
            pos += step;
        }

        Ok(match bad {
            None => RangeCheck::Match,
            Some((bad_start, value)) => RangeCheck::Mismatch(BadRun {
                start: addr(bad_start),
                end: min(pos, end),
                value,
            }),
        })
    }

    /// Check `size` bytes downward from `start`: `start, start - 1, ...`.
    ///
    /// Returns the first (highest) byte not holding `expect`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` if the range would go below address 0.
    pub fn check_range_backward(
        &self,
        start: u32,
        size: u64,
        expect: ShadowValue,
    ) -> Result<Option<u32>> {
        let top = u64::from(start);
        if size > top {
            return Err(ShadowError::InvalidRange {
                start: top,
                end: top.wrapping_sub(size),
            });
        }
        let mut pos = top;
        while pos > top - size {
            let at = addr(pos);
            if self.get_byte(at) != expect {
                return Ok(Some(at));
            }
            pos -= 1;
        }
        Ok(None)
    }

    /// Lowest 4-aligned address in `[start, end)` whose group is uniformly `expect`.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `start` is 4-aligned, or an error if the
    /// range is inverted or runs past the address space.
    pub fn find_next_matching_dword(
        &self,
        start: u32,
        end: u64,
        expect: ShadowValue,
    ) -> Result<Option<u32>> {
        check_align(start, SHADOW_GRANULARITY)?;
        let begin = u64::from(start);
        if end < begin {
            return Err(ShadowError::InvalidRange { start: begin, end });
        }
        checked_end(start, end - begin)?;

        let target = self.layout().uniform_byte(expect);
        let mut pos = begin;
        while pos < end {
            let at = addr(pos);
            let offset = u64::from(unit_offset(at));
            match self.slot(at) {
                Slot::Special(value) if value == expect => return Ok(Some(at)),
                Slot::Special(_) => {}
                Slot::Private(block) => {
                    let first = (offset / GRANULARITY) as usize;
                    if let Some(index) =
                        (first..BLOCK_SIZE).find(|&index| block.shadow_byte(index) == target)
                    {
                        let found = pos + (index - first) as u64 * GRANULARITY;
                        return Ok((found < end).then(|| addr(found)));
                    }
                }
            }
            pos = pos - offset + UNIT_SIZE;
        }
        Ok(None)
    }

    /// Highest 4-aligned address in `(end, start]` whose group is uniformly `expect`.
    ///
    /// A search that fails within a private unit resumes at the last group of
    /// the unit below.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` unless `start` is 4-aligned, or `InvalidRange`
    /// unless `end < start`.
    pub fn find_prev_matching_dword(
        &self,
        start: u32,
        end: u32,
        expect: ShadowValue,
    ) -> Result<Option<u32>> {
        check_align(start, SHADOW_GRANULARITY)?;
        if end >= start {
            return Err(ShadowError::InvalidRange {
                start: u64::from(start),
                end: u64::from(end),
            });
        }

        let target = self.layout().uniform_byte(expect);
        let floor = u64::from(end);
        let mut pos = u64::from(start);
        while pos > floor {
            let at = addr(pos);
            let offset = u64::from(unit_offset(at));
            match self.slot(at) {
                Slot::Special(value) if value == expect => return Ok(Some(at)),
                Slot::Special(_) => {}
                Slot::Private(block) => {
                    let first = (offset / GRANULARITY) as usize;
                    if let Some(index) = (0..=first)
                        .rev()
                        .find(|&index| block.shadow_byte(index) == target)
                    {
                        let found = pos - (first - index) as u64 * GRANULARITY;
                        return Ok((found > floor).then(|| addr(found)));
                    }
                }
            }
            let unit_start = pos - offset;
            if unit_start == 0 {
                break;
            }
            pos = unit_start - GRANULARITY;
        }
        Ok(None)
    }

    /// Composite state of `[start, start + size)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range runs past the address space.
    pub fn range_state(&self, start: u32, size: u64) -> Result<ShadowQuery> {
        if size == 0 {
            checked_end(start, 0)?;
            return Ok(ShadowQuery::Unknown);
        }
        let first = self.get_byte(start);
        Ok(match self.check_range(start, size, first)? {
            RangeCheck::Match => ShadowQuery::Uniform(first),
            RangeCheck::Mismatch(_) => ShadowQuery::Mixed,
        })
    }
}
