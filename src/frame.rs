/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Stack frame slots for spilled values.

use crate::{AllocError, FxHashMap, SlotWidth, SpillSlot, Value};
use std::collections::BTreeSet;

/// Assigns and reclaims frame slots.
///
/// Free slots are kept per width and are only ever handed out again at
/// the width they were allocated with, so a double-width slot never
/// aliases two single-width ones. Words skipped to align a
/// double-width slot go on the single-width free list.
#[derive(Clone, Debug)]
pub struct FrameManager {
    bindings: FxHashMap<Value, SpillSlot>,
    free: [BTreeSet<usize>; 2],
    hints: FxHashMap<Value, usize>,
    depth: usize,
    limit: usize,
}

fn bucket(width: SlotWidth) -> usize {
    width as usize - 1
}

impl FrameManager {
    /// A frame that may grow to `limit` words.
    pub fn new(limit: usize) -> Self {
        FrameManager {
            bindings: FxHashMap::default(),
            free: [BTreeSet::new(), BTreeSet::new()],
            hints: FxHashMap::default(),
            depth: 0,
            limit,
        }
    }

    /// High-water mark, in words.
    pub fn frame_depth(&self) -> usize {
        self.depth
    }

    pub fn slot_of(&self, value: Value) -> Option<SpillSlot> {
        self.bindings.get(&value).copied()
    }

    pub fn bound_values(&self) -> impl Iterator<Item = (Value, SpillSlot)> + '_ {
        self.bindings.iter().map(|(&v, &s)| (v, s))
    }

    /// Prefer `index` the next time `value` is spilled.
    pub fn hint(&mut self, value: Value, index: usize) {
        self.hints.insert(value, index);
    }

    /// Return the slot bound to `value`, allocating one if needed: the
    /// hinted slot when it is available, else the lowest free slot of
    /// the right width, else a new one at the top of the frame.
    pub fn spill(&mut self, value: Value, width: SlotWidth) -> Result<SpillSlot, AllocError> {
        if let Some(slot) = self.slot_of(value) {
            debug_assert_eq!(slot.width(), width);
            return Ok(slot);
        }
        let slot = match self.take_hinted(value, width)? {
            Some(slot) => slot,
            None => match self.free[bucket(width)].pop_first() {
                Some(index) => SpillSlot::new(index, width),
                None => self.grow(width)?,
            },
        };
        trace!("frame: {} -> {}", value, slot);
        self.bindings.insert(value, slot);
        Ok(slot)
    }

    fn take_hinted(
        &mut self,
        value: Value,
        width: SlotWidth,
    ) -> Result<Option<SpillSlot>, AllocError> {
        let Some(index) = self.hints.remove(&value) else {
            return Ok(None);
        };
        if width == SlotWidth::Double && index % 2 != 0 {
            return Ok(None);
        }
        if self.free[bucket(width)].remove(&index) {
            return Ok(Some(SpillSlot::new(index, width)));
        }
        if index >= self.depth {
            self.reserve(index)?;
            let slot = SpillSlot::new(index, width);
            self.set_depth(slot.end())?;
            return Ok(Some(slot));
        }
        Ok(None)
    }

    fn grow(&mut self, width: SlotWidth) -> Result<SpillSlot, AllocError> {
        if width == SlotWidth::Double && self.depth % 2 != 0 {
            self.free[bucket(SlotWidth::Single)].insert(self.depth);
            self.depth += 1;
        }
        let slot = SpillSlot::new(self.depth, width);
        self.set_depth(slot.end())?;
        Ok(slot)
    }

    /// Grow the frame to `depth` words, making the new words free
    /// single-width slots.
    pub fn reserve(&mut self, depth: usize) -> Result<(), AllocError> {
        if depth > self.depth {
            let old = self.depth;
            self.set_depth(depth)?;
            self.free[bucket(SlotWidth::Single)].extend(old..depth);
        }
        Ok(())
    }

    fn set_depth(&mut self, depth: usize) -> Result<(), AllocError> {
        if depth > self.limit {
            return Err(AllocError::FrameOverflow {
                depth,
                limit: self.limit,
            });
        }
        self.depth = self.depth.max(depth);
        Ok(())
    }

    /// Bind `value` to a given slot, e.g. where the caller left it on
    /// entry.
    pub fn bind(&mut self, value: Value, slot: SpillSlot) -> Result<(), AllocError> {
        if let Some((other, _)) = self
            .bindings
            .iter()
            .find(|(_, s)| s.overlaps(slot))
        {
            return Err(AllocError::InvariantViolation(format!(
                "{} bound to {} which overlaps the slot of {}",
                value, slot, other
            )));
        }
        self.reserve(slot.index())?;
        self.set_depth(slot.end())?;
        let words = slot.index()..slot.end();
        for w in words.clone() {
            self.free[bucket(SlotWidth::Single)].remove(&w);
            let d = w & !1;
            if self.free[bucket(SlotWidth::Double)].remove(&d) {
                // Whatever the binding leaves of a free double is single.
                for rest in (d..d + 2).filter(|r| !words.contains(r)) {
                    self.free[bucket(SlotWidth::Single)].insert(rest);
                }
            }
        }
        self.bindings.insert(value, slot);
        Ok(())
    }

    /// Release the slot of `value`, if it has one.
    pub fn free(&mut self, value: Value) -> Option<SpillSlot> {
        let slot = self.bindings.remove(&value)?;
        trace!("frame: free {} of {}", slot, value);
        self.free[bucket(slot.width())].insert(slot.index());
        Some(slot)
    }

    pub fn check_invariants(&self) -> Result<(), AllocError> {
        let mut slots: Vec<(SpillSlot, Option<Value>)> = self
            .bindings
            .iter()
            .map(|(&v, &s)| (s, Some(v)))
            .collect();
        for width in [SlotWidth::Single, SlotWidth::Double] {
            slots.extend(
                self.free[bucket(width)]
                    .iter()
                    .map(|&i| (SpillSlot::new(i, width), None)),
            );
        }
        slots.sort();
        for pair in slots.windows(2) {
            if pair[0].0.overlaps(pair[1].0) {
                return Err(AllocError::InvariantViolation(format!(
                    "frame slots {} ({:?}) and {} ({:?}) overlap",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                )));
            }
        }
        if let Some((slot, _)) = slots.last() {
            if slot.end() > self.depth {
                return Err(AllocError::InvariantViolation(format!(
                    "{} lies beyond the frame depth {}",
                    slot, self.depth
                )));
            }
        }
        Ok(())
    }
}
