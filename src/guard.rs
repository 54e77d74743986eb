/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Guard snapshots.
//!
//! When a guard fails, the runtime rebuilds the fallback state from
//! the values listed as the guard's fail arguments. A [`GuardToken`]
//! says where each of them is at the guard, and which of them are
//! heap references that a collection during recovery must find.

use crate::regalloc::RegAlloc;
use crate::target::{GuardFrameLayout, TargetProfile};
use crate::trace::Operand;
use crate::{AllocError, Location};
use smallvec::{smallvec, SmallVec};

/// One bit per fail argument, set for heap references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct RefBitmap {
    words: SmallVec<[u64; 1]>,
    len: usize,
}

impl RefBitmap {
    pub fn with_len(len: usize) -> Self {
        RefBitmap {
            words: smallvec![0; (len + 63) / 64],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 64] |= 1 << (i % 64);
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// The bitmap as words of `bits` bits each, least significant
    /// first.
    pub fn to_words(&self, bits: u32) -> SmallVec<[u64; 2]> {
        debug_assert!(bits == 32 || bits == 64);
        let per_u64 = (64 / bits) as usize;
        let mask = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
        let count = (self.len + bits as usize - 1) / bits as usize;
        (0..count)
            .map(|k| (self.words[k / per_u64] >> ((k % per_u64) as u32 * bits)) & mask)
            .collect()
    }
}

define_index!(GuardId, GuardTokens, GuardToken);

/// The frozen location map of one guard. Never changed after the
/// guard is allocated.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct GuardToken {
    /// Where each fail argument is, in fail-argument order.
    pub fail_locations: Vec<Location>,
    pub live_refs: RefBitmap,
    /// Frame depth at the guard, in words. A bridge attached here
    /// starts from a frame this deep.
    pub frame_depth: usize,
    pub descriptor_id: GuardId,
}

/// A word the guard's failure path stores into the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameField {
    /// Byte offset from the frame base.
    pub offset: i32,
    pub value: u64,
}

impl GuardToken {
    pub fn is_ref(&self, i: usize) -> bool {
        self.live_refs.get(i)
    }

    /// The failure descriptor id and the reference bitmap, laid out in
    /// the target's frame fields.
    pub fn frame_fields(&self, layout: &GuardFrameLayout) -> SmallVec<[FrameField; 4]> {
        let mut fields = smallvec![FrameField {
            offset: layout.descr_offset,
            value: self.descriptor_id.0 as u64,
        }];
        let bits = (layout.word_size * 8) as u32;
        for (k, word) in self.live_refs.to_words(bits).into_iter().enumerate() {
            fields.push(FrameField {
                offset: layout.gcmap_offset + k as i32 * layout.word_size,
                value: word,
            });
        }
        fields
    }
}

impl<'a, T: TargetProfile + ?Sized> RegAlloc<'a, T> {
    /// Record where every fail argument is right now. Reference
    /// constants get their bit too, so the runtime treats every
    /// reference entry alike.
    pub fn snapshot(
        &mut self,
        fail_args: &[Operand],
        descriptor_id: GuardId,
    ) -> Result<GuardToken, AllocError> {
        let mut live_refs = RefBitmap::with_len(fail_args.len());
        let mut fail_locations = Vec::with_capacity(fail_args.len());
        for (i, &arg) in fail_args.iter().enumerate() {
            fail_locations.push(self.operand_location(arg)?);
            if arg.ty().is_ref() {
                live_refs.set(i);
            }
        }
        let token = GuardToken {
            fail_locations,
            live_refs,
            frame_depth: self.frame.frame_depth(),
            descriptor_id,
        };
        trace!("guard {:?}: {:?}", descriptor_id, token);
        Ok(token)
    }
}
