/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Even/odd register pairs for wide arithmetic.

use super::{RegAlloc, VictimRank};
use crate::target::TargetProfile;
use crate::{AllocError, PReg, Pos, Value};

/// How a pair can be made available.
enum PairCost {
    Free,
    /// One half must be evicted.
    Single(VictimRank),
    /// Both halves must be evicted; ranked by the worse of the two.
    Double(VictimRank),
}

impl<'a, T: TargetProfile + ?Sized> RegAlloc<'a, T> {
    /// Allocate an adjacent even/odd register pair for `a` and `b`.
    /// With `bind_first`, `a` gets the even register and `b` the odd
    /// one; otherwise the other way round. Returns `(even, odd)`.
    ///
    /// A pair with both halves free is taken first. Otherwise the pair
    /// needing a single eviction with the cheapest victim, and failing
    /// that the cheapest pair needing two. Values in `forbidden` and
    /// values pinned to their register right now are never evicted. If
    /// no pair can be freed the allocation is unsatisfiable.
    pub fn ensure_pair(
        &mut self,
        a: Value,
        b: Value,
        bind_first: bool,
        forbidden: &[Value],
    ) -> Result<(PReg, PReg), AllocError> {
        self.check_known(a)?;
        self.check_known(b)?;
        let (first, second) = if bind_first { (a, b) } else { (b, a) };
        if let (Some(even), Some(odd)) = (self.reg_of(first), self.reg_of(second)) {
            if self.env.pairs.contains(&(even, odd)) {
                return Ok((even, odd));
            }
        }

        let pos = self.pos;
        let end = self
            .lifetimes
            .lifetime(a)
            .end
            .max(self.lifetimes.lifetime(b).end);
        let requesters = [a, b];

        let mut best: Option<(PairCost, (PReg, PReg))> = None;
        for &(even, odd) in &self.env.pairs {
            let Some(cost) = self.pair_cost(even, odd, end, &requesters, forbidden) else {
                continue;
            };
            let better = match (&best, &cost) {
                (None, _) => true,
                (Some((PairCost::Free, _)), _) => false,
                (Some(_), PairCost::Free) => true,
                (Some((PairCost::Single(old), _)), PairCost::Single(new)) => new > old,
                (Some((PairCost::Single(_), _)), PairCost::Double(_)) => false,
                (Some((PairCost::Double(_), _)), PairCost::Single(_)) => true,
                (Some((PairCost::Double(old), _)), PairCost::Double(new)) => new > old,
            };
            if better {
                best = Some((cost, (even, odd)));
            }
        }

        let Some((cost, (even, odd))) = best else {
            trace!("pair: no pair for {} and {} at {}", a, b, pos);
            return Err(AllocError::UnsatisfiableAllocation(pos));
        };
        if let PairCost::Double(_) = cost {
            self.stats.pair_double_spills += 1;
        }
        trace!("pair: {} and {} in ({}, {})", first, second, even, odd);
        for reg in [even, odd] {
            self.evict(reg)?;
        }
        for (v, reg) in [(first, even), (second, odd)] {
            self.move_to_reg(v, reg);
        }
        Ok((even, odd))
    }

    fn pair_cost(
        &self,
        even: PReg,
        odd: PReg,
        end: Pos,
        requesters: &[Value],
        forbidden: &[Value],
    ) -> Option<PairCost> {
        let mut victims = [None, None];
        for (slot, reg) in victims.iter_mut().zip([even, odd]) {
            if self.is_free(reg) {
                if let Some(w) = self.lifetimes.pinned_at(reg, self.pos) {
                    if !requesters.contains(&w) {
                        return None;
                    }
                }
                continue;
            }
            let occupant = self.evictable(reg, requesters, forbidden)?;
            *slot = Some(self.victim_rank(occupant, reg, end));
        }
        Some(match victims {
            [None, None] => PairCost::Free,
            [Some(r), None] | [None, Some(r)] => PairCost::Single(r),
            [Some(r0), Some(r1)] => PairCost::Double(r0.min(r1)),
        })
    }
}
