/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! On-demand register assignment.
//!
//! The allocator keeps, for the current position, the register (if
//! any) of every value, and asks the frame manager for a stack slot
//! when a value has to leave its register. Values are immutable once
//! defined, so a stack copy stays valid after a reload: a value that
//! is spilled a second time is simply dropped from its register.

use crate::frame::FrameManager;
use crate::lifetime::Lifetimes;
use crate::target::{ConstantPool, MachineEnv, TargetProfile};
use crate::trace::{Constant, Operand, Trace};
use crate::{
    AllocError, Edit, FxHashMap, Location, Options, PReg, Pos, ProgPoint, RegClass, SpillSlot,
    Value, ValueType,
};
use smallvec::SmallVec;

pub mod pair;

#[cfg(test)]
mod tests;

/// Counters describing the work the allocator did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Stats {
    /// Stores of a register into a stack slot.
    pub spills: usize,
    /// Loads of a stack slot into a register.
    pub reloads: usize,
    /// Register-to-register and constant moves.
    pub moves: usize,
    /// Values removed from a register to make room for another.
    pub evictions: usize,
    /// Coalescing requests honoured.
    pub coalesced: usize,
    /// Move cycles broken with a push/pop pair.
    pub cycles: usize,
    /// Register pairs that needed both halves evicted.
    pub pair_double_spills: usize,
}

/// What kind of register an operand needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegConstraint {
    Any,
    /// A register usable as a byte operand.
    Byte,
    Fixed(PReg),
}

/// Ranking of a register's occupant as a spill victim; larger is a
/// better victim. In order: the occupant has no further real use, its
/// next real use, the register stays free for the requester's whole
/// lifetime.
type VictimRank = (bool, Pos, bool);

pub struct RegAlloc<'a, T: TargetProfile + ?Sized> {
    pub(crate) target: &'a T,
    pub(crate) env: &'a MachineEnv,
    pub(crate) lifetimes: Lifetimes,
    pub(crate) frame: FrameManager,
    pub(crate) pool: ConstantPool,
    pub(crate) stats: Stats,
    pub(crate) options: Options,
    reg_of: FxHashMap<Value, PReg>,
    value_in_preg: [Option<Value>; PReg::NUM_INDEX],
    coalesce_with: FxHashMap<Value, Value>,
    /// The register each value most recently left.
    last_reg: FxHashMap<Value, PReg>,
    pos: Pos,
    point: ProgPoint,
    edits: Vec<(ProgPoint, Edit)>,
}

impl<'a, T: TargetProfile + ?Sized> RegAlloc<'a, T> {
    pub fn new(trace: &Trace, target: &'a T, options: Options) -> Result<Self, AllocError> {
        let env = target.env();
        let lifetimes = Lifetimes::compute(trace, env)?;
        let mut ra = RegAlloc {
            target,
            env,
            lifetimes,
            frame: FrameManager::new(env.max_frame_words),
            pool: ConstantPool::default(),
            stats: Stats::default(),
            options,
            reg_of: FxHashMap::default(),
            value_in_preg: [None; PReg::NUM_INDEX],
            coalesce_with: FxHashMap::default(),
            last_reg: FxHashMap::default(),
            pos: Pos::new(0),
            point: ProgPoint::before(Pos::new(0)),
            edits: vec![],
        };
        for &(a, b) in &trace.coalesce {
            ra.request_coalesce(a, b);
        }
        Ok(ra)
    }

    pub fn lifetimes(&self) -> &Lifetimes {
        &self.lifetimes
    }

    pub fn frame(&self) -> &FrameManager {
        &self.frame
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Move to the operation at `pos`. Values whose lifetime ended
    /// before `pos` release their register and stack slot.
    pub fn set_position(&mut self, pos: Pos) {
        debug_assert!(pos >= self.pos);
        self.pos = pos;
        self.point = ProgPoint::before(pos);
        self.free_dead_values();
    }

    /// Place further edits after the current operation.
    pub fn set_after(&mut self) {
        self.point = ProgPoint::after(self.pos);
    }

    pub fn free_dead_values(&mut self) {
        let pos = self.pos;
        for i in 0..PReg::NUM_INDEX {
            if let Some(v) = self.value_in_preg[i] {
                if self.lifetimes.lifetime(v).end < pos {
                    self.unbind(PReg::from_index(i));
                }
            }
        }
        let mut dead: SmallVec<[Value; 8]> = self
            .frame
            .bound_values()
            .filter(|&(v, _)| self.lifetimes.lifetime(v).end < pos)
            .map(|(v, _)| v)
            .collect();
        dead.sort_unstable();
        for v in dead {
            self.frame.free(v);
        }
    }

    pub fn emit(&mut self, edit: Edit) {
        trace!("{:?}: {}", self.point, edit);
        self.edits.push((self.point, edit));
    }

    pub fn take_edits(&mut self) -> Vec<(ProgPoint, Edit)> {
        core::mem::take(&mut self.edits)
    }

    pub fn reg_of(&self, v: Value) -> Option<PReg> {
        self.reg_of.get(&v).copied()
    }

    pub fn value_in(&self, reg: PReg) -> Option<Value> {
        self.value_in_preg[reg.index()]
    }

    #[inline(always)]
    pub fn is_free(&self, reg: PReg) -> bool {
        self.value_in_preg[reg.index()].is_none()
    }

    /// The current location of `v`: its register if it has one, else
    /// its stack slot.
    pub fn loc(&self, v: Value) -> Option<Location> {
        self.reg_of(v)
            .map(Location::Reg)
            .or_else(|| self.frame.slot_of(v).map(Location::Stack))
    }

    pub fn constant_location(&mut self, c: Constant) -> Result<Location, AllocError> {
        self.target.constant_location(c, &mut self.pool)
    }

    pub fn operand_location(&mut self, op: Operand) -> Result<Location, AllocError> {
        match op {
            Operand::Value(v) => self.loc(v).ok_or_else(|| {
                AllocError::InvariantViolation(format!("{} has no location at {}", v, self.pos))
            }),
            Operand::Const(c) => self.constant_location(c),
        }
    }

    /// A value created by the allocator that lives only at the
    /// current operation.
    pub fn new_temp(&mut self, ty: ValueType) -> Value {
        self.lifetimes.add_temp(ty, self.pos)
    }

    pub fn request_coalesce(&mut self, a: Value, b: Value) {
        let (Some(la), Some(lb)) = (self.lifetimes.get(a), self.lifetimes.get(b)) else {
            return;
        };
        if a.class() != b.class() || la.range().overlaps(lb.range()) {
            trace!("coalesce: {} and {} overlap, ignored", a, b);
            return;
        }
        self.coalesce_with.insert(a, b);
        self.coalesce_with.insert(b, a);
    }

    fn bind(&mut self, v: Value, reg: PReg) {
        debug_assert!(self.is_free(reg), "{} is taken", reg);
        trace!("bind {} -> {}", v, reg);
        self.value_in_preg[reg.index()] = Some(v);
        self.reg_of.insert(v, reg);
    }

    fn unbind(&mut self, reg: PReg) -> Option<Value> {
        let v = self.value_in_preg[reg.index()].take()?;
        self.reg_of.remove(&v);
        self.last_reg.insert(v, reg);
        Some(v)
    }

    /// Fail for values that do not belong to the trace being
    /// allocated.
    fn check_known(&self, v: Value) -> Result<(), AllocError> {
        match self.lifetimes.get(v) {
            Some(lt) if lt.ty == v.ty() => Ok(()),
            _ => Err(AllocError::InvariantViolation(format!(
                "{} does not occur in the trace",
                v
            ))),
        }
    }

    /// Bind `v` to where the code entering this trace leaves it.
    pub fn bind_entry(&mut self, v: Value, loc: Location) -> Result<(), AllocError> {
        self.check_known(v)?;
        match loc {
            Location::Reg(reg) if self.env.is_allocatable(reg) && self.is_free(reg) => {
                self.bind(v, reg);
                Ok(())
            }
            Location::Stack(slot) => self.frame.bind(v, slot),
            _ => Err(AllocError::InvariantViolation(format!(
                "{} cannot enter at {}",
                v, loc
            ))),
        }
    }

    /// Give `v` a fresh stack slot as its entry location.
    pub fn spill_entry(&mut self, v: Value) -> Result<SpillSlot, AllocError> {
        self.check_known(v)?;
        let width = self.target.slot_width(v.ty());
        self.frame.spill(v, width)
    }

    /// Make `reg` hold `v`. `reg` must be free. Emits the move or
    /// reload from the current location, if `v` has one.
    fn move_to_reg(&mut self, v: Value, reg: PReg) {
        match self.loc(v) {
            Some(Location::Reg(r)) if r == reg => return,
            Some(from) => {
                self.emit(Edit::Move {
                    from,
                    to: Location::Reg(reg),
                });
                if let Location::Reg(r) = from {
                    self.unbind(r);
                    self.stats.moves += 1;
                } else {
                    self.stats.reloads += 1;
                }
            }
            None => {}
        }
        self.bind(v, reg);
    }

    /// Move `v` out of its register, storing it first unless its stack
    /// slot already holds it.
    pub fn spill(&mut self, v: Value) -> Result<(), AllocError> {
        let Some(reg) = self.reg_of(v) else {
            return Ok(());
        };
        if self.frame.slot_of(v).is_none() {
            let width = self.target.slot_width(v.ty());
            let slot = self.frame.spill(v, width)?;
            self.emit(Edit::Move {
                from: Location::Reg(reg),
                to: Location::Stack(slot),
            });
            self.stats.spills += 1;
        }
        self.unbind(reg);
        Ok(())
    }

    fn evict(&mut self, reg: PReg) -> Result<(), AllocError> {
        if let Some(v) = self.value_in(reg) {
            trace!("evict {} from {}", v, reg);
            self.stats.evictions += 1;
            self.spill(v)?;
        }
        Ok(())
    }

    /// Forget the stack copy of `v`. Used where the copy would be stale
    /// on a later entry, e.g. for loop-carried values held in a
    /// register at the label.
    pub(crate) fn drop_stack_copy(&mut self, v: Value) {
        if self.reg_of(v).is_some() {
            self.frame.free(v);
        }
    }

    fn satisfies(&self, reg: PReg, class: RegClass, c: RegConstraint) -> bool {
        reg.class() == class
            && match c {
                RegConstraint::Any => true,
                RegConstraint::Byte => self.target.is_byte_addressable(reg),
                RegConstraint::Fixed(f) => reg == f,
            }
    }

    fn candidates(&self, class: RegClass, c: RegConstraint) -> impl Iterator<Item = PReg> + '_ {
        self.env.regs_by_class[class as usize]
            .iter()
            .copied()
            .filter(move |&r| self.satisfies(r, class, c))
    }

    /// Is `reg` needed by a value other than `v` at the current
    /// position?
    fn pinned_for_other(&self, reg: PReg, v: Value) -> bool {
        self.lifetimes
            .pinned_at(reg, self.pos)
            .map_or(false, |w| w != v)
    }

    /// Choose a free register for `v` without evicting anything.
    ///
    /// In order of preference: the register its coalescing partner
    /// left, the register of its next pin, the free register whose
    /// next pin comes soonest after `v` dies, and finally the free
    /// register that stays free the longest.
    fn try_pick_free_reg(&mut self, v: Value, c: RegConstraint) -> Option<PReg> {
        let pos = self.pos;
        let class = v.class();
        let end = self.lifetimes.lifetime(v).end;
        let free: SmallVec<[PReg; 16]> = self
            .candidates(class, c)
            .filter(|&r| self.is_free(r) && !self.pinned_for_other(r, v))
            .collect();
        if free.is_empty() {
            return None;
        }

        if let Some(&partner) = self.coalesce_with.get(&v) {
            if self.reg_of(partner).is_none() {
                if let Some(&reg) = self.last_reg.get(&partner) {
                    if free.contains(&reg) && self.lifetimes.free_until_pos(reg, pos) > end {
                        trace!("coalesce {} with {} in {}", v, partner, reg);
                        self.stats.coalesced += 1;
                        return Some(reg);
                    }
                }
            }
        }

        if let Some((pin_pos, reg)) = self.lifetimes.lifetime(v).next_fixed(pos) {
            if free.contains(&reg) && self.lifetimes.free_until_pos(reg, pos) >= pin_pos {
                return Some(reg);
            }
        }

        let mut best: Option<(Pos, PReg)> = None;
        for &reg in &free {
            let until = self.lifetimes.free_until_pos(reg, pos);
            if until > end && best.map_or(true, |(b, _)| until < b) {
                best = Some((until, reg));
            }
        }
        if let Some((_, reg)) = best {
            return Some(reg);
        }

        let mut latest: Option<(Pos, PReg)> = None;
        for &reg in &free {
            let until = self.lifetimes.free_until_pos(reg, pos);
            if latest.map_or(true, |(l, _)| until > l) {
                latest = Some((until, reg));
            }
        }
        latest.map(|(_, reg)| reg)
    }

    fn victim_rank(&self, occupant: Value, reg: PReg, end: Pos) -> VictimRank {
        let fits = self.lifetimes.free_until_pos(reg, self.pos) > end;
        let next_use = self.lifetimes.next_real_use(occupant, self.pos);
        (next_use.is_none(), next_use.unwrap_or(Pos::INFINITE), fits)
    }

    /// May the occupant of `reg` be evicted to make room for one of
    /// `requesters`?
    fn evictable(&self, reg: PReg, requesters: &[Value], forbidden: &[Value]) -> Option<Value> {
        let occupant = self.value_in(reg)?;
        if forbidden.contains(&occupant)
            || requesters.contains(&occupant)
            || self.lifetimes.lifetime(occupant).fixed_at(self.pos) == Some(reg)
        {
            return None;
        }
        if let Some(w) = self.lifetimes.pinned_at(reg, self.pos) {
            if !requesters.contains(&w) {
                return None;
            }
        }
        Some(occupant)
    }

    /// Choose the register whose occupant is the cheapest to evict for
    /// `v`: occupants without further real uses first, then the one
    /// used furthest in the future. Among equals a register that stays
    /// free for all of `v`'s lifetime wins, then the register listed
    /// first.
    fn pick_victim(
        &self,
        v: Value,
        c: RegConstraint,
        forbidden: &[Value],
        exclude: Option<PReg>,
    ) -> Option<PReg> {
        let end = self.lifetimes.lifetime(v).end;
        let mut best: Option<(VictimRank, PReg)> = None;
        for reg in self.candidates(v.class(), c) {
            if Some(reg) == exclude {
                continue;
            }
            let Some(occupant) = self.evictable(reg, &[v], forbidden) else {
                continue;
            };
            let rank = self.victim_rank(occupant, reg, end);
            if best.map_or(true, |(b, _)| rank > b) {
                best = Some((rank, reg));
            }
        }
        best.map(|(_, reg)| reg)
    }

    /// Find `v` a register satisfying `c` without evicting anything.
    pub fn try_allocate(&mut self, v: Value, c: RegConstraint) -> Option<Location> {
        self.check_known(v).ok()?;
        if let Some(reg) = self.reg_of(v) {
            if self.satisfies(reg, v.class(), c) {
                return Some(Location::Reg(reg));
            }
        }
        let reg = match c {
            RegConstraint::Fixed(reg) => {
                if !self.is_free(reg) || !self.satisfies(reg, v.class(), c) {
                    return None;
                }
                reg
            }
            _ => self.try_pick_free_reg(v, c)?,
        };
        self.move_to_reg(v, reg);
        Some(Location::Reg(reg))
    }

    /// Find `v` a register satisfying `c`, evicting another value if
    /// none is free. Values in `forbidden` are never evicted.
    pub fn force_allocate(
        &mut self,
        v: Value,
        c: RegConstraint,
        forbidden: &[Value],
    ) -> Result<Location, AllocError> {
        self.check_known(v)?;
        self.force_allocate_reg(v, c, forbidden).map(Location::Reg)
    }

    fn force_allocate_reg(
        &mut self,
        v: Value,
        c: RegConstraint,
        forbidden: &[Value],
    ) -> Result<PReg, AllocError> {
        if let RegConstraint::Fixed(reg) = c {
            self.force_fixed(v, reg, forbidden)?;
            return Ok(reg);
        }
        if let Some(Location::Reg(reg)) = self.try_allocate(v, c) {
            return Ok(reg);
        }
        let reg = self
            .pick_victim(v, c, forbidden, None)
            .ok_or(AllocError::UnsatisfiableAllocation(self.pos))?;
        self.evict(reg)?;
        self.move_to_reg(v, reg);
        Ok(reg)
    }

    /// Put `v` in `reg`, moving or evicting whatever is there.
    pub fn force_fixed(
        &mut self,
        v: Value,
        reg: PReg,
        forbidden: &[Value],
    ) -> Result<(), AllocError> {
        self.check_known(v)?;
        if self.reg_of(v) == Some(reg) {
            return Ok(());
        }
        if !self.env.is_allocatable(reg) || reg.class() != v.class() {
            return Err(AllocError::InvariantViolation(format!(
                "{} cannot be placed in {}",
                v, reg
            )));
        }
        self.make_room(reg, v, forbidden)?;
        self.move_to_reg(v, reg);
        Ok(())
    }

    /// Empty `reg` for `requester`. An occupant the current operation
    /// still reads is moved to another register; any other occupant is
    /// evicted.
    pub(crate) fn make_room(
        &mut self,
        reg: PReg,
        requester: Value,
        forbidden: &[Value],
    ) -> Result<(), AllocError> {
        let Some(occupant) = self.value_in(reg) else {
            return Ok(());
        };
        if occupant == requester {
            return Ok(());
        }
        if self.lifetimes.lifetime(occupant).fixed_at(self.pos) == Some(reg) {
            return Err(AllocError::UnsatisfiableAllocation(self.pos));
        }
        if !forbidden.contains(&occupant) {
            return self.evict(reg);
        }

        let to = match self.try_pick_free_reg(occupant, RegConstraint::Any) {
            Some(to) => to,
            None => {
                let mut keep: SmallVec<[Value; 8]> = forbidden.iter().copied().collect();
                keep.push(requester);
                let to = self
                    .pick_victim(occupant, RegConstraint::Any, &keep, Some(reg))
                    .ok_or(AllocError::UnsatisfiableAllocation(self.pos))?;
                self.evict(to)?;
                to
            }
        };
        trace!("relocate {} from {} to {}", occupant, reg, to);
        self.emit(Edit::Move {
            from: Location::Reg(reg),
            to: Location::Reg(to),
        });
        self.unbind(reg);
        self.bind(occupant, to);
        self.stats.moves += 1;
        Ok(())
    }

    /// Load a constant into `reg` for the current operation. The
    /// register is held by a temporary until the next operation.
    pub fn load_constant(
        &mut self,
        c: Constant,
        reg: PReg,
        forbidden: &[Value],
    ) -> Result<(), AllocError> {
        let t = self.new_temp(c.ty());
        self.force_fixed(t, reg, forbidden)?;
        let from = self.constant_location(c)?;
        self.emit(Edit::Move {
            from,
            to: Location::Reg(reg),
        });
        self.stats.moves += 1;
        Ok(())
    }

    /// Allocate the register an operation writes `result` to, in
    /// two-address form: the register first receives `source`.
    ///
    /// When `source` is a value that dies at this operation and sits
    /// in a suitable register, the result simply takes that register
    /// over and no move is needed.
    pub fn force_result_in_reg(
        &mut self,
        result: Value,
        source: Option<Operand>,
        c: RegConstraint,
        forbidden: &[Value],
    ) -> Result<PReg, AllocError> {
        self.check_known(result)?;
        if let Some(Operand::Value(s)) = source {
            self.check_known(s)?;
            if let Some(reg) = self.reg_of(s) {
                if self.lifetimes.lifetime(s).end == self.pos
                    && self.satisfies(reg, result.class(), c)
                    && !self.pinned_for_other(reg, s)
                {
                    trace!("result {} reuses {} of {}", result, reg, s);
                    self.unbind(reg);
                    self.bind(result, reg);
                    return Ok(reg);
                }
            }
        }
        let mut keep: SmallVec<[Value; 8]> = forbidden.iter().copied().collect();
        if let Some(Operand::Value(s)) = source {
            keep.push(s);
        }
        let reg = self.force_allocate_reg(result, c, &keep)?;
        if let Some(source) = source {
            self.copy_into(source, reg)?;
        }
        Ok(reg)
    }

    /// As `force_result_in_reg`, for a result that must be written to
    /// `reg`.
    pub fn force_result_in_fixed(
        &mut self,
        result: Value,
        reg: PReg,
        source: Option<Operand>,
        forbidden: &[Value],
    ) -> Result<(), AllocError> {
        self.check_known(result)?;
        if let Some(Operand::Value(s)) = source {
            self.check_known(s)?;
        }
        let mut source_in_place = false;
        if let Some(occupant) = self.value_in(reg) {
            let is_source = source == Some(Operand::Value(occupant));
            let pinned_here = self.lifetimes.lifetime(occupant).fixed_at(self.pos) == Some(reg);
            if pinned_here && !is_source && source.is_some() {
                // `reg` would receive the source before the operation
                // reads the occupant from it.
                return Err(AllocError::UnsatisfiableAllocation(self.pos));
            }
            if is_source || pinned_here {
                // The operation reads the occupant from `reg` and
                // overwrites it; keep a copy if it lives on.
                if self.lifetimes.lifetime(occupant).end > self.pos {
                    self.spill(occupant)?;
                } else {
                    self.unbind(reg);
                }
                source_in_place = is_source;
            } else {
                self.make_room(reg, result, forbidden)?;
            }
        }
        self.bind(result, reg);
        if let (Some(source), false) = (source, source_in_place) {
            self.copy_into(source, reg)?;
        }
        Ok(())
    }

    fn copy_into(&mut self, source: Operand, reg: PReg) -> Result<(), AllocError> {
        let from = self.operand_location(source)?;
        if from != Location::Reg(reg) {
            self.emit(Edit::Move {
                from,
                to: Location::Reg(reg),
            });
            if from.is_memory() {
                self.stats.reloads += 1;
            } else {
                self.stats.moves += 1;
            }
        }
        Ok(())
    }

    /// A free callee-saved register of `class`, other than `avoid`,
    /// that no pin claims before `end`.
    pub(crate) fn free_callee_saved(
        &self,
        class: RegClass,
        end: Pos,
        avoid: Option<PReg>,
    ) -> Option<PReg> {
        self.env.callee_saved(class).find(|&r| {
            Some(r) != avoid
                && self.is_free(r)
                && self.lifetimes.free_until_pos(r, self.pos) > end
        })
    }

    pub(crate) fn rebind(&mut self, from: PReg, to: PReg) {
        if let Some(v) = self.unbind(from) {
            self.bind(v, to);
        }
    }

    pub(crate) fn unbind_reg(&mut self, reg: PReg) -> Option<Value> {
        self.unbind(reg)
    }

    pub(crate) fn bind_reg(&mut self, v: Value, reg: PReg) {
        self.bind(v, reg)
    }

    /// Verify the allocator's bookkeeping: every register holds at most
    /// one value and agrees with the value-to-register map, only
    /// allocatable registers are used, no dead value holds a register,
    /// and the frame is consistent.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        let violation = |msg: String| -> Result<(), AllocError> {
            Err(AllocError::InvariantViolation(msg))
        };
        for i in 0..PReg::NUM_INDEX {
            let Some(v) = self.value_in_preg[i] else {
                continue;
            };
            let reg = PReg::from_index(i);
            if self.reg_of(v) != Some(reg) {
                return violation(format!("{} holds {} which is mapped elsewhere", reg, v));
            }
            if !self.env.is_allocatable(reg) {
                return violation(format!("{} is bound to non-allocatable {}", v, reg));
            }
            if self.lifetimes.lifetime(v).end < self.pos {
                return violation(format!("dead {} still holds {} at {}", v, reg, self.pos));
            }
        }
        for (&v, &reg) in &self.reg_of {
            if self.value_in(reg) != Some(v) {
                return violation(format!("{} maps to {} which does not hold it", v, reg));
            }
        }
        self.frame.check_invariants()
    }
}
