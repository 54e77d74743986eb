/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Value lifetimes and the fixed-register-use table.
//!
//! Lifetimes are computed once, before allocation, by a single walk
//! over the trace. A value is defined at `def` and must stay
//! available up to `end`. Only `real_uses` (operands the operation
//! actually reads) count for the spill heuristic; guard fail
//! arguments and label arguments keep a value alive without making it
//! look hot.

use crate::target::MachineEnv;
use crate::trace::{OpKind, Operand, Trace};
use crate::{AllocError, FxHashSet, PReg, Pos, PosRange, RegClass, Value, ValueType};
use smallvec::{smallvec, SmallVec};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lifetime {
    pub ty: ValueType,
    pub def: Pos,
    /// Last position at which the value must be available.
    pub end: Pos,
    /// Positions that read the value, ascending.
    pub real_uses: SmallVec<[Pos; 4]>,
    /// Registers the value is required to be in, ascending by
    /// position.
    pub fixed_positions: SmallVec<[(Pos, PReg); 2]>,
}

impl Lifetime {
    fn new(ty: ValueType, def: Pos) -> Self {
        Lifetime {
            ty,
            def,
            end: def,
            real_uses: smallvec![],
            fixed_positions: smallvec![],
        }
    }

    #[inline(always)]
    pub fn range(&self) -> PosRange {
        PosRange::new(self.def, self.end)
    }

    /// The first real use at or after `from`.
    pub fn next_real_use(&self, from: Pos) -> Option<Pos> {
        let i = self.real_uses.partition_point(|&p| p < from);
        self.real_uses.get(i).copied()
    }

    /// The first pin at or after `from`.
    pub fn next_fixed(&self, from: Pos) -> Option<(Pos, PReg)> {
        let i = self.fixed_positions.partition_point(|&(p, _)| p < from);
        self.fixed_positions.get(i).copied()
    }

    /// The register the value is pinned to exactly at `pos`.
    pub fn fixed_at(&self, pos: Pos) -> Option<PReg> {
        self.next_fixed(pos)
            .filter(|&(p, _)| p == pos)
            .map(|(_, reg)| reg)
    }

    fn use_at(&mut self, pos: Pos, real: bool) {
        if pos > self.end {
            self.end = pos;
        }
        if real && self.real_uses.last() != Some(&pos) {
            self.real_uses.push(pos);
        }
    }
}

/// One entry of the fixed-register-use table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pin {
    pub pos: Pos,
    pub value: Value,
    /// The pin is where `value` is defined rather than read.
    pub def: bool,
}

/// Per register, every pin on it in position order. This is what lets
/// the allocator see that a register which is free now will be needed
/// later.
#[derive(Clone, Debug)]
pub struct FixedRegUses {
    by_reg: Vec<SmallVec<[Pin; 4]>>,
}

impl Default for FixedRegUses {
    fn default() -> Self {
        FixedRegUses {
            by_reg: vec![smallvec![]; PReg::NUM_INDEX],
        }
    }
}

impl FixedRegUses {
    fn insert(&mut self, reg: PReg, pin: Pin) {
        let list = &mut self.by_reg[reg.index()];
        let i = list.partition_point(|p| p.pos <= pin.pos);
        list.insert(i, pin);
    }

    pub fn pins(&self, reg: PReg) -> &[Pin] {
        &self.by_reg[reg.index()]
    }

    /// Pins on `reg` at or after `from`.
    fn pins_from(&self, reg: PReg, from: Pos) -> &[Pin] {
        let pins = self.pins(reg);
        &pins[pins.partition_point(|p| p.pos < from)..]
    }
}

#[derive(Clone, Debug)]
pub struct Lifetimes {
    lifetimes: Vec<Option<Lifetime>>,
    fixed: FixedRegUses,
}

impl Lifetimes {
    /// Walk `trace` once and compute every value's lifetime and pins.
    ///
    /// Fails with `InvariantViolation` for malformed traces (a value
    /// read before it is defined, defined twice, or used after the
    /// loop label without being carried by it) and with
    /// `UnsatisfiableAllocation` when one value is pinned to two
    /// registers at once or two values to one register.
    pub fn compute(trace: &Trace, env: &MachineEnv) -> Result<Self, AllocError> {
        let mut this = Lifetimes {
            lifetimes: vec![None; trace.num_values],
            fixed: FixedRegUses::default(),
        };

        for &input in &trace.inputs {
            this.define(input, Pos::new(0))?;
        }

        let label = trace.label_pos();
        let mut carried: FxHashSet<Value> = FxHashSet::default();

        for (i, op) in trace.ops.iter().enumerate() {
            let pos = Pos::new(i);

            let after_label = label.map_or(false, |l| i > l);
            let check_carried = |this: &Self, v: Value| -> Result<(), AllocError> {
                if after_label
                    && !carried.contains(&v)
                    && this.get(v).map_or(false, |lt| lt.def.index() <= label.unwrap_or(0))
                {
                    return Err(AllocError::InvariantViolation(format!(
                        "{} is used at {} across the loop label without being a label argument",
                        v, pos
                    )));
                }
                Ok(())
            };

            let real = !matches!(op.kind, OpKind::Label);
            for v in op.arg_values() {
                check_carried(&this, v)?;
                this.use_value(v, pos, real)?;
            }
            for v in op.fail_args().iter().filter_map(|a| a.as_value()) {
                check_carried(&this, v)?;
                this.use_value(v, pos, false)?;
            }

            if op.kind == OpKind::Label {
                for v in op.arg_values() {
                    if !carried.insert(v) {
                        return Err(AllocError::InvariantViolation(format!(
                            "{} appears twice in the label at {}",
                            v, pos
                        )));
                    }
                }
            }

            for &(idx, reg) in &op.arg_pins {
                if let Some(Operand::Value(v)) = op.args.get(idx as usize) {
                    this.pin(*v, pos, reg, false)?;
                }
            }
            if let OpKind::Call(_) = op.kind {
                let mut next = [0usize; 2];
                for arg in &op.args {
                    let class = arg.ty().class() as usize;
                    let k = next[class];
                    next[class] += 1;
                    let Some(&reg) = env.arg_regs_by_class[class].get(k) else {
                        continue;
                    };
                    if let Operand::Value(v) = *arg {
                        // A value passed twice is copied by the argument
                        // shuffle; only its first register is a pin.
                        if this.lifetime(v).fixed_at(pos).is_none() {
                            this.pin(v, pos, reg, false)?;
                        }
                    }
                }
            }

            if let Some(result) = op.result {
                this.define(result, pos)?;
                let pin = match op.kind {
                    OpKind::Call(_) => {
                        Some(env.result_reg_by_class[result.class() as usize])
                    }
                    _ => op.result_pin,
                };
                if let Some(reg) = pin {
                    this.pin(result, pos, reg, true)?;
                }
            }
        }

        Ok(this)
    }

    fn define(&mut self, v: Value, pos: Pos) -> Result<(), AllocError> {
        if v.index() >= self.lifetimes.len() {
            self.lifetimes.resize(v.index() + 1, None);
        }
        let slot = &mut self.lifetimes[v.index()];
        if slot.is_some() {
            return Err(AllocError::InvariantViolation(format!(
                "{} is defined twice",
                v
            )));
        }
        *slot = Some(Lifetime::new(v.ty(), pos));
        Ok(())
    }

    fn use_value(&mut self, v: Value, pos: Pos, real: bool) -> Result<(), AllocError> {
        match self.lifetimes.get_mut(v.index()).and_then(|l| l.as_mut()) {
            Some(lt) if lt.ty == v.ty() => {
                lt.use_at(pos, real);
                Ok(())
            }
            Some(_) => Err(AllocError::InvariantViolation(format!(
                "{} is used at {} with a different type",
                v, pos
            ))),
            None => Err(AllocError::InvariantViolation(format!(
                "{} is used at {} before it is defined",
                v, pos
            ))),
        }
    }

    fn pin(&mut self, v: Value, pos: Pos, reg: PReg, def: bool) -> Result<(), AllocError> {
        if reg.class() != v.class() {
            return Err(AllocError::InvariantViolation(format!(
                "{} pinned to {} of the wrong class",
                v, reg
            )));
        }
        let lt = self.lifetimes[v.index()]
            .as_mut()
            .ok_or_else(|| AllocError::InvariantViolation(format!("{} has no lifetime", v)))?;
        match lt.fixed_at(pos) {
            Some(r) if r == reg => return Ok(()),
            Some(_) => return Err(AllocError::UnsatisfiableAllocation(pos)),
            None => {}
        }
        let i = lt.fixed_positions.partition_point(|&(p, _)| p < pos);
        lt.fixed_positions.insert(i, (pos, reg));

        // Two values may meet in one register only when one of them is
        // the operation's result.
        for other in self.fixed.pins_from(reg, pos) {
            if other.pos != pos {
                break;
            }
            if other.value != v && !other.def && !def {
                return Err(AllocError::UnsatisfiableAllocation(pos));
            }
        }
        self.fixed.insert(
            reg,
            Pin {
                pos,
                value: v,
                def,
            },
        );
        Ok(())
    }

    pub fn get(&self, v: Value) -> Option<&Lifetime> {
        self.lifetimes.get(v.index()).and_then(|l| l.as_ref())
    }

    /// The lifetime of a value the allocator already checked with
    /// `get`. Panics for values that do not occur in the trace.
    pub(crate) fn lifetime(&self, v: Value) -> &Lifetime {
        self.get(v).expect("value without a lifetime")
    }

    pub fn next_real_use(&self, v: Value, from: Pos) -> Option<Pos> {
        self.get(v)?.next_real_use(from)
    }

    pub fn fixed_positions_for(&self, v: Value) -> &[(Pos, PReg)] {
        self.get(v).map_or(&[][..], |lt| &lt.fixed_positions[..])
    }

    /// The earliest position at or after `from` at which a pin on
    /// `reg` needs the register, or `Pos::INFINITE`.
    ///
    /// A pin exactly at `from` that is its owner's definition is not
    /// counted: it only says where that value is being born, which is
    /// the register it already occupies.
    pub fn free_until_pos(&self, reg: PReg, from: Pos) -> Pos {
        self.fixed
            .pins_from(reg, from)
            .iter()
            .find(|pin| !(pin.pos == from && pin.def))
            .map_or(Pos::INFINITE, |pin| pin.pos)
    }

    /// The value pinned to `reg` exactly at `pos`, if any. Prefers a
    /// use over a definition.
    pub fn pinned_at(&self, reg: PReg, pos: Pos) -> Option<Value> {
        let mut found = None;
        for pin in self.fixed.pins_from(reg, pos) {
            if pin.pos != pos {
                break;
            }
            if !pin.def {
                return Some(pin.value);
            }
            found = Some(pin.value);
        }
        found
    }

    pub fn fixed_uses(&self) -> &FixedRegUses {
        &self.fixed
    }

    /// Register a short-lived value created by the allocator itself,
    /// live only at `pos`.
    pub fn add_temp(&mut self, ty: ValueType, pos: Pos) -> Value {
        let v = Value::new(self.lifetimes.len(), ty);
        let mut lt = Lifetime::new(ty, pos);
        lt.real_uses.push(pos);
        self.lifetimes.push(Some(lt));
        v
    }

    pub fn num_values(&self) -> usize {
        self.lifetimes.len()
    }

    /// Values live strictly after `pos` in `class`, in index order.
    pub fn live_after(&self, pos: Pos, class: RegClass) -> impl Iterator<Item = Value> + '_ {
        self.lifetimes.iter().enumerate().filter_map(move |(i, lt)| {
            let lt = lt.as_ref()?;
            (lt.def <= pos && lt.end > pos && lt.ty.class() == class)
                .then(|| Value::new(i, lt.ty))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CustomTarget;
    use crate::target::TargetProfile;
    use crate::trace::{CallEffect, Constant, Operation, TraceBuilder};

    fn int_reg(hw: usize) -> PReg {
        PReg::new(hw, RegClass::Int)
    }

    #[test]
    fn uses_and_ends() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let y = b.op(ValueType::Int, &[x.into()]);
        b.guard(&[y.into()], &[x.into(), y.into()]);
        b.finish(&[y.into()]);
        let trace = b.build();
        let lts = Lifetimes::compute(&trace, target.env()).unwrap();

        let lx = lts.lifetime(x);
        assert_eq!(lx.def, Pos::new(0));
        // The fail argument keeps `x` alive but is not a real use.
        assert_eq!(lx.end, Pos::new(1));
        assert_eq!(&lx.real_uses[..], &[Pos::new(0)]);
        assert_eq!(lts.next_real_use(x, Pos::new(1)), None);

        let ly = lts.lifetime(y);
        assert_eq!(ly.range(), PosRange::new(Pos::new(0), Pos::new(2)));
        assert_eq!(lts.next_real_use(y, Pos::new(2)), Some(Pos::new(2)));
    }

    #[test]
    fn free_until_skips_own_definition_pin() {
        let target = CustomTarget::small(4, 2);
        let r1 = int_reg(1);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let mut op = Operation::new(OpKind::Normal);
        op.args.push(x.into());
        op.result_pin = Some(r1);
        let y = b.push(op, Some(ValueType::Int)).unwrap();
        b.effect(&[]);
        let mut op = Operation::new(OpKind::Normal);
        op.args.push(y.into());
        op.arg_pins.push((0, r1));
        b.push(op, None);
        let trace = b.build();
        let lts = Lifetimes::compute(&trace, target.env()).unwrap();

        assert_eq!(lts.free_until_pos(r1, Pos::new(0)), Pos::new(2));
        assert_eq!(lts.free_until_pos(r1, Pos::new(1)), Pos::new(2));
        assert_eq!(lts.free_until_pos(r1, Pos::new(3)), Pos::INFINITE);
        assert_eq!(lts.free_until_pos(int_reg(0), Pos::new(0)), Pos::INFINITE);
        assert_eq!(
            lts.fixed_positions_for(y),
            &[(Pos::new(0), r1), (Pos::new(2), r1)]
        );
        assert_eq!(lts.pinned_at(r1, Pos::new(2)), Some(y));
    }

    #[test]
    fn call_arguments_are_pinned() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let r = b
            .call(
                CallEffect::Pure,
                &[x.into(), x.into(), Constant::Int(3).into()],
                Some(ValueType::Int),
            )
            .unwrap();
        b.finish(&[r.into()]);
        let trace = b.build();
        let lts = Lifetimes::compute(&trace, target.env()).unwrap();
        assert_eq!(lts.fixed_positions_for(x), &[(Pos::new(0), int_reg(0))]);
        assert_eq!(lts.fixed_positions_for(r), &[(Pos::new(0), int_reg(0))]);
    }

    #[test]
    fn conflicting_pins_are_unsatisfiable() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let y = b.input(ValueType::Int);
        let mut op = Operation::new(OpKind::Normal);
        op.args.extend([x.into(), y.into()]);
        op.arg_pins.extend([(0, int_reg(2)), (1, int_reg(2))]);
        b.push(op, None);
        let trace = b.build();
        assert_eq!(
            Lifetimes::compute(&trace, target.env()).unwrap_err(),
            AllocError::UnsatisfiableAllocation(Pos::new(0))
        );
    }

    #[test]
    fn use_before_definition() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let _ = b.input(ValueType::Int);
        let mut trace = b.build();
        let mut op = Operation::new(OpKind::Finish);
        op.args.push(Value::new(0, ValueType::Float).into());
        trace.ops.push(op);
        assert!(matches!(
            Lifetimes::compute(&trace, target.env()),
            Err(AllocError::InvariantViolation(_))
        ));
    }

    #[test]
    fn values_must_be_carried_by_the_label() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let y = b.input(ValueType::Int);
        b.label(&[x]);
        let z = b.op(ValueType::Int, &[x.into(), y.into()]);
        b.jump(&[z.into()]);
        let trace = b.build();
        assert!(matches!(
            Lifetimes::compute(&trace, target.env()),
            Err(AllocError::InvariantViolation(_))
        ));
    }

    #[test]
    fn temps_and_live_sets() {
        let target = CustomTarget::small(4, 2);
        let mut b = TraceBuilder::new();
        let x = b.input(ValueType::Int);
        let f = b.input(ValueType::Float);
        b.effect(&[]);
        b.finish(&[x.into(), f.into()]);
        let trace = b.build();
        let mut lts = Lifetimes::compute(&trace, target.env()).unwrap();
        let t = lts.add_temp(ValueType::Int, Pos::new(1));
        assert_eq!(t.index(), 2);
        assert_eq!(lts.lifetime(t).range().len(), 1);
        assert_eq!(
            lts.live_after(Pos::new(0), RegClass::Int).collect::<Vec<_>>(),
            vec![x]
        );
        assert_eq!(lts.live_after(Pos::new(1), RegClass::Float).count(), 1);
    }
}
