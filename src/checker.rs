/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies that an allocation result preserves the dataflow
//! of the trace it was computed for.
//!
//! The checker replays the trace together with the allocator's edits
//! and tracks, for every location, which symbol it holds: a trace
//! value or a constant. Every operation's result generates its value's
//! symbol in the result location; moves, pushes and pops copy symbols;
//! calls clobber the registers the callee may overwrite, and calls
//! that may collect garbage also clobber references held in
//! registers. Whenever the trace reads a value (an operand, a guard
//! fail argument, a jump argument), the location the allocator
//! reported for it must hold that value's symbol.
//!
//! A trace has no control-flow merges, so a single forward pass
//! suffices. At the loop label the state is reset to exactly the label
//! layout, which is all that a later iteration can rely on.
//!
//! Operand constraints are checked as well: fixed registers, argument
//! registers of calls, two-address results, register pairs and byte
//! operands.

use crate::guard::GuardId;
use crate::target::MachineEnv;
use crate::trace::{CallEffect, OpKind, Operand, Operation, Trace};
use crate::{
    Edit, FxHashMap, Location, OpAllocs, Output, PReg, Pos, ProgPoint, SpillSlot, Value,
};

/// A set of errors detected by the checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    errors: Vec<CheckerError>,
}

impl CheckerErrors {
    pub fn errors(&self) -> &[CheckerError] {
        &self.errors
    }
}

/// What a location holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    Value(Value),
    /// A constant, by bit pattern.
    Const(u64),
}

impl From<Operand> for Symbol {
    fn from(op: Operand) -> Self {
        match op {
            Operand::Value(v) => Symbol::Value(v),
            Operand::Const(c) => Symbol::Const(c.bits()),
        }
    }
}

/// A single error detected by the checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
    MissingAllocation {
        pos: Pos,
        index: usize,
    },
    IncorrectValueInLocation {
        pos: Pos,
        loc: Location,
        expected: Symbol,
        actual: Option<Symbol>,
    },
    AllocationIsNotReg {
        pos: Pos,
        index: usize,
        loc: Location,
    },
    AllocationIsNotFixedReg {
        pos: Pos,
        loc: Location,
        expected: PReg,
    },
    NotByteAddressable {
        pos: Pos,
        reg: PReg,
    },
    AllocationIsNotReuse {
        pos: Pos,
        loc: Location,
        expected: Location,
    },
    ArgumentOverwrittenByResult {
        pos: Pos,
        index: usize,
        loc: Location,
    },
    NotARegisterPair {
        pos: Pos,
        even: Location,
        odd: Option<Location>,
    },
    StackArgumentMismatch {
        pos: Pos,
        index: u32,
        expected: Symbol,
        actual: Option<Symbol>,
    },
    MissingGuardToken {
        pos: Pos,
    },
    GuardTokenMismatch {
        guard: GuardId,
        fail_args: usize,
        locations: usize,
    },
    WrongRefBit {
        guard: GuardId,
        index: usize,
    },
    GuardFrameTooShallow {
        guard: GuardId,
        slot: SpillSlot,
    },
    StackSlotOutsideFrame {
        pos: Pos,
        slot: SpillSlot,
    },
    WriteToConstant {
        point: ProgPoint,
        loc: Location,
    },
    StackToStackMove {
        point: ProgPoint,
        from: Location,
        to: Location,
    },
    PopFromEmptyStack {
        point: ProgPoint,
    },
    StackNotBalanced {
        pos: Pos,
        depth: usize,
    },
    LockProtocol {
        pos: Pos,
    },
    JumpWithoutTarget {
        pos: Pos,
    },
}

/// The symbolic machine state between two edits.
#[derive(Clone, Debug, Default)]
struct CheckerState {
    locations: FxHashMap<Location, Symbol>,
    stack: Vec<Option<Symbol>>,
    outgoing: FxHashMap<u32, Option<Symbol>>,
    lock_released: bool,
}

impl CheckerState {
    fn get(&self, loc: Location, pool: &[u64]) -> Option<Symbol> {
        match loc {
            Location::Imm(imm) => Some(Symbol::Const(imm as u64)),
            Location::Pool(offset) => pool
                .get(offset as usize / crate::target::ConstantPool::ENTRY_SIZE)
                .map(|&bits| Symbol::Const(bits)),
            _ => self.locations.get(&loc).copied(),
        }
    }

    fn set(&mut self, loc: Location, sym: Option<Symbol>) {
        if loc.is_stack() {
            self.locations.retain(|l, _| !l.overlaps(loc));
        } else {
            self.locations.remove(&loc);
        }
        if let Some(sym) = sym {
            self.locations.insert(loc, sym);
        }
    }

    fn clobber(&mut self, mut f: impl FnMut(PReg, Symbol) -> bool) {
        self.locations.retain(|&l, &mut sym| match l {
            Location::Reg(reg) => !f(reg, sym),
            _ => true,
        });
    }
}

pub struct Checker<'a> {
    trace: &'a Trace,
    env: &'a MachineEnv,
    jump_target: Option<Vec<Location>>,
    state: CheckerState,
    errors: Vec<CheckerError>,
}

impl<'a> Checker<'a> {
    pub fn new(trace: &'a Trace, env: &'a MachineEnv) -> Checker<'a> {
        Checker {
            trace,
            env,
            jump_target: None,
            state: CheckerState::default(),
            errors: vec![],
        }
    }

    /// The layout a bridge's final jump must deliver its arguments to.
    pub fn with_jump_target(mut self, layout: Vec<Location>) -> Self {
        self.jump_target = Some(layout);
        self
    }

    /// Replay `out` over the trace and report every discrepancy.
    pub fn run(mut self, out: &Output) -> Result<(), CheckerErrors> {
        let trace = self.trace;
        for (&v, &loc) in trace.inputs.iter().zip(&out.input_locations) {
            self.state.set(loc, Some(Symbol::Value(v)));
        }

        let empty = OpAllocs::default();
        for (i, op) in trace.ops.iter().enumerate() {
            let pos = Pos::new(i);
            let allocs = out.op_allocs.get(i).unwrap_or(&empty);
            if op.kind == OpKind::Jump {
                // The sources are read before the back-edge moves.
                self.check_reads(pos, op, allocs, out);
            }
            self.apply_edits(ProgPoint::before(pos), out);
            self.check_op(pos, op, allocs, out);
            self.apply_edits(ProgPoint::after(pos), out);
            if !self.state.stack.is_empty() {
                self.errors.push(CheckerError::StackNotBalanced {
                    pos,
                    depth: self.state.stack.len(),
                });
                self.state.stack.clear();
            }
            if self.state.lock_released {
                self.errors.push(CheckerError::LockProtocol { pos });
                self.state.lock_released = false;
            }
        }

        trace!("checker: {} errors", self.errors.len());
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CheckerErrors {
                errors: self.errors,
            })
        }
    }

    fn apply_edits(&mut self, point: ProgPoint, out: &Output) {
        for edit in out.edits_at(point) {
            trace!("checker: {:?}: {}", point, edit);
            match *edit {
                Edit::Move { from, to } => {
                    if to.is_const() {
                        self.errors.push(CheckerError::WriteToConstant { point, loc: to });
                        continue;
                    }
                    if from.is_memory() && to.is_memory() && !self.env.stack_to_stack_moves {
                        self.errors
                            .push(CheckerError::StackToStackMove { point, from, to });
                    }
                    self.check_in_frame(point.pos(), from, out);
                    self.check_in_frame(point.pos(), to, out);
                    let sym = self.state.get(from, &out.pool);
                    self.state.set(to, sym);
                }
                Edit::Push(loc) => {
                    self.check_in_frame(point.pos(), loc, out);
                    let sym = self.state.get(loc, &out.pool);
                    self.state.stack.push(sym);
                }
                Edit::Pop(loc) => {
                    self.check_in_frame(point.pos(), loc, out);
                    match self.state.stack.pop() {
                        Some(sym) => self.state.set(loc, sym),
                        None => self.errors.push(CheckerError::PopFromEmptyStack { point }),
                    }
                }
                Edit::StoreArg { from, index } => {
                    let sym = self.state.get(from, &out.pool);
                    self.state.outgoing.insert(index, sym);
                }
                Edit::ReleaseLock => {
                    if self.state.lock_released {
                        self.errors.push(CheckerError::LockProtocol { pos: point.pos() });
                    }
                    self.state.lock_released = true;
                }
                Edit::ReacquireLock { scratch } => {
                    if !self.state.lock_released {
                        self.errors.push(CheckerError::LockProtocol { pos: point.pos() });
                    }
                    self.state.lock_released = false;
                    let caller_saved = self.env.caller_saved;
                    self.state
                        .clobber(|reg, _| reg == scratch || caller_saved.contains(reg));
                }
            }
        }
    }

    fn check_in_frame(&mut self, pos: Pos, loc: Location, out: &Output) {
        if let Location::Stack(slot) = loc {
            if slot.end() > out.frame_depth {
                self.errors
                    .push(CheckerError::StackSlotOutsideFrame { pos, slot });
            }
        }
    }

    fn expect(&mut self, pos: Pos, loc: Location, expected: Symbol, out: &Output) {
        self.check_in_frame(pos, loc, out);
        let actual = self.state.get(loc, &out.pool);
        if actual != Some(expected) {
            self.errors.push(CheckerError::IncorrectValueInLocation {
                pos,
                loc,
                expected,
                actual,
            });
        }
    }

    /// Every argument must be in its reported location.
    fn check_reads(&mut self, pos: Pos, op: &Operation, allocs: &OpAllocs, out: &Output) -> bool {
        let mut complete = true;
        for (index, &arg) in op.args.iter().enumerate() {
            match allocs.args.get(index) {
                Some(&loc) => self.expect(pos, loc, arg.into(), out),
                None => {
                    self.errors
                        .push(CheckerError::MissingAllocation { pos, index });
                    complete = false;
                }
            }
        }
        complete
    }

    fn check_op(&mut self, pos: Pos, op: &Operation, allocs: &OpAllocs, out: &Output) {
        match &op.kind {
            OpKind::Normal | OpKind::Guard { .. } => {
                if self.check_reads(pos, op, allocs, out) {
                    self.check_constraints(pos, op, allocs);
                }
                if let OpKind::Guard { fail_args } = &op.kind {
                    self.check_guard(pos, fail_args, allocs, out);
                }
                for &temp in &allocs.temps {
                    self.state.set(temp, None);
                }
                self.define_result(op, allocs);
            }
            OpKind::Call(descr) => self.check_call(pos, op, descr.effect, allocs, out),
            OpKind::Label => {
                if !self.check_reads(pos, op, allocs, out) {
                    return;
                }
                let mut locations = FxHashMap::default();
                for (&arg, &loc) in op.args.iter().zip(&allocs.args) {
                    locations.insert(loc, Symbol::from(arg));
                }
                self.state.locations = locations;
            }
            OpKind::Jump => {
                let target = out.label_layout.as_ref().or(self.jump_target.as_ref());
                let Some(target) = target.cloned() else {
                    self.errors.push(CheckerError::JumpWithoutTarget { pos });
                    return;
                };
                if target.len() != op.args.len() {
                    self.errors.push(CheckerError::MissingAllocation {
                        pos,
                        index: target.len().min(op.args.len()),
                    });
                    return;
                }
                for (&arg, &loc) in op.args.iter().zip(&target) {
                    self.expect(pos, loc, arg.into(), out);
                }
            }
            OpKind::Finish => {
                self.check_reads(pos, op, allocs, out);
            }
        }
    }

    fn define_result(&mut self, op: &Operation, allocs: &OpAllocs) {
        if let (Some(result), Some(loc)) = (op.result, allocs.result) {
            self.state.set(loc, Some(Symbol::Value(result)));
        }
    }

    fn check_constraints(&mut self, pos: Pos, op: &Operation, allocs: &OpAllocs) {
        for (index, &arg) in op.args.iter().enumerate() {
            let loc = allocs.args[index];
            if let Some(reg) = op.pin_for_arg(index) {
                if loc != Location::Reg(reg) {
                    self.errors.push(CheckerError::AllocationIsNotFixedReg {
                        pos,
                        loc,
                        expected: reg,
                    });
                }
            }
            if arg.as_value().is_none() {
                continue;
            }
            match loc {
                Location::Reg(reg) => {
                    if op.byte_operands && !self.env.byte_regs.contains(reg) {
                        self.errors.push(CheckerError::NotByteAddressable { pos, reg });
                    }
                }
                _ => self
                    .errors
                    .push(CheckerError::AllocationIsNotReg { pos, index, loc }),
            }
        }

        if op.needs_pair {
            let even = allocs.args[0];
            let paired = match (even, allocs.result) {
                (Location::Reg(e), Some(Location::Reg(o))) => self.env.pairs.contains(&(e, o)),
                _ => false,
            };
            if !paired {
                self.errors.push(CheckerError::NotARegisterPair {
                    pos,
                    even,
                    odd: allocs.result,
                });
            }
            return;
        }

        let Some(result_loc) = allocs.result else {
            return;
        };
        if let Some(reg) = op.result_pin {
            if result_loc != Location::Reg(reg) {
                self.errors.push(CheckerError::AllocationIsNotFixedReg {
                    pos,
                    loc: result_loc,
                    expected: reg,
                });
            }
        }
        let two_address = !op.args.is_empty()
            && op.pin_for_arg(0).map_or(true, |reg| op.result_pin == Some(reg));
        if !two_address {
            return;
        }
        if allocs.args[0] != result_loc {
            self.errors.push(CheckerError::AllocationIsNotReuse {
                pos,
                loc: allocs.args[0],
                expected: result_loc,
            });
        }
        // The result register receives the first argument before the
        // operation reads the others.
        for (index, &arg) in op.args.iter().enumerate().skip(1) {
            if allocs.args[index] == result_loc && arg != op.args[0] {
                self.errors.push(CheckerError::ArgumentOverwrittenByResult {
                    pos,
                    index,
                    loc: result_loc,
                });
            }
        }
    }

    fn check_guard(&mut self, pos: Pos, fail_args: &[Operand], allocs: &OpAllocs, out: &Output) {
        let Some(guard) = allocs.guard else {
            self.errors.push(CheckerError::MissingGuardToken { pos });
            return;
        };
        if guard.index() >= out.guards.len() {
            self.errors.push(CheckerError::MissingGuardToken { pos });
            return;
        }
        let token = &out.guards[guard];
        if token.fail_locations.len() != fail_args.len() || token.live_refs.len() != fail_args.len()
        {
            self.errors.push(CheckerError::GuardTokenMismatch {
                guard,
                fail_args: fail_args.len(),
                locations: token.fail_locations.len(),
            });
            return;
        }
        for (index, (&arg, &loc)) in fail_args.iter().zip(&token.fail_locations).enumerate() {
            self.expect(pos, loc, arg.into(), out);
            if token.is_ref(index) != arg.ty().is_ref() {
                self.errors.push(CheckerError::WrongRefBit { guard, index });
            }
            if let Location::Stack(slot) = loc {
                if slot.end() > token.frame_depth {
                    self.errors
                        .push(CheckerError::GuardFrameTooShallow { guard, slot });
                }
            }
        }
    }

    fn check_call(
        &mut self,
        pos: Pos,
        op: &Operation,
        effect: CallEffect,
        allocs: &OpAllocs,
        out: &Output,
    ) {
        // Register arguments are read from the convention's registers
        // after the shuffle; stack arguments were stored before it and
        // are checked in the outgoing area.
        let mut next = [0usize; 2];
        let mut stack_index = 0u32;
        for (index, &arg) in op.args.iter().enumerate() {
            let class = arg.ty().class() as usize;
            let k = next[class];
            next[class] += 1;
            match self.env.arg_regs_by_class[class].get(k) {
                Some(&reg) => match allocs.args.get(index) {
                    Some(&loc) if loc == Location::Reg(reg) => {
                        self.expect(pos, loc, arg.into(), out);
                    }
                    Some(&loc) => self.errors.push(CheckerError::AllocationIsNotFixedReg {
                        pos,
                        loc,
                        expected: reg,
                    }),
                    None => self
                        .errors
                        .push(CheckerError::MissingAllocation { pos, index }),
                },
                None => {
                    let expected = Symbol::from(arg);
                    let actual = self.state.outgoing.get(&stack_index).copied().flatten();
                    if actual != Some(expected) {
                        self.errors.push(CheckerError::StackArgumentMismatch {
                            pos,
                            index: stack_index,
                            expected,
                            actual,
                        });
                    }
                    stack_index += 1;
                }
            }
        }
        self.state.outgoing.clear();

        if (effect == CallEffect::ReleasesLock) != self.state.lock_released {
            self.errors.push(CheckerError::LockProtocol { pos });
        }
        let caller_saved = self.env.caller_saved;
        let may_collect = effect.may_collect();
        self.state.clobber(|reg, sym| {
            caller_saved.contains(reg)
                || (may_collect && matches!(sym, Symbol::Value(v) if v.ty().is_ref()))
        });

        if let Some(result) = op.result {
            let reg = self.env.result_reg_by_class[result.class() as usize];
            match allocs.result {
                Some(loc) if loc == Location::Reg(reg) => {}
                Some(loc) => self.errors.push(CheckerError::AllocationIsNotFixedReg {
                    pos,
                    loc,
                    expected: reg,
                }),
                None => self.errors.push(CheckerError::MissingAllocation {
                    pos,
                    index: op.args.len(),
                }),
            }
        }
        self.define_result(op, allocs);
    }
}

/// Run the checker over an allocation result.
pub fn check(trace: &Trace, env: &MachineEnv, out: &Output) -> Result<(), CheckerErrors> {
    Checker::new(trace, env).run(out)
}
