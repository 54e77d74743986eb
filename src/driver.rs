/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The reference driver: walks a trace front to back, the way an
//! encoder would, and records every allocation decision.

use crate::guard::{GuardToken, GuardTokens};
use crate::moves::remap_mixed;
use crate::regalloc::{RegAlloc, RegConstraint};
use crate::target::TargetProfile;
use crate::trace::{OpKind, Operand, Operation, Trace};
use crate::{
    AllocError, Edit, FxHashSet, Location, OpAllocs, Options, Output, Pos, ProgPoint, RegClass,
    Value, ValueType,
};
use smallvec::{smallvec, SmallVec};

/// How a bridge is entered: where the guard it is attached to left
/// each input, and where its final jump must deliver its arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeEntry {
    pub input_locations: Vec<Location>,
    /// Frame depth at the guard; the bridge never reuses words below it
    /// that hold inputs, and never shrinks the frame.
    pub frame_depth: usize,
    /// The label layout of the loop the bridge jumps to, if it ends in
    /// a jump.
    pub jump_target: Option<Vec<Location>>,
}

impl BridgeEntry {
    /// The entry state of a bridge attached to the guard of `token`.
    /// The bridge has one input per distinct non-constant fail
    /// location, in fail-argument order.
    pub fn from_guard(token: &GuardToken, jump_target: Option<Vec<Location>>) -> Self {
        let mut seen = FxHashSet::default();
        let input_locations = token
            .fail_locations
            .iter()
            .copied()
            .filter(|loc| !loc.is_const() && seen.insert(*loc))
            .collect();
        BridgeEntry {
            input_locations,
            frame_depth: token.frame_depth,
            jump_target,
        }
    }
}

struct Driver<'a, 't, T: TargetProfile + ?Sized> {
    trace: &'t Trace,
    ra: RegAlloc<'a, T>,
    op_allocs: Vec<OpAllocs>,
    guards: GuardTokens,
    label_layout: Option<Vec<Location>>,
    jump_target: Option<Vec<Location>>,
    check: bool,
}

impl<'a, 't, T: TargetProfile + ?Sized> Driver<'a, 't, T> {
    fn new(
        trace: &'t Trace,
        target: &'a T,
        options: Options,
        jump_target: Option<Vec<Location>>,
    ) -> Result<Self, AllocError> {
        Ok(Driver {
            trace,
            ra: RegAlloc::new(trace, target, options)?,
            op_allocs: Vec::with_capacity(trace.ops.len()),
            guards: GuardTokens::default(),
            label_layout: None,
            jump_target,
            check: options.check_invariants || cfg!(debug_assertions),
        })
    }

    fn run(mut self, input_locations: Vec<Location>) -> Result<Output, AllocError> {
        let trace = self.trace;
        for (i, op) in trace.ops.iter().enumerate() {
            self.ra.set_position(Pos::new(i));
            let allocs = self.process(op)?;
            trace!("op {}: {:?}", i, allocs);
            self.op_allocs.push(allocs);
            if self.check {
                self.ra.check_invariants()?;
            }
        }

        let mut edits = self.ra.take_edits();
        // Stable: edits at the same point keep their emission order.
        edits.sort_by_key(|&(point, _)| point);
        let stats = self.ra.stats();
        log::debug!("stats: {:?}", stats);

        let output = Output {
            op_allocs: self.op_allocs,
            edits,
            guards: self.guards,
            frame_depth: self.ra.frame().frame_depth(),
            label_layout: self.label_layout,
            input_locations,
            pool: self.ra.pool.entries().to_vec(),
            stats,
        };
        if self.ra.options.verbose_log && trace_enabled!() {
            dump(trace, &output);
        }
        Ok(output)
    }

    fn process(&mut self, op: &Operation) -> Result<OpAllocs, AllocError> {
        match &op.kind {
            OpKind::Normal if op.needs_pair => self.pair_op(op),
            OpKind::Normal => self.normal(op),
            OpKind::Guard { fail_args } => {
                let mut allocs = self.normal(op)?;
                let id = self.guards.next_index();
                let token = self.ra.snapshot(fail_args, id)?;
                self.guards.push(token);
                allocs.guard = Some(id);
                Ok(allocs)
            }
            OpKind::Call(descr) => self.ra.call(op, descr.effect),
            OpKind::Label => self.label(op),
            OpKind::Jump => self.jump(op),
            OpKind::Finish => {
                let mut allocs = OpAllocs::default();
                for &arg in &op.args {
                    allocs.args.push(self.ra.operand_location(arg)?);
                }
                Ok(allocs)
            }
        }
    }

    /// Register arguments, pinned operands, and a result in two-address
    /// form when the first argument can be overwritten.
    fn normal(&mut self, op: &Operation) -> Result<OpAllocs, AllocError> {
        let mut forbidden: SmallVec<[Value; 8]> = op.arg_values().collect();
        forbidden.extend(op.result);
        let constraint = if op.byte_operands {
            RegConstraint::Byte
        } else {
            RegConstraint::Any
        };
        let two_address = op.result.is_some()
            && !op.args.is_empty()
            && op.pin_for_arg(0).map_or(true, |reg| op.result_pin == Some(reg));

        for (i, &arg) in op.args.iter().enumerate() {
            if two_address && i == 0 {
                continue;
            }
            let Some(reg) = op.pin_for_arg(i) else {
                continue;
            };
            match arg {
                Operand::Value(v) => self.ra.force_fixed(v, reg, &forbidden)?,
                Operand::Const(c) => self.ra.load_constant(c, reg, &forbidden)?,
            }
        }

        let source = two_address.then(|| op.args[0]);
        if let (Some(result), Some(reg)) = (op.result, op.result_pin) {
            self.ra
                .force_result_in_fixed(result, reg, source, &forbidden)?;
        }

        for (i, &arg) in op.args.iter().enumerate() {
            if (two_address && i == 0) || op.pin_for_arg(i).is_some() {
                continue;
            }
            if let Operand::Value(v) = arg {
                self.ra.force_allocate(v, constraint, &forbidden)?;
            }
        }

        let mut allocs = OpAllocs::default();
        for (i, &arg) in op.args.iter().enumerate() {
            if two_address && i == 0 {
                continue;
            }
            allocs.args.push(match op.pin_for_arg(i) {
                Some(reg) => Location::Reg(reg),
                None => self.ra.operand_location(arg)?,
            });
        }

        if let Some(result) = op.result {
            let reg = match op.result_pin {
                Some(reg) => reg,
                None => self
                    .ra
                    .force_result_in_reg(result, source, constraint, &forbidden)?,
            };
            allocs.result = Some(Location::Reg(reg));
            if two_address {
                allocs.args.insert(0, Location::Reg(reg));
            }
        }
        Ok(allocs)
    }

    /// The first argument is read from the even register of a pair and
    /// the result produced in the odd one; the even register is
    /// clobbered.
    fn pair_op(&mut self, op: &Operation) -> Result<OpAllocs, AllocError> {
        let (Some(result), Some(&first)) = (op.result, op.args.first()) else {
            return Err(AllocError::InvariantViolation(format!(
                "pair operation at {} needs an argument and a result",
                self.ra.pos()
            )));
        };
        let t = self.ra.new_temp(ValueType::Int);
        let (even, odd) = self.ra.ensure_pair(t, result, true, &[])?;

        let mut keep: SmallVec<[Value; 8]> = op.arg_values().collect();
        keep.extend([t, result]);
        let constraint = if op.byte_operands {
            RegConstraint::Byte
        } else {
            RegConstraint::Any
        };
        for &arg in &op.args[1..] {
            if let Operand::Value(v) = arg {
                self.ra.force_allocate(v, constraint, &keep)?;
            }
        }
        let mut allocs = OpAllocs {
            args: smallvec![Location::Reg(even)],
            result: Some(Location::Reg(odd)),
            temps: smallvec![Location::Reg(even)],
            guard: None,
        };
        for &arg in &op.args[1..] {
            allocs.args.push(self.ra.operand_location(arg)?);
        }

        let from = self.ra.operand_location(first)?;
        self.ra.emit(Edit::Move {
            from,
            to: Location::Reg(even),
        });
        if from.is_memory() {
            self.ra.stats.reloads += 1;
        } else {
            self.ra.stats.moves += 1;
        }
        Ok(allocs)
    }

    /// Fix the loop layout: every label argument stays where it is.
    fn label(&mut self, op: &Operation) -> Result<OpAllocs, AllocError> {
        let mut layout = Vec::with_capacity(op.args.len());
        for &arg in &op.args {
            let Operand::Value(v) = arg else {
                return Err(AllocError::InvariantViolation(format!(
                    "constant label argument at {}",
                    self.ra.pos()
                )));
            };
            layout.push(self.ra.operand_location(arg)?);
            // The back-edge only writes the layout location, so a stack
            // copy would be stale on the next iteration.
            self.ra.drop_stack_copy(v);
        }

        if let Some(jump) = self.trace.jump() {
            for ((&label_arg, &jump_arg), &loc) in op.args.iter().zip(&jump.args).zip(&layout) {
                if let (Operand::Value(w), Some(slot)) = (jump_arg, loc.as_stack()) {
                    if jump_arg != label_arg {
                        self.ra.frame.hint(w, slot.index());
                    }
                }
            }
        }

        trace!("label layout: {:?}", layout);
        self.label_layout = Some(layout.clone());
        Ok(OpAllocs {
            args: layout.into_iter().collect(),
            ..OpAllocs::default()
        })
    }

    /// Deliver the jump arguments to the target layout.
    fn jump(&mut self, op: &Operation) -> Result<OpAllocs, AllocError> {
        let pos = self.ra.pos();
        let target = match (&self.label_layout, &self.jump_target) {
            (Some(layout), _) | (None, Some(layout)) => layout.clone(),
            (None, None) => {
                return Err(AllocError::InvariantViolation(format!(
                    "jump at {} has no target layout",
                    pos
                )))
            }
        };
        if target.len() != op.args.len() {
            return Err(AllocError::InvariantViolation(format!(
                "jump at {} passes {} arguments to a layout of {}",
                pos,
                op.args.len(),
                target.len()
            )));
        }

        let mut allocs = OpAllocs::default();
        let mut src: [SmallVec<[Location; 8]>; 2] = Default::default();
        let mut dst: [SmallVec<[Location; 8]>; 2] = Default::default();
        for (&arg, &to) in op.args.iter().zip(&target) {
            let ty = arg.ty();
            let class = ty.class();
            let fits = match to {
                Location::Reg(reg) => reg.class() == class,
                Location::Stack(slot) => slot.width() == self.ra.target.slot_width(ty),
                _ => false,
            };
            if !fits {
                return Err(AllocError::InvariantViolation(format!(
                    "jump at {} cannot deliver a {:?} to {}",
                    pos, ty, to
                )));
            }
            let from = self.ra.operand_location(arg)?;
            allocs.args.push(from);
            src[class as usize].push(from);
            dst[class as usize].push(to);
        }

        let env = self.ra.env;
        let moves = remap_mixed(
            &src[RegClass::Int as usize],
            &dst[RegClass::Int as usize],
            env.scratch_by_class[RegClass::Int as usize],
            &src[RegClass::Float as usize],
            &dst[RegClass::Float as usize],
            env.scratch_by_class[RegClass::Float as usize],
            env.stack_to_stack_moves,
        )?;
        for edit in moves {
            match edit {
                Edit::Push(_) => self.ra.stats.cycles += 1,
                Edit::Move { .. } => self.ra.stats.moves += 1,
                _ => {}
            }
            self.ra.emit(edit);
        }
        Ok(allocs)
    }
}

/// Allocate a trace entered from the top, e.g. a loop. Inputs arrive
/// in consecutive frame slots.
pub fn run<T: TargetProfile + ?Sized>(
    trace: &Trace,
    target: &T,
    options: Options,
) -> Result<Output, AllocError> {
    let mut driver = Driver::new(trace, target, options, None)?;
    let mut input_locations = Vec::with_capacity(trace.inputs.len());
    for &v in &trace.inputs {
        input_locations.push(Location::Stack(driver.ra.spill_entry(v)?));
    }
    driver.run(input_locations)
}

/// Allocate a bridge: a trace entered from a failing guard, whose
/// inputs are where the guard left them.
pub fn run_bridge<T: TargetProfile + ?Sized>(
    trace: &Trace,
    target: &T,
    entry: &BridgeEntry,
    options: Options,
) -> Result<Output, AllocError> {
    if entry.input_locations.len() != trace.inputs.len() {
        return Err(AllocError::InvariantViolation(format!(
            "bridge has {} inputs but {} entry locations",
            trace.inputs.len(),
            entry.input_locations.len()
        )));
    }
    let mut driver = Driver::new(trace, target, options, entry.jump_target.clone())?;
    for (&v, &loc) in trace.inputs.iter().zip(&entry.input_locations) {
        driver.ra.bind_entry(v, loc)?;
    }
    driver.ra.frame.reserve(entry.frame_depth)?;

    if let (Some(jump), Some(layout)) = (trace.jump(), &entry.jump_target) {
        for (&arg, &loc) in jump.args.iter().zip(layout) {
            if let (Operand::Value(v), Some(slot)) = (arg, loc.as_stack()) {
                driver.ra.frame.hint(v, slot.index());
            }
        }
    }
    driver.run(entry.input_locations.clone())
}

fn dump(trace: &Trace, output: &Output) {
    log::trace!("inputs: {:?}", output.input_locations);
    for (i, (op, allocs)) in trace.ops.iter().zip(&output.op_allocs).enumerate() {
        let pos = Pos::new(i);
        for edit in output.edits_at(ProgPoint::before(pos)) {
            log::trace!("       {}", edit);
        }
        log::trace!(
            "{}: {:?} args {:?} -> {:?}",
            pos,
            op.kind,
            allocs.args,
            allocs.result
        );
        for edit in output.edits_at(ProgPoint::after(pos)) {
            log::trace!("       {}", edit);
        }
    }
    log::trace!(
        "frame depth {}, pool {} bytes",
        output.frame_depth,
        output.pool_size()
    );
}
