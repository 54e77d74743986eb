/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Call boundaries.
//!
//! Around a call the allocator saves values held in registers the
//! callee may clobber, shuffles the arguments into the calling
//! convention's registers, and binds the result. Saved values are not
//! reloaded after the call; they are fetched from their new location
//! when next needed.

use crate::moves::remap_mixed;
use crate::regalloc::RegAlloc;
use crate::target::TargetProfile;
use crate::trace::{CallEffect, Operation};
use crate::{AllocError, Edit, Location, OpAllocs, PReg, RegClass};
use smallvec::{smallvec, SmallVec};

impl<'a, T: TargetProfile + ?Sized> RegAlloc<'a, T> {
    /// Allocate a call operation at the current position.
    pub fn call(&mut self, op: &Operation, effect: CallEffect) -> Result<OpAllocs, AllocError> {
        let env = self.env;
        let pos = self.pos();

        // Where the arguments are now. Saving registers below copies
        // values without overwriting anything, so these stay valid
        // until the argument shuffle.
        let mut sources: SmallVec<[Location; 8]> = smallvec![];
        for &arg in &op.args {
            sources.push(self.operand_location(arg)?);
        }

        let mut src: [SmallVec<[Location; 8]>; 2] = Default::default();
        let mut dst: [SmallVec<[Location; 8]>; 2] = Default::default();
        let mut stack_args: SmallVec<[(Location, u32); 4]> = smallvec![];
        let mut allocs = OpAllocs::default();
        for (&arg, &from) in op.args.iter().zip(&sources) {
            let class = arg.ty().class() as usize;
            match env.arg_regs_by_class[class].get(dst[class].len()) {
                Some(&reg) => {
                    src[class].push(from);
                    dst[class].push(Location::Reg(reg));
                    allocs.args.push(Location::Reg(reg));
                }
                None => {
                    stack_args.push((from, stack_args.len() as u32));
                    allocs.args.push(from);
                }
            }
        }

        // A callee-saved result register is emptied before the saves,
        // which then catch anything it relocates into a caller-saved
        // register.
        let result_reg = op
            .result
            .map(|result| env.result_reg_by_class[result.class() as usize]);
        if let (Some(result), Some(reg)) = (op.result, result_reg) {
            if !env.caller_saved.contains(reg) {
                let mut keep: SmallVec<[_; 8]> = op.arg_values().collect();
                keep.push(result);
                self.make_room(reg, result, &keep)?;
            }
        }
        self.save_around_call(effect, result_reg)?;

        for (from, index) in stack_args {
            self.emit(Edit::StoreArg { from, index });
        }
        let [int_src, float_src] = &src;
        let [int_dst, float_dst] = &dst;
        let shuffle = remap_mixed(
            int_src,
            int_dst,
            env.scratch_by_class[RegClass::Int as usize],
            float_src,
            float_dst,
            env.scratch_by_class[RegClass::Float as usize],
            env.stack_to_stack_moves,
        )?;
        for edit in shuffle {
            match edit {
                Edit::Push(_) => self.stats.cycles += 1,
                Edit::Move { .. } => self.stats.moves += 1,
                _ => {}
            }
            self.emit(edit);
        }

        // Whatever is left in a clobbered register dies here.
        for reg in env.caller_saved.iter() {
            if let Some(v) = self.value_in(reg) {
                debug_assert!(self.lifetimes.lifetime(v).end <= pos);
                self.unbind_reg(reg);
            }
        }

        if effect == CallEffect::ReleasesLock {
            self.emit(Edit::ReleaseLock);
        }

        self.set_after();
        if let (Some(result), Some(reg)) = (op.result, result_reg) {
            allocs.result = Some(Location::Reg(reg));
            self.bind_reg(result, reg);
            if effect == CallEffect::ReleasesLock {
                self.preserve_across_reacquire(reg)?;
            }
        }
        if effect == CallEffect::ReleasesLock {
            self.emit(Edit::ReacquireLock {
                scratch: env.lock_scratch,
            });
        }
        Ok(allocs)
    }

    /// Empty the registers a call may clobber of values that outlive
    /// it. A call that cannot collect lets values move to a free
    /// callee-saved register; otherwise they are spilled, and so are
    /// references in any register, since a collection may move the
    /// objects they point to.
    fn save_around_call(
        &mut self,
        effect: CallEffect,
        result_reg: Option<PReg>,
    ) -> Result<(), AllocError> {
        let env = self.env;
        let pos = self.pos();
        for class in RegClass::ALL {
            for &reg in &env.regs_by_class[class as usize] {
                let Some(v) = self.value_in(reg) else {
                    continue;
                };
                let end = self.lifetimes.lifetime(v).end;
                if end <= pos {
                    continue;
                }
                let clobbered = env.caller_saved.contains(reg);
                let moved_by_gc = effect.may_collect() && v.ty().is_ref();
                if !clobbered && !moved_by_gc {
                    continue;
                }
                if !effect.may_collect() {
                    if let Some(to) = self.free_callee_saved(class, end, result_reg) {
                        trace!("call: keep {} in {} instead of {}", v, to, reg);
                        self.emit(Edit::Move {
                            from: Location::Reg(reg),
                            to: Location::Reg(to),
                        });
                        self.rebind(reg, to);
                        self.stats.moves += 1;
                        continue;
                    }
                }
                self.spill(v)?;
            }
        }
        Ok(())
    }

    /// Reacquiring the lock may run the runtime's slow path, which
    /// clobbers every caller-saved register: move the result that
    /// just arrived in `reg` somewhere safe.
    fn preserve_across_reacquire(&mut self, reg: PReg) -> Result<(), AllocError> {
        let Some(result) = self.value_in(reg) else {
            return Ok(());
        };
        if !self.env.caller_saved.contains(reg) {
            return Ok(());
        }
        let end = self.lifetimes.lifetime(result).end;
        if let Some(to) = self.free_callee_saved(reg.class(), end, None) {
            self.emit(Edit::Move {
                from: Location::Reg(reg),
                to: Location::Reg(to),
            });
            self.rebind(reg, to);
            self.stats.moves += 1;
        } else {
            self.spill(result)?;
        }
        Ok(())
    }
}
