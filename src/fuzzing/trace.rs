//! Fuzz the allocator with arbitrary traces, checking every result
//! with the [`checker`](crate::checker).

use crate::checker;
use crate::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use crate::guard::GuardId;
use crate::target::{Arm32, CustomTarget, TargetProfile, X64};
use crate::trace::{CallEffect, Constant, OpKind, Operand, Operation, Trace, TraceBuilder};
use crate::{run, run_bridge, BridgeEntry, Options, Value, ValueType};

#[derive(Clone, Copy, Debug)]
pub enum TargetKind {
    X64,
    Arm32,
    /// Four integer registers, two of them caller-saved.
    Small,
}

/// Knobs for trace generation.
#[derive(Clone, Copy, Debug)]
pub struct TraceOptions {
    pub loops: bool,
    pub calls: bool,
    pub pairs: bool,
    pub max_ops: usize,
}

impl TraceOptions {
    pub const DEFAULT: TraceOptions = TraceOptions {
        loops: true,
        calls: true,
        pairs: true,
        max_ops: 40,
    };
}

const TYPES: [ValueType; 4] = [
    ValueType::Int,
    ValueType::Ref,
    ValueType::Float,
    ValueType::Vector,
];

fn constant(u: &mut Unstructured, ty: ValueType) -> Result<Constant> {
    let bits: u64 = if u.ratio(1, 4)? {
        u64::arbitrary(u)?
    } else {
        u.int_in_range(0..=300)?
    };
    Ok(match ty {
        ValueType::Int => Constant::Int(bits as i64),
        ValueType::Ref => Constant::Ref(bits),
        _ => Constant::Float(bits),
    })
}

fn operand(u: &mut Unstructured, defined: &[Value], ty: ValueType) -> Result<Operand> {
    let same: Vec<Value> = defined.iter().copied().filter(|v| v.ty() == ty).collect();
    if same.is_empty() || u.ratio(1, 5)? {
        Ok(constant(u, ty)?.into())
    } else {
        Ok((*u.choose(&same)?).into())
    }
}

fn operands(u: &mut Unstructured, defined: &[Value], max: usize) -> Result<Vec<Operand>> {
    let n = u.int_in_range(0..=max)?;
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        let ty = *u.choose(&TYPES)?;
        args.push(operand(u, defined, ty)?);
    }
    Ok(args)
}

/// Generate a straight-line trace, optionally looping back to a label
/// over its inputs. Operations never carry pins other than those the
/// calling convention implies, so allocation always succeeds.
pub fn arbitrary_trace(
    u: &mut Unstructured,
    opts: &TraceOptions,
    inputs: &[ValueType],
    looped: bool,
) -> Result<Trace> {
    let mut b = TraceBuilder::new();
    let mut defined: Vec<Value> = inputs.iter().map(|&ty| b.input(ty)).collect();
    let entry = defined.clone();
    if looped {
        b.label(&entry);
    }
    arbitrary_body(u, opts, &mut b, &mut defined)?;

    if looped {
        let types: Vec<ValueType> = entry.iter().map(|v| v.ty()).collect();
        arbitrary_jump(u, &mut b, &mut defined, &types)?;
    } else {
        let args = operands(u, &defined, 4)?;
        b.finish(&args);
    }
    Ok(b.build())
}

/// Jump with one value of each label type, defining one first where
/// none exists.
fn arbitrary_jump(
    u: &mut Unstructured,
    b: &mut TraceBuilder,
    defined: &mut Vec<Value>,
    label: &[ValueType],
) -> Result<()> {
    let mut args = Vec::with_capacity(label.len());
    for &ty in label {
        if !defined.iter().any(|v| v.ty() == ty) {
            defined.push(b.op(ty, &[]));
        }
        let same: Vec<Value> = defined.iter().copied().filter(|w| w.ty() == ty).collect();
        args.push(Operand::from(*u.choose(&same)?));
    }
    b.jump(&args);
    Ok(())
}

fn arbitrary_body(
    u: &mut Unstructured,
    opts: &TraceOptions,
    b: &mut TraceBuilder,
    defined: &mut Vec<Value>,
) -> Result<()> {
    for _ in 0..u.int_in_range(1..=opts.max_ops)? {
        match u.int_in_range(0..=9)? {
            0..=3 => {
                let ty = *u.choose(&TYPES)?;
                let mut args = vec![];
                if bool::arbitrary(u)? {
                    args.push(operand(u, &defined, ty)?);
                    args.extend(operands(u, &defined, 2)?);
                }
                if u.ratio(1, 4)? {
                    b.effect(&args);
                } else {
                    defined.push(b.op(ty, &args));
                }
            }
            4 if opts.pairs => {
                let mut op = Operation::new(OpKind::Normal);
                op.needs_pair = true;
                op.args.push(operand(u, &defined, ValueType::Int)?);
                op.args.extend(operands(u, &defined, 1)?);
                if let Some(v) = b.push(op, Some(ValueType::Int)) {
                    defined.push(v);
                }
            }
            5 | 6 => {
                let cond = operand(u, &defined, ValueType::Int)?;
                let fail = operands(u, &defined, 4)?;
                b.guard(&[cond], &fail);
            }
            7 | 8 if opts.calls => {
                let effect = *u.choose(&[
                    CallEffect::Pure,
                    CallEffect::MayCallArbitrary,
                    CallEffect::ReleasesLock,
                ])?;
                let args = operands(u, &defined, 8)?;
                let ty = if bool::arbitrary(u)? {
                    Some(*u.choose(&TYPES)?)
                } else {
                    None
                };
                if let Some(v) = b.call(effect, &args, ty) {
                    defined.push(v);
                }
            }
            _ => {
                let args = operands(u, &defined, 3)?;
                b.effect(&args);
            }
        }
    }
    Ok(())
}

/// A trace, the target to allocate it for, and a bridge attached to
/// its first guard.
#[derive(Debug)]
pub struct TestCase {
    target: TargetKind,
    trace: Trace,
    bridge_seed: Vec<u8>,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<TestCase> {
        let target = *u.choose(&[TargetKind::X64, TargetKind::Arm32, TargetKind::Small])?;
        let mut opts = TraceOptions::DEFAULT;
        opts.pairs = !matches!(target, TargetKind::X64);
        let mut inputs = vec![];
        for _ in 0..u.int_in_range(0..=6)? {
            inputs.push(*u.choose(&TYPES)?);
        }
        let looped = opts.loops && !inputs.is_empty() && bool::arbitrary(u)?;
        let trace = arbitrary_trace(u, &opts, &inputs, looped)?;
        let bridge_seed = Vec::<u8>::arbitrary(u)?;
        Ok(TestCase {
            target,
            trace,
            bridge_seed,
        })
    }
}

/// Allocate the trace, check the result, then do the same for a
/// bridge entered from the first guard.
pub fn check(t: TestCase) {
    let small = CustomTarget::small(4, 2);
    let target: &dyn TargetProfile = match t.target {
        TargetKind::X64 => &X64,
        TargetKind::Arm32 => &Arm32,
        TargetKind::Small => &small,
    };
    log::trace!("trace on {}:\n{:?}", target.env().name, t.trace);

    let out = run(&t.trace, target, Options::default()).expect("allocation failed");
    checker::check(&t.trace, target.env(), &out).expect("checker failed");

    if out.guards.is_empty() {
        return;
    }
    let token = &out.guards[GuardId::new(0)];
    let guard = t
        .trace
        .ops
        .iter()
        .find(|op| op.is_guard())
        .expect("guard token without a guard");

    // One bridge input per distinct location, typed by the first fail
    // argument found there.
    let mut input_types = vec![];
    let mut seen = vec![];
    for (&arg, &loc) in guard.fail_args().iter().zip(&token.fail_locations) {
        if !loc.is_const() && !seen.contains(&loc) {
            seen.push(loc);
            input_types.push(arg.ty());
        }
    }
    let jump_target = out.label_layout.clone();
    let entry = BridgeEntry::from_guard(token, jump_target.clone());
    assert_eq!(entry.input_locations, seen);

    let mut u = Unstructured::new(&t.bridge_seed);
    let bridge = match &jump_target {
        Some(layout) if !layout.is_empty() => {
            let label_types: Vec<ValueType> = t.trace.inputs.iter().map(|v| v.ty()).collect();
            arbitrary_bridge(&mut u, &input_types, &label_types)
        }
        _ => arbitrary_trace(&mut u, &TraceOptions::DEFAULT, &input_types, false),
    };
    let Ok(bridge) = bridge else {
        return;
    };
    log::trace!("bridge:\n{:?}", bridge);

    let bout = run_bridge(&bridge, target, &entry, Options::default())
        .expect("bridge allocation failed");
    let mut checker = checker::Checker::new(&bridge, target.env());
    if let Some(layout) = jump_target {
        checker = checker.with_jump_target(layout);
    }
    checker.run(&bout).expect("bridge checker failed");
}

/// A bridge that ends by jumping to the loop label: the jump passes one
/// value of each label argument's type.
fn arbitrary_bridge(
    u: &mut Unstructured,
    inputs: &[ValueType],
    label_types: &[ValueType],
) -> Result<Trace> {
    let mut b = TraceBuilder::new();
    let mut defined: Vec<Value> = inputs.iter().map(|&ty| b.input(ty)).collect();
    arbitrary_body(u, &TraceOptions::DEFAULT, &mut b, &mut defined)?;
    arbitrary_jump(u, &mut b, &mut defined, label_types)?;
    Ok(b.build())
}
