use crate::checker::{check, Checker};
use crate::guard::GuardId;
use crate::regalloc::{RegAlloc, RegConstraint};
use crate::target::{CustomTarget, TargetProfile, X64};
use crate::trace::{CallEffect, Constant, OpKind, Operand, Operation, Trace, TraceBuilder};
use crate::{
    run, run_bridge, AllocError, BridgeEntry, Edit, Location, Options, Output, PReg, PRegSet, Pos,
    ProgPoint, RegClass, SlotWidth, SpillSlot, Value, ValueType,
};

#[test]
fn test_pinned_uses_share_register() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.op(ValueType::Int, &[]);
    let bv = b.op(ValueType::Int, &[]);
    let c = b.op(ValueType::Int, &[]);
    fill(&mut b, 2);
    pinned_use(&mut b, a, gpr(2));
    fill(&mut b, 4);
    pinned_use(&mut b, bv, gpr(2));
    fill(&mut b, 4);
    pinned_use(&mut b, c, gpr(2));
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(2)));
    assert_eq!(out.op_allocs[1].result, Some(reg(0)));
    assert_eq!(out.op_allocs[2].result, Some(reg(1)));
    for pos in [5, 10, 15] {
        assert_eq!(&out.op_allocs[pos].args[..], &[reg(2)]);
    }
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(10))),
        vec![Edit::Move {
            from: reg(0),
            to: reg(2)
        }]
    );
    assert_eq!(out.stats.spills, 0);
    assert_eq!(out.stats.evictions, 0);
}

#[test]
fn test_evicts_value_used_furthest_away() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let inputs: Vec<Value> = (0..4).map(|_| b.input(ValueType::Int)).collect();
    b.effect(&[]);
    let v4 = b.op(ValueType::Int, &[]);
    b.effect(&[inputs[3].into()]);
    b.effect(&[inputs[0].into()]);
    b.effect(&[v4.into()]);
    fill(&mut b, 4);
    b.effect(&[inputs[1].into(), inputs[2].into()]);
    let trace = b.build();

    let mut ra = RegAlloc::new(&trace, &target, Options::default()).unwrap();
    let values = [inputs[0], inputs[1], inputs[2], inputs[3], v4];
    let ranges: Vec<(usize, usize)> = values
        .iter()
        .map(|&v| {
            let lt = ra.lifetimes().get(v).unwrap();
            (lt.def.index(), lt.end.index())
        })
        .collect();
    assert_eq!(ranges, vec![(0, 3), (0, 9), (0, 9), (0, 2), (1, 4)]);
    for &v in &inputs {
        ra.spill_entry(v).unwrap();
    }
    ra.set_position(Pos::new(0));
    for (i, &v) in inputs.iter().enumerate() {
        assert_eq!(ra.force_allocate(v, RegConstraint::Any, &[v]).unwrap(), reg(i));
    }

    ra.set_position(Pos::new(1));
    assert_eq!(ra.force_allocate(v4, RegConstraint::Any, &[v4]).unwrap(), reg(1));
    assert_eq!(ra.loc(inputs[1]), Some(stack(1)));
    assert_eq!(ra.reg_of(inputs[3]), Some(gpr(3)));
    assert_eq!(ra.stats().evictions, 1);
    ra.check_invariants().unwrap();

    ra.set_position(Pos::new(9));
    let keep = [inputs[1], inputs[2]];
    assert_eq!(ra.force_allocate(inputs[1], RegConstraint::Any, &keep).unwrap(), reg(0));
    assert_eq!(ra.force_allocate(inputs[2], RegConstraint::Any, &keep).unwrap(), reg(2));
    ra.check_invariants().unwrap();

    let edits = ra.take_edits();
    assert!(edits.contains(&(
        ProgPoint::before(Pos::new(9)),
        Edit::Move {
            from: stack(1),
            to: reg(0)
        }
    )));
    // The input's entry slot already held it, so leaving the register
    // needed no store.
    assert_eq!(ra.stats().spills, 0);
    assert_eq!(ra.stats().reloads, 5);
}

#[test]
fn test_evicts_useless_value_before_live_one() {
    // `a` is only needed by a guard's fail arguments and sits in r0,
    // which `p` claims at 6. `c` is read again at 8.
    let target = CustomTarget::small(2, 2);
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    let c = b.input(ValueType::Int);
    let p = b.input(ValueType::Int);
    b.effect(&[a.into(), c.into()]);
    let v = b.op(ValueType::Int, &[]);
    b.guard(&[Constant::Int(1).into()], &[a.into()]);
    fill(&mut b, 3);
    pinned_use(&mut b, p, gpr(0));
    b.effect(&[v.into()]);
    b.effect(&[c.into()]);
    let trace = b.build();

    let mut ra = RegAlloc::new(&trace, &target, Options::default()).unwrap();
    for x in [a, c, p] {
        ra.spill_entry(x).unwrap();
    }
    ra.set_position(Pos::new(0));
    assert_eq!(ra.force_allocate(a, RegConstraint::Any, &[a, c]).unwrap(), reg(0));
    assert_eq!(ra.force_allocate(c, RegConstraint::Any, &[a, c]).unwrap(), reg(1));

    ra.set_position(Pos::new(1));
    assert_eq!(ra.lifetimes().next_real_use(a, Pos::new(1)), None);
    assert!(ra.lifetimes().free_until_pos(gpr(0), Pos::new(1)) < Pos::new(7));
    assert_eq!(ra.force_allocate(v, RegConstraint::Any, &[v]).unwrap(), reg(0));
    assert_eq!(ra.reg_of(c), Some(gpr(1)));
    assert_eq!(ra.loc(a), Some(stack(0)));
    assert_eq!(ra.stats().evictions, 1);
    ra.check_invariants().unwrap();
}

#[test]
fn test_values_outside_the_trace_are_rejected() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    b.finish(&[a.into()]);
    let trace = b.build();

    let mut ra = RegAlloc::new(&trace, &target, Options::default()).unwrap();
    let stranger = Value::new(17, ValueType::Int);
    let retyped = Value::new(a.index(), ValueType::Float);
    assert!(matches!(
        ra.force_allocate(stranger, RegConstraint::Any, &[]),
        Err(AllocError::InvariantViolation(_))
    ));
    assert!(matches!(
        ra.force_fixed(retyped, PReg::new(0, RegClass::Float), &[]),
        Err(AllocError::InvariantViolation(_))
    ));
    assert!(matches!(
        ra.spill_entry(stranger),
        Err(AllocError::InvariantViolation(_))
    ));
    assert_eq!(ra.try_allocate(stranger, RegConstraint::Any), None);
    assert_eq!(ra.lifetimes().next_real_use(stranger, Pos::new(0)), None);
    assert!(ra.lifetimes().fixed_positions_for(stranger).is_empty());
}

#[test]
fn test_eviction_stores_value_without_stack_copy() {
    let target = CustomTarget::small(2, 2);
    let mut b = TraceBuilder::new();
    let x = b.op(ValueType::Int, &[]);
    let y = b.op(ValueType::Int, &[]);
    let z = b.op(ValueType::Int, &[]);
    b.effect(&[z.into()]);
    b.effect(&[y.into()]);
    b.effect(&[x.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[2].result, Some(reg(0)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(2))),
        vec![Edit::Move {
            from: reg(0),
            to: stack(0)
        }]
    );
    assert_eq!(out.stats.spills, 1);
    assert_eq!(out.stats.reloads, 1);
}

#[test]
fn test_two_address_reuses_dying_source() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.op(ValueType::Int, &[]);
    let c = b.op(ValueType::Int, &[a.into(), Constant::Int(1).into()]);
    b.finish(&[c.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[1].result, Some(reg(0)));
    assert_eq!(&out.op_allocs[1].args[..], &[reg(0), Location::Imm(1)]);
    assert!(edits(&out, ProgPoint::before(Pos::new(1))).is_empty());
    assert_eq!(out.stats.moves, 0);
}

#[test]
fn test_two_address_copies_live_source() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.op(ValueType::Int, &[]);
    let c = b.op(ValueType::Int, &[a.into(), Constant::Int(1).into()]);
    b.finish(&[a.into(), c.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[1].result, Some(reg(1)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(1))),
        vec![Edit::Move {
            from: reg(0),
            to: reg(1)
        }]
    );
    assert_eq!(&out.op_allocs[2].args[..], &[reg(0), reg(1)]);
}

#[test]
fn test_call_spills_live_values() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let x = b.op(ValueType::Int, &[Constant::Int(1).into()]);
    let y = b.op(ValueType::Int, &[Constant::Int(2).into()]);
    let r = b
        .call(CallEffect::MayCallArbitrary, &[y.into()], Some(ValueType::Int))
        .unwrap();
    b.effect(&[x.into(), r.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(1)));
    assert_eq!(out.op_allocs[1].result, Some(reg(0)));
    assert_eq!(&out.op_allocs[2].args[..], &[reg(0)]);
    assert_eq!(out.op_allocs[2].result, Some(reg(0)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(2))),
        vec![Edit::Move {
            from: reg(1),
            to: stack(0)
        }]
    );
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(3))),
        vec![Edit::Move {
            from: stack(0),
            to: reg(1)
        }]
    );
    assert_eq!(&out.op_allocs[3].args[..], &[reg(1), reg(0)]);
    assert_eq!(out.stats.spills, 1);
    assert_eq!(out.stats.reloads, 1);
}

#[test]
fn test_pure_call_keeps_values_in_callee_saved() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let x = b.op(ValueType::Int, &[Constant::Int(1).into()]);
    let y = b.op(ValueType::Int, &[Constant::Int(2).into()]);
    let r = b
        .call(CallEffect::Pure, &[y.into()], Some(ValueType::Int))
        .unwrap();
    b.effect(&[x.into(), r.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(2))),
        vec![Edit::Move {
            from: reg(1),
            to: reg(2)
        }]
    );
    assert_eq!(&out.op_allocs[3].args[..], &[reg(2), reg(0)]);
    assert_eq!(out.stats.spills, 0);
    assert_eq!(out.frame_depth, 0);
}

#[test]
fn test_collecting_call_spills_refs_in_callee_saved() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let mut op = Operation::new(OpKind::Normal);
    op.result_pin = Some(gpr(2));
    let q = b.push(op, Some(ValueType::Ref)).unwrap();
    let n = b.op(ValueType::Int, &[Constant::Int(3).into()]);
    b.call(CallEffect::MayCallArbitrary, &[], None);
    b.effect(&[q.into(), n.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(2)));
    assert_eq!(out.op_allocs[1].result, Some(reg(0)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(2))),
        vec![
            Edit::Move {
                from: reg(0),
                to: stack(0)
            },
            Edit::Move {
                from: reg(2),
                to: stack(1)
            }
        ]
    );
    assert_eq!(out.stats.spills, 2);
}

#[test]
fn test_stack_arguments() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.op(ValueType::Int, &[]);
    let bv = b.op(ValueType::Int, &[]);
    let c = b.op(ValueType::Int, &[]);
    b.call(CallEffect::Pure, &[a.into(), bv.into(), c.into()], None);
    b.finish(&[]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(0)));
    assert_eq!(out.op_allocs[1].result, Some(reg(1)));
    assert_eq!(out.op_allocs[2].result, Some(reg(2)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(3))),
        vec![Edit::StoreArg {
            from: reg(2),
            index: 0
        }]
    );
}

#[test]
fn test_lock_released_around_call() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let y = b.op(ValueType::Int, &[Constant::Int(7).into()]);
    let r = b
        .call(CallEffect::ReleasesLock, &[y.into()], Some(ValueType::Int))
        .unwrap();
    b.effect(&[r.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(0)));
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(1))),
        vec![Edit::ReleaseLock]
    );
    assert_eq!(
        edits(&out, ProgPoint::after(Pos::new(1))),
        vec![
            Edit::Move {
                from: reg(0),
                to: reg(2)
            },
            Edit::ReacquireLock { scratch: gpr(4) }
        ]
    );
    assert_eq!(&out.op_allocs[2].args[..], &[reg(2)]);
}

#[test]
fn test_coalesced_values_share_register() {
    let target = CustomTarget::small(4, 2);
    let build = |coalesce: bool| {
        let mut b = TraceBuilder::new();
        let x0 = b.op(ValueType::Int, &[]);
        let x1 = b.op(ValueType::Int, &[]);
        let a = b.op(ValueType::Int, &[]);
        b.effect(&[a.into(), x1.into()]);
        let bv = b.op(ValueType::Int, &[]);
        b.effect(&[bv.into(), x0.into()]);
        if coalesce {
            b.coalesce(a, bv);
            // Overlapping lifetimes are never merged.
            b.coalesce(x0, a);
        }
        b.build()
    };

    let out = checked(&build(false), &target);
    assert_eq!(out.op_allocs[2].result, Some(reg(2)));
    assert_eq!(out.op_allocs[4].result, Some(reg(1)));
    assert_eq!(out.stats.coalesced, 0);

    let out = checked(&build(true), &target);
    assert_eq!(out.op_allocs[2].result, Some(reg(2)));
    assert_eq!(out.op_allocs[4].result, Some(reg(2)));
    assert!(edits(&out, ProgPoint::before(Pos::new(4))).is_empty());
    assert_eq!(out.stats.coalesced, 1);
}

#[test]
fn test_guard_snapshot() {
    let target = CustomTarget::small(4, 2);
    let trace = guarded_trace();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[1].guard, Some(GuardId::new(0)));
    assert_eq!(out.guards.len(), 1);
    let token = &out.guards[GuardId::new(0)];
    assert_eq!(
        token.fail_locations,
        vec![stack(0), reg(0), Location::Imm(0x1000)]
    );
    assert!(token.is_ref(0));
    assert!(!token.is_ref(1));
    assert!(token.is_ref(2));
    assert_eq!(token.frame_depth, 2);
    assert_eq!(token.descriptor_id, GuardId::new(0));
}

#[test]
fn test_bridge_starts_from_guard_locations() {
    let target = CustomTarget::small(4, 2);
    let trace = guarded_trace();
    let out = checked(&trace, &target);
    let entry = BridgeEntry::from_guard(&out.guards[GuardId::new(0)], None);
    assert_eq!(entry.input_locations, vec![stack(0), reg(0)]);
    assert_eq!(entry.frame_depth, 2);

    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Ref);
    let c = b.input(ValueType::Int);
    let d = b.op(ValueType::Int, &[c.into(), Constant::Int(2).into()]);
    b.finish(&[a.into(), d.into()]);
    let bridge = b.build();

    let bout = run_bridge(&bridge, &target, &entry, Options::default()).unwrap();
    check(&bridge, &target.env, &bout).unwrap();
    assert_eq!(bout.input_locations, entry.input_locations);
    assert_eq!(bout.op_allocs[0].result, Some(reg(0)));
    assert_eq!(&bout.op_allocs[1].args[..], &[stack(0), reg(0)]);
    assert!(bout.frame_depth >= 2);
    assert_eq!(bout.stats.moves, 0);
    assert_eq!(bout.stats.reloads, 0);
}

#[test]
fn test_bridge_entry_dedups_locations() {
    let token = crate::guard::GuardToken {
        fail_locations: vec![reg(1), Location::Imm(4), reg(1), stack(3)],
        live_refs: crate::guard::RefBitmap::with_len(4),
        frame_depth: 4,
        descriptor_id: GuardId::new(0),
    };
    let entry = BridgeEntry::from_guard(&token, Some(vec![stack(0)]));
    assert_eq!(entry.input_locations, vec![reg(1), stack(3)]);
    assert_eq!(entry.jump_target, Some(vec![stack(0)]));
}

#[test]
fn test_loop_and_bridge_jump_to_label() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let i = b.input(ValueType::Int);
    b.label(&[i]);
    let j = b.op(ValueType::Int, &[i.into(), Constant::Int(1).into()]);
    b.guard(&[j.into()], &[j.into()]);
    b.jump(&[j.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    let layout = out.label_layout.clone().unwrap();
    assert_eq!(layout, vec![stack(0)]);
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(3))),
        vec![Edit::Move {
            from: reg(0),
            to: stack(0)
        }]
    );

    let entry = BridgeEntry::from_guard(&out.guards[GuardId::new(0)], Some(layout.clone()));
    assert_eq!(entry.input_locations, vec![reg(0)]);
    let mut b = TraceBuilder::new();
    let k = b.input(ValueType::Int);
    let m = b.op(ValueType::Int, &[k.into(), Constant::Int(5).into()]);
    b.jump(&[m.into()]);
    let bridge = b.build();

    let bout = run_bridge(&bridge, &target, &entry, Options::default()).unwrap();
    Checker::new(&bridge, &target.env)
        .with_jump_target(layout)
        .run(&bout)
        .unwrap();
    assert_eq!(
        edits(&bout, ProgPoint::before(Pos::new(1))),
        vec![Edit::Move {
            from: reg(0),
            to: stack(0)
        }]
    );
}

#[test]
fn test_bridge_jump_reads_overlapped_slot_first() {
    // The guard left a float in word 3, which the loop keeps as half of
    // a vector's double slot.
    let target = CustomTarget::small(4, 2);
    let layout = vec![dstack(2), freg(1)];
    let entry = BridgeEntry {
        input_locations: vec![stack(3), freg(0)],
        frame_depth: 4,
        jump_target: Some(layout.clone()),
    };
    let mut b = TraceBuilder::new();
    let x = b.input(ValueType::Float);
    let y = b.input(ValueType::Vector);
    b.jump(&[y.into(), x.into()]);
    let bridge = b.build();

    let bout = run_bridge(&bridge, &target, &entry, Options::default()).unwrap();
    Checker::new(&bridge, &target.env)
        .with_jump_target(layout)
        .run(&bout)
        .unwrap();
    assert_eq!(
        edits(&bout, ProgPoint::before(Pos::new(0))),
        vec![
            Edit::Move {
                from: stack(3),
                to: freg(1)
            },
            Edit::Move {
                from: freg(0),
                to: dstack(2)
            },
        ]
    );
}

#[test]
fn test_swapping_jump_breaks_cycle() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.op(ValueType::Int, &[]);
    let bv = b.op(ValueType::Int, &[]);
    b.label(&[a, bv]);
    b.effect(&[a.into(), bv.into()]);
    b.jump(&[bv.into(), a.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.label_layout, Some(vec![reg(0), reg(1)]));
    assert_eq!(out.stats.cycles, 1);
}

#[test]
fn test_jump_without_label_is_rejected() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    b.jump(&[a.into()]);
    let trace = b.build();
    assert!(matches!(
        run(&trace, &target, Options::default()),
        Err(AllocError::InvariantViolation(_))
    ));
}

#[test]
fn test_pair_operation() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let x = b.input(ValueType::Int);
    let y = b.input(ValueType::Int);
    let mut op = Operation::new(OpKind::Normal);
    op.args.extend([Operand::from(x), Operand::from(y)]);
    op.needs_pair = true;
    let z = b.push(op, Some(ValueType::Int)).unwrap();
    b.finish(&[z.into(), y.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    let allocs = &out.op_allocs[0];
    assert_eq!(&allocs.args[..], &[reg(0), reg(2)]);
    assert_eq!(allocs.result, Some(reg(1)));
    assert_eq!(&allocs.temps[..], &[reg(0)]);
    assert_eq!(
        edits(&out, ProgPoint::before(Pos::new(0))),
        vec![
            Edit::Move {
                from: stack(1),
                to: reg(2)
            },
            Edit::Move {
                from: stack(0),
                to: reg(0)
            }
        ]
    );
}

#[test]
fn test_pair_unsatisfiable() {
    let target = CustomTarget::small(2, 2);
    let mut b = TraceBuilder::new();
    let x = b.input(ValueType::Int);
    let y = b.input(ValueType::Int);
    b.effect(&[x.into(), y.into()]);
    b.effect(&[x.into(), y.into()]);
    let trace = b.build();

    let mut ra = RegAlloc::new(&trace, &target, Options::default()).unwrap();
    ra.spill_entry(x).unwrap();
    ra.spill_entry(y).unwrap();
    ra.set_position(Pos::new(0));
    ra.force_allocate(x, RegConstraint::Any, &[x, y]).unwrap();
    ra.force_allocate(y, RegConstraint::Any, &[x, y]).unwrap();
    let t1 = ra.new_temp(ValueType::Int);
    let t2 = ra.new_temp(ValueType::Int);
    assert_eq!(
        ra.ensure_pair(t1, t2, true, &[x, y]),
        Err(AllocError::UnsatisfiableAllocation(Pos::new(0)))
    );
}

#[test]
fn test_byte_operands() {
    let mut target = CustomTarget::small(4, 2);
    target.env.byte_regs = PRegSet::from_regs(&[gpr(2), gpr(3)]);
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    let mut op = Operation::new(OpKind::Normal);
    op.args.extend([Operand::from(a), Constant::Int(3).into()]);
    op.byte_operands = true;
    let c = b.push(op, Some(ValueType::Int)).unwrap();
    b.finish(&[c.into()]);
    let trace = b.build();

    let out = checked(&trace, &target);
    assert_eq!(out.op_allocs[0].result, Some(reg(2)));
    assert!(target.is_byte_addressable(gpr(2)));
    assert!(!target.is_byte_addressable(gpr(0)));
}

#[test]
fn test_pinned_values_conflict() {
    let target = CustomTarget::small(4, 2);
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    let c = b.input(ValueType::Int);
    let mut op = Operation::new(OpKind::Normal);
    op.args.extend([Operand::from(a), Operand::from(c)]);
    op.arg_pins.extend([(0, gpr(1)), (1, gpr(1))]);
    b.push(op, None);
    let trace = b.build();
    assert_eq!(
        run(&trace, &target, Options::default()).unwrap_err(),
        AllocError::UnsatisfiableAllocation(Pos::new(0))
    );
}

#[test]
fn test_frame_overflow() {
    let mut target = CustomTarget::small(4, 2);
    target.env.max_frame_words = 1;
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Int);
    let c = b.input(ValueType::Int);
    b.finish(&[a.into(), c.into()]);
    let trace = b.build();
    assert_eq!(
        run(&trace, &target, Options::default()).unwrap_err(),
        AllocError::FrameOverflow { depth: 2, limit: 1 }
    );
}

#[test]
fn test_constant_pool() {
    let mut target = CustomTarget::small(4, 2);
    target.env.max_pool_bytes = 8;
    let mut b = TraceBuilder::new();
    let c = b.op(ValueType::Int, &[Constant::Int(1 << 40).into()]);
    let d = b.op(
        ValueType::Int,
        &[c.into(), Constant::Int(1 << 40).into()],
    );
    b.finish(&[d.into()]);
    let trace = b.build();
    let out = checked(&trace, &target);
    assert_eq!(out.pool, vec![1 << 40]);
    assert_eq!(out.pool_size(), 8);
    assert_eq!(&out.op_allocs[1].args[..], &[reg(0), Location::Pool(0)]);

    let mut b = TraceBuilder::new();
    let c = b.op(ValueType::Int, &[Constant::Int(1 << 40).into()]);
    let d = b.op(
        ValueType::Int,
        &[c.into(), Constant::Int(1 << 41).into()],
    );
    b.finish(&[d.into()]);
    let trace = b.build();
    assert_eq!(
        run(&trace, &target, Options::default()).unwrap_err(),
        AllocError::ConstantPoolOverflow { size: 16, limit: 8 }
    );
}

#[test]
fn test_float_constants_on_x64() {
    let mut b = TraceBuilder::new();
    let f = b.input(ValueType::Float);
    let bits = 1.5f64.to_bits();
    let g = b.op(ValueType::Float, &[f.into(), Constant::Float(bits).into()]);
    let h = b.op(ValueType::Float, &[g.into(), Constant::Float(bits).into()]);
    b.finish(&[h.into()]);
    let trace = b.build();

    let out = run(&trace, &X64, Options::default()).unwrap();
    check(&trace, X64.env(), &out).unwrap();
    assert_eq!(out.pool, vec![bits]);
    assert_eq!(out.pool_entry(0), Some(bits));
    assert_eq!(out.op_allocs[1].args[1], Location::Pool(0));
    assert_eq!(out.op_allocs[2].args[1], Location::Pool(0));
}

#[test]
fn test_random_traces_pass_checker() {
    let small = CustomTarget::small(4, 2);
    for seed in 1..200u64 {
        for looped in [false, true] {
            let trace = random_trace(seed, looped);
            for target in [&small as &dyn TargetProfile, &X64] {
                let out = run(&trace, target, Options::default())
                    .unwrap_or_else(|e| panic!("seed {}: {}", seed, e));
                if let Err(errors) = check(&trace, target.env(), &out) {
                    panic!("seed {}: {:?}", seed, errors.errors());
                }
                if looped {
                    check_random_bridge(seed, &trace, target, &out);
                }
            }
        }
    }
}

/// Attach a bridge to the first guard of a loop and jump back to its
/// label.
fn check_random_bridge(seed: u64, trace: &Trace, target: &dyn TargetProfile, out: &Output) {
    let Some(guard) = trace.ops.iter().find(|op| op.is_guard()) else {
        return;
    };
    let token = &out.guards[GuardId::new(0)];
    let mut seen = vec![];
    let mut inputs = vec![];
    for (&arg, &loc) in guard.fail_args().iter().zip(&token.fail_locations) {
        if !loc.is_const() && !seen.contains(&loc) {
            seen.push(loc);
            inputs.push(arg.ty());
        }
    }
    let layout = out.label_layout.clone().unwrap();
    let label: Vec<ValueType> = trace.inputs.iter().map(|v| v.ty()).collect();
    let entry = BridgeEntry::from_guard(token, Some(layout.clone()));
    assert_eq!(entry.input_locations, seen);

    let bridge = random_bridge(seed, &inputs, &label);
    let bout = run_bridge(&bridge, target, &entry, Options::default())
        .unwrap_or_else(|e| panic!("seed {} bridge: {}", seed, e));
    if let Err(errors) = Checker::new(&bridge, target.env())
        .with_jump_target(layout)
        .run(&bout)
    {
        panic!("seed {} bridge: {:?}", seed, errors.errors());
    }
}

struct Rng(u64);

impl Rng {
    fn below(&mut self, n: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % n as u64) as usize
    }

    fn ty(&mut self) -> ValueType {
        [
            ValueType::Int,
            ValueType::Ref,
            ValueType::Float,
            ValueType::Vector,
        ][self.below(4)]
    }

    fn constant(&mut self, ty: ValueType) -> Constant {
        let bits = if self.below(4) == 0 {
            1 << (33 + self.below(8))
        } else {
            self.below(100) as u64
        };
        match ty {
            ValueType::Int => Constant::Int(bits as i64),
            ValueType::Ref => Constant::Ref(bits),
            _ => Constant::Float(bits),
        }
    }

    fn operand(&mut self, defined: &[Value], ty: ValueType) -> Operand {
        let same: Vec<Value> = defined.iter().copied().filter(|v| v.ty() == ty).collect();
        if same.is_empty() || self.below(5) == 0 {
            self.constant(ty).into()
        } else {
            same[self.below(same.len())].into()
        }
    }
}

/// Straight-line traces of ordinary operations, guards and calls,
/// optionally looping back to a label at the top.
fn random_trace(seed: u64, looped: bool) -> Trace {
    let mut rng = Rng(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
    let mut b = TraceBuilder::new();
    let mut defined: Vec<Value> = vec![];
    for _ in 0..1 + rng.below(4) {
        let ty = rng.ty();
        defined.push(b.input(ty));
    }
    let inputs = defined.clone();
    if looped {
        b.label(&inputs);
    }
    random_body(&mut rng, &mut b, &mut defined);

    if looped {
        let types: Vec<ValueType> = inputs.iter().map(|v| v.ty()).collect();
        random_jump(&mut rng, &mut b, &mut defined, &types);
    } else {
        let args: Vec<Operand> = (0..rng.below(4))
            .map(|_| {
                let ty = rng.ty();
                rng.operand(&defined, ty)
            })
            .collect();
        b.finish(&args);
    }
    b.build()
}

/// A bridge with inputs of the given types that jumps back to a label
/// taking `label` types.
fn random_bridge(seed: u64, inputs: &[ValueType], label: &[ValueType]) -> Trace {
    let mut rng = Rng(seed.wrapping_mul(0x2545_f491_4f6c_dd1d) | 1);
    let mut b = TraceBuilder::new();
    let mut defined: Vec<Value> = inputs.iter().map(|&ty| b.input(ty)).collect();
    random_body(&mut rng, &mut b, &mut defined);
    random_jump(&mut rng, &mut b, &mut defined, label);
    b.build()
}

/// Jump with one value of each label type, defining one first where
/// none exists.
fn random_jump(rng: &mut Rng, b: &mut TraceBuilder, defined: &mut Vec<Value>, label: &[ValueType]) {
    let mut args = Vec::with_capacity(label.len());
    for &ty in label {
        if !defined.iter().any(|v| v.ty() == ty) {
            defined.push(b.op(ty, &[]));
        }
        let same: Vec<Value> = defined.iter().copied().filter(|w| w.ty() == ty).collect();
        args.push(Operand::from(same[rng.below(same.len())]));
    }
    b.jump(&args);
}

fn random_body(rng: &mut Rng, b: &mut TraceBuilder, defined: &mut Vec<Value>) {
    for _ in 0..5 + rng.below(20) {
        match rng.below(10) {
            0..=4 => {
                let ty = rng.ty();
                let mut args = vec![];
                if rng.below(4) != 0 {
                    args.push(rng.operand(defined, ty));
                    for _ in 0..rng.below(3) {
                        let ty = rng.ty();
                        args.push(rng.operand(defined, ty));
                    }
                }
                if rng.below(4) == 0 {
                    b.effect(&args);
                } else {
                    defined.push(b.op(ty, &args));
                }
            }
            5 | 6 => {
                let cond = rng.operand(defined, ValueType::Int);
                let fail: Vec<Operand> = (0..rng.below(4))
                    .map(|_| {
                        let ty = rng.ty();
                        rng.operand(defined, ty)
                    })
                    .collect();
                b.guard(&[cond], &fail);
            }
            7 | 8 => {
                let effect = [
                    CallEffect::Pure,
                    CallEffect::MayCallArbitrary,
                    CallEffect::ReleasesLock,
                ][rng.below(3)];
                let args: Vec<Operand> = (0..rng.below(4))
                    .map(|_| {
                        let ty = rng.ty();
                        rng.operand(defined, ty)
                    })
                    .collect();
                let ty = (rng.below(3) != 0).then(|| rng.ty());
                if let Some(v) = b.call(effect, &args, ty) {
                    defined.push(v);
                }
            }
            _ => {
                let n = rng.below(3);
                let args: Vec<Operand> = (0..n)
                    .map(|_| {
                        let ty = rng.ty();
                        rng.operand(defined, ty)
                    })
                    .collect();
                b.effect(&args);
            }
        }
    }
}

/// A guard at position 1 over a reference input, an integer result in
/// a register and a reference constant.
fn guarded_trace() -> Trace {
    let mut b = TraceBuilder::new();
    let a = b.input(ValueType::Ref);
    let x = b.input(ValueType::Int);
    let c = b.op(ValueType::Int, &[x.into(), Constant::Int(1).into()]);
    b.guard(
        &[c.into()],
        &[a.into(), c.into(), Constant::Ref(0x1000).into()],
    );
    b.finish(&[a.into(), c.into()]);
    b.build()
}

fn checked(trace: &Trace, target: &CustomTarget) -> Output {
    let out = run(trace, target, Options::default()).unwrap();
    if let Err(errors) = check(trace, &target.env, &out) {
        panic!("checker: {:?}", errors.errors());
    }
    out
}

fn pinned_use(b: &mut TraceBuilder, v: Value, reg: PReg) {
    let mut op = Operation::new(OpKind::Normal);
    op.args.push(v.into());
    op.arg_pins.push((0, reg));
    b.push(op, None);
}

fn fill(b: &mut TraceBuilder, n: usize) {
    for _ in 0..n {
        b.effect(&[]);
    }
}

fn edits(out: &Output, point: ProgPoint) -> Vec<Edit> {
    out.edits_at(point).copied().collect()
}

fn gpr(hw: usize) -> PReg {
    PReg::new(hw, RegClass::Int)
}

fn reg(hw: usize) -> Location {
    Location::Reg(gpr(hw))
}

fn stack(index: usize) -> Location {
    Location::Stack(SpillSlot::new(index, SlotWidth::Single))
}

fn freg(hw: usize) -> Location {
    Location::Reg(PReg::new(hw, RegClass::Float))
}

fn dstack(index: usize) -> Location {
    Location::Stack(SpillSlot::new(index, SlotWidth::Double))
}
