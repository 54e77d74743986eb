//! Fuzz the parallel-move resolver.

use crate::moves::ParallelMoves;
use crate::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use crate::{Edit, Location, PReg, RegClass, SlotWidth, SpillSlot};
use std::collections::{HashMap, HashSet};

const SCRATCH: usize = 30;

fn location(u: &mut Unstructured, allow_const: bool) -> Result<Location> {
    let kinds = if allow_const { 3 } else { 2 };
    Ok(match u.int_in_range(0..=kinds)? {
        0 => Location::Reg(PReg::new(u.int_in_range(0..=15)?, RegClass::Int)),
        1 => Location::Stack(SpillSlot::new(u.int_in_range(0..=15)?, SlotWidth::Single)),
        2 => Location::Stack(SpillSlot::new(
            2 * u.int_in_range(0..=7)?,
            SlotWidth::Double,
        )),
        _ => Location::Imm(u.int_in_range(-4..=4)?),
    })
}

#[derive(Clone, Debug)]
pub struct TestCase {
    moves: Vec<(Location, Location)>,
    stack_to_stack: bool,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        let mut ret = TestCase {
            moves: vec![],
            stack_to_stack: bool::arbitrary(u)?,
        };
        while bool::arbitrary(u)? {
            let src = location(u, true)?;
            let dst = location(u, false)?;
            // Each piece of storage may be written only once.
            if ret.moves.iter().any(|&(_, d)| d.overlaps(dst)) {
                break;
            }
            ret.moves.push((src, dst));
        }
        Ok(ret)
    }
}

pub fn check(t: TestCase) {
    let scratch = PReg::new(SCRATCH, RegClass::Int);
    let mut par = ParallelMoves::new();
    for &(src, dst) in &t.moves {
        par.add(src, dst);
    }
    let edits = par
        .resolve(scratch, t.stack_to_stack)
        .expect("resolution failed");
    log::trace!("resolved moves: {:?}", edits);

    // Simulate the edits; every location starts out holding itself. A
    // location partially overwritten holds garbage (`None`).
    let mut locations: HashMap<Location, Option<Location>> = HashMap::new();
    let mut stack: Vec<Option<Location>> = vec![];
    let read = |locations: &HashMap<Location, Option<Location>>, loc: Location| {
        match locations.get(&loc) {
            Some(&data) => data,
            None if locations.keys().any(|l| l.overlaps(loc)) => None,
            None => Some(loc),
        }
    };
    let write = |locations: &mut HashMap<Location, Option<Location>>,
                 loc: Location,
                 data: Option<Location>| {
        locations.retain(|l, _| !l.overlaps(loc));
        locations.insert(loc, data);
    };
    for edit in edits {
        match edit {
            Edit::Move { from, to } => {
                assert!(!to.is_const());
                if !t.stack_to_stack {
                    assert!(!(from.is_memory() && to.is_memory()), "memory-to-memory move");
                }
                let data = read(&locations, from);
                write(&mut locations, to, data);
            }
            Edit::Push(loc) => stack.push(read(&locations, loc)),
            Edit::Pop(loc) => {
                let data = stack.pop().expect("pop from an empty stack");
                write(&mut locations, loc, data);
            }
            other => panic!("unexpected edit {:?}", other),
        }
    }
    assert!(stack.is_empty());

    for &(src, dst) in &t.moves {
        assert_eq!(read(&locations, dst), Some(src), "wrong value in {}", dst);
    }
    let written: HashSet<Location> = t.moves.iter().map(|&(_, d)| d).collect();
    for (loc, data) in locations {
        // Anything else written must be the scratch register.
        if !written.contains(&loc) && data != Some(loc) {
            assert_eq!(loc, Location::Reg(scratch));
        }
    }
}
