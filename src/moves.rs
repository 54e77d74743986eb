/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Parallel-move resolution.

use crate::{AllocError, Edit, Location, PReg};
use smallvec::{smallvec, SmallVec};

/// A list of primitive edits to be performed in sequence.
pub type MoveVec = SmallVec<[Edit; 16]>;

/// A `ParallelMoves` represents a list of location-to-location moves
/// that must happen in parallel -- i.e., all reads of sources
/// semantically happen before all writes of destinations, and
/// destinations are allowed to overwrite sources. It computes a list
/// of sequential edits that produce the equivalent data movement.
#[derive(Clone, Debug, Default)]
pub struct ParallelMoves {
    parallel_moves: SmallVec<[(Location, Location); 16]>,
}

impl ParallelMoves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, from: Location, to: Location) {
        self.parallel_moves.push((from, to));
    }

    pub fn len(&self) -> usize {
        self.parallel_moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parallel_moves.is_empty()
    }

    /// Resolve the parallel-moves problem to a sequence of edits.
    ///
    /// A move can be emitted once no other pending move still reads
    /// storage its destination overlaps. Overlap is by storage, not by
    /// location: a double-width slot shares a word with the two
    /// single-width slots it covers. When no move can be emitted, the
    /// source of one blocking move is pushed and that move finishes
    /// with a pop into its destination once everything else is done.
    /// Pops run in reverse push order.
    ///
    /// `scratch` routes memory-to-memory moves when the target cannot
    /// encode them (`stack_to_stack` is false). It must not appear in
    /// the problem.
    pub fn resolve(self, scratch: PReg, stack_to_stack: bool) -> Result<MoveVec, AllocError> {
        let moves = &self.parallel_moves;
        let mut out: MoveVec = smallvec![];

        for (i, &(from, to)) in moves.iter().enumerate() {
            if to.is_const() || from == Location::Reg(scratch) || to == Location::Reg(scratch) {
                return Err(AllocError::InvariantViolation(format!(
                    "bad parallel move {} -> {}",
                    from, to
                )));
            }
            if moves[..i].iter().any(|&(_, other)| other.overlaps(to)) {
                return Err(AllocError::InvariantViolation(format!(
                    "{} written twice by one parallel move",
                    to
                )));
            }
        }

        let mut pending: SmallVec<[(Location, Location); 16]> = moves
            .iter()
            .copied()
            .filter(|&(from, to)| from != to)
            .collect();
        // Destinations waiting for a pushed value.
        let mut saved: SmallVec<[Location; 4]> = smallvec![];

        while !pending.is_empty() {
            if let Some(i) = (0..pending.len()).find(|&i| !is_blocked(&pending, i)) {
                let (from, to) = pending.remove(i);
                emit_move(&mut out, from, to, scratch, stack_to_stack);
                continue;
            }

            // Every destination is still read by another move: save the
            // source of the first move that blocks someone.
            let j = (0..pending.len())
                .find(|&j| {
                    let from = pending[j].0;
                    pending
                        .iter()
                        .enumerate()
                        .any(|(i, &(_, to))| i != j && to.overlaps(from))
                })
                .ok_or_else(|| {
                    AllocError::InvariantViolation(format!(
                        "parallel move stuck on {:?}",
                        pending
                    ))
                })?;
            let (from, to) = pending.remove(j);
            trace!("moves: breaking cycle at {}", from);
            out.push(Edit::Push(from));
            saved.push(to);
        }
        while let Some(to) = saved.pop() {
            out.push(Edit::Pop(to));
        }

        trace!("moves: resolved {:?} into {:?}", self.parallel_moves, out);
        Ok(out)
    }
}

/// Does any other pending move still read storage that move `i` writes?
fn is_blocked(pending: &[(Location, Location)], i: usize) -> bool {
    let to = pending[i].1;
    pending
        .iter()
        .enumerate()
        .any(|(j, &(from, _))| j != i && from.overlaps(to))
}

fn emit_move(out: &mut MoveVec, from: Location, to: Location, scratch: PReg, stack_to_stack: bool) {
    if from.is_memory() && to.is_memory() && !stack_to_stack {
        out.push(Edit::Move {
            from,
            to: Location::Reg(scratch),
        });
        out.push(Edit::Move {
            from: Location::Reg(scratch),
            to,
        });
    } else {
        out.push(Edit::Move { from, to });
    }
}

/// Realize `dst[i] := src[i]` for all `i` simultaneously.
pub fn remap(
    src: &[Location],
    dst: &[Location],
    scratch: PReg,
    stack_to_stack: bool,
) -> Result<MoveVec, AllocError> {
    debug_assert_eq!(src.len(), dst.len());
    let mut pm = ParallelMoves::new();
    for (&from, &to) in src.iter().zip(dst) {
        pm.add(from, to);
    }
    pm.resolve(scratch, stack_to_stack)
}

/// Two independent remaps, one per register file, sharing the frame.
///
/// The integer batch runs first. A float source on the stack that an
/// integer destination overlaps would be overwritten before the float
/// batch reads it, so it is pushed beforehand and popped into its
/// destination at the end.
pub fn remap_mixed(
    int_src: &[Location],
    int_dst: &[Location],
    int_scratch: PReg,
    float_src: &[Location],
    float_dst: &[Location],
    float_scratch: PReg,
    stack_to_stack: bool,
) -> Result<MoveVec, AllocError> {
    debug_assert_eq!(float_src.len(), float_dst.len());
    let mut out: MoveVec = smallvec![];
    let mut extra_pushes: SmallVec<[Location; 4]> = smallvec![];
    let mut float_moves = ParallelMoves::new();
    for (&from, &to) in float_src.iter().zip(float_dst) {
        let clobbered = from.is_stack()
            && from != to
            && int_dst.iter().any(|d| d.is_stack() && d.overlaps(from));
        if clobbered {
            out.push(Edit::Push(from));
            extra_pushes.push(to);
        } else {
            float_moves.add(from, to);
        }
    }

    out.extend(remap(int_src, int_dst, int_scratch, stack_to_stack)?);
    out.extend(float_moves.resolve(float_scratch, stack_to_stack)?);
    while let Some(to) = extra_pushes.pop() {
        out.push(Edit::Pop(to));
    }
    Ok(out)
}
