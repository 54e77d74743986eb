/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The linear IR handed to the allocator by the trace optimizer.

use crate::{PReg, Value, ValueType};
use smallvec::SmallVec;

/// A constant operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Constant {
    Int(i64),
    /// A float, as its IEEE-754 bit pattern.
    Float(u64),
    /// A pointer to a prebuilt, non-moving heap object.
    Ref(u64),
}

impl Constant {
    pub fn ty(self) -> ValueType {
        match self {
            Constant::Int(_) => ValueType::Int,
            Constant::Float(_) => ValueType::Float,
            Constant::Ref(_) => ValueType::Ref,
        }
    }

    pub fn bits(self) -> u64 {
        match self {
            Constant::Int(i) => i as u64,
            Constant::Float(bits) | Constant::Ref(bits) => bits,
        }
    }
}

/// An operation argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Operand {
    Value(Value),
    Const(Constant),
}

impl Operand {
    pub fn as_value(self) -> Option<Value> {
        match self {
            Operand::Value(v) => Some(v),
            Operand::Const(_) => None,
        }
    }

    pub fn ty(self) -> ValueType {
        match self {
            Operand::Value(v) => v.ty(),
            Operand::Const(c) => c.ty(),
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl From<Constant> for Operand {
    fn from(c: Constant) -> Self {
        Operand::Const(c)
    }
}

/// What a call may do while it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum CallEffect {
    /// Pure or bounded helper: cannot collect garbage or re-enter the
    /// runtime.
    Pure,
    /// May run arbitrary managed code, including a garbage collection.
    MayCallArbitrary,
    /// Runs foreign code that does not respect the execution lock:
    /// the lock is released around the call.
    ReleasesLock,
}

impl CallEffect {
    /// Can references held in registers be invalidated by the call?
    pub fn may_collect(self) -> bool {
        !matches!(self, CallEffect::Pure)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct CallDescr {
    pub effect: CallEffect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum OpKind {
    /// An ordinary operation: inputs in registers (or immediates),
    /// result in a register.
    Normal,
    /// A conditional bailout. `args` are the condition inputs,
    /// `fail_args` the values the fallback path needs.
    Guard { fail_args: SmallVec<[Operand; 8]> },
    /// A call to a helper or foreign function. `args` are the call
    /// arguments.
    Call(CallDescr),
    /// The loop header; `args` are the values carried around the loop.
    Label,
    /// Jump back to the label (or, in a bridge, to the loop being
    /// attached to) with `args` as the new label arguments.
    Jump,
    /// Leave the trace, returning `args`.
    Finish,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Operation {
    pub kind: OpKind,
    pub args: SmallVec<[Operand; 4]>,
    pub result: Option<Value>,
    /// ISA-mandated registers for specific arguments, as
    /// `(argument index, register)`.
    pub arg_pins: SmallVec<[(u8, PReg); 2]>,
    /// ISA-mandated register for the result.
    pub result_pin: Option<PReg>,
    /// The operation uses an even/odd register pair: the first
    /// argument is read from the even register and the result is
    /// produced in the odd one.
    pub needs_pair: bool,
    /// Register operands must be byte-addressable.
    pub byte_operands: bool,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Operation {
            kind,
            args: SmallVec::new(),
            result: None,
            arg_pins: SmallVec::new(),
            result_pin: None,
            needs_pair: false,
            byte_operands: false,
        }
    }

    pub fn is_guard(&self) -> bool {
        matches!(self.kind, OpKind::Guard { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, OpKind::Call(_))
    }

    pub fn arg_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.args.iter().filter_map(|a| a.as_value())
    }

    pub fn fail_args(&self) -> &[Operand] {
        match &self.kind {
            OpKind::Guard { fail_args } => fail_args,
            _ => &[],
        }
    }

    pub fn pin_for_arg(&self, idx: usize) -> Option<PReg> {
        self.arg_pins
            .iter()
            .find(|&&(i, _)| i as usize == idx)
            .map(|&(_, reg)| reg)
    }
}

/// A trace: input values plus a linear list of operations. Operation
/// `i` executes at position `Pos(i)`; inputs are defined at position 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Trace {
    pub inputs: Vec<Value>,
    pub ops: Vec<Operation>,
    /// One more than the highest value index in the trace.
    pub num_values: usize,
    /// Pairs of values that should share a register if their
    /// lifetimes allow.
    pub coalesce: Vec<(Value, Value)>,
}

impl Trace {
    pub fn label_pos(&self) -> Option<usize> {
        self.ops.iter().position(|op| op.kind == OpKind::Label)
    }

    pub fn jump(&self) -> Option<&Operation> {
        self.ops.last().filter(|op| op.kind == OpKind::Jump)
    }
}

/// Incremental construction of traces, for tests and tools.
#[derive(Default)]
pub struct TraceBuilder {
    trace: Trace,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, ty: ValueType) -> Value {
        let v = Value::new(self.trace.num_values, ty);
        self.trace.num_values += 1;
        v
    }

    pub fn input(&mut self, ty: ValueType) -> Value {
        let v = self.fresh(ty);
        self.trace.inputs.push(v);
        v
    }

    /// Append an operation; returns its result value if `result_ty` is
    /// given.
    pub fn push(&mut self, mut op: Operation, result_ty: Option<ValueType>) -> Option<Value> {
        let result = result_ty.map(|ty| self.fresh(ty));
        op.result = result;
        self.trace.ops.push(op);
        result
    }

    pub fn op(&mut self, ty: ValueType, args: &[Operand]) -> Value {
        let mut op = Operation::new(OpKind::Normal);
        op.args.extend_from_slice(args);
        self.push(op, Some(ty)).unwrap()
    }

    /// An operation with no result.
    pub fn effect(&mut self, args: &[Operand]) {
        let mut op = Operation::new(OpKind::Normal);
        op.args.extend_from_slice(args);
        self.push(op, None);
    }

    pub fn guard(&mut self, cond: &[Operand], fail_args: &[Operand]) {
        let mut op = Operation::new(OpKind::Guard {
            fail_args: fail_args.iter().copied().collect(),
        });
        op.args.extend_from_slice(cond);
        self.push(op, None);
    }

    pub fn call(
        &mut self,
        effect: CallEffect,
        args: &[Operand],
        result_ty: Option<ValueType>,
    ) -> Option<Value> {
        let mut op = Operation::new(OpKind::Call(CallDescr { effect }));
        op.args.extend_from_slice(args);
        self.push(op, result_ty)
    }

    pub fn label(&mut self, args: &[Value]) {
        let mut op = Operation::new(OpKind::Label);
        op.args.extend(args.iter().map(|&v| Operand::Value(v)));
        self.push(op, None);
    }

    pub fn jump(&mut self, args: &[Operand]) {
        let mut op = Operation::new(OpKind::Jump);
        op.args.extend_from_slice(args);
        self.push(op, None);
    }

    pub fn finish(&mut self, args: &[Operand]) {
        let mut op = Operation::new(OpKind::Finish);
        op.args.extend_from_slice(args);
        self.push(op, None);
    }

    pub fn coalesce(&mut self, a: Value, b: Value) {
        self.trace.coalesce.push((a, b));
    }

    pub fn build(self) -> Trace {
        self.trace
    }
}
