/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Register allocation, control-transfer moves and guard snapshots
//! for the backend of a tracing JIT.
//!
//! A trace is a straight line of operations, optionally ending in a
//! jump back to a loop label. The allocator walks it once, front to
//! back: every operation asks for locations for its inputs and its
//! result, jumps and calls reconcile locations with a parallel-move
//! resolver, and every guard freezes the current value-to-location
//! map into a [`guard::GuardToken`] that the runtime reads when the
//! guard fails.

use core::hash::BuildHasherDefault;
use rustc_hash::FxHasher;
use smallvec::SmallVec;

macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, BuildHasherDefault<FxHasher>>;

#[macro_use]
mod index;
pub use index::{Pos, PosRange};

pub mod call;
pub mod checker;
mod driver;
pub mod frame;
pub mod guard;
pub mod lifetime;
pub mod moves;
pub mod regalloc;
pub mod target;
pub mod trace;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub use driver::{run, run_bridge, BridgeEntry};
pub use regalloc::Stats;

/// Register classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum RegClass {
    Int = 0,
    Float = 1,
}

impl RegClass {
    pub const ALL: [RegClass; 2] = [RegClass::Int, RegClass::Float];
}

/// The type of an IR value. Integers and references live in the
/// general-purpose register file, floats and vectors in the
/// float/vector register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ValueType {
    Int = 0,
    Ref = 1,
    Float = 2,
    Vector = 3,
}

impl ValueType {
    #[inline(always)]
    pub fn class(self) -> RegClass {
        match self {
            ValueType::Int | ValueType::Ref => RegClass::Int,
            ValueType::Float | ValueType::Vector => RegClass::Float,
        }
    }

    #[inline(always)]
    pub fn is_ref(self) -> bool {
        self == ValueType::Ref
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ValueType::Int,
            1 => ValueType::Ref,
            2 => ValueType::Float,
            3 => ValueType::Vector,
            _ => unreachable!(),
        }
    }
}

/// A physical register. Contains a physical register number and a class.
///
/// The `hw_enc` field contains the physical register number and is in
/// a logically separate index space per class; in other words, Int
/// register 0 is different than Float register 0.
///
/// `hw_enc` must fit in 5 bits, i.e., at most 32 registers per class.
/// The value returned by `index()` is in a single index space shared
/// by both classes, with the class bit at the MSB.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PReg {
    hw_enc: u8,
    class: RegClass,
}

impl PReg {
    pub const MAX_BITS: usize = 5;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;
    pub const NUM_INDEX: usize = 1 << (Self::MAX_BITS + 1);

    #[inline(always)]
    pub const fn new(hw_enc: usize, class: RegClass) -> Self {
        assert!(hw_enc <= PReg::MAX);
        PReg {
            hw_enc: hw_enc as u8,
            class,
        }
    }

    /// The physical register number, as encoded by the ISA for the particular register class.
    #[inline(always)]
    pub fn hw_enc(self) -> usize {
        self.hw_enc as usize
    }

    #[inline(always)]
    pub fn class(self) -> RegClass {
        self.class
    }

    /// Get an index into the index space of all physical registers.
    #[inline(always)]
    pub fn index(self) -> usize {
        ((self.class as u8 as usize) << Self::MAX_BITS) | (self.hw_enc as usize)
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        let class = match (index >> Self::MAX_BITS) & 1 {
            0 => RegClass::Int,
            _ => RegClass::Float,
        };
        PReg::new(index & Self::MAX, class)
    }

    #[inline(always)]
    pub fn is_even(self) -> bool {
        self.hw_enc % 2 == 0
    }
}

impl core::fmt::Debug for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "PReg(hw = {}, class = {:?}, index = {})",
            self.hw_enc(),
            self.class(),
            self.index()
        )
    }
}

impl core::fmt::Display for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let class = match self.class() {
            RegClass::Int => "i",
            RegClass::Float => "f",
        };
        write!(f, "p{}{}", self.hw_enc(), class)
    }
}

/// A set of physical registers, as a bitmask over `PReg::index()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PRegSet {
    bits: u64,
}

impl PRegSet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn from_regs(regs: &[PReg]) -> Self {
        let mut set = Self::empty();
        for &reg in regs {
            set.add(reg);
        }
        set
    }

    #[inline(always)]
    pub fn contains(&self, reg: PReg) -> bool {
        self.bits & (1u64 << reg.index()) != 0
    }

    #[inline(always)]
    pub fn add(&mut self, reg: PReg) {
        self.bits |= 1u64 << reg.index();
    }

    #[inline(always)]
    pub fn remove(&mut self, reg: PReg) {
        self.bits &= !(1u64 << reg.index());
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(self) -> impl Iterator<Item = PReg> {
        (0..PReg::NUM_INDEX)
            .filter(move |&i| self.bits & (1u64 << i) != 0)
            .map(PReg::from_index)
    }
}

/// An IR value: an index plus a type, packed into 32 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Value {
    bits: u32,
}

impl Value {
    pub const MAX_BITS: usize = 30;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;

    #[inline(always)]
    pub fn new(index: usize, ty: ValueType) -> Self {
        assert!(index <= Self::MAX);
        Value {
            bits: ((index as u32) << 2) | (ty as u8 as u32),
        }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        (self.bits >> 2) as usize
    }

    #[inline(always)]
    pub fn ty(self) -> ValueType {
        ValueType::from_bits(self.bits)
    }

    #[inline(always)]
    pub fn class(self) -> RegClass {
        self.ty().class()
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Value(v{}, {:?})", self.index(), self.ty())
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "v{}", self.index())
    }
}

/// Width of a stack slot, in frame words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum SlotWidth {
    Single = 1,
    Double = 2,
}

impl SlotWidth {
    #[inline(always)]
    pub fn words(self) -> usize {
        self as usize
    }
}

/// A stack slot in the frame of the compiled trace. `index` counts
/// frame words; a double-width slot covers `index` and `index + 1`
/// and is always aligned to an even index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SpillSlot {
    index: u32,
    width: SlotWidth,
}

impl SpillSlot {
    #[inline(always)]
    pub fn new(index: usize, width: SlotWidth) -> Self {
        debug_assert!(width == SlotWidth::Single || index % 2 == 0);
        SpillSlot {
            index: index as u32,
            width,
        }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline(always)]
    pub fn width(self) -> SlotWidth {
        self.width
    }

    /// One past the last frame word covered by this slot.
    #[inline(always)]
    pub fn end(self) -> usize {
        self.index() + self.width.words()
    }

    #[inline(always)]
    pub fn overlaps(self, other: SpillSlot) -> bool {
        self.index() < other.end() && other.index() < self.end()
    }
}

impl core::fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.width {
            SlotWidth::Single => write!(f, "stack{}", self.index()),
            SlotWidth::Double => write!(f, "stack{}w", self.index()),
        }
    }
}

/// Where a value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Location {
    Reg(PReg),
    Stack(SpillSlot),
    /// An immediate operand encoded into the instruction.
    Imm(i64),
    /// A byte offset into the constant pool.
    Pool(u32),
}

impl Location {
    #[inline(always)]
    pub fn as_reg(self) -> Option<PReg> {
        match self {
            Location::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_stack(self) -> Option<SpillSlot> {
        match self {
            Location::Stack(slot) => Some(slot),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_reg(self) -> bool {
        matches!(self, Location::Reg(_))
    }

    #[inline(always)]
    pub fn is_stack(self) -> bool {
        matches!(self, Location::Stack(_))
    }

    /// Is this a read-only constant location?
    #[inline(always)]
    pub fn is_const(self) -> bool {
        matches!(self, Location::Imm(_) | Location::Pool(_))
    }

    /// Does reading or writing this location touch memory?
    #[inline(always)]
    pub fn is_memory(self) -> bool {
        matches!(self, Location::Stack(_) | Location::Pool(_))
    }

    /// Do the two locations share any storage?
    pub fn overlaps(self, other: Location) -> bool {
        match (self, other) {
            (Location::Stack(a), Location::Stack(b)) => a.overlaps(b),
            _ => self == other,
        }
    }
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Location::Reg(reg) => write!(f, "{}", reg),
            Location::Stack(slot) => write!(f, "{}", slot),
            Location::Imm(imm) => write!(f, "${}", imm),
            Location::Pool(offset) => write!(f, "pool+{}", offset),
        }
    }
}

/// The two points around an operation at which edits are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
#[repr(u8)]
pub enum InstPosition {
    Before = 0,
    After = 1,
}

/// A program point: a single point before or after a given operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ProgPoint {
    bits: u32,
}

impl core::fmt::Debug for ProgPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "progpoint{}{}",
            self.pos().index(),
            match self.inst_pos() {
                InstPosition::Before => "-pre",
                InstPosition::After => "-post",
            }
        )
    }
}

impl ProgPoint {
    #[inline(always)]
    pub fn new(pos: Pos, inst_pos: InstPosition) -> Self {
        let bits = (pos.0 << 1) | (inst_pos as u8 as u32);
        Self { bits }
    }
    #[inline(always)]
    pub fn before(pos: Pos) -> Self {
        Self::new(pos, InstPosition::Before)
    }
    #[inline(always)]
    pub fn after(pos: Pos) -> Self {
        Self::new(pos, InstPosition::After)
    }
    #[inline(always)]
    pub fn pos(self) -> Pos {
        Pos(self.bits >> 1)
    }
    #[inline(always)]
    pub fn inst_pos(self) -> InstPosition {
        match self.bits & 1 {
            0 => InstPosition::Before,
            1 => InstPosition::After,
            _ => unreachable!(),
        }
    }
}

/// A primitive data-movement or runtime-protocol instruction that the
/// encoder must emit at a program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Edit {
    /// Copy `from` into `to`. `to` is a register or a stack slot.
    /// Stack-to-stack moves are only produced on targets that can
    /// encode them.
    Move { from: Location, to: Location },
    /// Push a location onto the machine stack.
    Push(Location),
    /// Pop the top of the machine stack into a location.
    Pop(Location),
    /// Store an outgoing call argument that did not fit in the
    /// argument registers into the outgoing argument area.
    StoreArg { from: Location, index: u32 },
    /// Release the shared execution lock before a call into foreign
    /// code.
    ReleaseLock,
    /// Reacquire the shared execution lock after a foreign call:
    /// compare-and-swap on the shared flag using `scratch`, falling
    /// back to the runtime's blocking slow path. Clobbers every
    /// caller-saved register.
    ReacquireLock { scratch: PReg },
}

impl core::fmt::Display for Edit {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Edit::Move { from, to } => write!(f, "move {} <- {}", to, from),
            Edit::Push(loc) => write!(f, "push {}", loc),
            Edit::Pop(loc) => write!(f, "pop {}", loc),
            Edit::StoreArg { from, index } => write!(f, "arg[{}] <- {}", index, from),
            Edit::ReleaseLock => write!(f, "release_lock"),
            Edit::ReacquireLock { scratch } => write!(f, "reacquire_lock ({})", scratch),
        }
    }
}

/// Locations chosen for one operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OpAllocs {
    /// One location per argument, in argument order, as read by the
    /// operation.
    pub args: SmallVec<[Location; 4]>,
    /// Where the operation writes its result.
    pub result: Option<Location>,
    /// Registers the operation may clobber as scratch, besides its
    /// result (the other half of a register pair).
    pub temps: SmallVec<[Location; 1]>,
    /// The guard token recorded at this operation, if it is a guard.
    pub guard: Option<guard::GuardId>,
}

/// The output of the register allocator.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Output {
    /// Locations for every operation, indexed by position.
    pub op_allocs: Vec<OpAllocs>,
    /// Edits, sorted by program point; edits at the same point must be
    /// emitted in order.
    pub edits: Vec<(ProgPoint, Edit)>,
    /// Every guard token, indexed by descriptor id.
    pub guards: guard::GuardTokens,
    /// High-water mark of the frame, in words.
    pub frame_depth: usize,
    /// Locations of the label arguments, fixed when the label was
    /// reached. Jumps to the label (including from bridges) must
    /// deliver their arguments here.
    pub label_layout: Option<Vec<Location>>,
    /// Where each trace input is on entry, in input order.
    pub input_locations: Vec<Location>,
    /// Constant pool entries; `Location::Pool(offset)` refers to entry
    /// `offset / 8`.
    pub pool: Vec<u64>,
    pub stats: Stats,
}

impl Output {
    /// Bytes of constant pool used.
    pub fn pool_size(&self) -> usize {
        self.pool.len() * target::ConstantPool::ENTRY_SIZE
    }

    /// The bits of the pool entry at byte `offset`.
    pub fn pool_entry(&self, offset: u32) -> Option<u64> {
        self.pool
            .get(offset as usize / target::ConstantPool::ENTRY_SIZE)
            .copied()
    }

    pub fn op_allocs(&self, pos: Pos) -> &OpAllocs {
        &self.op_allocs[pos.index()]
    }

    /// All edits at one program point, in emission order.
    pub fn edits_at(&self, point: ProgPoint) -> impl Iterator<Item = &Edit> {
        let start = self.edits.partition_point(|(p, _)| *p < point);
        self.edits[start..]
            .iter()
            .take_while(move |(p, _)| *p == point)
            .map(|(_, edit)| edit)
    }
}

/// An error that aborts a compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// More values are pinned to distinct registers at once than the
    /// register file can hold, or a register pair could not be
    /// found. The caller produced an unsatisfiable constraint set.
    UnsatisfiableAllocation(Pos),
    /// The frame grew beyond what the target can address.
    FrameOverflow { depth: usize, limit: usize },
    /// The constant pool grew beyond what the target can address.
    ConstantPoolOverflow { size: usize, limit: usize },
    /// An internal consistency check failed.
    InvariantViolation(String),
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            AllocError::UnsatisfiableAllocation(pos) => {
                write!(f, "unsatisfiable register constraints at {}", pos)
            }
            AllocError::FrameOverflow { depth, limit } => {
                write!(f, "frame depth {} exceeds limit {}", depth, limit)
            }
            AllocError::ConstantPoolOverflow { size, limit } => {
                write!(f, "constant pool size {} exceeds limit {}", size, limit)
            }
            AllocError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for AllocError {}

/// Options for allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
    /// Run the allocator's consistency checks after every operation,
    /// also in release builds.
    pub check_invariants: bool,
}
