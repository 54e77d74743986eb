/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Target descriptions.
//!
//! A [`MachineEnv`] is plain data describing a register file and its
//! calling convention. The built-in environments are constructed once
//! per process and shared by reference. A [`TargetProfile`] wraps an
//! environment with the per-architecture rules that are code rather
//! than data, such as which constants fit in an immediate.

use crate::trace::Constant;
use crate::{AllocError, FxHashMap, Location, PReg, PRegSet, RegClass, SlotWidth, ValueType};
use std::sync::OnceLock;

/// Frame offsets, relative to the frame base, of the words a failing
/// guard fills in for the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardFrameLayout {
    /// Where the failure descriptor id is stored.
    pub descr_offset: i32,
    /// Where the first word of the live-reference bitmap is stored.
    pub gcmap_offset: i32,
    /// Size of one frame word in bytes.
    pub word_size: i32,
}

/// A machine environment tells the register allocator which registers
/// are available to allocate, how the calling convention uses them,
/// and how big the frame and constant pool may grow.
#[derive(Clone, Debug)]
pub struct MachineEnv {
    pub name: &'static str,
    /// Allocatable registers for each class, in order of preference.
    pub regs_by_class: [Vec<PReg>; 2],
    /// Registers a callee may clobber.
    pub caller_saved: PRegSet,
    /// Registers usable as byte operands.
    pub byte_regs: PRegSet,
    /// Even/odd register pairs for wide arithmetic.
    pub pairs: Vec<(PReg, PReg)>,
    /// Argument registers for each class, in assignment order.
    pub arg_regs_by_class: [Vec<PReg>; 2],
    /// Result register for each class.
    pub result_reg_by_class: [PReg; 2],
    /// One scratch register per class, used to break move cycles and
    /// to route memory-to-memory moves. Never allocatable.
    pub scratch_by_class: [PReg; 2],
    /// Register used by the fast path of lock reacquisition.
    pub lock_scratch: PReg,
    /// Stack slot width per `ValueType`.
    pub slot_width_by_type: [SlotWidth; 4],
    /// Frame words addressable by the target's displacement encoding.
    pub max_frame_words: usize,
    /// Bytes of constant pool the target can address.
    pub max_pool_bytes: usize,
    /// Can the target move directly between two memory locations?
    pub stack_to_stack_moves: bool,
    pub guard_frame: GuardFrameLayout,
}

impl MachineEnv {
    pub fn is_allocatable(&self, reg: PReg) -> bool {
        self.regs_by_class[reg.class() as usize].contains(&reg)
    }

    pub fn callee_saved(&self, class: RegClass) -> impl Iterator<Item = PReg> + '_ {
        self.regs_by_class[class as usize]
            .iter()
            .copied()
            .filter(move |r| !self.caller_saved.contains(*r))
    }

    /// The other half of `reg`'s pair, if `reg` belongs to one.
    pub fn pair_partner(&self, reg: PReg) -> Option<PReg> {
        self.pairs.iter().find_map(|&(even, odd)| {
            if even == reg {
                Some(odd)
            } else if odd == reg {
                Some(even)
            } else {
                None
            }
        })
    }
}

/// Per-architecture capabilities the allocator consults. One value
/// implementing this trait is injected into every compilation.
pub trait TargetProfile {
    fn env(&self) -> &MachineEnv;

    /// Turn a constant into an operand location: an immediate when the
    /// instruction encoding can carry it, otherwise a pool entry.
    fn constant_location(
        &self,
        c: Constant,
        pool: &mut ConstantPool,
    ) -> Result<Location, AllocError> {
        match c {
            Constant::Int(i) if i32::try_from(i).is_ok() => Ok(Location::Imm(i)),
            Constant::Ref(bits) if i32::try_from(bits).is_ok() => Ok(Location::Imm(bits as i64)),
            _ => pool.insert(c.bits(), self.env().max_pool_bytes),
        }
    }

    fn slot_width(&self, ty: ValueType) -> SlotWidth {
        self.env().slot_width_by_type[ty as usize]
    }

    fn is_byte_addressable(&self, reg: PReg) -> bool {
        self.env().byte_regs.contains(reg)
    }
}

/// The literal pool of one compiled trace. Entries are eight bytes and
/// deduplicated by bit pattern.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    offsets: FxHashMap<u64, u32>,
    entries: Vec<u64>,
}

impl ConstantPool {
    pub const ENTRY_SIZE: usize = 8;

    pub fn insert(&mut self, bits: u64, limit: usize) -> Result<Location, AllocError> {
        if let Some(&offset) = self.offsets.get(&bits) {
            return Ok(Location::Pool(offset));
        }
        let offset = self.size();
        let size = offset + Self::ENTRY_SIZE;
        if size > limit {
            return Err(AllocError::ConstantPoolOverflow { size, limit });
        }
        self.entries.push(bits);
        self.offsets.insert(bits, offset as u32);
        trace!("pool: {:#x} at offset {}", bits, offset);
        Ok(Location::Pool(offset as u32))
    }

    pub fn size(&self) -> usize {
        self.entries.len() * Self::ENTRY_SIZE
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }
}

fn gpr(hw: usize) -> PReg {
    PReg::new(hw, RegClass::Int)
}

fn fpr(hw: usize) -> PReg {
    PReg::new(hw, RegClass::Float)
}

/// x86-64 with the System V calling convention.
pub fn x64_env() -> &'static MachineEnv {
    static ENV: OnceLock<MachineEnv> = OnceLock::new();
    ENV.get_or_init(|| {
        // rax=0 rcx=1 rdx=2 rbx=3 rsp=4 rbp=5 rsi=6 rdi=7 r8..r15=8..15.
        // rsp and rbp are reserved; r11 and xmm15 are the scratch pair.
        let int_regs: Vec<PReg> = [0, 1, 2, 3, 6, 7, 8, 9, 10, 12, 13, 14, 15]
            .iter()
            .map(|&hw| gpr(hw))
            .collect();
        let float_regs: Vec<PReg> = (0..15).map(fpr).collect();
        let mut caller_saved = PRegSet::from_regs(
            &[0, 1, 2, 6, 7, 8, 9, 10, 11]
                .iter()
                .map(|&hw| gpr(hw))
                .collect::<Vec<_>>(),
        );
        for hw in 0..16 {
            caller_saved.add(fpr(hw));
        }
        MachineEnv {
            name: "x86_64",
            byte_regs: PRegSet::from_regs(&int_regs),
            regs_by_class: [int_regs, float_regs],
            caller_saved,
            pairs: vec![],
            arg_regs_by_class: [
                [7, 6, 2, 1, 8, 9].iter().map(|&hw| gpr(hw)).collect(),
                (0..8).map(fpr).collect(),
            ],
            result_reg_by_class: [gpr(0), fpr(0)],
            scratch_by_class: [gpr(11), fpr(15)],
            // `lock cmpxchg` compares against rax.
            lock_scratch: gpr(0),
            slot_width_by_type: [
                SlotWidth::Single,
                SlotWidth::Single,
                SlotWidth::Single,
                SlotWidth::Double,
            ],
            max_frame_words: (i32::MAX as usize) / 8,
            max_pool_bytes: i32::MAX as usize,
            stack_to_stack_moves: false,
            guard_frame: GuardFrameLayout {
                descr_offset: 8,
                gcmap_offset: 16,
                word_size: 8,
            },
        }
    })
}

/// 32-bit Arm with the AAPCS-VFP calling convention.
pub fn arm32_env() -> &'static MachineEnv {
    static ENV: OnceLock<MachineEnv> = OnceLock::new();
    ENV.get_or_init(|| {
        // r11 is the frame pointer, r12 the scratch, r13-r15 sp/lr/pc.
        let int_regs: Vec<PReg> = (0..11).map(gpr).collect();
        let float_regs: Vec<PReg> = (0..15).map(fpr).collect();
        let mut caller_saved = PRegSet::from_regs(&[gpr(0), gpr(1), gpr(2), gpr(3), gpr(12)]);
        for hw in 0..8 {
            caller_saved.add(fpr(hw));
        }
        caller_saved.add(fpr(15));
        MachineEnv {
            name: "arm32",
            byte_regs: PRegSet::from_regs(&int_regs),
            regs_by_class: [int_regs, float_regs],
            caller_saved,
            pairs: (0..5).map(|i| (gpr(2 * i), gpr(2 * i + 1))).collect(),
            arg_regs_by_class: [(0..4).map(gpr).collect(), (0..8).map(fpr).collect()],
            result_reg_by_class: [gpr(0), fpr(0)],
            scratch_by_class: [gpr(12), fpr(15)],
            lock_scratch: gpr(12),
            slot_width_by_type: [
                SlotWidth::Single,
                SlotWidth::Single,
                SlotWidth::Double,
                SlotWidth::Double,
            ],
            // ldr/str carry a 12-bit byte offset.
            max_frame_words: 4095 / 4,
            max_pool_bytes: 4095,
            stack_to_stack_moves: false,
            guard_frame: GuardFrameLayout {
                descr_offset: 4,
                gcmap_offset: 8,
                word_size: 4,
            },
        }
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct X64;

impl TargetProfile for X64 {
    fn env(&self) -> &MachineEnv {
        x64_env()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Arm32;

impl TargetProfile for Arm32 {
    fn env(&self) -> &MachineEnv {
        arm32_env()
    }

    fn constant_location(
        &self,
        c: Constant,
        pool: &mut ConstantPool,
    ) -> Result<Location, AllocError> {
        match c {
            // Data-processing immediates: an 8-bit value.
            Constant::Int(i) if (0..=255).contains(&i) => Ok(Location::Imm(i)),
            _ => pool.insert(c.bits(), self.env().max_pool_bytes),
        }
    }
}

/// A target built from an arbitrary environment, with the default
/// constant rules.
#[derive(Clone, Debug)]
pub struct CustomTarget {
    pub env: MachineEnv,
}

impl CustomTarget {
    pub fn new(env: MachineEnv) -> Self {
        CustomTarget { env }
    }

    /// A small symmetric machine: `int_regs` general-purpose registers
    /// of which the first `caller_saved` are caller-saved, four float
    /// registers, and consecutive even/odd pairs.
    pub fn small(int_regs: usize, caller_saved: usize) -> Self {
        assert!(int_regs + 1 <= PReg::MAX);
        let regs: Vec<PReg> = (0..int_regs).map(gpr).collect();
        let float_regs: Vec<PReg> = (0..4).map(fpr).collect();
        let mut saved = PRegSet::from_regs(&regs[..caller_saved]);
        for &f in &float_regs {
            saved.add(f);
        }
        let scratch = gpr(int_regs);
        saved.add(scratch);
        let arg_count = caller_saved.min(2);
        CustomTarget::new(MachineEnv {
            name: "small",
            byte_regs: PRegSet::from_regs(&regs),
            pairs: (0..int_regs / 2)
                .map(|i| (gpr(2 * i), gpr(2 * i + 1)))
                .collect(),
            arg_regs_by_class: [regs[..arg_count].to_vec(), float_regs[..2].to_vec()],
            result_reg_by_class: [regs[0], float_regs[0]],
            regs_by_class: [regs, float_regs],
            caller_saved: saved,
            scratch_by_class: [scratch, fpr(4)],
            lock_scratch: scratch,
            slot_width_by_type: [
                SlotWidth::Single,
                SlotWidth::Single,
                SlotWidth::Single,
                SlotWidth::Double,
            ],
            max_frame_words: 1 << 20,
            max_pool_bytes: 1 << 20,
            stack_to_stack_moves: false,
            guard_frame: GuardFrameLayout {
                descr_offset: 8,
                gcmap_offset: 16,
                word_size: 8,
            },
        })
    }
}

impl TargetProfile for CustomTarget {
    fn env(&self) -> &MachineEnv {
        &self.env
    }
}
