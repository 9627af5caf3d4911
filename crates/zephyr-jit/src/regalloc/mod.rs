//! Register allocation
//!
//! Maps virtual registers onto RV64 hardware registers or frame slots.
//! Three allocators of increasing quality are selected by optimization
//! tier; all produce the same `Allocation` shape so code emission never
//! cares which one ran.

pub mod graph_color;
pub mod linear_scan;
pub mod naive;
pub mod ranges;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::FlowInfo;
use crate::config::OptLevel;
use crate::ir::{Function, Instr, Vreg};

/// Allocatable scalar pool: x19..x27 (s3..s11). Callee-saved registers
/// survive runtime helper calls, so allocated values never need
/// caller-save shuffling around a call.
pub const SCALAR_POOL: [u8; 9] = [19, 20, 21, 22, 23, 24, 25, 26, 27];

/// Vector pool v1..v7. v0 is reserved for masks.
pub const VECTOR_POOL: [u8; 7] = [1, 2, 3, 4, 5, 6, 7];

/// Where a virtual register lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Scalar hardware register (x-register number)
    Reg(u8),
    /// Frame slot at the given byte offset into the spill area
    Stack(i32),
    /// Vector hardware register (v-register number)
    Vector(u8),
}

impl Slot {
    pub fn is_stack(&self) -> bool {
        matches!(self, Slot::Stack(_))
    }
}

/// Result of allocation for one function.
#[derive(Debug, Default)]
pub struct Allocation {
    pub slots: FxHashMap<Vreg, Slot>,
    /// Bytes of frame needed for spill slots, 16-byte aligned
    pub spill_bytes: u32,
}

impl Allocation {
    pub fn slot(&self, r: Vreg) -> Option<Slot> {
        self.slots.get(&r).copied()
    }
}

/// Bump allocator for spill slots.
#[derive(Default)]
pub(crate) struct SpillArea {
    next: i32,
}

impl SpillArea {
    pub(crate) fn alloc(&mut self, bytes: i32) -> i32 {
        let off = self.next;
        self.next += bytes;
        off
    }

    pub(crate) fn total(&self) -> u32 {
        (self.next as u32 + 15) & !15
    }
}

pub trait RegAlloc: Send + Sync {
    fn name(&self) -> &'static str;

    /// Assign a slot to every vreg defined in `func`. `flow` must be
    /// current.
    fn allocate(&self, func: &Function, flow: &FlowInfo) -> Allocation;
}

/// Allocator for an optimization tier.
pub fn for_level(level: OptLevel) -> Box<dyn RegAlloc> {
    match level {
        OptLevel::None => Box::new(naive::NaiveAllocator),
        OptLevel::Minimal | OptLevel::Balanced => Box::new(linear_scan::LinearScanAllocator),
        OptLevel::Aggressive => Box::new(graph_color::GraphColoringAllocator),
    }
}

/// Vregs that must live in vector registers.
pub(crate) fn vector_regs(func: &Function) -> FxHashSet<Vreg> {
    let mut set = FxHashSet::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::VecLoad { dest, .. } | Instr::VecBin { dest, .. } = instr {
                set.insert(*dest);
            }
        }
    }
    set
}
