//! Naive allocator
//!
//! Every scalar vreg gets its own frame slot; nothing is kept in a
//! register across instructions. Compilation is instant and the emitted
//! code is memory-bound, which is exactly the trade the no-optimization
//! tier wants. Vector vregs still get vector registers since there is no
//! cheap frame fallback for them.

use crate::analysis::FlowInfo;
use crate::ir::Function;
use crate::regalloc::{Allocation, RegAlloc, Slot, SpillArea, VECTOR_POOL};

pub struct NaiveAllocator;

impl RegAlloc for NaiveAllocator {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn allocate(&self, func: &Function, flow: &FlowInfo) -> Allocation {
        let ranges = crate::regalloc::ranges::build_ranges(func, flow);
        let mut alloc = Allocation::default();
        let mut area = SpillArea::default();
        let mut next_vector = 0usize;
        for r in ranges {
            let slot = if r.vector {
                let v = VECTOR_POOL[next_vector % VECTOR_POOL.len()];
                next_vector += 1;
                Slot::Vector(v)
            } else {
                Slot::Stack(area.alloc(8))
            };
            alloc.slots.insert(r.vreg, slot);
        }
        alloc.spill_bytes = area.total();
        alloc
    }
}
