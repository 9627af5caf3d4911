//! Linear-scan allocator
//!
//! Single pass over start-sorted live ranges with an active set per
//! register class. When the pool is empty the range reaching furthest is
//! spilled, which keeps short hot values in registers.

use crate::analysis::FlowInfo;
use crate::ir::Function;
use crate::regalloc::ranges::{build_ranges, LiveRange};
use crate::regalloc::{Allocation, RegAlloc, Slot, SpillArea, SCALAR_POOL, VECTOR_POOL};

pub struct LinearScanAllocator;

impl RegAlloc for LinearScanAllocator {
    fn name(&self) -> &'static str {
        "linear-scan"
    }

    fn allocate(&self, func: &Function, flow: &FlowInfo) -> Allocation {
        let ranges = build_ranges(func, flow);
        let mut alloc = Allocation::default();
        let mut area = SpillArea::default();
        let mut scalars = Scan::new(&SCALAR_POOL, false);
        let mut vectors = Scan::new(&VECTOR_POOL, true);

        for range in ranges {
            let scan = if range.vector {
                &mut vectors
            } else {
                &mut scalars
            };
            scan.place(range, &mut alloc, &mut area);
        }
        alloc.spill_bytes = area.total();
        alloc
    }
}

/// Active set for one register class.
struct Scan {
    free: Vec<u8>,
    /// (range, register), kept sorted by range end
    active: Vec<(LiveRange, u8)>,
    vector: bool,
}

impl Scan {
    fn new(pool: &[u8], vector: bool) -> Self {
        let mut free = pool.to_vec();
        // pop() hands out low registers first
        free.reverse();
        Self {
            free,
            active: Vec::new(),
            vector,
        }
    }

    fn wrap(&self, reg: u8) -> Slot {
        if self.vector {
            Slot::Vector(reg)
        } else {
            Slot::Reg(reg)
        }
    }

    fn place(&mut self, range: LiveRange, alloc: &mut Allocation, area: &mut SpillArea) {
        self.expire(range.start);
        if let Some(reg) = self.free.pop() {
            alloc.slots.insert(range.vreg, self.wrap(reg));
            self.insert_active(range, reg);
            return;
        }
        // pool exhausted: spill whichever range ends last
        let furthest = self
            .active
            .last()
            .map(|(r, _)| r.end)
            .unwrap_or(0);
        let bytes = if self.vector { 32 } else { 8 };
        match self.active.pop() {
            Some((victim, reg)) if furthest > range.end => {
                log::trace!("spilling {} for {}", victim.vreg, range.vreg);
                alloc
                    .slots
                    .insert(victim.vreg, Slot::Stack(area.alloc(bytes)));
                alloc.slots.insert(range.vreg, self.wrap(reg));
                self.insert_active(range, reg);
            }
            popped => {
                if let Some(entry) = popped {
                    self.active.push(entry);
                }
                alloc.slots.insert(range.vreg, Slot::Stack(area.alloc(bytes)));
            }
        }
    }

    fn expire(&mut self, now: u32) {
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].0.end < now {
                let (_, reg) = self.active.remove(i);
                self.free.push(reg);
            } else {
                i += 1;
            }
        }
    }

    fn insert_active(&mut self, range: LiveRange, reg: u8) {
        let at = self
            .active
            .partition_point(|(r, _)| r.end <= range.end);
        self.active.insert(at, (range, reg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regalloc::tests::{check_no_overlap_conflicts, many_live};

    #[test]
    fn test_few_values_all_in_registers() {
        let mut f = many_live(3);
        let flow = FlowInfo::compute(&mut f);
        let alloc = LinearScanAllocator.allocate(&f, &flow);
        assert!(alloc.slots.values().all(|s| matches!(s, Slot::Reg(_))));
        assert_eq!(alloc.spill_bytes, 0);
    }

    #[test]
    fn test_pressure_forces_spills() {
        let mut f = many_live(16);
        let flow = FlowInfo::compute(&mut f);
        let alloc = LinearScanAllocator.allocate(&f, &flow);
        assert!(alloc.slots.values().any(|s| s.is_stack()));
        assert!(alloc.spill_bytes > 0);
        check_no_overlap_conflicts(&mut f, &alloc);
    }

    #[test]
    fn test_registers_reused_after_expiry() {
        // two sequential non-overlapping phases can share the pool
        let mut f = many_live(5);
        let flow = FlowInfo::compute(&mut f);
        let alloc = LinearScanAllocator.allocate(&f, &flow);
        check_no_overlap_conflicts(&mut f, &alloc);
    }
}
