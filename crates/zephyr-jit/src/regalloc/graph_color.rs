//! Graph-coloring allocator
//!
//! Chaitin-style: build an interference graph from overlapping live
//! ranges, simplify nodes below the pool size onto a stack, then color
//! optimistically on the way back. Nodes that stay uncolorable get frame
//! slots. Longer ranges are preferred as spill candidates.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::FlowInfo;
use crate::ir::{Function, Vreg};
use crate::regalloc::ranges::{build_ranges, LiveRange};
use crate::regalloc::{Allocation, RegAlloc, Slot, SpillArea, SCALAR_POOL, VECTOR_POOL};

pub struct GraphColoringAllocator;

impl RegAlloc for GraphColoringAllocator {
    fn name(&self) -> &'static str {
        "graph-coloring"
    }

    fn allocate(&self, func: &Function, flow: &FlowInfo) -> Allocation {
        let ranges = build_ranges(func, flow);
        let mut alloc = Allocation::default();
        let mut area = SpillArea::default();

        let scalar: Vec<LiveRange> = ranges.iter().filter(|r| !r.vector).copied().collect();
        let vector: Vec<LiveRange> = ranges.iter().filter(|r| r.vector).copied().collect();
        color_class(&scalar, &SCALAR_POOL, false, &mut alloc, &mut area);
        color_class(&vector, &VECTOR_POOL, true, &mut alloc, &mut area);

        alloc.spill_bytes = area.total();
        alloc
    }
}

fn color_class(
    ranges: &[LiveRange],
    pool: &[u8],
    vector: bool,
    alloc: &mut Allocation,
    area: &mut SpillArea,
) {
    let k = pool.len();
    let by_vreg: FxHashMap<Vreg, &LiveRange> = ranges.iter().map(|r| (r.vreg, r)).collect();

    // adjacency over overlapping ranges
    let mut edges: FxHashMap<Vreg, FxHashSet<Vreg>> = FxHashMap::default();
    for r in ranges {
        edges.entry(r.vreg).or_default();
    }
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            if b.start > a.end {
                break;
            }
            if a.overlaps(b) {
                edges.entry(a.vreg).or_default().insert(b.vreg);
                edges.entry(b.vreg).or_default().insert(a.vreg);
            }
        }
    }

    // simplify: push low-degree nodes; when stuck, push the longest range
    // as an optimistic spill candidate
    let mut degree: FxHashMap<Vreg, usize> =
        edges.iter().map(|(v, n)| (*v, n.len())).collect();
    let mut remaining: FxHashSet<Vreg> = edges.keys().copied().collect();
    let mut stack: Vec<Vreg> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let pick = remaining
            .iter()
            .filter(|v| degree[v] < k)
            .min_by_key(|v| (degree[v], v.0))
            .copied()
            .or_else(|| {
                remaining
                    .iter()
                    .max_by_key(|v| (by_vreg[v].len(), v.0))
                    .copied()
            });
        let Some(v) = pick else { break };
        remaining.remove(&v);
        stack.push(v);
        for n in &edges[&v] {
            if let Some(d) = degree.get_mut(n) {
                *d = d.saturating_sub(1);
            }
        }
    }

    // color in reverse simplification order
    let mut colors: FxHashMap<Vreg, u8> = FxHashMap::default();
    while let Some(v) = stack.pop() {
        let taken: FxHashSet<u8> = edges[&v]
            .iter()
            .filter_map(|n| colors.get(n).copied())
            .collect();
        match pool.iter().find(|c| !taken.contains(c)) {
            Some(c) => {
                colors.insert(v, *c);
                let slot = if vector { Slot::Vector(*c) } else { Slot::Reg(*c) };
                alloc.slots.insert(v, slot);
            }
            None => {
                log::trace!("no color for {}, spilling", v);
                let bytes = if vector { 32 } else { 8 };
                alloc.slots.insert(v, Slot::Stack(area.alloc(bytes)));
            }
        }
    }
}
