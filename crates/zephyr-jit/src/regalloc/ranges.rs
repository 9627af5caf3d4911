//! Live ranges over a linearized instruction order
//!
//! Blocks are numbered in reverse postorder and every instruction (and
//! terminator) gets a global index. Each vreg is summarized as a single
//! conservative interval covering every point where it may be live; holes
//! are not modeled.

use rustc_hash::FxHashMap;

use crate::analysis::{analyze_liveness, FlowInfo};
use crate::ir::{Function, Value, Vreg};
use crate::regalloc::vector_regs;

/// Inclusive interval of instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub vreg: Vreg,
    pub start: u32,
    pub end: u32,
    pub vector: bool,
}

impl LiveRange {
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Build one range per vreg, sorted by start index.
pub fn build_ranges(func: &Function, flow: &FlowInfo) -> Vec<LiveRange> {
    let live = analyze_liveness(func, &flow.rpo);
    let vectors = vector_regs(func);

    let mut spans: FxHashMap<Vreg, (u32, u32)> = FxHashMap::default();
    let mut extend = |r: Vreg, at: u32| {
        let e = spans.entry(r).or_insert((at, at));
        if at < e.0 {
            e.0 = at;
        }
        if at > e.1 {
            e.1 = at;
        }
    };

    let mut idx: u32 = 0;
    for &b in &flow.rpo {
        let block = func.block(b);
        let block_start = idx;
        let block_end = idx + block.instrs.len() as u32;

        for r in &live.live_in[&b] {
            extend(*r, block_start);
        }
        for instr in &block.instrs {
            if let Some(d) = instr.dest() {
                extend(d, idx);
            }
            instr.for_each_value(|v| {
                if let Value::Reg(r) = v {
                    extend(r, idx);
                }
            });
            idx += 1;
        }
        block.terminator.for_each_value(|v| {
            if let Value::Reg(r) = v {
                extend(r, block_end);
            }
        });
        for r in &live.live_out[&b] {
            extend(*r, block_end);
        }
        idx = block_end + 1;
    }

    let mut ranges: Vec<LiveRange> = spans
        .into_iter()
        .map(|(vreg, (start, end))| LiveRange {
            vreg,
            start,
            end,
            vector: vectors.contains(&vreg),
        })
        .collect();
    ranges.sort_by_key(|r| (r.start, r.end, r.vreg));
    ranges
}
