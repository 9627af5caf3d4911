//! Natural-loop detection
//!
//! A back edge is an edge whose target dominates its source; the natural
//! loop of a header is the set of blocks that reach a back-edge source
//! without passing through the header.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::dominators::DomTree;
use crate::ir::{BlockId, Function};

#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,
    /// Sources of back edges into this header
    pub latches: Vec<BlockId>,
    /// All blocks in the loop, header included
    pub blocks: FxHashSet<BlockId>,
}

impl NaturalLoop {
    pub fn contains(&self, b: BlockId) -> bool {
        self.blocks.contains(&b)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    pub loops: Vec<NaturalLoop>,
    /// Nesting depth per block: number of loops containing it
    pub depth: FxHashMap<BlockId, u32>,
}

impl LoopForest {
    pub fn is_header(&self, b: BlockId) -> bool {
        self.loops.iter().any(|l| l.header == b)
    }

    pub fn depth_of(&self, b: BlockId) -> u32 {
        self.depth.get(&b).copied().unwrap_or(0)
    }

    /// Loops ordered innermost-first (by shrinking block count).
    pub fn innermost_first(&self) -> Vec<&NaturalLoop> {
        let mut out: Vec<&NaturalLoop> = self.loops.iter().collect();
        out.sort_by_key(|l| l.blocks.len());
        out
    }
}

/// Detect all natural loops. Requires a current CFG and dominator tree.
pub fn detect_loops(func: &Function, dom: &DomTree) -> LoopForest {
    // back edges grouped by header
    let mut latches_of: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for block in &func.blocks {
        if !dom.is_reachable(block.id) {
            continue;
        }
        for succ in block.terminator.successors() {
            if succ.index() < func.blocks.len() && dom.dominates(succ, block.id) {
                latches_of.entry(succ).or_default().push(block.id);
            }
        }
    }

    let mut loops = Vec::new();
    let mut headers: Vec<BlockId> = latches_of.keys().copied().collect();
    headers.sort();
    for header in headers {
        let latches = latches_of.remove(&header).unwrap_or_default();
        let mut blocks: FxHashSet<BlockId> = FxHashSet::default();
        blocks.insert(header);
        let mut work: Vec<BlockId> = latches.clone();
        while let Some(b) = work.pop() {
            if blocks.insert(b) {
                for &p in &func.block(b).preds {
                    if dom.is_reachable(p) {
                        work.push(p);
                    }
                }
            }
        }
        loops.push(NaturalLoop {
            header,
            latches,
            blocks,
        });
    }

    let mut depth: FxHashMap<BlockId, u32> = FxHashMap::default();
    for l in &loops {
        for &b in &l.blocks {
            *depth.entry(b).or_insert(0) += 1;
        }
    }

    LoopForest { loops, depth }
}
