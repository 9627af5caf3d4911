//! Flow analyses over the IR
//!
//! All analyses are pure and re-derivable. `FlowInfo` bundles them with a
//! version stamp so the optimizer only recomputes after a mutation.

pub mod cfg;
pub mod dominators;
pub mod liveness;
pub mod loops;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BlockId, Function};

pub use cfg::reverse_postorder;
pub use dominators::DomTree;
pub use liveness::{analyze as analyze_liveness, Liveness};
pub use loops::{detect_loops, LoopForest, NaturalLoop};

/// Cached flow-analysis results for one function at one version.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    version: u64,
    pub rpo: Vec<BlockId>,
    pub dom: DomTree,
    pub frontiers: FxHashMap<BlockId, FxHashSet<BlockId>>,
    pub loops: LoopForest,
}

impl FlowInfo {
    /// Build the CFG and derive every flow analysis. Also writes the
    /// loop-header/depth annotations back onto the blocks.
    pub fn compute(func: &mut Function) -> FlowInfo {
        func.build_cfg();
        let rpo = cfg::reverse_postorder(func);
        let dom = DomTree::compute(func);
        let frontiers = dom.frontiers(func);
        let loops = loops::detect_loops(func, &dom);

        for id in 0..func.blocks.len() {
            let b = BlockId(id as u32);
            func.annotate_loop(b, loops.is_header(b), loops.depth_of(b));
        }

        FlowInfo {
            version: func.version(),
            rpo,
            dom,
            frontiers,
            loops,
        }
    }

    /// True while the function has not been mutated since `compute`.
    pub fn is_current(&self, func: &Function) -> bool {
        self.version == func.version()
    }
}
