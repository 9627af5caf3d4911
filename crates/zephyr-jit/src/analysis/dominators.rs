//! Dominator tree (Lengauer–Tarjan) and dominance frontiers
//!
//! One canonical algorithm for every client; passes must never mix exact
//! and approximate dominance.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BlockId, Function};

/// Immediate-dominator tree over the reachable blocks of one function.
/// The entry block is its own immediate dominator.
#[derive(Debug, Clone)]
pub struct DomTree {
    idom: FxHashMap<BlockId, BlockId>,
    children: FxHashMap<BlockId, Vec<BlockId>>,
    entry: BlockId,
}

impl DomTree {
    /// Lengauer–Tarjan with path compression. Requires `func.build_cfg()`
    /// to have run (predecessor sets must be current).
    pub fn compute(func: &Function) -> DomTree {
        let n_blocks = func.blocks.len();

        // True DFS preorder from the entry.
        let mut dfnum: Vec<Option<usize>> = vec![None; n_blocks];
        let mut vertex: Vec<usize> = Vec::new();
        let mut parent: Vec<usize> = Vec::new();
        let mut stack: Vec<(usize, usize)> = vec![(func.entry.index(), 0)];
        dfnum[func.entry.index()] = Some(0);
        vertex.push(func.entry.index());
        parent.push(usize::MAX);

        while let Some((b, cur)) = stack.last_mut() {
            let block = *b;
            let succs = func.blocks[block].terminator.successors();
            if *cur < succs.len() {
                let s = succs[*cur].index();
                *cur += 1;
                if s < n_blocks && dfnum[s].is_none() {
                    dfnum[s] = Some(vertex.len());
                    parent.push(dfnum[block].unwrap_or(0));
                    vertex.push(s);
                    stack.push((s, 0));
                }
            } else {
                stack.pop();
            }
        }

        let n = vertex.len();
        let mut semi: Vec<usize> = (0..n).collect();
        let mut idom_num: Vec<usize> = vec![0; n];
        let mut ancestor: Vec<Option<usize>> = vec![None; n];
        let mut label: Vec<usize> = (0..n).collect();
        let mut bucket: Vec<Vec<usize>> = vec![Vec::new(); n];

        fn compress(
            v: usize,
            ancestor: &mut [Option<usize>],
            label: &mut [usize],
            semi: &[usize],
        ) {
            let mut path = Vec::new();
            let mut x = v;
            while let Some(a) = ancestor[x] {
                if ancestor[a].is_some() {
                    path.push(x);
                    x = a;
                } else {
                    break;
                }
            }
            for &y in path.iter().rev() {
                // every node on the path was pushed with a live ancestor
                let Some(a) = ancestor[y] else { continue };
                if semi[label[a]] < semi[label[y]] {
                    label[y] = label[a];
                }
                ancestor[y] = ancestor[a];
            }
        }

        fn eval(
            v: usize,
            ancestor: &mut [Option<usize>],
            label: &mut [usize],
            semi: &[usize],
        ) -> usize {
            if ancestor[v].is_none() {
                label[v]
            } else {
                compress(v, ancestor, label, semi);
                label[v]
            }
        }

        for w in (1..n).rev() {
            for pred in &func.blocks[vertex[w]].preds {
                let Some(v) = dfnum[pred.index()] else {
                    // unreachable predecessor
                    continue;
                };
                let u = eval(v, &mut ancestor, &mut label, &semi);
                if semi[u] < semi[w] {
                    semi[w] = semi[u];
                }
            }
            bucket[semi[w]].push(w);
            ancestor[w] = Some(parent[w]);
            for v in std::mem::take(&mut bucket[parent[w]]) {
                let u = eval(v, &mut ancestor, &mut label, &semi);
                idom_num[v] = if semi[u] < semi[v] { u } else { parent[w] };
            }
        }
        for w in 1..n {
            if idom_num[w] != semi[w] {
                idom_num[w] = idom_num[idom_num[w]];
            }
        }

        let mut idom = FxHashMap::default();
        let mut children: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        idom.insert(func.entry, func.entry);
        for w in 1..n {
            let block = BlockId(vertex[w] as u32);
            let dom = BlockId(vertex[idom_num[w]] as u32);
            idom.insert(block, dom);
            children.entry(dom).or_default().push(block);
        }

        DomTree {
            idom,
            children,
            entry: func.entry,
        }
    }

    /// Immediate dominator; the entry returns itself. `None` for
    /// unreachable blocks.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idom.get(&b).copied()
    }

    pub fn children(&self, b: BlockId) -> &[BlockId] {
        self.children.get(&b).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.idom.contains_key(&b)
    }

    /// Does `a` dominate `b`? Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom.get(&cur) {
                Some(&d) if d != cur => cur = d,
                _ => return false,
            }
        }
    }

    /// Dominance frontiers (Cooper-Harvey-Kennedy walk from join points).
    pub fn frontiers(&self, func: &Function) -> FxHashMap<BlockId, FxHashSet<BlockId>> {
        let mut df: FxHashMap<BlockId, FxHashSet<BlockId>> = FxHashMap::default();
        for block in &func.blocks {
            if !self.is_reachable(block.id) || block.preds.len() < 2 {
                continue;
            }
            let idom_b = match self.idom(block.id) {
                Some(d) => d,
                None => continue,
            };
            for &pred in &block.preds {
                if !self.is_reachable(pred) {
                    continue;
                }
                let mut runner = pred;
                while runner != idom_b {
                    df.entry(runner).or_default().insert(block.id);
                    match self.idom(runner) {
                        Some(d) if d != runner => runner = d,
                        _ => break,
                    }
                }
            }
        }
        df
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncId, IrType, Terminator, Value};

    /// bb0 -> bb1 | bb2; bb1 -> bb3; bb2 -> bb3; bb3 -> ret
    fn diamond() -> Function {
        let mut f = Function::new(FuncId(0), "d", vec![IrType::Bool], IrType::Int64);
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        f.set_terminator(
            f.entry,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: b1,
                else_bb: b2,
            },
        );
        f.set_terminator(b1, Terminator::Jump { target: b3 });
        f.set_terminator(b2, Terminator::Jump { target: b3 });
        f.set_terminator(
            b3,
            Terminator::Ret {
                value: Some(Value::ConstInt(0)),
            },
        );
        f.build_cfg();
        f
    }

    #[test]
    fn test_diamond_idoms() {
        let f = diamond();
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(BlockId(1)), Some(BlockId(0)));
        assert_eq!(dom.idom(BlockId(2)), Some(BlockId(0)));
        // join is dominated by the fork, not by either arm
        assert_eq!(dom.idom(BlockId(3)), Some(BlockId(0)));
    }

    #[test]
    fn test_dominates_relation() {
        let f = diamond();
        let dom = DomTree::compute(&f);
        assert!(dom.dominates(BlockId(0), BlockId(3)));
        assert!(dom.dominates(BlockId(3), BlockId(3)));
        assert!(!dom.dominates(BlockId(1), BlockId(3)));
        assert!(!dom.dominates(BlockId(1), BlockId(2)));
    }

    #[test]
    fn test_diamond_frontiers() {
        let f = diamond();
        let dom = DomTree::compute(&f);
        let df = dom.frontiers(&f);
        assert!(df[&BlockId(1)].contains(&BlockId(3)));
        assert!(df[&BlockId(2)].contains(&BlockId(3)));
        assert!(!df.contains_key(&BlockId(0)));
    }

    #[test]
    fn test_loop_idoms() {
        // bb0 -> bb1; bb1 -> bb2 | bb3; bb2 -> bb1 (back edge)
        let mut f = Function::new(FuncId(0), "l", vec![IrType::Bool], IrType::Int64);
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        f.set_terminator(f.entry, Terminator::Jump { target: b1 });
        f.set_terminator(
            b1,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: b2,
                else_bb: b3,
            },
        );
        f.set_terminator(b2, Terminator::Jump { target: b1 });
        f.set_terminator(b3, Terminator::Ret { value: None });
        f.build_cfg();

        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b1), Some(BlockId(0)));
        assert_eq!(dom.idom(b2), Some(b1));
        assert_eq!(dom.idom(b3), Some(b1));
        assert!(dom.dominates(b1, b2));
        assert!(!dom.dominates(b2, b1));
    }

    #[test]
    fn test_unreachable_block_not_in_tree() {
        let mut f = diamond();
        let orphan = f.add_block();
        f.set_terminator(orphan, Terminator::Unreachable);
        f.build_cfg();
        let dom = DomTree::compute(&f);
        assert!(!dom.is_reachable(orphan));
        assert_eq!(dom.idom(orphan), None);
    }
}
