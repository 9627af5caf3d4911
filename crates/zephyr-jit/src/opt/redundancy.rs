//! Redundancy elimination by local value numbering
//!
//! Side-effect-free instructions are keyed by structure; a later duplicate
//! inside the same block is replaced with a move from the earliest
//! equivalent definition.

use rustc_hash::FxHashMap;

use crate::analysis::FlowInfo;
use crate::ir::{Function, Instr, Module, Value, Vreg};
use crate::opt::{expr_key, ExprKey, OptPass};

pub struct RedundancyElimination;

impl OptPass for RedundancyElimination {
    fn name(&self) -> &'static str {
        "redundancy-elimination"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        for bi in 0..func.blocks.len() {
            let mut table: FxHashMap<ExprKey, Vreg> = FxHashMap::default();
            for ii in 0..func.blocks[bi].instrs.len() {
                let instr = &func.blocks[bi].instrs[ii];
                if instr.has_side_effects() {
                    continue;
                }
                let Some(key) = expr_key(instr) else { continue };
                let Some(dest) = instr.dest() else { continue };
                match table.get(&key) {
                    Some(&first) if first != dest => {
                        func.blocks[bi].instrs[ii] = Instr::Move {
                            dest,
                            src: Value::Reg(first),
                        };
                        changed = true;
                    }
                    Some(_) => {}
                    None => {
                        table.insert(key, dest);
                    }
                }
            }
        }
        if changed {
            func.touch();
        }
        changed
    }
}
