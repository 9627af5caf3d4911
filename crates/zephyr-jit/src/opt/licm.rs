//! Loop-invariant code motion
//!
//! Side-effect-free instructions whose operands are all defined outside
//! the loop are hoisted to the preheader (the unique out-of-loop
//! predecessor of the header). Loops without one are skipped.

use rustc_hash::FxHashSet;

use crate::analysis::{FlowInfo, NaturalLoop};
use crate::ir::{BlockId, Function, Instr, Module, Value};
use crate::opt::{def_blocks, OptPass};

pub struct LoopInvariantCodeMotion;

impl OptPass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&self, func: &mut Function, flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        for l in flow.loops.innermost_first() {
            if hoist_loop(func, l) {
                changed = true;
            }
        }
        changed
    }
}

/// The unique predecessor of the header outside the loop, if any.
fn preheader(func: &Function, l: &NaturalLoop) -> Option<BlockId> {
    let mut outside = func
        .block(l.header)
        .preds
        .iter()
        .filter(|p| !l.contains(**p));
    let first = outside.next()?;
    if outside.next().is_some() {
        return None;
    }
    Some(*first)
}

fn hoist_loop(func: &mut Function, l: &NaturalLoop) -> bool {
    let Some(pre) = preheader(func, l) else {
        return false;
    };

    let defs = def_blocks(func);
    let in_loop = |v: Value| match v {
        Value::Reg(r) => defs.get(&r).map(|b| l.contains(*b)).unwrap_or(true),
        _ => false,
    };

    let mut hoisted = Vec::new();
    let mut body: Vec<BlockId> = l.blocks.iter().copied().collect();
    body.sort();
    for bid in body {
        let block = &mut func.blocks[bid.index()];
        let mut ii = 0;
        while ii < block.instrs.len() {
            let instr = &block.instrs[ii];
            let mut invariant = !instr.has_side_effects() && !instr.is_phi();
            if invariant {
                instr.for_each_value(|v| {
                    if in_loop(v) {
                        invariant = false;
                    }
                });
            }
            // loads observe memory the loop may write; leave them alone
            if matches!(instr, Instr::Load { .. } | Instr::VecLoad { .. }) {
                invariant = false;
            }
            if invariant && instr.dest().is_some() {
                hoisted.push(block.instrs.remove(ii));
            } else {
                ii += 1;
            }
        }
    }

    if hoisted.is_empty() {
        return false;
    }
    let pre_block = &mut func.blocks[pre.index()];
    pre_block.instrs.extend(hoisted);
    func.touch();
    true
}
