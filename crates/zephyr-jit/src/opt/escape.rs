//! Escape analysis
//!
//! Heap allocations whose address is only ever used as the base of loads
//! and stores inside the function are demoted to stack allocations. Any
//! other use (call argument, stored value, phi, return) counts as an
//! escape.

use rustc_hash::FxHashSet;

use crate::analysis::FlowInfo;
use crate::ir::{Function, Instr, Module, Value, Vreg};
use crate::opt::OptPass;

pub struct EscapeAnalysis;

impl OptPass for EscapeAnalysis {
    fn name(&self) -> &'static str {
        "escape-analysis"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let escaped = escaping_allocs(func);
        let mut changed = false;
        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                if let Instr::HeapAlloc { dest, size } = *instr {
                    if !escaped.contains(&dest) {
                        log::trace!("demoting allocation {} to the stack", dest);
                        *instr = Instr::StackAlloc { dest, size };
                        changed = true;
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

/// Allocation results with at least one escaping use.
fn escaping_allocs(func: &Function) -> FxHashSet<Vreg> {
    let mut allocs: FxHashSet<Vreg> = FxHashSet::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::HeapAlloc { dest, .. } = instr {
                allocs.insert(*dest);
            }
        }
    }
    if allocs.is_empty() {
        return allocs;
    }

    let mut escaped = FxHashSet::default();
    let mut mark = |v: Value| {
        if let Value::Reg(r) = v {
            if allocs.contains(&r) {
                escaped.insert(r);
            }
        }
    };
    for block in &func.blocks {
        for instr in &block.instrs {
            match instr {
                Instr::Load { .. } | Instr::VecLoad { .. } => {}
                Instr::Store { value, .. } | Instr::VecStore { value, .. } => {
                    // base address is fine; storing the pointer itself is not
                    mark(*value);
                }
                Instr::HeapAlloc { .. } => {}
                other => other.for_each_value(&mut mark),
            }
        }
        block.terminator.for_each_value(&mut mark);
    }
    escaped
}
