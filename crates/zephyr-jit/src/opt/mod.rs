//! IR optimizer
//!
//! An ordered set of independently toggleable rewrite passes driven to a
//! bounded fixed point. Each pass reports whether it changed the function;
//! the driver recomputes flow analyses only after a change and stops at the
//! iteration cap to guarantee termination.

pub mod cse;
pub mod dce;
pub mod escape;
pub mod folding;
pub mod infer;
pub mod inline;
pub mod licm;
pub mod redundancy;
pub mod specialize;
pub mod strength;
pub mod tailcall;
pub mod vectorize;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::FlowInfo;
use crate::config::OptLevel;
use crate::ir::{BinOp, BlockId, Function, Instr, Module, Value, Vreg};

/// Upper bound on fixed-point iterations.
pub const MAX_ITERATIONS: usize = 20;

/// A single rewrite pass.
pub trait OptPass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite `func`; return true if anything changed. `flow` is current
    /// at entry. `module` gives access to sibling functions (inlining).
    fn run(&self, func: &mut Function, flow: &FlowInfo, module: Option<&Module>) -> bool;
}

/// The pass pipeline.
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    /// Pipeline for an optimization tier.
    pub fn for_level(level: OptLevel, inline_threshold: usize, vector_width: u32) -> Self {
        let mut opt = Self::empty();
        if level >= OptLevel::Minimal {
            opt.add_pass(Box::new(folding::ConstantFolding));
        }
        if level >= OptLevel::Balanced {
            opt.add_pass(Box::new(redundancy::RedundancyElimination));
            opt.add_pass(Box::new(cse::CommonSubexpressionElimination));
            opt.add_pass(Box::new(strength::StrengthReduction));
            opt.add_pass(Box::new(specialize::TypeSpecialization));
            opt.add_pass(Box::new(licm::LoopInvariantCodeMotion));
        }
        if level >= OptLevel::Aggressive {
            opt.add_pass(Box::new(inline::Inlining::new(inline_threshold)));
            opt.add_pass(Box::new(escape::EscapeAnalysis));
            opt.add_pass(Box::new(tailcall::TailCallElimination));
            opt.add_pass(Box::new(vectorize::Vectorization::new(vector_width)));
        }
        if level >= OptLevel::Minimal {
            opt.add_pass(Box::new(dce::DeadCodeElimination));
        }
        opt
    }

    /// A pipeline with no passes; optimizing with it is a no-op.
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run the pipeline to a fixed point (bounded). Returns whether any
    /// pass changed the function.
    pub fn optimize(&self, func: &mut Function, module: Option<&Module>) -> bool {
        let mut changed_any = false;
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            let mut flow = FlowInfo::compute(func);
            for pass in &self.passes {
                if !flow.is_current(func) {
                    flow = FlowInfo::compute(func);
                }
                if pass.run(func, &flow, module) {
                    log::debug!(
                        "opt: {} changed {} (iteration {})",
                        pass.name(),
                        func.name,
                        iteration
                    );
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            changed_any = true;
        }
        changed_any
    }
}

// Shared helpers for passes.

/// Every vreg read by any instruction or terminator.
pub(crate) fn collect_used_regs(func: &Function) -> FxHashSet<Vreg> {
    let mut used = FxHashSet::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            instr.for_each_value(|v| {
                if let Value::Reg(r) = v {
                    used.insert(r);
                }
            });
        }
        block.terminator.for_each_value(|v| {
            if let Value::Reg(r) = v {
                used.insert(r);
            }
        });
    }
    used
}

/// Defining block of every vreg.
pub(crate) fn def_blocks(func: &Function) -> FxHashMap<Vreg, BlockId> {
    let mut defs = FxHashMap::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Some(d) = instr.dest() {
                defs.insert(d, block.id);
            }
        }
    }
    defs
}

/// Structural key for value numbering and CSE. Only side-effect-free
/// instructions get a key; commutative operands are canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ExprKey {
    Bin(BinOp, Value, Value),
    Un(crate::ir::UnOp, Value),
    Cmp(crate::ir::CmpOp, Value, Value),
    Cast(crate::ir::IrType, Value),
    ElementPtr(Value, Value, u8),
}

pub(crate) fn expr_key(instr: &Instr) -> Option<ExprKey> {
    match instr {
        Instr::Bin { op, lhs, rhs, .. } => {
            let (a, b) = if op.is_commutative() && rhs < lhs {
                (*rhs, *lhs)
            } else {
                (*lhs, *rhs)
            };
            Some(ExprKey::Bin(*op, a, b))
        }
        Instr::Un { op, src, .. } => Some(ExprKey::Un(*op, *src)),
        Instr::Cmp { op, lhs, rhs, .. } => Some(ExprKey::Cmp(*op, *lhs, *rhs)),
        Instr::Cast { src, to, .. } => Some(ExprKey::Cast(*to, *src)),
        Instr::ElementPtr {
            base, index, scale, ..
        } => Some(ExprKey::ElementPtr(*base, *index, *scale)),
        _ => None,
    }
}

/// Rewrite every use of `from` to `to`, leaving definitions alone.
/// Returns whether any use was rewritten.
pub(crate) fn replace_uses(func: &mut Function, from: Vreg, to: Value) -> bool {
    let mut changed = false;
    for bi in 0..func.blocks.len() {
        let block = &mut func.blocks[bi];
        for instr in &mut block.instrs {
            instr.for_each_value_mut(|v| {
                if *v == Value::Reg(from) {
                    *v = to;
                    changed = true;
                }
            });
        }
        block.terminator.for_each_value_mut(|v| {
            if *v == Value::Reg(from) {
                *v = to;
                changed = true;
            }
        });
    }
    if changed {
        func.touch();
    }
    changed
}
