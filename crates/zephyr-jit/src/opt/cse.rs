//! Common-subexpression elimination
//!
//! Tracks available expressions across blocks in reverse postorder. The
//! table is invalidated wholesale at any side-effecting instruction
//! (conservative, not per-alias). A hit only counts when the earlier
//! definition's block dominates the current block.

use rustc_hash::FxHashMap;

use crate::analysis::FlowInfo;
use crate::ir::{BlockId, Function, Instr, Module, Value, Vreg};
use crate::opt::{expr_key, ExprKey, OptPass};

pub struct CommonSubexpressionElimination;

impl OptPass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn run(&self, func: &mut Function, flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        let mut table: FxHashMap<ExprKey, (BlockId, Vreg)> = FxHashMap::default();

        for &bid in &flow.rpo {
            for ii in 0..func.block(bid).instrs.len() {
                let instr = &func.block(bid).instrs[ii];
                if instr.has_side_effects() {
                    table.clear();
                    continue;
                }
                let Some(key) = expr_key(instr) else { continue };
                let Some(dest) = instr.dest() else { continue };
                match table.get(&key) {
                    Some(&(def_block, first)) if first != dest => {
                        if flow.dom.dominates(def_block, bid) {
                            func.blocks[bid.index()].instrs[ii] = Instr::Move {
                                dest,
                                src: Value::Reg(first),
                            };
                            changed = true;
                        }
                    }
                    Some(_) => {}
                    None => {
                        table.insert(key, (bid, dest));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, FuncId, IrType, Terminator};

    #[test]
    fn test_cross_block_cse() {
        // bb0: a = arg0 * arg0; jump bb1
        // bb1: b = arg0 * arg0; ret b       (bb0 dominates bb1)
        let mut f = Function::new(FuncId(0), "t", vec![IrType::Int64], IrType::Int64);
        let b1 = f.add_block();
        let a = f.alloc_vreg(IrType::Int64);
        let b = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::Mul,
                dest: a,
                lhs: Value::Arg(0),
                rhs: Value::Arg(0),
            },
        );
        f.set_terminator(entry, Terminator::Jump { target: b1 });
        f.add_instr(
            b1,
            Instr::Bin {
                op: BinOp::Mul,
                dest: b,
                lhs: Value::Arg(0),
                rhs: Value::Arg(0),
            },
        );
        f.set_terminator(
            b1,
            Terminator::Ret {
                value: Some(Value::Reg(b)),
            },
        );

        let flow = FlowInfo::compute(&mut f);
        assert!(CommonSubexpressionElimination.run(&mut f, &flow, None));
        assert_eq!(
            f.block(b1).instrs[0],
            Instr::Move {
                dest: b,
                src: Value::Reg(a)
            }
        );
    }

    #[test]
    fn test_call_invalidates_table() {
        use crate::ir::Callee;
        use crate::runtime::RuntimeHelper;
        // a = arg0 + 1; call rt; b = arg0 + 1   -- the call kills the table
        let mut f = Function::new(FuncId(0), "t", vec![IrType::Int64], IrType::Int64);
        let a = f.alloc_vreg(IrType::Int64);
        let b = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::Add,
                dest: a,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(1),
            },
        );
        f.add_instr(
            entry,
            Instr::Call {
                dest: None,
                callee: Callee::Runtime(RuntimeHelper::WriteBarrier),
                args: vec![Value::Reg(a)],
            },
        );
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::Add,
                dest: b,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(1),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(b)),
            },
        );

        let flow = FlowInfo::compute(&mut f);
        assert!(!CommonSubexpressionElimination.run(&mut f, &flow, None));
    }

    #[test]
    fn test_sibling_branches_not_merged() {
        // arms of a diamond do not dominate each other; no rewrite
        let mut f = Function::new(FuncId(0), "t", vec![IrType::Bool], IrType::Int64);
        let b1 = f.add_block();
        let b2 = f.add_block();
        let a = f.alloc_vreg(IrType::Int64);
        let b = f.alloc_vreg(IrType::Int64);
        f.set_terminator(
            f.entry,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: b1,
                else_bb: b2,
            },
        );
        f.add_instr(
            b1,
            Instr::Bin {
                op: BinOp::Add,
                dest: a,
                lhs: Value::ConstInt(1),
                rhs: Value::Arg(0),
            },
        );
        f.set_terminator(
            b1,
            Terminator::Ret {
                value: Some(Value::Reg(a)),
            },
        );
        f.add_instr(
            b2,
            Instr::Bin {
                op: BinOp::Add,
                dest: b,
                lhs: Value::ConstInt(1),
                rhs: Value::Arg(0),
            },
        );
        f.set_terminator(
            b2,
            Terminator::Ret {
                value: Some(Value::Reg(b)),
            },
        );

        let flow = FlowInfo::compute(&mut f);
        assert!(!CommonSubexpressionElimination.run(&mut f, &flow, None));
    }
}
