//! Tail-call elimination
//!
//! Self-recursive tail calls are rewritten into a loop. The entry block is
//! split into a parameter-binding prologue and a dispatch header; each
//! tail site rebinds the parameter registers through temporaries and jumps
//! back to the header instead of calling.

use crate::analysis::FlowInfo;
use crate::ir::{BlockId, Callee, Function, Instr, Module, Terminator, Value, Vreg};
use crate::opt::OptPass;

pub struct TailCallElimination;

impl OptPass for TailCallElimination {
    fn name(&self) -> &'static str {
        "tail-call-elimination"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        if !func.is_self_recursive() || find_sites(func).is_empty() {
            return false;
        }

        let param_count = func.params.len();
        let pregs: Vec<Vreg> = (0..param_count)
            .map(|i| func.alloc_vreg(func.params[i]))
            .collect();

        // entry keeps only parameter binding; the old body moves to a header
        let entry = func.entry;
        let header = func.add_block();
        let body = std::mem::take(&mut func.blocks[entry.index()].instrs);
        let term = std::mem::replace(
            &mut func.blocks[entry.index()].terminator,
            Terminator::None,
        );
        func.blocks[header.index()].instrs = body;
        func.blocks[header.index()].terminator = term;
        for (i, p) in pregs.iter().enumerate() {
            func.blocks[entry.index()].instrs.push(Instr::Move {
                dest: *p,
                src: Value::Arg(i as u16),
            });
        }
        func.blocks[entry.index()].terminator = Terminator::Jump { target: header };

        // the moved body reads parameters through the bound registers
        for block in &mut func.blocks {
            if block.id == entry {
                continue;
            }
            for instr in &mut block.instrs {
                instr.for_each_value_mut(|v| rewrite_arg(v, &pregs));
                if let Instr::Phi { incoming, .. } = instr {
                    for (_, b) in incoming.iter_mut() {
                        if *b == entry {
                            *b = header;
                        }
                    }
                }
            }
            block
                .terminator
                .for_each_value_mut(|v| rewrite_arg(v, &pregs));
        }
        func.touch();

        for site in find_sites(func) {
            let Some(Instr::Call { args, .. }) = func.blocks[site.index()].instrs.pop() else {
                continue;
            };
            log::debug!("looping tail call in {} at {}", func.name, site);
            // bind through temporaries so swapped arguments read old values
            let temps: Vec<Vreg> = (0..param_count)
                .map(|i| func.alloc_vreg(func.params[i]))
                .collect();
            for (i, t) in temps.iter().enumerate() {
                func.blocks[site.index()].instrs.push(Instr::Move {
                    dest: *t,
                    src: args[i],
                });
            }
            for (p, t) in pregs.iter().zip(&temps) {
                func.blocks[site.index()].instrs.push(Instr::Move {
                    dest: *p,
                    src: Value::Reg(*t),
                });
            }
            func.blocks[site.index()].terminator = Terminator::Jump { target: header };
        }
        func.touch();
        true
    }
}

fn rewrite_arg(v: &mut Value, pregs: &[Vreg]) {
    if let Value::Arg(i) = *v {
        if let Some(p) = pregs.get(i as usize) {
            *v = Value::Reg(*p);
        }
    }
}

/// Blocks ending in `r = call self(...); ret r` (or a discarded-result
/// call followed by `ret`), with an argument per parameter.
fn find_sites(func: &Function) -> Vec<BlockId> {
    let mut sites = Vec::new();
    for block in &func.blocks {
        let Some(Instr::Call { dest, callee, args }) = block.instrs.last() else {
            continue;
        };
        if *callee != Callee::Func(func.id) || args.len() != func.params.len() {
            continue;
        }
        let tail = match (&block.terminator, dest) {
            (Terminator::Ret { value: None }, None) => true,
            (Terminator::Ret { value: Some(Value::Reg(r)) }, Some(d)) => r == d,
            _ => false,
        };
        if tail {
            sites.push(block.id);
        }
    }
    sites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, CmpOp, FuncId, IrType};

    /// fact(n, acc) = n <= 1 ? acc : fact(n - 1, acc * n)
    fn accumulator_factorial() -> Function {
        let mut f = Function::new(
            FuncId(3),
            "fact",
            vec![IrType::Int64, IrType::Int64],
            IrType::Int64,
        );
        let base = f.add_block();
        let rec = f.add_block();
        let c = f.alloc_vreg(IrType::Bool);
        let n1 = f.alloc_vreg(IrType::Int64);
        let a1 = f.alloc_vreg(IrType::Int64);
        let r = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Cmp {
                op: CmpOp::Le,
                dest: c,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(1),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Branch {
                cond: Value::Reg(c),
                then_bb: base,
                else_bb: rec,
            },
        );
        f.set_terminator(
            base,
            Terminator::Ret {
                value: Some(Value::Arg(1)),
            },
        );
        f.add_instr(
            rec,
            Instr::Bin {
                op: BinOp::IntSub,
                dest: n1,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(1),
            },
        );
        f.add_instr(
            rec,
            Instr::Bin {
                op: BinOp::IntMul,
                dest: a1,
                lhs: Value::Arg(1),
                rhs: Value::Arg(0),
            },
        );
        f.add_instr(
            rec,
            Instr::Call {
                dest: Some(r),
                callee: Callee::Func(FuncId(3)),
                args: vec![Value::Reg(n1), Value::Reg(a1)],
            },
        );
        f.set_terminator(
            rec,
            Terminator::Ret {
                value: Some(Value::Reg(r)),
            },
        );
        f
    }

    #[test]
    fn test_tail_recursion_becomes_loop() {
        let mut f = accumulator_factorial();
        let flow = FlowInfo::compute(&mut f);
        assert!(TailCallElimination.run(&mut f, &flow, None));
        assert!(!f
            .blocks
            .iter()
            .any(|b| b.instrs.iter().any(|i| matches!(i, Instr::Call { .. }))));
        f.build_cfg();
        assert!(crate::ir::verify(&f).is_empty());
        // the rewrite produced a loop back to the dispatch header
        let flow = FlowInfo::compute(&mut f);
        assert!(!flow.loops.loops.is_empty());
    }

    #[test]
    fn test_entry_binds_parameters_once() {
        let mut f = accumulator_factorial();
        let flow = FlowInfo::compute(&mut f);
        TailCallElimination.run(&mut f, &flow, None);
        let entry = f.block(f.entry);
        assert_eq!(entry.instrs.len(), 2);
        assert!(entry
            .instrs
            .iter()
            .all(|i| matches!(i, Instr::Move { src: Value::Arg(_), .. })));
        assert!(matches!(entry.terminator, Terminator::Jump { .. }));
    }

    #[test]
    fn test_non_tail_call_untouched() {
        // result is modified after the call, so the call is not in tail position
        let mut f = Function::new(FuncId(1), "t", vec![IrType::Int64], IrType::Int64);
        let r = f.alloc_vreg(IrType::Int64);
        let out = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Call {
                dest: Some(r),
                callee: Callee::Func(FuncId(1)),
                args: vec![Value::Arg(0)],
            },
        );
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: out,
                lhs: Value::Reg(r),
                rhs: Value::ConstInt(1),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(out)),
            },
        );
        let flow = FlowInfo::compute(&mut f);
        assert!(!TailCallElimination.run(&mut f, &flow, None));
    }
}
