//! Block-level liveness
//!
//! Backward dataflow over virtual registers. Used by the register
//! allocators to build live ranges and by dead-store reasoning.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BlockId, Function, Value, Vreg};

#[derive(Debug, Default)]
pub struct Liveness {
    pub live_in: FxHashMap<BlockId, FxHashSet<Vreg>>,
    pub live_out: FxHashMap<BlockId, FxHashSet<Vreg>>,
}

impl Liveness {
    pub fn live_out_of(&self, b: BlockId) -> Option<&FxHashSet<Vreg>> {
        self.live_out.get(&b)
    }
}

/// Iterate to a fixed point over the given block order (any order is
/// correct; reverse postorder converges fastest when walked backward).
pub fn analyze(func: &Function, order: &[BlockId]) -> Liveness {
    let mut uses: FxHashMap<BlockId, FxHashSet<Vreg>> = FxHashMap::default();
    let mut defs: FxHashMap<BlockId, FxHashSet<Vreg>> = FxHashMap::default();

    for &b in order {
        let block = func.block(b);
        let u = uses.entry(b).or_default();
        let d = defs.entry(b).or_default();
        for instr in &block.instrs {
            instr.for_each_value(|v| {
                if let Value::Reg(r) = v {
                    if !d.contains(&r) {
                        u.insert(r);
                    }
                }
            });
            if let Some(dest) = instr.dest() {
                d.insert(dest);
            }
        }
        block.terminator.for_each_value(|v| {
            if let Value::Reg(r) = v {
                if !d.contains(&r) {
                    u.insert(r);
                }
            }
        });
    }

    let mut live = Liveness::default();
    for &b in order {
        live.live_in.insert(b, FxHashSet::default());
        live.live_out.insert(b, FxHashSet::default());
    }

    loop {
        let mut changed = false;
        for &b in order.iter().rev() {
            let mut out: FxHashSet<Vreg> = FxHashSet::default();
            for s in func.block(b).terminator.successors() {
                if let Some(li) = live.live_in.get(&s) {
                    out.extend(li.iter().copied());
                }
            }
            let mut inn: FxHashSet<Vreg> = uses[&b].clone();
            for r in &out {
                if !defs[&b].contains(r) {
                    inn.insert(*r);
                }
            }
            if out != live.live_out[&b] {
                live.live_out.insert(b, out);
                changed = true;
            }
            if inn != live.live_in[&b] {
                live.live_in.insert(b, inn);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::reverse_postorder;
    use crate::ir::{BinOp, FuncId, Instr, IrType, Terminator};

    #[test]
    fn test_value_live_across_loop() {
        // bb0: v0 = arg0 + 0        (defined before the loop)
        // bb1: branch arg1 -> bb2 | bb3
        // bb2: v1 = v0 + 1; jump bb1   (v0 used inside the loop)
        // bb3: ret v0
        let mut f = Function::new(
            FuncId(0),
            "l",
            vec![IrType::Int64, IrType::Bool],
            IrType::Int64,
        );
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        let v0 = f.alloc_vreg(IrType::Int64);
        let v1 = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::Add,
                dest: v0,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(0),
            },
        );
        f.set_terminator(entry, Terminator::Jump { target: b1 });
        f.set_terminator(
            b1,
            Terminator::Branch {
                cond: Value::Arg(1),
                then_bb: b2,
                else_bb: b3,
            },
        );
        f.add_instr(
            b2,
            Instr::Bin {
                op: BinOp::Add,
                dest: v1,
                lhs: Value::Reg(v0),
                rhs: Value::ConstInt(1),
            },
        );
        f.set_terminator(b2, Terminator::Jump { target: b1 });
        f.set_terminator(
            b3,
            Terminator::Ret {
                value: Some(Value::Reg(v0)),
            },
        );
        f.build_cfg();

        let order = reverse_postorder(&f);
        let live = analyze(&f, &order);
        // v0 is live around the whole loop
        assert!(live.live_out[&entry].contains(&v0));
        assert!(live.live_in[&b1].contains(&v0));
        assert!(live.live_out[&b2].contains(&v0));
        // v1 dies inside bb2
        assert!(!live.live_out[&b2].contains(&v1));
    }

    #[test]
    fn test_straight_line_kill() {
        let mut f = Function::new(FuncId(0), "s", vec![IrType::Int64], IrType::Int64);
        let v0 = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Move {
                dest: v0,
                src: Value::Arg(0),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(v0)),
            },
        );
        f.build_cfg();
        let order = reverse_postorder(&f);
        let live = analyze(&f, &order);
        assert!(live.live_in[&entry].is_empty());
        assert!(live.live_out[&entry].is_empty());
    }
}
