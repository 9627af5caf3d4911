//! Strength reduction
//!
//! Integer multiply/divide/modulo by a power of two become shifts and
//! masks.

use crate::analysis::FlowInfo;
use crate::ir::{BinOp, Function, Instr, Module, Value};
use crate::opt::OptPass;

pub struct StrengthReduction;

impl OptPass for StrengthReduction {
    fn name(&self) -> &'static str {
        "strength-reduction"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        for bi in 0..func.blocks.len() {
            for ii in 0..func.blocks[bi].instrs.len() {
                if let Some(reduced) = reduce(&func.blocks[bi].instrs[ii]) {
                    func.blocks[bi].instrs[ii] = reduced;
                    changed = true;
                }
            }
        }
        if changed {
            func.touch();
        }
        changed
    }
}

fn power_of_two(v: Value) -> Option<u32> {
    match v {
        Value::ConstInt(c) if c >= 2 && (c & (c - 1)) == 0 => Some(c.trailing_zeros()),
        _ => None,
    }
}

fn reduce(instr: &Instr) -> Option<Instr> {
    let Instr::Bin { op, dest, lhs, rhs } = instr else {
        return None;
    };
    if !op.integer_class() {
        return None;
    }
    let n = power_of_two(*rhs)?;
    match op {
        BinOp::Mul | BinOp::IntMul => Some(Instr::Bin {
            op: BinOp::Shl,
            dest: *dest,
            lhs: *lhs,
            rhs: Value::ConstInt(n as i64),
        }),
        BinOp::Div | BinOp::IntDiv => Some(Instr::Bin {
            op: BinOp::Sar,
            dest: *dest,
            lhs: *lhs,
            rhs: Value::ConstInt(n as i64),
        }),
        BinOp::Mod | BinOp::IntMod => Some(Instr::Bin {
            op: BinOp::And,
            dest: *dest,
            lhs: *lhs,
            rhs: Value::ConstInt((1i64 << n) - 1),
        }),
        _ => None,
    }
}
