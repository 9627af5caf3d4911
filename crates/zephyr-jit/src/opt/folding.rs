//! Constant folding and algebraic simplification

use crate::analysis::FlowInfo;
use crate::ir::{BinOp, CmpOp, Function, Instr, Module, UnOp, Value};
use crate::opt::OptPass;

pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        for bi in 0..func.blocks.len() {
            for ii in 0..func.blocks[bi].instrs.len() {
                let instr = func.blocks[bi].instrs[ii].clone();
                if let Some(folded) = fold(&instr) {
                    func.blocks[bi].instrs[ii] = folded;
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

/// Fold one instruction, or return None if it cannot be simplified.
fn fold(instr: &Instr) -> Option<Instr> {
    match instr {
        Instr::Bin { op, dest, lhs, rhs } => {
            if let (Value::ConstInt(a), Value::ConstInt(b)) = (lhs, rhs) {
                if op.integer_class() {
                    if let Some(v) = fold_int(*op, *a, *b) {
                        return Some(Instr::Move {
                            dest: *dest,
                            src: Value::ConstInt(v),
                        });
                    }
                }
            }
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                if let Some(v) = fold_float(*op, a, b) {
                    return Some(Instr::Move {
                        dest: *dest,
                        src: Value::const_f64(v),
                    });
                }
            }
            fold_identity(*op, *dest, *lhs, *rhs)
        }
        Instr::Un { op, dest, src } => match (op, src) {
            (UnOp::Neg, Value::ConstInt(v)) => Some(Instr::Move {
                dest: *dest,
                src: Value::ConstInt(v.wrapping_neg()),
            }),
            (UnOp::Not, Value::ConstBool(b)) => Some(Instr::Move {
                dest: *dest,
                src: Value::ConstBool(!b),
            }),
            (UnOp::BitNot, Value::ConstInt(v)) => Some(Instr::Move {
                dest: *dest,
                src: Value::ConstInt(!v),
            }),
            _ => None,
        },
        Instr::Cmp { op, dest, lhs, rhs } => {
            if let (Value::ConstInt(a), Value::ConstInt(b)) = (lhs, rhs) {
                let r = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                return Some(Instr::Move {
                    dest: *dest,
                    src: Value::ConstBool(r),
                });
            }
            None
        }
        _ => None,
    }
}

fn fold_int(op: BinOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add | BinOp::IntAdd => a.wrapping_add(b),
        BinOp::Sub | BinOp::IntSub => a.wrapping_sub(b),
        BinOp::Mul | BinOp::IntMul => a.wrapping_mul(b),
        BinOp::Div | BinOp::IntDiv => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        BinOp::Mod | BinOp::IntMod => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32 & 63),
        BinOp::Shr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
        BinOp::Sar => a.wrapping_shr(b as u32 & 63),
        _ => return None,
    })
}

fn fold_float(op: BinOp, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add | BinOp::FloatAdd => a + b,
        BinOp::Sub | BinOp::FloatSub => a - b,
        BinOp::Mul | BinOp::FloatMul => a * b,
        BinOp::Div | BinOp::FloatDiv => a / b,
        _ => return None,
    })
}

/// Algebraic identities. Integer-only; float zero/one interact with NaN
/// and signed zero.
fn fold_identity(op: BinOp, dest: crate::ir::Vreg, lhs: Value, rhs: Value) -> Option<Instr> {
    if !op.integer_class() {
        return None;
    }
    let mv = |src| Some(Instr::Move { dest, src });
    match op {
        BinOp::Add | BinOp::IntAdd => {
            if rhs == Value::ConstInt(0) {
                return mv(lhs);
            }
            if lhs == Value::ConstInt(0) {
                return mv(rhs);
            }
        }
        BinOp::Sub | BinOp::IntSub => {
            if rhs == Value::ConstInt(0) {
                return mv(lhs);
            }
        }
        BinOp::Mul | BinOp::IntMul => {
            if rhs == Value::ConstInt(1) {
                return mv(lhs);
            }
            if lhs == Value::ConstInt(1) {
                return mv(rhs);
            }
            if rhs == Value::ConstInt(0) || lhs == Value::ConstInt(0) {
                return mv(Value::ConstInt(0));
            }
        }
        BinOp::Div | BinOp::IntDiv => {
            if rhs == Value::ConstInt(1) {
                return mv(lhs);
            }
        }
        _ => {}
    }
    None
}
