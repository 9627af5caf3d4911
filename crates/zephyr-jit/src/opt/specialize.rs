//! Type specialization
//!
//! Uses the inference oracle to narrow generic arithmetic to typed
//! opcodes and to drop runtime type checks from property accesses whose
//! receiver type is proven.

use crate::analysis::FlowInfo;
use crate::ir::{Function, Instr, IrType, Module, Value};
use crate::opt::infer::{infer_types, TypeMap};
use crate::opt::OptPass;

pub struct TypeSpecialization;

fn operand_type(v: Value, func: &Function, types: &TypeMap) -> IrType {
    match v {
        Value::Reg(r) => types.get(&r).copied().unwrap_or(IrType::Unknown),
        _ => func.value_type(v),
    }
}

impl OptPass for TypeSpecialization {
    fn name(&self) -> &'static str {
        "type-specialization"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let types = infer_types(func);
        let mut changed = false;

        for bi in 0..func.blocks.len() {
            for ii in 0..func.blocks[bi].instrs.len() {
                let instr = &func.blocks[bi].instrs[ii];
                let replacement = match instr {
                    Instr::Bin { op, dest, lhs, rhs } if op.is_generic() => {
                        let lt = operand_type(*lhs, func, &types);
                        let rt = operand_type(*rhs, func, &types);
                        if lt.is_integer() && rt.is_integer() {
                            op.specialize_int().map(|op| Instr::Bin {
                                op,
                                dest: *dest,
                                lhs: *lhs,
                                rhs: *rhs,
                            })
                        } else if lt.is_float() && rt.is_float() {
                            op.specialize_float().map(|op| Instr::Bin {
                                op,
                                dest: *dest,
                                lhs: *lhs,
                                rhs: *rhs,
                            })
                        } else {
                            None
                        }
                    }
                    Instr::PropertyGet {
                        dest,
                        object,
                        key,
                        checked: true,
                    } => {
                        if operand_type(*object, func, &types) == IrType::Object {
                            Some(Instr::PropertyGet {
                                dest: *dest,
                                object: *object,
                                key: *key,
                                checked: false,
                            })
                        } else {
                            None
                        }
                    }
                    Instr::PropertySet {
                        object,
                        key,
                        value,
                        checked: true,
                    } => {
                        if operand_type(*object, func, &types) == IrType::Object {
                            Some(Instr::PropertySet {
                                object: *object,
                                key: *key,
                                value: *value,
                                checked: false,
                            })
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(instr) = replacement {
                    func.blocks[bi].instrs[ii] = instr;
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
