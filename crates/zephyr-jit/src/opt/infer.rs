//! Iterative type inference
//!
//! Propagates semantic types forward through moves, arithmetic, casts,
//! and phis until a fixed point. Serves as the oracle for type
//! specialization; conservative (`Unknown`) everywhere it cannot prove a
//! type. Vregs with more than one definition and phis whose inputs
//! disagree (or are themselves unresolved) stay `Unknown`.

use rustc_hash::FxHashMap;

use crate::ir::{Function, Instr, IrType, Value, Vreg};

pub type TypeMap = FxHashMap<Vreg, IrType>;

fn value_type(v: Value, func: &Function, map: &TypeMap) -> IrType {
    match v {
        Value::Reg(r) => map.get(&r).copied().unwrap_or(IrType::Unknown),
        _ => func.value_type(v),
    }
}

/// Agreement join: both sides must already be the same concrete type.
fn agree(a: IrType, b: IrType) -> IrType {
    if a == b {
        a
    } else {
        IrType::Unknown
    }
}

/// Infer a type for every defined vreg.
pub fn infer_types(func: &Function) -> TypeMap {
    let mut map = TypeMap::default();
    let mut def_count: FxHashMap<Vreg, u32> = FxHashMap::default();

    for block in &func.blocks {
        for instr in &block.instrs {
            if let Some(d) = instr.dest() {
                *def_count.entry(d).or_insert(0) += 1;
                map.insert(d, IrType::Unknown);
            }
        }
    }

    loop {
        let mut changed = false;
        for block in &func.blocks {
            for instr in &block.instrs {
                let Some(dest) = instr.dest() else { continue };
                if def_count[&dest] > 1 {
                    continue;
                }
                let declared = func.vreg_type(dest);
                let inferred = if declared != IrType::Unknown {
                    declared
                } else {
                    match instr {
                        Instr::Move { src, .. } => value_type(*src, func, &map),
                        Instr::Bin { op, lhs, rhs, .. } => {
                            if !op.integer_class() {
                                IrType::Float64
                            } else if op.specialize_int().is_none() {
                                // shifts, masks, already-specialized forms
                                IrType::Int64
                            } else {
                                let lt = value_type(*lhs, func, &map);
                                let rt = value_type(*rhs, func, &map);
                                if lt.is_integer() && rt.is_integer() {
                                    IrType::Int64
                                } else if lt.is_float() && rt.is_float() {
                                    IrType::Float64
                                } else {
                                    IrType::Unknown
                                }
                            }
                        }
                        Instr::Un { src, .. } => value_type(*src, func, &map),
                        Instr::Cmp { .. } => IrType::Bool,
                        Instr::Load { ty, .. } => *ty,
                        Instr::Cast { to, .. } => *to,
                        Instr::StackAlloc { .. } | Instr::ElementPtr { .. } => IrType::Ptr,
                        Instr::HeapAlloc { .. } => IrType::Object,
                        Instr::Phi { incoming, .. } => {
                            let mut it = incoming.iter();
                            match it.next() {
                                Some((first, _)) => {
                                    let mut ty = value_type(*first, func, &map);
                                    for (v, _) in it {
                                        ty = agree(ty, value_type(*v, func, &map));
                                    }
                                    ty
                                }
                                None => IrType::Unknown,
                            }
                        }
                        _ => IrType::Unknown,
                    }
                };
                let old = map[&dest];
                if inferred != IrType::Unknown && old == IrType::Unknown {
                    map.insert(dest, inferred);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    map
}
