//! Dead-code elimination
//!
//! Removes unreachable blocks, side-effect-free instructions with unused
//! results, self-moves, constant branches, stores to stack slots that are
//! never read, and forwards jumps through empty blocks.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::FlowInfo;
use crate::ir::{BlockId, Function, Instr, Module, Terminator, Value, Vreg};
use crate::opt::{collect_used_regs, OptPass};

pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, _module: Option<&Module>) -> bool {
        let mut changed = false;
        changed |= fold_constant_branches(func);
        changed |= clear_unreachable_blocks(func);
        changed |= remove_dead_stores(func);
        changed |= remove_dead_instrs(func);
        changed |= forward_empty_blocks(func);
        if changed {
            func.touch();
        }
        changed
    }
}

/// Branch on a constant condition, or with identical arms, becomes a jump.
fn fold_constant_branches(func: &mut Function) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        let new = match block.terminator {
            Terminator::Branch {
                cond: Value::ConstBool(b),
                then_bb,
                else_bb,
            } => Some(Terminator::Jump {
                target: if b { then_bb } else { else_bb },
            }),
            Terminator::Branch {
                then_bb, else_bb, ..
            } if then_bb == else_bb => Some(Terminator::Jump { target: then_bb }),
            _ => None,
        };
        if let Some(t) = new {
            block.terminator = t;
            changed = true;
        }
    }
    changed
}

/// Empty the instruction lists of unreachable blocks and mark them
/// unreachable. Arena slots stay; ids remain stable.
fn clear_unreachable_blocks(func: &mut Function) -> bool {
    let reachable: FxHashSet<BlockId> = func.reachable_blocks().into_iter().collect();
    let mut changed = false;
    for block in &mut func.blocks {
        if reachable.contains(&block.id) {
            continue;
        }
        if !block.instrs.is_empty() || !matches!(block.terminator, Terminator::Unreachable) {
            block.instrs.clear();
            block.terminator = Terminator::Unreachable;
            changed = true;
        }
    }
    changed
}

/// Iteratively drop pure instructions whose results are never read, plus
/// self-moves.
fn remove_dead_instrs(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let used = collect_used_regs(func);
        let mut removed = false;
        for block in &mut func.blocks {
            let before = block.instrs.len();
            block.instrs.retain(|instr| {
                if let Instr::Move { dest, src } = instr {
                    if *src == Value::Reg(*dest) {
                        return false;
                    }
                }
                if instr.has_side_effects() {
                    return true;
                }
                match instr.dest() {
                    Some(d) => used.contains(&d),
                    // pure instruction with no result
                    None => !matches!(instr, Instr::Nop),
                }
            });
            if block.instrs.len() != before {
                removed = true;
            }
        }
        if !removed {
            break;
        }
        changed = true;
    }
    changed
}

#[derive(Default)]
struct SlotUse {
    loaded: bool,
    escaped: bool,
}

/// Drop stores whose target is a stack slot that is never read and whose
/// address never leaves the function. The orphaned allocation then dies as
/// an ordinary unused pure instruction.
fn remove_dead_stores(func: &mut Function) -> bool {
    let mut slots: FxHashMap<Vreg, SlotUse> = FxHashMap::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::StackAlloc { dest, .. } = instr {
                slots.insert(*dest, SlotUse::default());
            }
        }
    }
    if slots.is_empty() {
        return false;
    }
    for block in &func.blocks {
        for instr in &block.instrs {
            match instr {
                Instr::StackAlloc { .. } => {}
                Instr::Load {
                    addr: Value::Reg(r),
                    ..
                }
                | Instr::VecLoad {
                    addr: Value::Reg(r),
                    ..
                } => {
                    if let Some(s) = slots.get_mut(r) {
                        s.loaded = true;
                    }
                }
                Instr::Store { value, .. } | Instr::VecStore { value, .. } => {
                    // the address operand is not a read, but a slot address
                    // stored as data escapes through memory
                    if let Value::Reg(r) = value {
                        if let Some(s) = slots.get_mut(r) {
                            s.escaped = true;
                        }
                    }
                }
                _ => {
                    instr.for_each_value(|v| {
                        if let Value::Reg(r) = v {
                            if let Some(s) = slots.get_mut(&r) {
                                s.escaped = true;
                            }
                        }
                    });
                }
            }
        }
        block.terminator.for_each_value(|v| {
            if let Value::Reg(r) = v {
                if let Some(s) = slots.get_mut(&r) {
                    s.escaped = true;
                }
            }
        });
    }
    let mut changed = false;
    for block in &mut func.blocks {
        let before = block.instrs.len();
        block.instrs.retain(|instr| {
            let addr = match instr {
                Instr::Store {
                    addr: Value::Reg(r),
                    ..
                }
                | Instr::VecStore {
                    addr: Value::Reg(r),
                    ..
                } => r,
                _ => return true,
            };
            match slots.get(addr) {
                Some(s) => s.loaded || s.escaped,
                None => true,
            }
        });
        if block.instrs.len() != before {
            changed = true;
        }
    }
    changed
}

/// Redirect edges through blocks that contain nothing but a jump. Blocks
/// whose target carries phis are left alone (incoming edges are named).
fn forward_empty_blocks(func: &mut Function) -> bool {
    let mut changed = false;
    let count = func.blocks.len();
    for bi in 0..count {
        let id = BlockId(bi as u32);
        let target = match (&func.blocks[bi].instrs[..], &func.blocks[bi].terminator) {
            ([], Terminator::Jump { target }) => *target,
            _ => continue,
        };
        if target == id || func.block(target).phi_count() > 0 {
            continue;
        }
        if id == func.entry {
            continue;
        }
        for other in 0..count {
            if other == bi {
                continue;
            }
            let term = &mut func.blocks[other].terminator;
            let had = term.successors().contains(&id);
            if had {
                term.retarget(id, target);
                changed = true;
            }
        }
    }
    changed
}
