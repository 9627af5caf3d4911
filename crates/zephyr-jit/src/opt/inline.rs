//! Function inlining
//!
//! Replaces a direct call with a remapped copy of the callee's body. One
//! call site is expanded per run; the driver's fixed-point loop picks up
//! further candidates on later iterations. Self-recursive callees and
//! bodies above the size threshold are skipped.

use rustc_hash::FxHashMap;

use crate::analysis::FlowInfo;
use crate::ir::{BlockId, Callee, Function, Instr, Module, Terminator, Value, Vreg};
use crate::opt::OptPass;

pub struct Inlining {
    threshold: usize,
}

impl Inlining {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

struct CallSite {
    block: BlockId,
    index: usize,
    dest: Option<Vreg>,
    args: Vec<Value>,
    callee: crate::ir::FuncId,
}

impl OptPass for Inlining {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn run(&self, func: &mut Function, _flow: &FlowInfo, module: Option<&Module>) -> bool {
        let Some(module) = module else { return false };
        let Some(site) = find_candidate(func, module, self.threshold) else {
            return false;
        };
        // candidate existence was just checked
        let Some(callee) = module.function(site.callee) else {
            return false;
        };
        log::debug!(
            "inlining {} into {} at {}[{}]",
            callee.name,
            func.name,
            site.block,
            site.index
        );
        expand(func, callee, site);
        true
    }
}

fn find_candidate(func: &Function, module: &Module, threshold: usize) -> Option<CallSite> {
    for block in &func.blocks {
        for (index, instr) in block.instrs.iter().enumerate() {
            let Instr::Call {
                dest,
                callee: Callee::Func(g),
                args,
            } = instr
            else {
                continue;
            };
            if *g == func.id {
                continue;
            }
            let Some(target) = module.function(*g) else {
                continue;
            };
            if target.is_self_recursive() || target.instr_count() > threshold {
                continue;
            }
            if target.attrs.cold {
                continue;
            }
            return Some(CallSite {
                block: block.id,
                index,
                dest: *dest,
                args: args.clone(),
                callee: *g,
            });
        }
    }
    None
}

fn expand(func: &mut Function, callee: &Function, site: CallSite) {
    // continuation takes everything after the call plus the old terminator
    let cont = func.add_block();
    let tail: Vec<Instr> = func.blocks[site.block.index()]
        .instrs
        .split_off(site.index + 1);
    func.blocks[site.block.index()].instrs.pop();
    let old_term = std::mem::replace(
        &mut func.blocks[site.block.index()].terminator,
        Terminator::None,
    );
    func.blocks[cont.index()].instrs = tail;
    func.blocks[cont.index()].terminator = old_term;

    // the tail's outgoing edges moved with it, so phis in its successors
    // must name the continuation, not the split block
    let tail_succs = func.blocks[cont.index()].terminator.successors();
    for succ in tail_succs {
        for instr in &mut func.blocks[succ.index()].instrs {
            let Instr::Phi { incoming, .. } = instr else {
                break;
            };
            for (_, b) in incoming.iter_mut() {
                if *b == site.block {
                    *b = cont;
                }
            }
        }
    }

    let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for b in &callee.blocks {
        block_map.insert(b.id, func.add_block());
    }
    let mut vreg_map: FxHashMap<Vreg, Vreg> = FxHashMap::default();
    let mut map_vreg = |func: &mut Function, r: Vreg| -> Vreg {
        if let Some(m) = vreg_map.get(&r) {
            return *m;
        }
        let fresh = func.alloc_vreg(callee.vreg_type(r));
        vreg_map.insert(r, fresh);
        fresh
    };

    let args = site.args;
    for src in &callee.blocks {
        let new_id = block_map[&src.id];
        let mut instrs = Vec::with_capacity(src.instrs.len());
        for instr in &src.instrs {
            let mut copy = instr.clone();
            if let Some(d) = copy.dest() {
                let fresh = map_vreg(func, d);
                rebind_dest(&mut copy, fresh);
            }
            copy.for_each_value_mut(|v| remap_value(v, func, &args, &mut map_vreg, &block_map));
            if let Instr::Phi { incoming, .. } = &mut copy {
                for (_, b) in incoming.iter_mut() {
                    *b = block_map[b];
                }
            }
            instrs.push(copy);
        }
        let terminator = match &src.terminator {
            Terminator::Ret { value } => {
                if let (Some(dest), Some(v)) = (site.dest, value) {
                    let mut v = *v;
                    remap_value(&mut v, func, &args, &mut map_vreg, &block_map);
                    instrs.push(Instr::Move { dest, src: v });
                }
                Terminator::Jump { target: cont }
            }
            other => {
                let mut t = other.clone();
                t.for_each_value_mut(|v| remap_value(v, func, &args, &mut map_vreg, &block_map));
                match &mut t {
                    Terminator::Jump { target } => *target = block_map[target],
                    Terminator::Branch {
                        then_bb, else_bb, ..
                    } => {
                        *then_bb = block_map[then_bb];
                        *else_bb = block_map[else_bb];
                    }
                    _ => {}
                }
                t
            }
        };
        func.blocks[new_id.index()].instrs = instrs;
        func.blocks[new_id.index()].terminator = terminator;
    }

    func.blocks[site.block.index()].terminator = Terminator::Jump {
        target: block_map[&callee.entry],
    };
    func.touch();
}

fn remap_value(
    v: &mut Value,
    func: &mut Function,
    args: &[Value],
    map_vreg: &mut impl FnMut(&mut Function, Vreg) -> Vreg,
    block_map: &FxHashMap<BlockId, BlockId>,
) {
    match v {
        Value::Reg(r) => *r = map_vreg(func, *r),
        Value::Arg(i) => {
            *v = args.get(*i as usize).copied().unwrap_or(Value::ConstInt(0));
        }
        Value::Block(b) => {
            if let Some(m) = block_map.get(b) {
                *b = *m;
            }
        }
        _ => {}
    }
}

fn rebind_dest(instr: &mut Instr, fresh: Vreg) {
    match instr {
        Instr::Move { dest, .. }
        | Instr::Bin { dest, .. }
        | Instr::Un { dest, .. }
        | Instr::Cmp { dest, .. }
        | Instr::Load { dest, .. }
        | Instr::StackAlloc { dest, .. }
        | Instr::HeapAlloc { dest, .. }
        | Instr::Phi { dest, .. }
        | Instr::Cast { dest, .. }
        | Instr::ElementPtr { dest, .. }
        | Instr::PropertyGet { dest, .. }
        | Instr::VecBin { dest, .. }
        | Instr::VecLoad { dest, .. } => *dest = fresh,
        Instr::Call { dest, .. } => *dest = Some(fresh),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, CmpOp, FuncId, IrType};

    /// callee: fn double(x) { return x + x }
    fn double_fn(id: FuncId) -> Function {
        let mut f = Function::new(id, "double", vec![IrType::Int64], IrType::Int64);
        let r = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: r,
                lhs: Value::Arg(0),
                rhs: Value::Arg(0),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(r)),
            },
        );
        f
    }

    fn caller_calling(callee: FuncId) -> Function {
        let mut f = Function::new(FuncId(0), "caller", vec![IrType::Int64], IrType::Int64);
        let r = f.alloc_vreg(IrType::Int64);
        let out = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Call {
                dest: Some(r),
                callee: Callee::Func(callee),
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
        f
    }

    #[test]
    fn test_small_callee_inlined() {
        let mut module = Module::new("m");
        let mut caller = caller_calling(FuncId(1));
        module.add_function(caller.clone());
        module.add_function(double_fn(FuncId(1)));
        let flow = FlowInfo::compute(&mut caller);
        assert!(Inlining::new(24).run(&mut caller, &flow, Some(&module)));
        // no call instructions remain
        assert!(!caller
            .blocks
            .iter()
            .any(|b| b.instrs.iter().any(|i| matches!(i, Instr::Call { .. }))));
        // the callee body arrived with Arg(0) substituted for its parameter
        assert!(caller.blocks.iter().any(|b| b.instrs.iter().any(|i| {
            matches!(
                i,
                Instr::Bin {
                    op: BinOp::IntAdd,
                    lhs: Value::Arg(0),
                    rhs: Value::Arg(0),
                    ..
                }
            )
        })));
        // the tail of the split block still returns through the new result
        caller.build_cfg();
        assert!(crate::ir::verify(&caller).is_empty());
    }

    #[test]
    fn test_split_block_phi_edges_follow_the_tail() {
        // entry: c = call double(a); branch into a phi merge. After the
        // call block is split, the merge phi must name the continuation.
        let mut module = Module::new("m");
        let mut caller = Function::new(FuncId(0), "caller", vec![IrType::Int64], IrType::Int64);
        let merge = caller.add_block();
        let side = caller.add_block();
        let c = caller.alloc_vreg(IrType::Int64);
        let cond = caller.alloc_vreg(IrType::Bool);
        let d = caller.alloc_vreg(IrType::Int64);
        let m = caller.alloc_vreg(IrType::Int64);
        let entry = caller.entry;
        caller.add_instr(
            entry,
            Instr::Call {
                dest: Some(c),
                callee: Callee::Func(FuncId(1)),
                args: vec![Value::Arg(0)],
            },
        );
        caller.add_instr(
            entry,
            Instr::Cmp {
                op: CmpOp::Lt,
                dest: cond,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(0),
            },
        );
        caller.set_terminator(
            entry,
            Terminator::Branch {
                cond: Value::Reg(cond),
                then_bb: side,
                else_bb: merge,
            },
        );
        caller.add_instr(
            side,
            Instr::Bin {
                op: BinOp::IntMul,
                dest: d,
                lhs: Value::Reg(c),
                rhs: Value::ConstInt(-10),
            },
        );
        caller.set_terminator(side, Terminator::Jump { target: merge });
        caller.add_instr(
            merge,
            Instr::Phi {
                dest: m,
                incoming: vec![(Value::Reg(c), entry), (Value::Reg(d), side)],
            },
        );
        caller.set_terminator(
            merge,
            Terminator::Ret {
                value: Some(Value::Reg(m)),
            },
        );
        module.add_function(caller.clone());
        module.add_function(double_fn(FuncId(1)));

        let flow = FlowInfo::compute(&mut caller);
        assert!(Inlining::new(24).run(&mut caller, &flow, Some(&module)));
        caller.build_cfg();
        assert!(crate::ir::verify(&caller).is_empty());
        // every phi edge comes from an actual predecessor
        for block in &caller.blocks {
            for instr in &block.instrs {
                if let Instr::Phi { incoming, .. } = instr {
                    for (_, pred) in incoming {
                        assert!(
                            block.preds.contains(pred),
                            "{}: phi edge from non-predecessor {pred}",
                            block.id
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_threshold_respected() {
        let mut module = Module::new("m");
        let mut caller = caller_calling(FuncId(1));
        module.add_function(caller.clone());
        module.add_function(double_fn(FuncId(1)));
        let flow = FlowInfo::compute(&mut caller);
        assert!(!Inlining::new(0).run(&mut caller, &flow, Some(&module)));
    }

    #[test]
    fn test_recursive_callee_skipped() {
        let mut module = Module::new("m");
        let mut caller = caller_calling(FuncId(1));
        module.add_function(caller.clone());
        let mut rec = Function::new(FuncId(1), "rec", vec![IrType::Int64], IrType::Int64);
        let r = rec.alloc_vreg(IrType::Int64);
        let entry = rec.entry;
        rec.add_instr(
            entry,
            Instr::Call {
                dest: Some(r),
                callee: Callee::Func(FuncId(1)),
                args: vec![Value::Arg(0)],
            },
        );
        rec.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(r)),
            },
        );
        module.add_function(rec);
        let flow = FlowInfo::compute(&mut caller);
        assert!(!Inlining::new(24).run(&mut caller, &flow, Some(&module)));
    }

    #[test]
    fn test_no_module_no_op() {
        let mut caller = caller_calling(FuncId(1));
        let flow = FlowInfo::compute(&mut caller);
        assert!(!Inlining::new(24).run(&mut caller, &flow, None));
    }
}
