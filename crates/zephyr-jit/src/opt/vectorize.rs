//! Loop vectorization
//!
//! Recognizes the canonical element-wise array loop
//!
//! ```text
//! for (i = init; i < n; i += 1) dst[i] = a[i] op b[i]
//! ```
//!
//! and emits a vector pre-loop that processes `width` lanes per iteration,
//! falling through to the original scalar loop for the remainder. Only
//! unit-stride, 8-byte-element loops with an integer lane op are taken;
//! anything else is left for the scalar pipeline.

use crate::analysis::{FlowInfo, NaturalLoop};
use crate::ir::{BinOp, BlockId, Function, Instr, IrType, Module, Terminator, Value};
use crate::opt::OptPass;

pub struct Vectorization {
    width: u32,
}

impl Vectorization {
    pub fn new(width: u32) -> Self {
        Self { width }
    }
}

/// A matched element-wise loop.
struct Candidate {
    header: BlockId,
    pre: BlockId,
    init: Value,
    limit: Value,
    op: BinOp,
    src_a: Value,
    src_b: Value,
    dst: Value,
}

impl OptPass for Vectorization {
    fn name(&self) -> &'static str {
        "vectorization"
    }

    fn run(&self, func: &mut Function, flow: &FlowInfo, _module: Option<&Module>) -> bool {
        if self.width < 2 {
            return false;
        }
        let candidate = flow
            .loops
            .loops
            .iter()
            .find_map(|l| match_loop(func, l));
        let Some(c) = candidate else { return false };
        log::debug!("vectorizing loop at {} in {}", c.header, func.name);
        emit_vector_preloop(func, c, self.width);
        true
    }
}

fn lane_op(op: BinOp) -> bool {
    matches!(op, BinOp::IntAdd | BinOp::IntSub | BinOp::IntMul)
}

/// Loop-invariant values a vector loop may read: anything that is not a
/// register defined inside the loop. Register bases are rejected outright
/// to keep the matcher simple.
fn invariant(v: Value) -> bool {
    !matches!(v, Value::Reg(_) | Value::Block(_) | Value::Func(_))
}

fn match_loop(func: &Function, l: &NaturalLoop) -> Option<Candidate> {
    if l.blocks.len() != 2 {
        return None;
    }
    let header = func.block(l.header);
    let body_id = *l.blocks.iter().find(|b| **b != l.header)?;
    let body = func.block(body_id);

    // single out-of-loop predecessor feeding the header
    let mut outside = header.preds.iter().filter(|p| !l.contains(**p));
    let pre = *outside.next()?;
    if outside.next().is_some() {
        return None;
    }

    // header: iv = phi(init from pre, step from body); cond = iv < limit
    let (iv, init) = match &header.instrs[..] {
        [Instr::Phi { dest, incoming }, Instr::Cmp { .. }] if incoming.len() == 2 => {
            let from_pre = incoming.iter().find(|(_, b)| *b == pre)?;
            if !invariant(from_pre.0) {
                return None;
            }
            if !incoming.iter().any(|(_, b)| *b == body_id) {
                return None;
            }
            (*dest, from_pre.0)
        }
        _ => return None,
    };
    let limit = match &header.instrs[1] {
        Instr::Cmp {
            op: crate::ir::CmpOp::Lt,
            dest,
            lhs: Value::Reg(r),
            rhs,
        } if *r == iv && invariant(*rhs) => {
            match &header.terminator {
                Terminator::Branch {
                    cond: Value::Reg(c),
                    then_bb,
                    else_bb,
                } if *c == *dest && *then_bb == body_id && !l.contains(*else_bb) => *rhs,
                _ => return None,
            }
        }
        _ => return None,
    };

    if body.terminator != (Terminator::Jump { target: l.header }) {
        return None;
    }

    // body: ptr/load pair per source, the lane op, ptr/store, iv += 1
    match &body.instrs[..] {
        [Instr::ElementPtr { dest: pa, base: src_a, index: Value::Reg(ia), scale: 8 }, Instr::Load { dest: x, addr: Value::Reg(la), offset: 0, ty: IrType::Int64 }, Instr::ElementPtr { dest: pb, base: src_b, index: Value::Reg(ib), scale: 8 }, Instr::Load { dest: y, addr: Value::Reg(lb), offset: 0, ty: IrType::Int64 }, Instr::Bin { op, dest: z, lhs: Value::Reg(zl), rhs: Value::Reg(zr) }, Instr::ElementPtr { dest: pc, base: dst, index: Value::Reg(ic), scale: 8 }, Instr::Store { addr: Value::Reg(sa), offset: 0, value: Value::Reg(sv), ty: IrType::Int64 }, Instr::Bin { op: BinOp::IntAdd, dest: step, lhs: Value::Reg(sl), rhs: Value::ConstInt(1) }]
            if *ia == iv
                && *ib == iv
                && *ic == iv
                && *sl == iv
                && la == pa
                && lb == pb
                && sa == pc
                && zl == x
                && zr == y
                && sv == z
                && lane_op(*op)
                && invariant(*src_a)
                && invariant(*src_b)
                && invariant(*dst) =>
        {
            // the step must feed the phi back edge
            let feeds_phi = match &header.instrs[0] {
                Instr::Phi { incoming, .. } => incoming
                    .iter()
                    .any(|(v, b)| *b == body_id && *v == Value::Reg(*step)),
                _ => false,
            };
            if !feeds_phi {
                return None;
            }
            Some(Candidate {
                header: l.header,
                pre,
                init,
                limit,
                op: *op,
                src_a: *src_a,
                src_b: *src_b,
                dst: *dst,
            })
        }
        _ => None,
    }
}

fn emit_vector_preloop(func: &mut Function, c: Candidate, width: u32) {
    let vh = func.add_block();
    let vb = func.add_block();

    // last full lane group starts at limit - (width - 1)
    let bound = match c.limit {
        Value::ConstInt(n) => Value::ConstInt(n - (width as i64 - 1)),
        other => {
            let b = func.alloc_vreg(IrType::Int64);
            func.blocks[c.pre.index()].instrs.push(Instr::Bin {
                op: BinOp::IntSub,
                dest: b,
                lhs: other,
                rhs: Value::ConstInt(width as i64 - 1),
            });
            Value::Reg(b)
        }
    };

    let ivv = func.alloc_vreg(IrType::Int64);
    let ivn = func.alloc_vreg(IrType::Int64);
    let cv = func.alloc_vreg(IrType::Bool);
    let qa = func.alloc_vreg(IrType::Ptr);
    let qb = func.alloc_vreg(IrType::Ptr);
    let qc = func.alloc_vreg(IrType::Ptr);
    let xv = func.alloc_vreg(IrType::Unknown);
    let yv = func.alloc_vreg(IrType::Unknown);
    let zv = func.alloc_vreg(IrType::Unknown);

    func.blocks[vh.index()].instrs = vec![
        Instr::Phi {
            dest: ivv,
            incoming: vec![(c.init, c.pre), (Value::Reg(ivn), vb)],
        },
        Instr::Cmp {
            op: crate::ir::CmpOp::Lt,
            dest: cv,
            lhs: Value::Reg(ivv),
            rhs: bound,
        },
    ];
    func.blocks[vh.index()].terminator = Terminator::Branch {
        cond: Value::Reg(cv),
        then_bb: vb,
        else_bb: c.header,
    };

    func.blocks[vb.index()].instrs = vec![
        Instr::ElementPtr {
            dest: qa,
            base: c.src_a,
            index: Value::Reg(ivv),
            scale: 8,
        },
        Instr::VecLoad {
            dest: xv,
            addr: Value::Reg(qa),
            offset: 0,
        },
        Instr::ElementPtr {
            dest: qb,
            base: c.src_b,
            index: Value::Reg(ivv),
            scale: 8,
        },
        Instr::VecLoad {
            dest: yv,
            addr: Value::Reg(qb),
            offset: 0,
        },
        Instr::VecBin {
            op: c.op,
            dest: zv,
            lhs: Value::Reg(xv),
            rhs: Value::Reg(yv),
        },
        Instr::ElementPtr {
            dest: qc,
            base: c.dst,
            index: Value::Reg(ivv),
            scale: 8,
        },
        Instr::VecStore {
            addr: Value::Reg(qc),
            offset: 0,
            value: Value::Reg(zv),
        },
        Instr::Bin {
            op: BinOp::IntAdd,
            dest: ivn,
            lhs: Value::Reg(ivv),
            rhs: Value::ConstInt(width as i64),
        },
    ];
    func.blocks[vb.index()].terminator = Terminator::Jump { target: vh };

    // the scalar loop now starts where the vector loop stopped
    func.blocks[c.pre.index()]
        .terminator
        .retarget(c.header, vh);
    if let Some(Instr::Phi { incoming, .. }) = func.blocks[c.header.index()].instrs.first_mut() {
        for (v, b) in incoming.iter_mut() {
            if *b == c.pre {
                *v = Value::Reg(ivv);
                *b = vh;
            }
        }
    }
    func.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, FuncId};

    /// for (i = 0; i < n; i++) dst[i] = a[i] + b[i]
    /// args: dst, a, b, n
    fn elementwise_add() -> Function {
        let mut f = Function::new(
            FuncId(0),
            "vadd",
            vec![IrType::Ptr, IrType::Ptr, IrType::Ptr, IrType::Int64],
            IrType::Void,
        );
        let header = f.add_block();
        let body = f.add_block();
        let exit = f.add_block();
        let iv = f.alloc_vreg(IrType::Int64);
        let step = f.alloc_vreg(IrType::Int64);
        let c = f.alloc_vreg(IrType::Bool);
        let pa = f.alloc_vreg(IrType::Ptr);
        let pb = f.alloc_vreg(IrType::Ptr);
        let pc = f.alloc_vreg(IrType::Ptr);
        let x = f.alloc_vreg(IrType::Int64);
        let y = f.alloc_vreg(IrType::Int64);
        let z = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.set_terminator(entry, Terminator::Jump { target: header });
        f.add_instr(
            header,
            Instr::Phi {
                dest: iv,
                incoming: vec![(Value::ConstInt(0), entry), (Value::Reg(step), body)],
            },
        );
        f.add_instr(
            header,
            Instr::Cmp {
                op: CmpOp::Lt,
                dest: c,
                lhs: Value::Reg(iv),
                rhs: Value::Arg(3),
            },
        );
        f.set_terminator(
            header,
            Terminator::Branch {
                cond: Value::Reg(c),
                then_bb: body,
                else_bb: exit,
            },
        );
        f.add_instr(
            body,
            Instr::ElementPtr {
                dest: pa,
                base: Value::Arg(1),
                index: Value::Reg(iv),
                scale: 8,
            },
        );
        f.add_instr(
            body,
            Instr::Load {
                dest: x,
                addr: Value::Reg(pa),
                offset: 0,
                ty: IrType::Int64,
            },
        );
        f.add_instr(
            body,
            Instr::ElementPtr {
                dest: pb,
                base: Value::Arg(2),
                index: Value::Reg(iv),
                scale: 8,
            },
        );
        f.add_instr(
            body,
            Instr::Load {
                dest: y,
                addr: Value::Reg(pb),
                offset: 0,
                ty: IrType::Int64,
            },
        );
        f.add_instr(
            body,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: z,
                lhs: Value::Reg(x),
                rhs: Value::Reg(y),
            },
        );
        f.add_instr(
            body,
            Instr::ElementPtr {
                dest: pc,
                base: Value::Arg(0),
                index: Value::Reg(iv),
                scale: 8,
            },
        );
        f.add_instr(
            body,
            Instr::Store {
                addr: Value::Reg(pc),
                offset: 0,
                value: Value::Reg(z),
                ty: IrType::Int64,
            },
        );
        f.add_instr(
            body,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: step,
                lhs: Value::Reg(iv),
                rhs: Value::ConstInt(1),
            },
        );
        f.set_terminator(body, Terminator::Jump { target: header });
        f.set_terminator(exit, Terminator::Ret { value: None });
        f
    }

    #[test]
    fn test_elementwise_loop_vectorized() {
        let mut f = elementwise_add();
        let flow = FlowInfo::compute(&mut f);
        assert!(Vectorization::new(4).run(&mut f, &flow, None));
        let vec_instrs: usize = f
            .blocks
            .iter()
            .map(|b| b.instrs.iter().filter(|i| i.is_vector()).count())
            .sum();
        assert_eq!(vec_instrs, 3);
        // the scalar remainder loop survives
        assert!(f.blocks.iter().any(|b| {
            b.instrs
                .iter()
                .any(|i| matches!(i, Instr::Load { .. }))
        }));
        f.build_cfg();
        assert!(crate::ir::verify(&f).is_empty());
    }

    #[test]
    fn test_vector_step_matches_width() {
        let mut f = elementwise_add();
        let flow = FlowInfo::compute(&mut f);
        Vectorization::new(4).run(&mut f, &flow, None);
        assert!(f.blocks.iter().any(|b| {
            b.instrs.iter().any(|i| {
                matches!(
                    i,
                    Instr::Bin {
                        op: BinOp::IntAdd,
                        rhs: Value::ConstInt(4),
                        ..
                    }
                )
            })
        }));
    }

    #[test]
    fn test_width_one_disables() {
        let mut f = elementwise_add();
        let flow = FlowInfo::compute(&mut f);
        assert!(!Vectorization::new(1).run(&mut f, &flow, None));
    }

    #[test]
    fn test_non_unit_stride_not_vectorized() {
        let mut f = elementwise_add();
        // rewrite the induction step to 2
        for b in &mut f.blocks {
            for i in &mut b.instrs {
                if let Instr::Bin {
                    op: BinOp::IntAdd,
                    rhs: rhs @ Value::ConstInt(1),
                    ..
                } = i
                {
                    *rhs = Value::ConstInt(2);
                }
            }
        }
        f.touch();
        let flow = FlowInfo::compute(&mut f);
        assert!(!Vectorization::new(4).run(&mut f, &flow, None));
    }
}
