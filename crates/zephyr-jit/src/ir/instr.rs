//! IR instructions
//!
//! One tagged enum carries every opcode family; opcode-specific fields live
//! inline in the variant. Side-effect and terminator classification is
//! derived from the variant, never stored.

use crate::ir::types::IrType;
use crate::ir::value::{BlockId, FuncId, Value, Vreg};
use crate::runtime::RuntimeHelper;

/// Binary opcodes. The generic arithmetic forms (`Add`..`Mod`) operate on
/// dynamically-typed values; type specialization narrows them to the
/// `Int*`/`Float*` forms once operand types are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    /// Logical shift right
    Shr,
    /// Arithmetic shift right
    Sar,
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    IntMod,
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
}

impl BinOp {
    /// Generic arithmetic that specialization may narrow.
    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
        )
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::IntAdd
                | BinOp::IntMul
                | BinOp::FloatAdd
                | BinOp::FloatMul
        )
    }

    /// Integer-specialized form of a generic opcode.
    pub fn specialize_int(&self) -> Option<BinOp> {
        match self {
            BinOp::Add => Some(BinOp::IntAdd),
            BinOp::Sub => Some(BinOp::IntSub),
            BinOp::Mul => Some(BinOp::IntMul),
            BinOp::Div => Some(BinOp::IntDiv),
            BinOp::Mod => Some(BinOp::IntMod),
            _ => None,
        }
    }

    /// Float-specialized form of a generic opcode.
    pub fn specialize_float(&self) -> Option<BinOp> {
        match self {
            BinOp::Add => Some(BinOp::FloatAdd),
            BinOp::Sub => Some(BinOp::FloatSub),
            BinOp::Mul => Some(BinOp::FloatMul),
            BinOp::Div => Some(BinOp::FloatDiv),
            _ => None,
        }
    }

    /// Integer opcodes in either generic or specialized form, eligible for
    /// strength reduction and integer folding.
    pub fn integer_class(&self) -> bool {
        !matches!(
            self,
            BinOp::FloatAdd | BinOp::FloatSub | BinOp::FloatMul | BinOp::FloatDiv
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    /// Boolean not
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Call target: a module function or a named runtime entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Func(FuncId),
    Runtime(RuntimeHelper),
}

/// A single IR instruction. Owned exclusively by its containing block.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Nop,
    Move {
        dest: Vreg,
        src: Value,
    },
    Bin {
        op: BinOp,
        dest: Vreg,
        lhs: Value,
        rhs: Value,
    },
    Un {
        op: UnOp,
        dest: Vreg,
        src: Value,
    },
    Cmp {
        op: CmpOp,
        dest: Vreg,
        lhs: Value,
        rhs: Value,
    },
    Load {
        dest: Vreg,
        addr: Value,
        offset: i32,
        ty: IrType,
    },
    Store {
        addr: Value,
        offset: i32,
        value: Value,
        ty: IrType,
    },
    /// Reserve `size` bytes in the current frame
    StackAlloc {
        dest: Vreg,
        size: u32,
    },
    /// Allocate `size` bytes on the runtime heap
    HeapAlloc {
        dest: Vreg,
        size: u32,
    },
    Call {
        dest: Option<Vreg>,
        callee: Callee,
        args: Vec<Value>,
    },
    Phi {
        dest: Vreg,
        incoming: Vec<(Value, BlockId)>,
    },
    Cast {
        dest: Vreg,
        src: Value,
        to: IrType,
    },
    /// dest = base + index * scale
    ElementPtr {
        dest: Vreg,
        base: Value,
        index: Value,
        scale: u8,
    },
    /// `checked` requests a runtime receiver-type check before the access;
    /// specialization clears it when the receiver type is proven.
    PropertyGet {
        dest: Vreg,
        object: Value,
        key: u32,
        checked: bool,
    },
    PropertySet {
        object: Value,
        key: u32,
        value: Value,
        checked: bool,
    },
    VecBin {
        op: BinOp,
        dest: Vreg,
        lhs: Value,
        rhs: Value,
    },
    VecLoad {
        dest: Vreg,
        addr: Value,
        offset: i32,
    },
    VecStore {
        addr: Value,
        offset: i32,
        value: Value,
    },
}

impl Instr {
    /// The virtual register this instruction defines, if any.
    pub fn dest(&self) -> Option<Vreg> {
        match self {
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
            | Instr::VecLoad { dest, .. } => Some(*dest),
            Instr::Call { dest, .. } => *dest,
            Instr::Nop | Instr::Store { .. } | Instr::PropertySet { .. } | Instr::VecStore { .. } => {
                None
            }
        }
    }

    /// Whether the instruction has effects beyond producing its result.
    /// Property access may invoke user getters/setters; calls are opaque.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Instr::Store { .. }
                | Instr::Call { .. }
                | Instr::PropertyGet { .. }
                | Instr::PropertySet { .. }
                | Instr::VecStore { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Instr::Phi { .. })
    }

    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Instr::VecBin { .. } | Instr::VecLoad { .. } | Instr::VecStore { .. }
        )
    }

    /// Operand values, in operand order. Phi incoming values included.
    pub fn operands(&self) -> Vec<Value> {
        let mut out = Vec::new();
        self.for_each_value(|v| out.push(v));
        out
    }

    /// Visit every operand value.
    pub fn for_each_value(&self, mut f: impl FnMut(Value)) {
        match self {
            Instr::Nop | Instr::StackAlloc { .. } | Instr::HeapAlloc { .. } => {}
            Instr::Move { src, .. } | Instr::Un { src, .. } | Instr::Cast { src, .. } => f(*src),
            Instr::Bin { lhs, rhs, .. }
            | Instr::Cmp { lhs, rhs, .. }
            | Instr::VecBin { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Instr::Load { addr, .. } | Instr::VecLoad { addr, .. } => f(*addr),
            Instr::Store { addr, value, .. } | Instr::VecStore { addr, value, .. } => {
                f(*addr);
                f(*value);
            }
            Instr::Call { args, .. } => {
                for a in args {
                    f(*a);
                }
            }
            Instr::Phi { incoming, .. } => {
                for (v, _) in incoming {
                    f(*v);
                }
            }
            Instr::ElementPtr { base, index, .. } => {
                f(*base);
                f(*index);
            }
            Instr::PropertyGet { object, .. } => f(*object),
            Instr::PropertySet { object, value, .. } => {
                f(*object);
                f(*value);
            }
        }
    }

    /// Visit every operand value mutably (operand rewriting).
    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Instr::Nop | Instr::StackAlloc { .. } | Instr::HeapAlloc { .. } => {}
            Instr::Move { src, .. } | Instr::Un { src, .. } | Instr::Cast { src, .. } => f(src),
            Instr::Bin { lhs, rhs, .. }
            | Instr::Cmp { lhs, rhs, .. }
            | Instr::VecBin { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instr::Load { addr, .. } | Instr::VecLoad { addr, .. } => f(addr),
            Instr::Store { addr, value, .. } | Instr::VecStore { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Instr::Call { args, .. } => {
                for a in args.iter_mut() {
                    f(a);
                }
            }
            Instr::Phi { incoming, .. } => {
                for (v, _) in incoming.iter_mut() {
                    f(v);
                }
            }
            Instr::ElementPtr { base, index, .. } => {
                f(base);
                f(index);
            }
            Instr::PropertyGet { object, .. } => f(object),
            Instr::PropertySet { object, value, .. } => {
                f(object);
                f(value);
            }
        }
    }
}

/// Block terminator. Every reachable block must end in one; `None` marks a
/// block still under construction and is a verification error.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    None,
    Jump {
        target: BlockId,
    },
    Branch {
        cond: Value,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Ret {
        value: Option<Value>,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            _ => Vec::new(),
        }
    }

    /// Values read by the terminator (branch condition, return value).
    pub fn for_each_value(&self, mut f: impl FnMut(Value)) {
        match self {
            Terminator::Branch { cond, .. } => f(*cond),
            Terminator::Ret { value: Some(v) } => f(*v),
            _ => {}
        }
    }

    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Terminator::Branch { cond, .. } => f(cond),
            Terminator::Ret { value: Some(v) } => f(v),
            _ => {}
        }
    }

    /// Rewrite every successor edge `from` -> `to`.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        match self {
            Terminator::Jump { target } => {
                if *target == from {
                    *target = to;
                }
            }
            Terminator::Branch {
                then_bb, else_bb, ..
            } => {
                if *then_bb == from {
                    *then_bb = to;
                }
                if *else_bb == from {
                    *else_bb = to;
                }
            }
            _ => {}
        }
    }
}
