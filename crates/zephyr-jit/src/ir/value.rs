//! Value handles and stable ids
//!
//! A `Value` is an immutable, copyable reference to a definition site. It
//! never owns what it points at; registers refer to instruction results by
//! id, constants carry their payload inline.

use std::fmt;

/// A virtual register: the result of one instruction (or a synthesized
/// temporary). Stable numeric identity within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vreg(pub u32);

impl fmt::Display for Vreg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies a basic block within its owning function. Blocks are arena
/// entries; ids stay stable across block removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Identifies a function within its owning module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// An operand: tagged by the kind of definition it references.
///
/// Float constants are stored as raw bit patterns so equality and hashing
/// stay derivable (NaN-safe structural identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// Result of an instruction
    Reg(Vreg),
    ConstInt(i64),
    /// f64 bit pattern
    ConstFloat(u64),
    ConstBool(bool),
    /// Function argument by position
    Arg(u16),
    /// A basic-block label
    Block(BlockId),
    /// A function in the enclosing module
    Func(FuncId),
    /// A module-level global by id
    Global(u32),
}

impl Value {
    pub fn const_f64(v: f64) -> Self {
        Value::ConstFloat(v.to_bits())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::ConstFloat(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<Vreg> {
        match self {
            Value::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Value::ConstInt(v) => Some(*v),
            _ => None,
        }
    }

    /// True for constants of any payload kind.
    pub fn is_const(&self) -> bool {
        matches!(
            self,
            Value::ConstInt(_) | Value::ConstFloat(_) | Value::ConstBool(_)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg(r) => write!(f, "{}", r),
            Value::ConstInt(v) => write!(f, "{}", v),
            Value::ConstFloat(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Value::ConstBool(b) => write!(f, "{}", b),
            Value::Arg(i) => write!(f, "arg{}", i),
            Value::Block(b) => write!(f, "{}", b),
            Value::Func(id) => write!(f, "{}", id),
            Value::Global(g) => write!(f, "g{}", g),
        }
    }
}
