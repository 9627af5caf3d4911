//! Textual IR dump, for logs and test assertions

use std::fmt;

use crate::ir::function::Function;
use crate::ir::instr::{Callee, Instr, Terminator};

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Nop => write!(f, "nop"),
            Instr::Move { dest, src } => write!(f, "{} = {}", dest, src),
            Instr::Bin { op, dest, lhs, rhs } => {
                write!(f, "{} = {:?} {}, {}", dest, op, lhs, rhs)
            }
            Instr::Un { op, dest, src } => write!(f, "{} = {:?} {}", dest, op, src),
            Instr::Cmp { op, dest, lhs, rhs } => {
                write!(f, "{} = cmp.{:?} {}, {}", dest, op, lhs, rhs)
            }
            Instr::Load {
                dest, addr, offset, ty,
            } => write!(f, "{} = load.{} {}+{}", dest, ty, addr, offset),
            Instr::Store {
                addr, offset, value, ty,
            } => write!(f, "store.{} {}+{}, {}", ty, addr, offset, value),
            Instr::StackAlloc { dest, size } => write!(f, "{} = stackalloc {}", dest, size),
            Instr::HeapAlloc { dest, size } => write!(f, "{} = heapalloc {}", dest, size),
            Instr::Call { dest, callee, args } => {
                if let Some(d) = dest {
                    write!(f, "{} = ", d)?;
                }
                match callee {
                    Callee::Func(id) => write!(f, "call {}(", id)?,
                    Callee::Runtime(h) => write!(f, "call {}(", h)?,
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Instr::Phi { dest, incoming } => {
                write!(f, "{} = phi", dest)?;
                for (v, b) in incoming {
                    write!(f, " [{}, {}]", v, b)?;
                }
                Ok(())
            }
            Instr::Cast { dest, src, to } => write!(f, "{} = cast.{} {}", dest, to, src),
            Instr::ElementPtr {
                dest, base, index, scale,
            } => write!(f, "{} = elemptr {}[{} * {}]", dest, base, index, scale),
            Instr::PropertyGet {
                dest, object, key, checked,
            } => write!(
                f,
                "{} = getprop{} {}, #{}",
                dest,
                if *checked { "" } else { ".nocheck" },
                object,
                key
            ),
            Instr::PropertySet {
                object, key, value, checked,
            } => write!(
                f,
                "setprop{} {}, #{}, {}",
                if *checked { "" } else { ".nocheck" },
                object,
                key,
                value
            ),
            Instr::VecBin { op, dest, lhs, rhs } => {
                write!(f, "{} = vec.{:?} {}, {}", dest, op, lhs, rhs)
            }
            Instr::VecLoad { dest, addr, offset } => {
                write!(f, "{} = vload {}+{}", dest, addr, offset)
            }
            Instr::VecStore { addr, offset, value } => {
                write!(f, "vstore {}+{}, {}", addr, offset, value)
            }
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::None => write!(f, "<no terminator>"),
            Terminator::Jump { target } => write!(f, "jump {}", target),
            Terminator::Branch {
                cond, then_bb, else_bb,
            } => write!(f, "branch {}, {}, {}", cond, then_bb, else_bb),
            Terminator::Ret { value: Some(v) } => write!(f, "ret {}", v),
            Terminator::Ret { value: None } => write!(f, "ret"),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "arg{}: {}", i, p)?;
        }
        writeln!(f, ") -> {} {{", self.ret_ty)?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.id)?;
            for instr in &block.instrs {
                writeln!(f, "  {}", instr)?;
            }
            writeln!(f, "  {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}
