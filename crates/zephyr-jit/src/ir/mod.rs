//! Intermediate representation
//!
//! The typed program form the backend optimizes before emitting machine
//! code. Functions own their blocks, blocks own their instructions, and
//! every cross-reference is a stable integer id.

pub mod display;
pub mod function;
pub mod instr;
pub mod types;
pub mod value;
pub mod verify;

pub use function::{Block, FnAttrs, Function, Module};
pub use instr::{BinOp, Callee, CmpOp, Instr, Terminator, UnOp};
pub use types::IrType;
pub use value::{BlockId, FuncId, Value, Vreg};
pub use verify::{verify, Diagnostic};
