//! Structural verification
//!
//! Returns every violation found; never repairs anything. Compilation
//! refuses functions with a non-empty diagnostic list.

use thiserror::Error;

use crate::ir::function::Function;
use crate::ir::instr::Terminator;
use crate::ir::value::BlockId;

/// One structural violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("function has no entry block")]
    MissingEntry,
    #[error("{0} is empty")]
    EmptyBlock(BlockId),
    #[error("{0} has no terminator")]
    MissingTerminator(BlockId),
    #[error("phi at position {1} in {0} is not grouped at the block head")]
    PhiNotAtHead(BlockId, usize),
    #[error("{0} targets unknown block {1}")]
    UnknownTarget(BlockId, BlockId),
}

/// Collect all structural violations in `func`.
///
/// Only reachable blocks are checked for emptiness and termination;
/// orphaned arena slots left behind by block removal are legal.
pub fn verify(func: &Function) -> Vec<Diagnostic> {
    let mut out = Vec::new();

    if func.blocks.is_empty() || func.entry.index() >= func.blocks.len() {
        out.push(Diagnostic::MissingEntry);
        return out;
    }

    let block_count = func.blocks.len() as u32;
    for id in func.reachable_blocks() {
        let block = func.block(id);

        if block.instrs.is_empty() && matches!(block.terminator, Terminator::None) {
            out.push(Diagnostic::EmptyBlock(id));
            continue;
        }
        if matches!(block.terminator, Terminator::None) {
            out.push(Diagnostic::MissingTerminator(id));
        }

        let phis = block.phi_count();
        for (pos, instr) in block.instrs.iter().enumerate().skip(phis) {
            if instr.is_phi() {
                out.push(Diagnostic::PhiNotAtHead(id, pos));
            }
        }

        for succ in block.terminator.successors() {
            if succ.0 >= block_count {
                out.push(Diagnostic::UnknownTarget(id, succ));
            }
        }
    }

    out
}
