//! Block orderings over the control-flow graph

use crate::ir::{BlockId, Function};

/// Reverse postorder over reachable blocks. The entry block is first;
/// every block appears after all of its non-back-edge predecessors.
pub fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let n = func.blocks.len();
    let mut seen = vec![false; n];
    let mut postorder = Vec::new();
    // (block, successor cursor)
    let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
    seen[func.entry.index()] = true;

    while let Some((b, cur)) = stack.last_mut() {
        let block = *b;
        let succs = func.block(block).terminator.successors();
        if *cur < succs.len() {
            let s = succs[*cur];
            *cur += 1;
            if s.index() < n && !seen[s.index()] {
                seen[s.index()] = true;
                stack.push((s, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }

    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncId, IrType, Terminator, Value};

    /// Diamond: bb0 -> bb1, bb2; bb1/bb2 -> bb3
    fn diamond() -> Function {
        let mut f = Function::new(FuncId(0), "d", vec![IrType::Bool], IrType::Int64);
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        f.set_terminator(
            f.entry,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: b1,
                else_bb: b2,
            },
        );
        f.set_terminator(b1, Terminator::Jump { target: b3 });
        f.set_terminator(b2, Terminator::Jump { target: b3 });
        f.set_terminator(
            b3,
            Terminator::Ret {
                value: Some(Value::ConstInt(0)),
            },
        );
        f
    }

    #[test]
    fn test_rpo_diamond() {
        let f = diamond();
        let rpo = reverse_postorder(&f);
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], f.entry);
        // join block comes last
        assert_eq!(rpo[3], BlockId(3));
    }

    #[test]
    fn test_rpo_skips_unreachable() {
        let mut f = diamond();
        let orphan = f.add_block();
        f.set_terminator(orphan, Terminator::Unreachable);
        let rpo = reverse_postorder(&f);
        assert!(!rpo.contains(&orphan));
    }
}
