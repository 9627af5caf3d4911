//! Post-layout word cleanup
//!
//! Runs after block layout but before branch fixups are patched, so jump
//! placeholders still carry block targets and can be dropped when they
//! would land on the very next word. Deleting words shifts every later
//! index, so fixups, block offsets, relocations, stack maps, and patch
//! points are remapped together.

use rustc_hash::FxHashMap;

use crate::ir::BlockId;

use super::encode as e;
use super::{Fixup, FixupKind, PatchPoint, Relocation, StackMap};

/// Iterate deletion passes to a fixed point. Removing one fall-through
/// jump can expose another.
pub(super) fn run(
    words: &mut Vec<u32>,
    fixups: &mut Vec<Fixup>,
    block_words: &mut FxHashMap<BlockId, usize>,
    relocations: &mut Vec<Relocation>,
    stack_maps: &mut Vec<StackMap>,
    patch_points: &mut Vec<PatchPoint>,
) {
    loop {
        let mut dead = vec![false; words.len()];
        let mut any = false;

        for (i, w) in words.iter().enumerate() {
            if is_self_move(*w) && !fixups.iter().any(|f| f.word == i) {
                dead[i] = true;
                any = true;
            }
        }

        let mut dropped_fixups = Vec::new();
        for (fi, f) in fixups.iter().enumerate() {
            if dead[f.word] {
                continue;
            }
            if let FixupKind::Jump { rd: e::ZERO } = f.kind {
                if block_words.get(&f.target) == Some(&(f.word + 1)) {
                    dead[f.word] = true;
                    dropped_fixups.push(fi);
                    any = true;
                }
            }
        }

        if !any {
            return;
        }
        for fi in dropped_fixups.into_iter().rev() {
            fixups.remove(fi);
        }
        delete_words(&dead, words, fixups, block_words, relocations, stack_maps, patch_points);
    }
}

/// `addi rd, rd, 0` with a nonzero rd moves a register onto itself.
fn is_self_move(w: u32) -> bool {
    let opcode = w & 0x7f;
    let funct3 = (w >> 12) & 0x7;
    let rd = (w >> 7) & 0x1f;
    let rs1 = (w >> 15) & 0x1f;
    let imm = (w as i32) >> 20;
    opcode == e::OP_IMM && funct3 == 0 && imm == 0 && rd == rs1 && rd != 0
}

fn delete_words(
    dead: &[bool],
    words: &mut Vec<u32>,
    fixups: &mut [Fixup],
    block_words: &mut FxHashMap<BlockId, usize>,
    relocations: &mut [Relocation],
    stack_maps: &mut [StackMap],
    patch_points: &mut [PatchPoint],
) {
    // removed[i] = dead words strictly before i
    let mut removed = vec![0usize; words.len() + 1];
    for i in 0..words.len() {
        removed[i + 1] = removed[i] + dead[i] as usize;
    }
    let remap = |w: usize| w - removed[w];

    for f in fixups.iter_mut() {
        f.word = remap(f.word);
    }
    for r in relocations.iter_mut() {
        r.word = remap(r.word);
    }
    for m in stack_maps.iter_mut() {
        m.word = remap(m.word);
    }
    for p in patch_points.iter_mut() {
        p.offset = remap(p.offset / 4) * 4;
    }
    for off in block_words.values_mut() {
        // a block whose first word died now starts at the next kept word
        *off = remap(*off);
    }

    let mut i = 0;
    words.retain(|_| {
        let keep = !dead[i];
        i += 1;
        keep
    });
}
