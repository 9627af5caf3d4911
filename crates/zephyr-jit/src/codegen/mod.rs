//! Machine-code emission
//!
//! Walks blocks linearly and lowers each instruction through the slot
//! assignment, producing fixed-width words, branch fixups resolved after
//! layout, relocation records for runtime symbols and sibling functions,
//! and safepoint stack maps. Phis must be lowered to moves before emission
//! (`lower_phis`); the allocator runs between the two.
//!
//! Calling convention of generated code: `a0` = argument array base,
//! `a1` = argument count, result in `a0`. The argument base and count are
//! latched into `s1`/`s2` by the prologue so helper calls cannot clobber
//! them.

pub mod encode;
pub mod peephole;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ir::{
    BinOp, BlockId, Callee, CmpOp, FuncId, Function, Instr, IrType, Terminator, UnOp, Value, Vreg,
};
use crate::regalloc::{Allocation, Slot};
use crate::runtime::RuntimeHelper;

use encode as e;

#[derive(Debug, Error, PartialEq)]
pub enum CodegenError {
    #[error("branch offset {offset} exceeds the B-type range")]
    BranchOutOfRange { offset: i64 },
    #[error("jump offset {offset} exceeds the J-type range")]
    JumpOutOfRange { offset: i64 },
    #[error("virtual register {0} has no slot assignment")]
    MissingSlot(Vreg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Absolute,
    Relative,
    PcRelative,
    Got,
    Plt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Helper(RuntimeHelper),
    Func(FuncId),
    Address(u64),
}

/// One patch to apply when the final code address is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    /// Word index of the `auipc` of the call pair
    pub word: usize,
    pub target: RelocTarget,
    pub addend: i64,
    pub kind: RelocKind,
}

/// Safepoint record: sp-relative frame offsets that may hold heap
/// pointers while the call at `word` is live.
#[derive(Debug, Clone, PartialEq)]
pub struct StackMap {
    pub word: usize,
    pub slots: Vec<i32>,
}

/// Named byte offset that the lifecycle manager may patch later.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPoint {
    pub name: String,
    pub offset: usize,
}

/// Finished machine code for one function, position-independent until
/// relocations are applied.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub relocations: Vec<Relocation>,
    pub is_optimized: bool,
    pub stack_maps: Vec<StackMap>,
    pub patch_points: Vec<PatchPoint>,
}

impl CompiledCode {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The code as 32-bit words (little-endian).
    pub fn words(&self) -> Vec<u32> {
        self.code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Rewrite every phi into moves at the end of its predecessors. The moves
/// form a parallel copy: every edge temporary is written before any phi
/// destination, so phis that read each other's destinations (a swap) see
/// the pre-update values. Must run before register allocation.
pub fn lower_phis(func: &mut Function) {
    let block_count = func.blocks.len();
    for bi in 0..block_count {
        let phi_count = func.blocks[bi].phi_count();
        if phi_count == 0 {
            continue;
        }
        let phis: Vec<Instr> = func.blocks[bi].instrs.drain(..phi_count).collect();
        let mut writebacks: Vec<(BlockId, Vreg, Vreg)> = Vec::new();
        for phi in phis {
            let Instr::Phi { dest, incoming } = phi else {
                continue;
            };
            let ty = func.vreg_type(dest);
            for (value, pred) in incoming {
                let tmp = func.alloc_vreg(ty);
                func.blocks[pred.index()].instrs.push(Instr::Move {
                    dest: tmp,
                    src: value,
                });
                writebacks.push((pred, dest, tmp));
            }
        }
        for (pred, dest, tmp) in writebacks {
            func.blocks[pred.index()].instrs.push(Instr::Move {
                dest,
                src: Value::Reg(tmp),
            });
        }
    }
    func.touch();
}

enum FixupKind {
    Branch { funct3: u32, rs1: u8, rs2: u8 },
    Jump { rd: u8 },
}

struct Fixup {
    word: usize,
    target: BlockId,
    kind: FixupKind,
}

/// Per-function emitter.
pub struct Codegen<'a> {
    func: &'a Function,
    alloc: &'a Allocation,
    vector_width: u32,
    is_optimized: bool,

    words: Vec<u32>,
    block_words: FxHashMap<BlockId, usize>,
    fixups: Vec<Fixup>,
    relocations: Vec<Relocation>,
    stack_maps: Vec<StackMap>,
    patch_points: Vec<PatchPoint>,

    frame_size: i32,
    out_args_base: i32,
    alloca_offsets: FxHashMap<Vreg, i32>,
    spill_base: i32,
    save_base: i32,
    pointer_slots: Vec<i32>,
    /// vtype/vl configured since the last block start or call
    vconfig: bool,
}

/// ra, fp, s1, s2 and the nine allocatable callee-saved registers.
const SAVED_REGS: [u8; 13] = [
    e::RA,
    e::FP,
    e::S1,
    e::S2,
    19,
    20,
    21,
    22,
    23,
    24,
    25,
    26,
    27,
];

impl<'a> Codegen<'a> {
    pub fn new(
        func: &'a Function,
        alloc: &'a Allocation,
        vector_width: u32,
        is_optimized: bool,
    ) -> Self {
        // outgoing argument area for direct calls to sibling functions
        let mut out_words = 0usize;
        let mut alloca_bytes = 0i32;
        let mut alloca_offsets = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                match instr {
                    Instr::Call {
                        callee: Callee::Func(_),
                        args,
                        ..
                    } => out_words = out_words.max(args.len()),
                    Instr::StackAlloc { dest, size } => {
                        alloca_offsets.insert(*dest, alloca_bytes);
                        alloca_bytes += ((*size as i32) + 7) & !7;
                    }
                    _ => {}
                }
            }
        }

        let out_args_base = 0;
        let alloca_base = out_args_base + (out_words as i32) * 8;
        let spill_base = alloca_base + alloca_bytes;
        let save_base = spill_base + alloc.spill_bytes as i32;
        let frame_size = (save_base + (SAVED_REGS.len() as i32) * 8 + 15) & !15;
        for off in alloca_offsets.values_mut() {
            *off += alloca_base;
        }

        let mut pointer_slots: Vec<i32> = alloc
            .slots
            .iter()
            .filter_map(|(v, s)| match s {
                Slot::Stack(off)
                    if matches!(
                        func.vreg_type(*v),
                        IrType::Ptr | IrType::Object | IrType::Array
                    ) =>
                {
                    Some(spill_base + off)
                }
                _ => None,
            })
            .collect();
        pointer_slots.sort_unstable();

        Self {
            func,
            alloc,
            vector_width,
            is_optimized,
            words: Vec::new(),
            block_words: FxHashMap::default(),
            fixups: Vec::new(),
            relocations: Vec::new(),
            stack_maps: Vec::new(),
            patch_points: Vec::new(),
            frame_size,
            out_args_base,
            alloca_offsets,
            spill_base,
            save_base,
            pointer_slots,
            vconfig: false,
        }
    }

    pub fn emit(mut self) -> Result<CompiledCode, CodegenError> {
        self.prologue();
        for b in self.func.reachable_blocks() {
            self.block_words.insert(b, self.words.len());
            self.vconfig = false;
            let block = self.func.block(b);
            for instr in &block.instrs {
                self.emit_instr(instr)?;
            }
            self.emit_terminator(&block.terminator)?;
        }

        let (mut words, mut fixups, mut block_words, mut relocations, mut stack_maps, mut patch_points) = (
            self.words,
            self.fixups,
            self.block_words,
            self.relocations,
            self.stack_maps,
            self.patch_points,
        );
        peephole::run(
            &mut words,
            &mut fixups,
            &mut block_words,
            &mut relocations,
            &mut stack_maps,
            &mut patch_points,
        );
        patch_fixups(&mut words, &fixups, &block_words)?;

        let mut code = Vec::with_capacity(words.len() * 4);
        for w in &words {
            code.extend_from_slice(&w.to_le_bytes());
        }
        Ok(CompiledCode {
            code,
            entry_offset: 0,
            relocations,
            is_optimized: self.is_optimized,
            stack_maps,
            patch_points,
        })
    }

    fn push(&mut self, word: u32) {
        self.words.push(word);
    }

    // frame access that tolerates offsets beyond the 12-bit immediate

    fn frame_load(&mut self, rd: u8, off: i32) {
        if (-2048..2048).contains(&off) {
            self.push(e::ld(rd, e::SP, off));
        } else {
            e::li(&mut self.words, rd, off as i64);
            self.push(e::add(rd, rd, e::SP));
            self.push(e::ld(rd, rd, 0));
        }
    }

    fn frame_store(&mut self, src: u8, off: i32) {
        if (-2048..2048).contains(&off) {
            self.push(e::sd(e::SP, src, off));
        } else {
            let addr = if src == e::T2 { e::T1 } else { e::T2 };
            e::li(&mut self.words, addr, off as i64);
            self.push(e::add(addr, addr, e::SP));
            self.push(e::sd(addr, src, 0));
        }
    }

    fn frame_addr(&mut self, rd: u8, off: i32) {
        if (-2048..2048).contains(&off) {
            self.push(e::addi(rd, e::SP, off));
        } else {
            e::li(&mut self.words, rd, off as i64);
            self.push(e::add(rd, rd, e::SP));
        }
    }

    fn prologue(&mut self) {
        let frame = self.frame_size;
        if frame < 2048 {
            self.push(e::addi(e::SP, e::SP, -frame));
        } else {
            e::li(&mut self.words, e::T0, frame as i64);
            self.push(e::sub(e::SP, e::SP, e::T0));
        }
        for (i, reg) in SAVED_REGS.iter().enumerate() {
            self.frame_store(*reg, self.save_base + (i as i32) * 8);
        }
        if frame < 2048 {
            self.push(e::addi(e::FP, e::SP, frame));
        } else {
            e::li(&mut self.words, e::T0, frame as i64);
            self.push(e::add(e::FP, e::SP, e::T0));
        }
        self.push(e::mv(e::S1, e::A0));
        self.push(e::mv(e::S2, e::A1));
    }

    fn epilogue(&mut self) {
        for (i, reg) in SAVED_REGS.iter().enumerate() {
            self.frame_load(*reg, self.save_base + (i as i32) * 8);
        }
        let frame = self.frame_size;
        if frame < 2048 {
            self.push(e::addi(e::SP, e::SP, frame));
        } else {
            e::li(&mut self.words, e::T0, frame as i64);
            self.push(e::add(e::SP, e::SP, e::T0));
        }
        self.push(e::jalr(e::ZERO, e::RA, 0));
    }

    fn slot(&self, r: Vreg) -> Result<Slot, CodegenError> {
        self.alloc.slot(r).ok_or(CodegenError::MissingSlot(r))
    }

    /// Bring a scalar value into a register; returns the register holding
    /// it, which is either its home register or `scratch`.
    fn load_value(&mut self, v: Value, scratch: u8) -> Result<u8, CodegenError> {
        match v {
            Value::Reg(r) => match self.slot(r)? {
                Slot::Reg(x) => Ok(x),
                Slot::Stack(off) => {
                    let off = self.spill_base + off;
                    self.frame_load(scratch, off);
                    Ok(scratch)
                }
                Slot::Vector(_) => {
                    log::error!("vector register {} used in scalar position", r);
                    Ok(e::ZERO)
                }
            },
            Value::ConstInt(c) => {
                e::li(&mut self.words, scratch, c);
                Ok(scratch)
            }
            Value::ConstFloat(bits) => {
                e::li(&mut self.words, scratch, bits as i64);
                Ok(scratch)
            }
            Value::ConstBool(b) => {
                e::li(&mut self.words, scratch, b as i64);
                Ok(scratch)
            }
            Value::Arg(i) => {
                self.push(e::ld(scratch, e::S1, (i as i32) * 8));
                Ok(scratch)
            }
            Value::Block(_) | Value::Func(_) | Value::Global(_) => {
                log::error!("unsupported value operand {:?}", v);
                Ok(e::ZERO)
            }
        }
    }

    /// Register a result should be computed into.
    fn dest_reg(&self, dest: Vreg) -> Result<u8, CodegenError> {
        match self.slot(dest)? {
            Slot::Reg(x) => Ok(x),
            _ => Ok(e::T2),
        }
    }

    /// Flush a computed result to its slot if it lives on the stack.
    fn store_result(&mut self, dest: Vreg, from: u8) -> Result<(), CodegenError> {
        match self.slot(dest)? {
            Slot::Reg(x) => {
                if x != from {
                    self.push(e::mv(x, from));
                }
            }
            Slot::Stack(off) => {
                let off = self.spill_base + off;
                self.frame_store(from, off);
            }
            Slot::Vector(_) => {
                log::error!("scalar result for vector-allocated {}", dest);
            }
        }
        Ok(())
    }

    fn emit_instr(&mut self, instr: &Instr) -> Result<(), CodegenError> {
        match instr {
            Instr::Nop => {}
            Instr::Move { dest, src } => {
                let rd = self.dest_reg(*dest)?;
                let rs = self.load_value(*src, rd)?;
                if rs != rd {
                    self.push(e::mv(rd, rs));
                }
                self.store_result(*dest, rd)?;
            }
            Instr::Bin { op, dest, lhs, rhs } => self.emit_bin(*op, *dest, *lhs, *rhs)?,
            Instr::Un { op, dest, src } => {
                let rd = self.dest_reg(*dest)?;
                let rs = self.load_value(*src, e::T0)?;
                match op {
                    UnOp::Neg => self.push(e::sub(rd, e::ZERO, rs)),
                    UnOp::Not => self.push(e::sltiu(rd, rs, 1)),
                    UnOp::BitNot => self.push(e::xori(rd, rs, -1)),
                }
                self.store_result(*dest, rd)?;
            }
            Instr::Cmp { op, dest, lhs, rhs } => {
                let rd = self.dest_reg(*dest)?;
                let ra = self.load_value(*lhs, e::T0)?;
                let rb = self.load_value(*rhs, e::T1)?;
                match op {
                    CmpOp::Eq => {
                        self.push(e::sub(rd, ra, rb));
                        self.push(e::sltiu(rd, rd, 1));
                    }
                    CmpOp::Ne => {
                        self.push(e::sub(rd, ra, rb));
                        self.push(e::sltu(rd, e::ZERO, rd));
                    }
                    CmpOp::Lt => self.push(e::slt(rd, ra, rb)),
                    CmpOp::Le => {
                        self.push(e::slt(rd, rb, ra));
                        self.push(e::xori(rd, rd, 1));
                    }
                    CmpOp::Gt => self.push(e::slt(rd, rb, ra)),
                    CmpOp::Ge => {
                        self.push(e::slt(rd, ra, rb));
                        self.push(e::xori(rd, rd, 1));
                    }
                }
                self.store_result(*dest, rd)?;
            }
            Instr::Load {
                dest,
                addr,
                offset,
                ty,
            } => {
                let rd = self.dest_reg(*dest)?;
                let base = self.addr_with_offset(*addr, *offset)?;
                self.push(e::load(rd, base.0, base.1, ty.byte_size().max(1)));
                self.store_result(*dest, rd)?;
            }
            Instr::Store {
                addr,
                offset,
                value,
                ty,
            } => {
                let src = self.load_value(*value, e::T1)?;
                let base = self.addr_with_offset(*addr, *offset)?;
                self.push(e::store(base.0, src, base.1, ty.byte_size().max(1)));
            }
            Instr::StackAlloc { dest, .. } => {
                let off = self.alloca_offsets.get(dest).copied().unwrap_or(0);
                let rd = self.dest_reg(*dest)?;
                self.frame_addr(rd, off);
                self.store_result(*dest, rd)?;
            }
            Instr::HeapAlloc { dest, size } => {
                e::li(&mut self.words, e::A0, *size as i64);
                self.emit_runtime_call(RuntimeHelper::AllocObject);
                self.store_result(*dest, e::A0)?;
            }
            Instr::Call { dest, callee, args } => self.emit_call(*dest, *callee, args)?,
            Instr::Phi { dest, .. } => {
                log::error!("phi for {} reached emission; lower_phis must run first", dest);
            }
            Instr::Cast { dest, src, to } => {
                let rd = self.dest_reg(*dest)?;
                let rs = self.load_value(*src, e::T0)?;
                let from = self.func.value_type(*src);
                if to.is_float() && !from.is_float() {
                    self.push(e::fcvt_d_l(e::FT0, rs));
                    self.push(e::fmv_x_d(rd, e::FT0));
                } else if to.is_integer() && from.is_float() {
                    self.push(e::fmv_d_x(e::FT0, rs));
                    self.push(e::fcvt_l_d(rd, e::FT0));
                } else if rs != rd {
                    self.push(e::mv(rd, rs));
                }
                self.store_result(*dest, rd)?;
            }
            Instr::ElementPtr {
                dest,
                base,
                index,
                scale,
            } => {
                let rd = self.dest_reg(*dest)?;
                let rb = self.load_value(*base, e::T0)?;
                let ri = self.load_value(*index, e::T1)?;
                let scale = *scale as u32;
                if scale.is_power_of_two() && scale > 1 {
                    self.push(e::slli(e::T1, ri, scale.trailing_zeros()));
                    self.push(e::add(rd, rb, e::T1));
                } else if scale <= 1 {
                    self.push(e::add(rd, rb, ri));
                } else {
                    e::li(&mut self.words, e::T2, scale as i64);
                    self.push(e::mul(e::T1, ri, e::T2));
                    self.push(e::add(rd, rb, e::T1));
                }
                self.store_result(*dest, rd)?;
            }
            Instr::PropertyGet {
                dest,
                object,
                key,
                checked,
            } => {
                if *checked {
                    let obj = self.load_value(*object, e::T0)?;
                    self.push(e::mv(e::A0, obj));
                    e::li(&mut self.words, e::A1, IrType::Object as i64);
                    self.emit_runtime_call(RuntimeHelper::TypeCheck);
                }
                let obj = self.load_value(*object, e::T0)?;
                self.push(e::mv(e::A0, obj));
                e::li(&mut self.words, e::A1, *key as i64);
                self.emit_runtime_call(RuntimeHelper::PropertyGet);
                self.store_result(*dest, e::A0)?;
            }
            Instr::PropertySet {
                object,
                key,
                value,
                checked,
            } => {
                if *checked {
                    let obj = self.load_value(*object, e::T0)?;
                    self.push(e::mv(e::A0, obj));
                    e::li(&mut self.words, e::A1, IrType::Object as i64);
                    self.emit_runtime_call(RuntimeHelper::TypeCheck);
                }
                let val = self.load_value(*value, e::T1)?;
                self.push(e::mv(e::A2, val));
                let obj = self.load_value(*object, e::T0)?;
                self.push(e::mv(e::A0, obj));
                e::li(&mut self.words, e::A1, *key as i64);
                self.emit_runtime_call(RuntimeHelper::PropertySet);
            }
            Instr::VecBin { op, dest, lhs, rhs } => {
                self.ensure_vconfig();
                let va = self.vec_operand(*lhs, e::VSCRATCH0)?;
                let vb = self.vec_operand(*rhs, e::VSCRATCH1)?;
                let vd = self.vec_dest(*dest)?;
                let word = match op {
                    BinOp::IntSub | BinOp::Sub => e::vsub_vv(vd, va, vb),
                    BinOp::IntMul | BinOp::Mul => e::vmul_vv(vd, va, vb),
                    _ => e::vadd_vv(vd, va, vb),
                };
                self.push(word);
                self.vec_store_dest(*dest, vd)?;
            }
            Instr::VecLoad { dest, addr, offset } => {
                self.ensure_vconfig();
                let base = self.addr_with_offset(*addr, *offset)?;
                let base = self.flatten_addr(base);
                let vd = self.vec_dest(*dest)?;
                self.push(e::vle64(vd, base));
                self.vec_store_dest(*dest, vd)?;
            }
            Instr::VecStore {
                addr,
                offset,
                value,
            } => {
                self.ensure_vconfig();
                let vs = self.vec_operand(*value, e::VSCRATCH0)?;
                let base = self.addr_with_offset(*addr, *offset)?;
                let base = self.flatten_addr(base);
                self.push(e::vse64(vs, base));
            }
        }
        Ok(())
    }

    fn emit_bin(&mut self, op: BinOp, dest: Vreg, lhs: Value, rhs: Value) -> Result<(), CodegenError> {
        let rd = self.dest_reg(dest)?;
        let ra = self.load_value(lhs, e::T0)?;
        let rb = self.load_value(rhs, e::T1)?;
        match op {
            BinOp::FloatAdd | BinOp::FloatSub | BinOp::FloatMul | BinOp::FloatDiv => {
                self.push(e::fmv_d_x(e::FT0, ra));
                self.push(e::fmv_d_x(e::FT1, rb));
                let word = match op {
                    BinOp::FloatAdd => e::fadd_d(e::FT0, e::FT0, e::FT1),
                    BinOp::FloatSub => e::fsub_d(e::FT0, e::FT0, e::FT1),
                    BinOp::FloatMul => e::fmul_d(e::FT0, e::FT0, e::FT1),
                    _ => e::fdiv_d(e::FT0, e::FT0, e::FT1),
                };
                self.push(word);
                self.push(e::fmv_x_d(rd, e::FT0));
            }
            _ => {
                // generic forms reach here only at the lowest tier, where
                // operands are untagged integers
                let word = match op {
                    BinOp::Add | BinOp::IntAdd => e::add(rd, ra, rb),
                    BinOp::Sub | BinOp::IntSub => e::sub(rd, ra, rb),
                    BinOp::Mul | BinOp::IntMul => e::mul(rd, ra, rb),
                    BinOp::Div | BinOp::IntDiv => e::div(rd, ra, rb),
                    BinOp::Mod | BinOp::IntMod => e::rem(rd, ra, rb),
                    BinOp::And => e::and(rd, ra, rb),
                    BinOp::Or => e::or(rd, ra, rb),
                    BinOp::Xor => e::xor(rd, ra, rb),
                    BinOp::Shl => e::sll(rd, ra, rb),
                    BinOp::Shr => e::srl(rd, ra, rb),
                    BinOp::Sar => e::sra(rd, ra, rb),
                    _ => e::add(rd, ra, rb),
                };
                self.push(word);
            }
        }
        self.store_result(dest, rd)
    }

    /// Address operand as (base register, residual 12-bit offset).
    fn addr_with_offset(&mut self, addr: Value, offset: i32) -> Result<(u8, i32), CodegenError> {
        let base = self.load_value(addr, e::T0)?;
        if (-2048..2048).contains(&offset) {
            Ok((base, offset))
        } else {
            e::li(&mut self.words, e::T2, offset as i64);
            self.push(e::add(e::T0, base, e::T2));
            Ok((e::T0, 0))
        }
    }

    /// Vector memory ops have no offset field; fold a residual offset into
    /// the base register.
    fn flatten_addr(&mut self, (base, off): (u8, i32)) -> u8 {
        if off == 0 {
            return base;
        }
        self.push(e::addi(e::T0, base, off));
        e::T0
    }

    fn ensure_vconfig(&mut self) {
        if !self.vconfig {
            self.push(e::vsetivli_e64m1(self.vector_width));
            self.vconfig = true;
        }
    }

    fn vec_operand(&mut self, v: Value, scratch: u8) -> Result<u8, CodegenError> {
        match v {
            Value::Reg(r) => match self.slot(r)? {
                Slot::Vector(n) => Ok(n),
                Slot::Stack(off) => {
                    self.frame_addr(e::T0, self.spill_base + off);
                    self.push(e::vle64(scratch, e::T0));
                    Ok(scratch)
                }
                Slot::Reg(_) => {
                    log::error!("scalar register {} used in vector position", r);
                    Ok(scratch)
                }
            },
            other => {
                log::error!("unsupported vector operand {:?}", other);
                Ok(scratch)
            }
        }
    }

    fn vec_dest(&mut self, dest: Vreg) -> Result<u8, CodegenError> {
        match self.slot(dest)? {
            Slot::Vector(n) => Ok(n),
            _ => Ok(e::VSCRATCH0),
        }
    }

    fn vec_store_dest(&mut self, dest: Vreg, from: u8) -> Result<(), CodegenError> {
        if let Slot::Stack(off) = self.slot(dest)? {
            self.frame_addr(e::T0, self.spill_base + off);
            self.push(e::vse64(from, e::T0));
        }
        Ok(())
    }

    fn emit_call(
        &mut self,
        dest: Option<Vreg>,
        callee: Callee,
        args: &[Value],
    ) -> Result<(), CodegenError> {
        match callee {
            Callee::Runtime(h) => {
                const ARG_REGS: [u8; 6] = [e::A0, e::A1, e::A2, e::A3, e::A4, e::A5];
                if args.len() > ARG_REGS.len() {
                    log::error!("runtime call with {} arguments truncated", args.len());
                }
                for (i, a) in args.iter().take(ARG_REGS.len()).enumerate() {
                    let r = self.load_value(*a, e::T0)?;
                    self.push(e::mv(ARG_REGS[i], r));
                }
                self.emit_runtime_call(h);
            }
            Callee::Func(fid) => {
                // spill arguments into the outgoing array, pass base + count
                for (i, a) in args.iter().enumerate() {
                    let r = self.load_value(*a, e::T0)?;
                    self.frame_store(r, self.out_args_base + (i as i32) * 8);
                }
                self.frame_addr(e::A0, self.out_args_base);
                e::li(&mut self.words, e::A1, args.len() as i64);
                self.emit_reloc_call(RelocTarget::Func(fid));
            }
        }
        if let Some(d) = dest {
            self.store_result(d, e::A0)?;
        }
        Ok(())
    }

    fn emit_runtime_call(&mut self, helper: RuntimeHelper) {
        self.emit_reloc_call(RelocTarget::Helper(helper));
    }

    fn emit_reloc_call(&mut self, target: RelocTarget) {
        let word = self.words.len();
        self.relocations.push(Relocation {
            word,
            target,
            addend: 0,
            kind: RelocKind::PcRelative,
        });
        self.stack_maps.push(StackMap {
            word,
            slots: self.pointer_slots.clone(),
        });
        self.patch_points.push(PatchPoint {
            name: format!("call.{}", self.patch_points.len()),
            offset: word * 4,
        });
        self.push(e::auipc(e::T0, 0));
        self.push(e::jalr(e::RA, e::T0, 0));
        // calls may reconfigure vl/vtype
        self.vconfig = false;
    }

    fn emit_terminator(&mut self, term: &Terminator) -> Result<(), CodegenError> {
        match term {
            Terminator::Jump { target } => {
                self.fixups.push(Fixup {
                    word: self.words.len(),
                    target: *target,
                    kind: FixupKind::Jump { rd: e::ZERO },
                });
                self.push(e::jal(e::ZERO, 0));
            }
            Terminator::Branch {
                cond,
                then_bb,
                else_bb,
            } => {
                let rc = self.load_value(*cond, e::T0)?;
                self.fixups.push(Fixup {
                    word: self.words.len(),
                    target: *then_bb,
                    kind: FixupKind::Branch {
                        funct3: 0b001,
                        rs1: rc,
                        rs2: e::ZERO,
                    },
                });
                self.push(e::bne(rc, e::ZERO, 0));
                self.fixups.push(Fixup {
                    word: self.words.len(),
                    target: *else_bb,
                    kind: FixupKind::Jump { rd: e::ZERO },
                });
                self.push(e::jal(e::ZERO, 0));
            }
            Terminator::Ret { value } => {
                match value {
                    Some(v) => {
                        let r = self.load_value(*v, e::A0)?;
                        if r != e::A0 {
                            self.push(e::mv(e::A0, r));
                        }
                    }
                    None => self.push(e::mv(e::A0, e::ZERO)),
                }
                self.epilogue();
            }
            Terminator::None | Terminator::Unreachable => {
                self.push(e::EBREAK);
            }
        }
        Ok(())
    }
}

fn patch_fixups(
    words: &mut [u32],
    fixups: &[Fixup],
    block_words: &FxHashMap<BlockId, usize>,
) -> Result<(), CodegenError> {
    for f in fixups {
        let Some(&target) = block_words.get(&f.target) else {
            continue;
        };
        let offset = (target as i64 - f.word as i64) * 4;
        match &f.kind {
            FixupKind::Branch { funct3, rs1, rs2 } => {
                if !(-4096..4096).contains(&offset) {
                    return Err(CodegenError::BranchOutOfRange { offset });
                }
                words[f.word] = e::enc_b(*funct3, *rs1, *rs2, offset as i32);
            }
            FixupKind::Jump { rd } => {
                if !(-(1 << 20)..(1 << 20)).contains(&offset) {
                    return Err(CodegenError::JumpOutOfRange { offset });
                }
                words[f.word] = e::enc_j(*rd, offset as i32);
            }
        }
    }
    Ok(())
}

/// Patch the auipc/jalr pair at `word` so the call lands `pcrel` bytes
/// away from the auipc. Used when relocations are applied at commit.
pub fn patch_pcrel_call(words: &mut [u32], word: usize, pcrel: i64) -> Result<(), CodegenError> {
    // upper bound shrinks by the rounding bias so hi << 12 stays in i32
    if pcrel < -(1 << 31) || pcrel >= (1 << 31) - 0x800 {
        return Err(CodegenError::JumpOutOfRange { offset: pcrel });
    }
    let hi = ((pcrel + 0x800) >> 12) as i32;
    let lo = (pcrel - ((hi as i64) << 12)) as i32;
    words[word] = e::auipc(e::T0, hi << 12);
    words[word + 1] = e::jalr(e::RA, e::T0, lo);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FlowInfo;
    use crate::config::OptLevel;
    use crate::regalloc;

    fn add_func() -> Function {
        let mut f = Function::new(
            FuncId(0),
            "add2",
            vec![IrType::Int64, IrType::Int64],
            IrType::Int64,
        );
        let r = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: r,
                lhs: Value::Arg(0),
                rhs: Value::Arg(1),
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

    fn compile(f: &mut Function, level: OptLevel) -> CompiledCode {
        lower_phis(f);
        let flow = FlowInfo::compute(f);
        let alloc = regalloc::for_level(level).allocate(f, &flow);
        Codegen::new(f, &alloc, 4, level > OptLevel::None)
            .emit()
            .expect("codegen")
    }

    #[test]
    fn test_simple_function_emits() {
        let mut f = add_func();
        let code = compile(&mut f, OptLevel::None);
        assert!(!code.is_empty());
        assert_eq!(code.entry_offset, 0);
        // first word allocates the frame: addi sp, sp, -frame
        let words = code.words();
        assert_eq!(words[0] & 0x7f, e::OP_IMM);
        // a return lands somewhere: jalr x0, ra, 0
        assert!(words.contains(&e::jalr(e::ZERO, e::RA, 0)));
    }

    #[test]
    fn test_lower_phis_removes_all_phis() {
        let mut f = Function::new(FuncId(0), "t", vec![IrType::Bool], IrType::Int64);
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        let x = f.alloc_vreg(IrType::Int64);
        let y = f.alloc_vreg(IrType::Int64);
        let p = f.alloc_vreg(IrType::Int64);
        f.set_terminator(
            f.entry,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: b1,
                else_bb: b2,
            },
        );
        f.add_instr(b1, Instr::Move { dest: x, src: Value::ConstInt(1) });
        f.set_terminator(b1, Terminator::Jump { target: b3 });
        f.add_instr(b2, Instr::Move { dest: y, src: Value::ConstInt(2) });
        f.set_terminator(b2, Terminator::Jump { target: b3 });
        f.add_instr(
            b3,
            Instr::Phi {
                dest: p,
                incoming: vec![(Value::Reg(x), b1), (Value::Reg(y), b2)],
            },
        );
        f.set_terminator(b3, Terminator::Ret { value: Some(Value::Reg(p)) });

        lower_phis(&mut f);
        assert!(!f.blocks.iter().any(|b| b.instrs.iter().any(|i| i.is_phi())));
        // each predecessor got the temp + rebind pair
        assert_eq!(f.block(b1).instrs.len(), 3);
        assert_eq!(f.block(b2).instrs.len(), 3);
    }

    #[test]
    fn test_lower_phis_swap_reads_before_writes() {
        // header phis exchange x and y on every trip through the latch;
        // the latch copy must read both old values before writing either
        let mut f = Function::new(FuncId(0), "swap", vec![IrType::Bool], IrType::Int64);
        let header = f.add_block();
        let latch = f.add_block();
        let exit = f.add_block();
        let x = f.alloc_vreg(IrType::Int64);
        let y = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.set_terminator(entry, Terminator::Jump { target: header });
        f.add_instr(
            header,
            Instr::Phi {
                dest: x,
                incoming: vec![(Value::ConstInt(1), entry), (Value::Reg(y), latch)],
            },
        );
        f.add_instr(
            header,
            Instr::Phi {
                dest: y,
                incoming: vec![(Value::ConstInt(2), entry), (Value::Reg(x), latch)],
            },
        );
        f.set_terminator(
            header,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: latch,
                else_bb: exit,
            },
        );
        f.set_terminator(latch, Terminator::Jump { target: header });
        f.set_terminator(exit, Terminator::Ret { value: Some(Value::Reg(x)) });

        lower_phis(&mut f);
        let moves = &f.block(latch).instrs;
        assert_eq!(moves.len(), 4);
        let first_write = moves
            .iter()
            .position(|i| matches!(i.dest(), Some(d) if d == x || d == y))
            .unwrap();
        assert_eq!(first_write, 2, "a phi destination was written before all reads");
        for m in &moves[..first_write] {
            assert!(matches!(m, Instr::Move { src: Value::Reg(r), .. } if *r == x || *r == y));
        }
    }

    #[test]
    fn test_runtime_call_records_relocation_and_stack_map() {
        let mut f = Function::new(FuncId(0), "t", vec![], IrType::Object);
        let p = f.alloc_vreg(IrType::Object);
        let entry = f.entry;
        f.add_instr(entry, Instr::HeapAlloc { dest: p, size: 32 });
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(p)),
            },
        );
        let code = compile(&mut f, OptLevel::None);
        assert_eq!(code.relocations.len(), 1);
        let reloc = &code.relocations[0];
        assert_eq!(reloc.kind, RelocKind::PcRelative);
        assert_eq!(reloc.target, RelocTarget::Helper(RuntimeHelper::AllocObject));
        // the reloc points at an auipc
        assert_eq!(code.words()[reloc.word] & 0x7f, e::OP_AUIPC);
        assert_eq!(code.stack_maps.len(), 1);
        // p is an object spilled by the naive allocator, so its slot is mapped
        assert!(!code.stack_maps[0].slots.is_empty());
        assert_eq!(code.patch_points.len(), 1);
    }

    #[test]
    fn test_branch_out_of_range_is_hard_error() {
        let mut f = Function::new(FuncId(0), "big", vec![IrType::Bool], IrType::Int64);
        let target = f.add_block();
        let filler = f.add_block();
        // the filler lays out between the conditional branch and its
        // target, with enough words to blow the 13-bit immediate
        f.set_terminator(
            f.entry,
            Terminator::Branch {
                cond: Value::Arg(0),
                then_bb: target,
                else_bb: filler,
            },
        );
        for i in 0..1500 {
            let r = f.alloc_vreg(IrType::Int64);
            f.add_instr(
                filler,
                Instr::Bin {
                    op: BinOp::IntAdd,
                    dest: r,
                    lhs: Value::ConstInt(i),
                    rhs: Value::ConstInt(i),
                },
            );
        }
        f.set_terminator(filler, Terminator::Ret { value: Some(Value::ConstInt(0)) });
        f.set_terminator(target, Terminator::Ret { value: Some(Value::ConstInt(1)) });

        let flow = FlowInfo::compute(&mut f);
        let alloc = regalloc::for_level(OptLevel::None).allocate(&f, &flow);
        let err = Codegen::new(&f, &alloc, 4, false).emit().unwrap_err();
        assert!(matches!(err, CodegenError::BranchOutOfRange { .. }));
    }

    #[test]
    fn test_patch_pcrel_call() {
        let mut words = vec![e::auipc(e::T0, 0), e::jalr(e::RA, e::T0, 0)];
        patch_pcrel_call(&mut words, 0, 0x1234).expect("patch");
        assert_eq!(words[0], e::auipc(e::T0, 0x1000));
        assert_eq!(words[1], e::jalr(e::RA, e::T0, 0x234));

        // negative low half biases the high part up
        let mut words = vec![0, 0];
        patch_pcrel_call(&mut words, 0, 0x1fff).expect("patch");
        assert_eq!(words[0], e::auipc(e::T0, 0x2000));
        assert_eq!(words[1], e::jalr(e::RA, e::T0, -1));

        // the rounding bias shrinks the top of the reachable range
        let mut words = vec![0, 0];
        assert!(patch_pcrel_call(&mut words, 0, (1 << 31) - 1).is_err());
        patch_pcrel_call(&mut words, 0, (1 << 31) - 0x801).expect("patch");
        assert_eq!(words[0], e::auipc(e::T0, 0x7fff_f000));
        assert_eq!(words[1], e::jalr(e::RA, e::T0, 0x7ff));
    }

    #[test]
    fn test_vector_ops_emit_v_words() {
        let mut f = Function::new(FuncId(0), "v", vec![IrType::Ptr], IrType::Void);
        let xv = f.alloc_vreg(IrType::Unknown);
        let yv = f.alloc_vreg(IrType::Unknown);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::VecLoad {
                dest: xv,
                addr: Value::Arg(0),
                offset: 0,
            },
        );
        f.add_instr(
            entry,
            Instr::VecBin {
                op: BinOp::IntAdd,
                dest: yv,
                lhs: Value::Reg(xv),
                rhs: Value::Reg(xv),
            },
        );
        f.add_instr(
            entry,
            Instr::VecStore {
                addr: Value::Arg(0),
                offset: 0,
                value: Value::Reg(yv),
            },
        );
        f.set_terminator(entry, Terminator::Ret { value: None });
        let code = compile(&mut f, OptLevel::Aggressive);
        let words = code.words();
        assert!(words.iter().any(|w| w & 0x7f == e::OP_V));
        assert!(words.iter().any(|w| w & 0x7f == e::OP_LOAD_V));
        assert!(words.iter().any(|w| w & 0x7f == e::OP_STORE_V));
    }
}
