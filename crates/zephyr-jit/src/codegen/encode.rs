//! RV64 instruction encoders
//!
//! One function per instruction format, returning the 32-bit word. Field
//! layouts follow the base ISA exactly and are locked down by the tests at
//! the bottom; everything above `mod.rs` builds on these.

/// x0, hardwired zero
pub const ZERO: u8 = 0;
/// x1, return address
pub const RA: u8 = 1;
/// x2, stack pointer
pub const SP: u8 = 2;
/// x5..x7, scratch registers owned by the emitter
pub const T0: u8 = 5;
pub const T1: u8 = 6;
pub const T2: u8 = 7;
/// x8, frame pointer (s0)
pub const FP: u8 = 8;
/// x9, argument-array base inside compiled code
pub const S1: u8 = 9;
/// x10..x15, argument/result registers
pub const A0: u8 = 10;
pub const A1: u8 = 11;
pub const A2: u8 = 12;
pub const A3: u8 = 13;
pub const A4: u8 = 14;
pub const A5: u8 = 15;
/// x18, argument-count register inside compiled code
pub const S2: u8 = 18;

/// f0..f2, scratch float registers
pub const FT0: u8 = 0;
pub const FT1: u8 = 1;
pub const FT2: u8 = 2;

/// v8/v9, vector scratch outside the allocatable pool
pub const VSCRATCH0: u8 = 8;
pub const VSCRATCH1: u8 = 9;

pub const OP_LOAD: u32 = 0x03;
pub const OP_LOAD_V: u32 = 0x07;
pub const OP_IMM: u32 = 0x13;
pub const OP_AUIPC: u32 = 0x17;
pub const OP_IMM_32: u32 = 0x1b;
pub const OP_STORE: u32 = 0x23;
pub const OP_STORE_V: u32 = 0x27;
pub const OP: u32 = 0x33;
pub const OP_LUI: u32 = 0x37;
pub const OP_32: u32 = 0x3b;
pub const OP_FP: u32 = 0x53;
pub const OP_V: u32 = 0x57;
pub const OP_BRANCH: u32 = 0x63;
pub const OP_JALR: u32 = 0x67;
pub const OP_JAL: u32 = 0x6f;

/// `ebreak`, used as the invalidation trap.
pub const EBREAK: u32 = 0x0010_0073;

fn r(x: u8) -> u32 {
    (x & 0x1f) as u32
}

/// R-type: funct7 | rs2 | rs1 | funct3 | rd | opcode
pub fn enc_r(opcode: u32, funct3: u32, funct7: u32, rd: u8, rs1: u8, rs2: u8) -> u32 {
    (funct7 << 25) | (r(rs2) << 20) | (r(rs1) << 15) | (funct3 << 12) | (r(rd) << 7) | opcode
}

/// I-type: imm[11:0] | rs1 | funct3 | rd | opcode
pub fn enc_i(opcode: u32, funct3: u32, rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (r(rs1) << 15) | (funct3 << 12) | (r(rd) << 7) | opcode
}

/// S-type: imm[11:5] | rs2 | rs1 | funct3 | imm[4:0] | opcode
pub fn enc_s(opcode: u32, funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) & 0x7f) << 25
        | (r(rs2) << 20)
        | (r(rs1) << 15)
        | (funct3 << 12)
        | (imm & 0x1f) << 7
        | opcode
}

/// B-type: imm[12|10:5] | rs2 | rs1 | funct3 | imm[4:1|11] | opcode
pub fn enc_b(funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | (r(rs2) << 20)
        | (r(rs1) << 15)
        | (funct3 << 12)
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 1) << 7
        | OP_BRANCH
}

/// U-type: imm[31:12] | rd | opcode
pub fn enc_u(opcode: u32, rd: u8, imm: i32) -> u32 {
    (imm as u32 & 0xfffff000) | (r(rd) << 7) | opcode
}

/// J-type: imm[20|10:1|11|19:12] | rd | opcode
pub fn enc_j(rd: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & 0xff) << 12
        | (r(rd) << 7)
        | OP_JAL
}

/// V-type arithmetic: funct6 | vm | vs2 | vs1 | funct3 | vd | 0x57
pub fn enc_v(funct6: u32, funct3: u32, vd: u8, vs1: u8, vs2: u8) -> u32 {
    (funct6 << 26) | (1 << 25) | (r(vs2) << 20) | (r(vs1) << 15) | (funct3 << 12) | (r(vd) << 7)
        | OP_V
}

// Base integer ops.

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(OP_IMM, 0b000, rd, rs1, imm)
}

pub fn addiw(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(OP_IMM_32, 0b000, rd, rs1, imm)
}

pub fn xori(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(OP_IMM, 0b100, rd, rs1, imm)
}

pub fn sltiu(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(OP_IMM, 0b011, rd, rs1, imm)
}

pub fn slli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    enc_i(OP_IMM, 0b001, rd, rs1, shamt as i32)
}

pub fn srli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    enc_i(OP_IMM, 0b101, rd, rs1, shamt as i32)
}

pub fn srai(rd: u8, rs1: u8, shamt: u32) -> u32 {
    enc_i(OP_IMM, 0b101, rd, rs1, (shamt | 0x400) as i32)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b000, 0, rd, rs1, rs2)
}

pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b000, 0x20, rd, rs1, rs2)
}

pub fn and(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b111, 0, rd, rs1, rs2)
}

pub fn or(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b110, 0, rd, rs1, rs2)
}

pub fn xor(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b100, 0, rd, rs1, rs2)
}

pub fn sll(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b001, 0, rd, rs1, rs2)
}

pub fn srl(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b101, 0, rd, rs1, rs2)
}

pub fn sra(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b101, 0x20, rd, rs1, rs2)
}

pub fn slt(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b010, 0, rd, rs1, rs2)
}

pub fn sltu(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b011, 0, rd, rs1, rs2)
}

// M extension (funct7 = 1).

pub fn mul(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b000, 1, rd, rs1, rs2)
}

pub fn div(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b100, 1, rd, rs1, rs2)
}

pub fn rem(rd: u8, rs1: u8, rs2: u8) -> u32 {
    enc_r(OP, 0b110, 1, rd, rs1, rs2)
}

// Memory.

pub fn load(rd: u8, rs1: u8, imm: i32, bytes: u32) -> u32 {
    let funct3 = match bytes {
        1 => 0b000,
        2 => 0b001,
        4 => 0b010,
        _ => 0b011,
    };
    enc_i(OP_LOAD, funct3, rd, rs1, imm)
}

pub fn store(rs1: u8, rs2: u8, imm: i32, bytes: u32) -> u32 {
    let funct3 = match bytes {
        1 => 0b000,
        2 => 0b001,
        4 => 0b010,
        _ => 0b011,
    };
    enc_s(OP_STORE, funct3, rs1, rs2, imm)
}

pub fn ld(rd: u8, rs1: u8, imm: i32) -> u32 {
    load(rd, rs1, imm, 8)
}

pub fn sd(rs1: u8, rs2: u8, imm: i32) -> u32 {
    store(rs1, rs2, imm, 8)
}

// Control transfer.

pub fn lui(rd: u8, imm: i32) -> u32 {
    enc_u(OP_LUI, rd, imm)
}

pub fn auipc(rd: u8, imm: i32) -> u32 {
    enc_u(OP_AUIPC, rd, imm)
}

pub fn jal(rd: u8, imm: i32) -> u32 {
    enc_j(rd, imm)
}

pub fn jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(OP_JALR, 0b000, rd, rs1, imm)
}

pub fn beq(rs1: u8, rs2: u8, imm: i32) -> u32 {
    enc_b(0b000, rs1, rs2, imm)
}

pub fn bne(rs1: u8, rs2: u8, imm: i32) -> u32 {
    enc_b(0b001, rs1, rs2, imm)
}

/// Register-to-register move (`addi rd, rs, 0`).
pub fn mv(rd: u8, rs: u8) -> u32 {
    addi(rd, rs, 0)
}

// D extension, enough to do f64 arithmetic through x-registers.

pub fn fmv_d_x(fd: u8, rs: u8) -> u32 {
    enc_r(OP_FP, 0b000, 0b1111001, fd, rs, 0)
}

pub fn fmv_x_d(rd: u8, fs: u8) -> u32 {
    enc_r(OP_FP, 0b000, 0b1110001, rd, fs, 0)
}

pub fn fadd_d(fd: u8, fs1: u8, fs2: u8) -> u32 {
    enc_r(OP_FP, 0b111, 0b0000001, fd, fs1, fs2)
}

pub fn fsub_d(fd: u8, fs1: u8, fs2: u8) -> u32 {
    enc_r(OP_FP, 0b111, 0b0000101, fd, fs1, fs2)
}

pub fn fmul_d(fd: u8, fs1: u8, fs2: u8) -> u32 {
    enc_r(OP_FP, 0b111, 0b0001001, fd, fs1, fs2)
}

pub fn fdiv_d(fd: u8, fs1: u8, fs2: u8) -> u32 {
    enc_r(OP_FP, 0b111, 0b0001101, fd, fs1, fs2)
}

/// Signed 64-bit integer to f64 (`fcvt.d.l`).
pub fn fcvt_d_l(fd: u8, rs: u8) -> u32 {
    enc_r(OP_FP, 0b111, 0b1101001, fd, rs, 2)
}

/// f64 to signed 64-bit integer, round toward zero (`fcvt.l.d`).
pub fn fcvt_l_d(rd: u8, fs: u8) -> u32 {
    enc_r(OP_FP, 0b001, 0b1100001, rd, fs, 2)
}

// V extension, fixed e64/m1 configuration.

/// `vsetivli zero, avl, e64m1`: vtype zimm=0x18, immediate AVL.
pub fn vsetivli_e64m1(avl: u32) -> u32 {
    (0b11 << 30) | (0x18 << 20) | ((avl & 0x1f) << 15) | (0b111 << 12) | OP_V
}

/// `vle64.v vd, (rs1)`
pub fn vle64(vd: u8, rs1: u8) -> u32 {
    (1 << 25) | (r(rs1) << 15) | (0b111 << 12) | (r(vd) << 7) | OP_LOAD_V
}

/// `vse64.v vs3, (rs1)`
pub fn vse64(vs3: u8, rs1: u8) -> u32 {
    (1 << 25) | (r(rs1) << 15) | (0b111 << 12) | (r(vs3) << 7) | OP_STORE_V
}

/// `vadd.vv vd, vs2, vs1`
pub fn vadd_vv(vd: u8, vs2: u8, vs1: u8) -> u32 {
    enc_v(0b000000, 0b000, vd, vs1, vs2)
}

/// `vsub.vv vd, vs2, vs1`
pub fn vsub_vv(vd: u8, vs2: u8, vs1: u8) -> u32 {
    enc_v(0b000010, 0b000, vd, vs1, vs2)
}

/// `vmul.vv vd, vs2, vs1` (OPMVV)
pub fn vmul_vv(vd: u8, vs2: u8, vs1: u8) -> u32 {
    enc_v(0b100101, 0b010, vd, vs1, vs2)
}

/// Materialize an arbitrary signed 64-bit constant into `rd`.
pub fn li(out: &mut Vec<u32>, rd: u8, imm: i64) {
    if (-2048..2048).contains(&imm) {
        out.push(addi(rd, ZERO, imm as i32));
        return;
    }
    if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
        let imm = imm as i32;
        let hi = imm.wrapping_add(0x800) & !0xfff;
        let lo = imm.wrapping_sub(hi);
        out.push(lui(rd, hi));
        if lo != 0 {
            out.push(addiw(rd, rd, lo));
        }
        return;
    }
    // wide constant: build the upper bits, shift, add the low 12
    let lo = (imm << 52) >> 52;
    let hi = (imm - lo) >> 12;
    li(out, rd, hi);
    out.push(slli(rd, rd, 12));
    if lo != 0 {
        out.push(addi(rd, rd, lo as i32));
    }
}
