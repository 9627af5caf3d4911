//! Instruction-level emulator for generated code
//!
//! Executes the subset of RV64IMVD words the backend emits, so compiled
//! functions run on any host. Memory accesses go straight to host memory:
//! the stack pointer starts inside a scratch buffer, argument arrays are
//! real host slices, and loads/stores dereference whatever address the
//! code computed. Jumps that leave the code region are treated as calls
//! into the host and routed through a callback, which lets the engine
//! dispatch to runtime helpers and to other compiled regions.
//!
//! Native execution on a riscv64 host bypasses this module entirely.

use thiserror::Error;

use crate::codegen::encode as e;
use crate::runtime::RtValue;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("trap at code offset {offset:#x}")]
    Trap { offset: usize },
    #[error("illegal instruction {word:#010x} at code offset {offset:#x}")]
    IllegalInstruction { word: u32, offset: usize },
    #[error("program counter {pc:#x} left the code region")]
    PcOutOfRange { pc: u64 },
    #[error("step limit exhausted after {0} instructions")]
    StepLimit(u64),
}

/// Host-call hook: target address plus the six argument registers.
pub type ExternCall<'a> = &'a dyn Fn(u64, [u64; 6]) -> u64;

const STACK_BYTES: usize = 1 << 20;
const STEP_LIMIT: u64 = 50_000_000;
const LANES: usize = 4;

/// Run a compiled region from `entry_offset` with the standard entry ABI
/// (a0 = argument base, a1 = argument count).
pub fn execute(
    code: &[u8],
    entry_offset: usize,
    args: &[RtValue],
    extern_call: ExternCall<'_>,
) -> Result<RtValue, SimError> {
    let mut sim = Simulator::new(code, extern_call);
    sim.x[e::A0 as usize] = args.as_ptr() as u64;
    sim.x[e::A1 as usize] = args.len() as u64;
    sim.run(entry_offset)
}

struct Simulator<'a> {
    code: &'a [u8],
    base: u64,
    x: [u64; 32],
    f: [u64; 32],
    v: [[u64; LANES]; 32],
    vl: usize,
    stack: Vec<u8>,
    extern_call: ExternCall<'a>,
}

impl<'a> Simulator<'a> {
    fn new(code: &'a [u8], extern_call: ExternCall<'a>) -> Self {
        Self {
            code,
            base: code.as_ptr() as u64,
            x: [0; 32],
            f: [0; 32],
            v: [[0; LANES]; 32],
            vl: LANES,
            stack: vec![0u8; STACK_BYTES],
            extern_call,
        }
    }

    fn run(&mut self, entry_offset: usize) -> Result<RtValue, SimError> {
        // 16-aligned top of the scratch stack
        self.x[e::SP as usize] =
            (self.stack.as_ptr() as u64 + self.stack.len() as u64) & !15;
        // ra = 0 marks the outermost frame; returning through it finishes
        self.x[e::RA as usize] = 0;
        let mut pc = self.base + entry_offset as u64;
        let end = self.base + self.code.len() as u64;

        for _ in 0..STEP_LIMIT {
            if pc < self.base || pc + 4 > end || pc % 4 != 0 {
                return Err(SimError::PcOutOfRange { pc });
            }
            let offset = (pc - self.base) as usize;
            let w = u32::from_le_bytes([
                self.code[offset],
                self.code[offset + 1],
                self.code[offset + 2],
                self.code[offset + 3],
            ]);
            match self.step(w, pc, offset)? {
                Flow::Next => pc += 4,
                Flow::Jump(target) => {
                    if target == 0 {
                        return Ok(RtValue(self.x[e::A0 as usize] as i64));
                    }
                    if target < self.base || target >= end {
                        let a = [
                            self.x[10], self.x[11], self.x[12], self.x[13], self.x[14], self.x[15],
                        ];
                        self.x[e::A0 as usize] = (self.extern_call)(target, a);
                        pc = self.x[e::RA as usize];
                        if pc == 0 {
                            return Ok(RtValue(self.x[e::A0 as usize] as i64));
                        }
                    } else {
                        pc = target;
                    }
                }
            }
            self.x[0] = 0;
        }
        Err(SimError::StepLimit(STEP_LIMIT))
    }

    fn step(&mut self, w: u32, pc: u64, offset: usize) -> Result<Flow, SimError> {
        if w == e::EBREAK {
            return Err(SimError::Trap { offset });
        }
        let opcode = w & 0x7f;
        let rd = ((w >> 7) & 0x1f) as usize;
        let rs1 = ((w >> 15) & 0x1f) as usize;
        let rs2 = ((w >> 20) & 0x1f) as usize;
        let funct3 = (w >> 12) & 0x7;
        let funct7 = w >> 25;
        let illegal = || SimError::IllegalInstruction { word: w, offset };

        match opcode {
            e::OP_IMM => {
                let imm = imm_i(w) as i64;
                let a = self.x[rs1] as i64;
                self.x[rd] = match funct3 {
                    0b000 => a.wrapping_add(imm) as u64,
                    0b100 => (a ^ imm) as u64,
                    0b011 => ((self.x[rs1]) < imm as u64) as u64,
                    0b001 => (self.x[rs1]) << (imm & 0x3f),
                    0b101 => {
                        let sh = (imm & 0x3f) as u32;
                        if imm & 0x400 != 0 {
                            (a >> sh) as u64
                        } else {
                            self.x[rs1] >> sh
                        }
                    }
                    _ => return Err(illegal()),
                };
            }
            e::OP_IMM_32 => {
                let imm = imm_i(w);
                match funct3 {
                    0b000 => {
                        self.x[rd] = (self.x[rs1] as i32).wrapping_add(imm) as i64 as u64;
                    }
                    _ => return Err(illegal()),
                }
            }
            e::OP => {
                let a = self.x[rs1];
                let b = self.x[rs2];
                self.x[rd] = match (funct7, funct3) {
                    (0, 0b000) => a.wrapping_add(b),
                    (0x20, 0b000) => a.wrapping_sub(b),
                    (0, 0b111) => a & b,
                    (0, 0b110) => a | b,
                    (0, 0b100) => a ^ b,
                    (0, 0b001) => a << (b & 0x3f),
                    (0, 0b101) => a >> (b & 0x3f),
                    (0x20, 0b101) => ((a as i64) >> (b & 0x3f)) as u64,
                    (0, 0b010) => ((a as i64) < b as i64) as u64,
                    (0, 0b011) => (a < b) as u64,
                    (1, 0b000) => a.wrapping_mul(b),
                    (1, 0b100) => {
                        if b == 0 {
                            u64::MAX
                        } else {
                            (a as i64).wrapping_div(b as i64) as u64
                        }
                    }
                    (1, 0b110) => {
                        if b == 0 {
                            a
                        } else {
                            (a as i64).wrapping_rem(b as i64) as u64
                        }
                    }
                    _ => return Err(illegal()),
                };
            }
            e::OP_LUI => self.x[rd] = imm_u(w) as i64 as u64,
            e::OP_AUIPC => self.x[rd] = pc.wrapping_add(imm_u(w) as i64 as u64),
            e::OP_LOAD => {
                let addr = self.x[rs1].wrapping_add(imm_i(w) as i64 as u64);
                self.x[rd] = unsafe {
                    match funct3 {
                        0b000 => (addr as *const i8).read_unaligned() as i64 as u64,
                        0b001 => (addr as *const i16).read_unaligned() as i64 as u64,
                        0b010 => (addr as *const i32).read_unaligned() as i64 as u64,
                        0b011 => (addr as *const u64).read_unaligned(),
                        _ => return Err(illegal()),
                    }
                };
            }
            e::OP_STORE => {
                let addr = self.x[rs1].wrapping_add(imm_s(w) as i64 as u64);
                let val = self.x[rs2];
                unsafe {
                    match funct3 {
                        0b000 => (addr as *mut u8).write_unaligned(val as u8),
                        0b001 => (addr as *mut u16).write_unaligned(val as u16),
                        0b010 => (addr as *mut u32).write_unaligned(val as u32),
                        0b011 => (addr as *mut u64).write_unaligned(val),
                        _ => return Err(illegal()),
                    }
                }
            }
            e::OP_BRANCH => {
                let taken = match funct3 {
                    0b000 => self.x[rs1] == self.x[rs2],
                    0b001 => self.x[rs1] != self.x[rs2],
                    0b100 => (self.x[rs1] as i64) < self.x[rs2] as i64,
                    0b101 => (self.x[rs1] as i64) >= self.x[rs2] as i64,
                    _ => return Err(illegal()),
                };
                if taken {
                    return Ok(Flow::Jump(pc.wrapping_add(imm_b(w) as i64 as u64)));
                }
            }
            e::OP_JAL => {
                self.x[rd] = pc + 4;
                self.x[0] = 0;
                return Ok(Flow::Jump(pc.wrapping_add(imm_j(w) as i64 as u64)));
            }
            e::OP_JALR => {
                let target = self.x[rs1].wrapping_add(imm_i(w) as i64 as u64) & !1;
                self.x[rd] = pc + 4;
                self.x[0] = 0;
                return Ok(Flow::Jump(target));
            }
            e::OP_FP => match funct7 {
                0b1111001 => self.f[rd] = self.x[rs1],
                0b1110001 => self.x[rd] = self.f[rs1],
                0b1101001 => self.f[rd] = (self.x[rs1] as i64 as f64).to_bits(),
                0b1100001 => self.x[rd] = f64::from_bits(self.f[rs1]) as i64 as u64,
                0b0000001 | 0b0000101 | 0b0001001 | 0b0001101 => {
                    let a = f64::from_bits(self.f[rs1]);
                    let b = f64::from_bits(self.f[rs2]);
                    let r = match funct7 {
                        0b0000001 => a + b,
                        0b0000101 => a - b,
                        0b0001001 => a * b,
                        _ => a / b,
                    };
                    self.f[rd] = r.to_bits();
                }
                _ => return Err(illegal()),
            },
            e::OP_V => {
                if funct3 == 0b111 {
                    // vsetivli with e64/m1 is the only config the backend uses
                    let avl = ((w >> 15) & 0x1f) as usize;
                    self.vl = avl.min(LANES);
                } else {
                    let funct6 = w >> 26;
                    let lanes = self.vl;
                    for i in 0..lanes {
                        let a = self.v[rs1][i];
                        let b = self.v[rs2][i];
                        self.v[rd][i] = match (funct6, funct3) {
                            (0b000000, 0b000) => b.wrapping_add(a),
                            (0b000010, 0b000) => b.wrapping_sub(a),
                            (0b100101, 0b010) => b.wrapping_mul(a),
                            _ => return Err(illegal()),
                        };
                    }
                }
            }
            e::OP_LOAD_V => {
                let addr = self.x[rs1];
                for i in 0..self.vl {
                    self.v[rd][i] =
                        unsafe { ((addr + (i * 8) as u64) as *const u64).read_unaligned() };
                }
            }
            e::OP_STORE_V => {
                let addr = self.x[rs1];
                for i in 0..self.vl {
                    unsafe { ((addr + (i * 8) as u64) as *mut u64).write_unaligned(self.v[rd][i]) };
                }
            }
            _ => return Err(illegal()),
        }
        Ok(Flow::Next)
    }
}

enum Flow {
    Next,
    Jump(u64),
}

fn imm_i(w: u32) -> i32 {
    (w as i32) >> 20
}

fn imm_s(w: u32) -> i32 {
    (((w as i32) >> 25) << 5) | (((w >> 7) & 0x1f) as i32)
}

fn imm_b(w: u32) -> i32 {
    let sign = (w as i32) >> 31;
    let b11 = ((w >> 7) & 1) as i32;
    let hi = ((w >> 25) & 0x3f) as i32;
    let lo = ((w >> 8) & 0xf) as i32;
    (sign << 12) | (b11 << 11) | (hi << 5) | (lo << 1)
}

fn imm_u(w: u32) -> i32 {
    (w & 0xffff_f000) as i32
}

fn imm_j(w: u32) -> i32 {
    let sign = (w as i32) >> 31;
    let b19_12 = ((w >> 12) & 0xff) as i32;
    let b11 = ((w >> 20) & 1) as i32;
    let b10_1 = ((w >> 21) & 0x3ff) as i32;
    (sign << 20) | (b19_12 << 12) | (b11 << 11) | (b10_1 << 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes(words: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(words.len() * 4);
        for w in words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn no_extern(_: u64, _: [u64; 6]) -> u64 {
        panic!("unexpected host call")
    }

    fn run(words: &[u32], args: &[RtValue]) -> RtValue {
        let code = to_bytes(words);
        execute(&code, 0, args, &no_extern).expect("sim")
    }

    #[test]
    fn test_arithmetic_and_return() {
        // a0 = 40 + 2
        let mut body = Vec::new();
        e::li(&mut body, e::T0, 40);
        body.push(e::addi(e::A0, e::T0, 2));
        body.push(e::jalr(e::ZERO, e::RA, 0));
        assert_eq!(run(&body, &[]).as_i64(), 42);
    }

    #[test]
    fn test_entry_abi_reads_argument_array() {
        // a0 = args[0] + args[1]
        let words = vec![
            e::ld(e::T0, e::A0, 0),
            e::ld(e::T1, e::A0, 8),
            e::add(e::A0, e::T0, e::T1),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        let args = [RtValue(7), RtValue(35)];
        assert_eq!(run(&words, &args).as_i64(), 42);
    }

    #[test]
    fn test_branch_loop_sums() {
        // t0 = 0; t1 = 5; while t1 != 0 { t0 += t1; t1 -= 1 }; a0 = t0
        let words = vec![
            e::addi(e::T0, e::ZERO, 0),
            e::addi(e::T1, e::ZERO, 5),
            e::beq(e::T1, e::ZERO, 16),
            e::add(e::T0, e::T0, e::T1),
            e::addi(e::T1, e::T1, -1),
            e::jal(e::ZERO, -12),
            e::mv(e::A0, e::T0),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        assert_eq!(run(&words, &[]).as_i64(), 15);
    }

    #[test]
    fn test_stack_memory_round_trip() {
        let words = vec![
            e::addi(e::SP, e::SP, -16),
            e::addi(e::T0, e::ZERO, 99),
            e::sd(e::SP, e::T0, 8),
            e::ld(e::A0, e::SP, 8),
            e::addi(e::SP, e::SP, 16),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        assert_eq!(run(&words, &[]).as_i64(), 99);
    }

    #[test]
    fn test_float_add() {
        // 1.5 + 2.25 through the x-register float path
        let mut body = Vec::new();
        e::li(&mut body, e::T0, f64::to_bits(1.5) as i64);
        e::li(&mut body, e::T1, f64::to_bits(2.25) as i64);
        body.push(e::fmv_d_x(e::FT0, e::T0));
        body.push(e::fmv_d_x(e::FT1, e::T1));
        body.push(e::fadd_d(e::FT0, e::FT0, e::FT1));
        body.push(e::fmv_x_d(e::A0, e::FT0));
        body.push(e::jalr(e::ZERO, e::RA, 0));
        let bits = run(&body, &[]).as_i64() as u64;
        assert_eq!(f64::from_bits(bits), 3.75);
    }

    #[test]
    fn test_int_float_conversions() {
        let words = vec![
            e::addi(e::T0, e::ZERO, -7),
            e::fcvt_d_l(e::FT0, e::T0),
            e::fcvt_l_d(e::A0, e::FT0),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        assert_eq!(run(&words, &[]).as_i64(), -7);
    }

    #[test]
    fn test_vector_lane_add() {
        // args[0] points at a buffer; double its 4 lanes in place
        let mut buf = [1i64, 2, 3, 4];
        let args = [RtValue(buf.as_mut_ptr() as i64)];
        let words = vec![
            e::ld(e::T0, e::A0, 0),
            e::vsetivli_e64m1(4),
            e::vle64(1, e::T0),
            e::vadd_vv(2, 1, 1),
            e::vse64(2, e::T0),
            e::mv(e::A0, e::ZERO),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        let code = to_bytes(&words);
        execute(&code, 0, &args, &no_extern).expect("sim");
        assert_eq!(buf, [2, 4, 6, 8]);
    }

    #[test]
    fn test_external_call_dispatch() {
        // call an out-of-region address; the hook doubles a0
        let target: u64 = 0x7000_0000_0000;
        let hook = move |addr: u64, a: [u64; 6]| {
            assert_eq!(addr, target);
            a[0] * 2
        };
        let mut body = Vec::new();
        e::li(&mut body, e::A0, 21);
        e::li(&mut body, e::T0, target as i64);
        body.push(e::jalr(e::RA, e::T0, 0));
        body.push(e::jalr(e::ZERO, e::RA, 0));
        let code = to_bytes(&body);
        let got = execute(&code, 0, &[], &hook).expect("sim");
        assert_eq!(got.as_i64(), 42);
    }

    #[test]
    fn test_ebreak_traps() {
        let code = to_bytes(&[e::EBREAK]);
        let err = execute(&code, 0, &[], &no_extern).unwrap_err();
        assert!(matches!(err, SimError::Trap { offset: 0 }));
    }

    #[test]
    fn test_division_by_zero_follows_hardware() {
        let words = vec![
            e::addi(e::T0, e::ZERO, 9),
            e::addi(e::T1, e::ZERO, 0),
            e::div(e::A0, e::T0, e::T1),
            e::jalr(e::ZERO, e::RA, 0),
        ];
        assert_eq!(run(&words, &[]).as_i64(), -1);
    }
}
