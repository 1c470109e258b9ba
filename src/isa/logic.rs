//! Bit-level instructions: TEST, the shift/rotate group, and SETcc.
//!
//! The OR/AND/XOR rows share the ALU machinery in `arith`; what lives here
//! is everything whose flag behavior differs from the plain ALU pattern.

use crate::error::Result;
use crate::flags::{
    self, eval_cc, flags_logic, flags_shift, update_status, OperandSize,
};
use crate::isa::encoding::{read_imm_for, OperandShape};
use crate::isa::operands::{read_rm, rm_operand, write_rm, RmRef};
use crate::isa::{Instruction, InstructionSet, Runtime, Status};

/// Register TEST, shifts/rotates, and SETcc.
pub fn register(set: &mut InstructionSet) {
    set.register(&[&[0x84], &[0x85]], Box::new(TestRmR));
    set.register(&[&[0xA8], &[0xA9]], Box::new(TestAlImm));
    set.register(
        &[&[0xC0], &[0xC1], &[0xD0], &[0xD1], &[0xD2], &[0xD3]],
        Box::new(ShiftGroup),
    );

    let sigs: Vec<[u8; 2]> = (0x90u8..=0x9F).map(|b| [0x0F, b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(SetCc));
}

/// `TEST r/m, r` (84/85).
struct TestRmR;

impl Instruction for TestRmR {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = if opcodes[0] == 0x84 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let a = read_rm(rt.cpu, rt.mem, &rm, size)?;
        let b = read_rm(
            rt.cpu,
            rt.mem,
            &RmRef::Reg(m.reg(rt.cpu.prefixes.rex_r())),
            size,
        )?;
        let f = flags_logic(a & b, size);
        update_status(&mut rt.cpu.regs.rflags, f);
        Ok(Status::Success)
    }
}

/// `TEST AL/eAX, imm` (A8/A9).
struct TestAlImm;

impl Instruction for TestAlImm {
    fn shape(&self, sig: &[u8]) -> OperandShape {
        if sig[0] == 0xA8 {
            OperandShape::Imm8
        } else {
            OperandShape::Imm
        }
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let (size, imm) = if opcodes[0] == 0xA8 {
            (OperandSize::Byte, opcodes[1] as u64)
        } else {
            let size = rt.cpu.operand_size();
            (size, read_imm_for(size, &opcodes[1..]))
        };
        let a = rt
            .cpu
            .regs
            .read_sized(0, size, rt.cpu.prefixes.rex_present);
        let f = flags_logic(a & imm, size);
        update_status(&mut rt.cpu.regs.rflags, f);
        Ok(Status::Success)
    }
}

// ── Group 2: rotates and shifts ──

/// ROL/ROR/RCL/RCR/SHL/SHR/SAR selected by the ModR/M reg field.
struct ShiftGroup;

impl Instruction for ShiftGroup {
    fn shape(&self, sig: &[u8]) -> OperandShape {
        match sig[0] {
            0xC0 | 0xC1 => OperandShape::ModRmImm8,
            _ => OperandShape::ModRm,
        }
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let opcode = opcodes[0];
        let size = if opcode & 1 == 0 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;

        let raw_count = match opcode {
            0xC0 | 0xC1 => opcodes[1 + m.consumed] as u64,
            0xD0 | 0xD1 => 1,
            _ => rt.cpu.regs.gpr[1] & 0xFF, // CL
        };
        let count_mask = if size == OperandSize::Qword { 63 } else { 31 };
        let count = (raw_count & count_mask) as u32;

        let val = read_rm(rt.cpu, rt.mem, &rm, size)? & size.mask();
        let op = m.reg(false) & 7;
        let (res, wrote_flags) = shift_rotate(rt, op, val, count, size)?;
        if wrote_flags || count != 0 {
            write_rm(rt.cpu, rt.mem, &rm, size, res)?;
        }
        Ok(Status::Success)
    }
}

/// Execute one shift/rotate. Returns `(result, flags_written)`.
fn shift_rotate(
    rt: &mut Runtime<'_>,
    op: u8,
    val: u64,
    count: u32,
    size: OperandSize,
) -> Result<(u64, bool)> {
    if count == 0 {
        return Ok((val, false));
    }
    let bits = size.bits();
    let sign = size.sign_bit();
    let rflags = &mut rt.cpu.regs.rflags;

    match op {
        0 => {
            // ROL: rotate left; CF = low result bit; OF (count 1) = CF ^ MSB.
            let c = count % bits;
            let res = if c == 0 {
                val
            } else {
                ((val << c) | (val >> (bits - c))) & size.mask()
            };
            let cf = (res & 1) != 0;
            let of = cf != ((res & sign) != 0);
            set_rotate_flags(rflags, cf, count == 1, of);
            Ok((res, true))
        }
        1 => {
            // ROR: rotate right; CF = MSB of result.
            let c = count % bits;
            let res = if c == 0 {
                val
            } else {
                ((val >> c) | (val << (bits - c))) & size.mask()
            };
            let cf = (res & sign) != 0;
            let of = ((res & sign) != 0) != ((res & (sign >> 1)) != 0);
            set_rotate_flags(rflags, cf, count == 1, of);
            Ok((res, true))
        }
        2 => {
            // RCL: rotate through carry.
            let mut v = val;
            let mut cf = (*rflags & flags::CF) != 0;
            for _ in 0..count % (bits + 1) {
                let new_cf = (v & sign) != 0;
                v = ((v << 1) | cf as u64) & size.mask();
                cf = new_cf;
            }
            let of = cf != ((v & sign) != 0);
            set_rotate_flags(rflags, cf, count == 1, of);
            Ok((v, true))
        }
        3 => {
            // RCR: rotate right through carry.
            let mut v = val;
            let mut cf = (*rflags & flags::CF) != 0;
            for _ in 0..count % (bits + 1) {
                let new_cf = (v & 1) != 0;
                v = (v >> 1) | ((cf as u64) << (bits - 1));
                cf = new_cf;
            }
            let of = ((v & sign) != 0) != ((v & (sign >> 1)) != 0);
            set_rotate_flags(rflags, cf, count == 1, of);
            Ok((v, true))
        }
        4 | 6 => {
            // SHL.
            let (res, cf) = if count >= bits {
                (0, count == bits && (val & 1) != 0)
            } else {
                (
                    (val << count) & size.mask(),
                    (val >> (bits - count)) & 1 != 0,
                )
            };
            let of = cf != ((res & sign) != 0);
            let f = flags_shift(res, cf, count == 1 && of, size);
            update_status(rflags, preserve_of_if_multi(*rflags, f, count));
            Ok((res, true))
        }
        5 => {
            // SHR.
            let (res, cf) = if count >= bits {
                (0, count == bits && (val & sign) != 0)
            } else {
                ((val >> count), (val >> (count - 1)) & 1 != 0)
            };
            let of = (val & sign) != 0;
            let f = flags_shift(res, cf, count == 1 && of, size);
            update_status(rflags, preserve_of_if_multi(*rflags, f, count));
            Ok((res, true))
        }
        _ => {
            // SAR.
            let sval = size.sign_extend(val) as i64;
            let (res, cf) = if count >= bits {
                let filled = (sval >> (bits - 1)) as u64 & size.mask();
                (filled, sval < 0)
            } else {
                (
                    (sval >> count) as u64 & size.mask(),
                    (sval >> (count - 1)) & 1 != 0,
                )
            };
            let f = flags_shift(res, cf, false, size);
            update_status(rflags, f);
            Ok((res, true))
        }
    }
}

/// Rotates touch only CF (always) and OF (count of 1).
fn set_rotate_flags(rflags: &mut u64, cf: bool, single: bool, of: bool) {
    *rflags &= !flags::CF;
    if cf {
        *rflags |= flags::CF;
    }
    if single {
        *rflags &= !flags::OF;
        if of {
            *rflags |= flags::OF;
        }
    }
}

/// For multi-bit shifts OF is undefined; keep the previous value.
fn preserve_of_if_multi(old: u64, mut new: u64, count: u32) -> u64 {
    if count != 1 {
        new = (new & !flags::OF) | (old & flags::OF);
    }
    new
}

// ── SETcc ──

/// `SETcc r/m8` (0F 90-9F).
struct SetCc;

impl Instruction for SetCc {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let cc = opcodes[1] & 0x0F;
        let (rm, _) = rm_operand(rt.cpu, &opcodes[2..])?;
        let v = eval_cc(cc, rt.cpu.regs.rflags) as u64;
        write_rm(rt.cpu, rt.mem, &rm, OperandSize::Byte, v)?;
        Ok(Status::Success)
    }
}
