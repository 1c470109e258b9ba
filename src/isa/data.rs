//! Data movement: the MOV family, LEA, XCHG, and the widening moves.

use crate::cpu::CpuMode;
use crate::error::{Result, VmError};
use crate::flags::OperandSize;
use crate::isa::encoding::{read_imm, read_imm_for, OperandShape};
use crate::isa::operands::{read_rm, rm_operand, write_rm, RmRef};
use crate::isa::{load_segment, Instruction, InstructionSet, Runtime, Status};
use crate::registers::SegReg;

/// Register the data-movement handlers.
pub fn register(set: &mut InstructionSet) {
    set.register(&[&[0x88], &[0x89], &[0x8A], &[0x8B]], Box::new(MovRmR));

    let sigs: Vec<[u8; 1]> = (0xB0u8..=0xBF).map(|b| [b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(MovRegImm));

    set.register(&[&[0xC6], &[0xC7]], Box::new(MovRmImm));
    set.register(&[&[0xA0], &[0xA1], &[0xA2], &[0xA3]], Box::new(MovMoffs));
    set.register(&[&[0x8C], &[0x8E]], Box::new(MovSeg));
    set.register(&[&[0x8D]], Box::new(Lea));
    set.register(&[&[0x86], &[0x87]], Box::new(XchgRmR));

    let sigs: Vec<[u8; 1]> = (0x91u8..=0x97).map(|b| [b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(XchgAxReg));

    set.register(&[&[0x90]], Box::new(Nop));
    set.register(
        &[&[0x0F, 0xB6], &[0x0F, 0xB7], &[0x0F, 0xBE], &[0x0F, 0xBF]],
        Box::new(MovExtend),
    );
    set.register(&[&[0x63]], Box::new(Movsxd));
}

/// `MOV r/m,r` / `MOV r,r/m` (88/89/8A/8B).
struct MovRmR;

impl Instruction for MovRmR {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[0];
        let size = if op & 1 == 0 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let reg = RmRef::Reg(m.reg(rt.cpu.prefixes.rex_r()));
        let (dst, src) = if op < 0x8A { (rm, reg) } else { (reg, rm) };
        let v = read_rm(rt.cpu, rt.mem, &src, size)?;
        write_rm(rt.cpu, rt.mem, &dst, size, v)?;
        Ok(Status::Success)
    }
}

/// `MOV r, imm` (B0-BF). The wide row takes a full operand-size immediate,
/// which is how `MOV r64, imm64` carries 8 bytes.
struct MovRegImm;

impl Instruction for MovRegImm {
    fn shape(&self, sig: &[u8]) -> OperandShape {
        if sig[0] < 0xB8 {
            OperandShape::Imm8
        } else {
            OperandShape::ImmFull
        }
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[0];
        let rex = rt.cpu.prefixes.rex_present;
        let rex_b = rt.cpu.prefixes.rex_b();
        if op < 0xB8 {
            let reg = (op & 7) | if rex_b { 8 } else { 0 };
            rt.cpu
                .regs
                .write_sized(reg, OperandSize::Byte, rex, opcodes[1] as u64);
        } else {
            let size = rt.cpu.operand_size();
            let reg = (op & 7) | if rex_b { 8 } else { 0 };
            let v = read_imm(&opcodes[1..], size.bytes());
            rt.cpu.regs.write_sized(reg, size, rex, v);
        }
        Ok(Status::Success)
    }
}

/// `MOV r/m, imm` (C6/C7).
struct MovRmImm;

impl Instruction for MovRmImm {
    fn shape(&self, sig: &[u8]) -> OperandShape {
        if sig[0] == 0xC6 {
            OperandShape::ModRmImm8
        } else {
            OperandShape::ModRmImm
        }
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = if opcodes[0] == 0xC6 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let imm_at = 1 + m.consumed;
        let v = if opcodes[0] == 0xC6 {
            opcodes[imm_at] as u64
        } else {
            read_imm_for(size, &opcodes[imm_at..])
        };
        write_rm(rt.cpu, rt.mem, &rm, size, v)?;
        Ok(Status::Success)
    }
}

/// `MOV AL/eAX, moffs` and back (A0-A3).
struct MovMoffs;

impl Instruction for MovMoffs {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Moffs
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[0];
        let size = if op & 1 == 0 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let addr = rt.cpu.address_size();
        let offset = read_imm(&opcodes[1..], addr.bytes()) & addr.mask();
        let seg = rt.cpu.prefixes.seg_override.unwrap_or(SegReg::Ds);
        let linear = rt.cpu.regs.seg[seg as usize].base.wrapping_add(offset);
        let rex = rt.cpu.prefixes.rex_present;

        if op < 0xA2 {
            let v = rt.mem.read_sized(linear, size.bytes())?;
            rt.cpu.regs.write_sized(0, size, rex, v);
        } else {
            let v = rt.cpu.regs.read_sized(0, size, rex);
            rt.mem.write_sized(linear, size.bytes(), v)?;
        }
        Ok(Status::Success)
    }
}

/// `MOV r/m16, Sreg` / `MOV Sreg, r/m16` (8C/8E).
struct MovSeg;

impl Instruction for MovSeg {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let seg = SegReg::from_encoding(m.reg(false))
            .ok_or(VmError::UndefinedOpcode(opcodes[0]))?;

        if opcodes[0] == 0x8C {
            let sel = rt.cpu.regs.seg[seg as usize].selector as u64;
            write_rm(rt.cpu, rt.mem, &rm, OperandSize::Word, sel)?;
        } else {
            if seg == SegReg::Cs {
                return Err(VmError::UndefinedOpcode(opcodes[0]));
            }
            let sel = read_rm(rt.cpu, rt.mem, &rm, OperandSize::Word)? as u16;
            load_segment(rt, seg, sel)?;
        }
        Ok(Status::Success)
    }
}

/// `LEA r, m` (8D) — the effective offset, no segmentation, no access.
struct Lea;

impl Instruction for Lea {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = rt.cpu.operand_size();
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let offset = match rm {
            RmRef::Mem { offset, .. } => offset,
            RmRef::Reg(_) => return Err(VmError::UndefinedOpcode(0x8D)),
        };
        let reg = m.reg(rt.cpu.prefixes.rex_r());
        let rex = rt.cpu.prefixes.rex_present;
        rt.cpu.regs.write_sized(reg, size, rex, offset);
        Ok(Status::Success)
    }
}

/// `XCHG r/m, r` (86/87).
struct XchgRmR;

impl Instruction for XchgRmR {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = if opcodes[0] == 0x86 {
            OperandSize::Byte
        } else {
            rt.cpu.operand_size()
        };
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let reg = RmRef::Reg(m.reg(rt.cpu.prefixes.rex_r()));
        let a = read_rm(rt.cpu, rt.mem, &rm, size)?;
        let b = read_rm(rt.cpu, rt.mem, &reg, size)?;
        write_rm(rt.cpu, rt.mem, &rm, size, b)?;
        write_rm(rt.cpu, rt.mem, &reg, size, a)?;
        Ok(Status::Success)
    }
}

/// `XCHG eAX, r` (91-97).
struct XchgAxReg;

impl Instruction for XchgAxReg {
    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = rt.cpu.operand_size();
        let rex = rt.cpu.prefixes.rex_present;
        let reg = (opcodes[0] & 7) | if rt.cpu.prefixes.rex_b() { 8 } else { 0 };
        let a = rt.cpu.regs.read_sized(0, size, rex);
        let b = rt.cpu.regs.read_sized(reg, size, rex);
        rt.cpu.regs.write_sized(0, size, rex, b);
        rt.cpu.regs.write_sized(reg, size, rex, a);
        Ok(Status::Success)
    }
}

/// `NOP` (90; also `XCHG eAX, eAX`).
struct Nop;

impl Instruction for Nop {
    fn process(&self, _rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        Ok(Status::Success)
    }
}

/// `MOVZX` / `MOVSX` (0F B6/B7/BE/BF).
struct MovExtend;

impl Instruction for MovExtend {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[1];
        let src_size = if op & 1 == 0 {
            OperandSize::Byte
        } else {
            OperandSize::Word
        };
        let dst_size = rt.cpu.operand_size();
        let (rm, m) = rm_operand(rt.cpu, &opcodes[2..])?;
        let raw = read_rm(rt.cpu, rt.mem, &rm, src_size)?;
        let v = if op >= 0xBE {
            src_size.sign_extend(raw) & dst_size.mask()
        } else {
            raw
        };
        let reg = m.reg(rt.cpu.prefixes.rex_r());
        let rex = rt.cpu.prefixes.rex_present;
        rt.cpu.regs.write_sized(reg, dst_size, rex, v);
        Ok(Status::Success)
    }
}

/// `MOVSXD r64, r/m32` (63, long mode only).
struct Movsxd;

impl Instruction for Movsxd {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn available(&self, mode: CpuMode) -> bool {
        mode == CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        let raw = read_rm(rt.cpu, rt.mem, &rm, OperandSize::Dword)?;
        let v = OperandSize::Dword.sign_extend(raw);
        let reg = m.reg(rt.cpu.prefixes.rex_r());
        rt.cpu.regs.write_sized(reg, OperandSize::Qword, true, v);
        Ok(Status::Success)
    }
}
