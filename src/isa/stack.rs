//! Stack instructions and the shared push/pop primitives.
//!
//! The stack pointer is masked to the stack width chosen by the mode and
//! the SS descriptor's D/B bit; pushed values use the operand size (which
//! defaults to 64-bit in long mode, where 32-bit pushes do not exist).

use crate::cpu::CpuMode;
use crate::error::Result;
use crate::flags::{self, OperandSize, RFLAGS_FIXED};
use crate::isa::encoding::{read_imm, OperandShape};
use crate::isa::{Instruction, InstructionSet, Runtime, Status};
use crate::registers::{Gpr, SegReg};

/// Register the stack handlers.
pub fn register(set: &mut InstructionSet) {
    let sigs: Vec<[u8; 1]> = (0x50u8..=0x5F).map(|b| [b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(PushPopReg));

    set.register(&[&[0x68], &[0x6A]], Box::new(PushImm));
    set.register(&[&[0x9C]], Box::new(Pushf));
    set.register(&[&[0x9D]], Box::new(Popf));
    set.register(&[&[0x06], &[0x0E], &[0x16], &[0x1E]], Box::new(PushSeg));
    set.register(&[&[0x07], &[0x17], &[0x1F]], Box::new(PopSeg));
}

/// Push operand width: long mode promotes to 64-bit unless 0x66 narrows.
pub(crate) fn push_size(rt: &Runtime<'_>) -> OperandSize {
    if rt.cpu.mode == CpuMode::Long64 {
        if rt.cpu.prefixes.operand_size {
            OperandSize::Word
        } else {
            OperandSize::Qword
        }
    } else {
        rt.cpu.operand_size()
    }
}

/// Push `val` at the given width onto the guest stack.
pub fn push(rt: &mut Runtime<'_>, size: OperandSize, val: u64) -> Result<()> {
    let sp_size = rt.cpu.stack_size();
    let sp = rt.cpu.regs.read_sized(Gpr::Rsp as u8, sp_size, true);
    let new_sp = sp.wrapping_sub(size.bytes()) & sp_size.mask();
    let base = rt.cpu.regs.seg[SegReg::Ss as usize].base;
    rt.mem
        .write_sized(base.wrapping_add(new_sp), size.bytes(), val)?;
    rt.cpu.regs.write_sized(Gpr::Rsp as u8, sp_size, true, new_sp);
    Ok(())
}

/// Pop a value of the given width off the guest stack.
pub fn pop(rt: &mut Runtime<'_>, size: OperandSize) -> Result<u64> {
    let sp_size = rt.cpu.stack_size();
    let sp = rt.cpu.regs.read_sized(Gpr::Rsp as u8, sp_size, true);
    let base = rt.cpu.regs.seg[SegReg::Ss as usize].base;
    let val = rt.mem.read_sized(base.wrapping_add(sp), size.bytes())?;
    let new_sp = sp.wrapping_add(size.bytes()) & sp_size.mask();
    rt.cpu.regs.write_sized(Gpr::Rsp as u8, sp_size, true, new_sp);
    Ok(val)
}

/// `PUSH r` / `POP r` (50-5F).
struct PushPopReg;

impl Instruction for PushPopReg {
    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[0];
        let reg = (op & 7) | if rt.cpu.prefixes.rex_b() { 8 } else { 0 };
        let size = push_size(rt);
        if op < 0x58 {
            let v = rt.cpu.regs.read_sized(reg, size, true);
            push(rt, size, v)?;
        } else {
            let v = pop(rt, size)?;
            rt.cpu.regs.write_sized(reg, size, true, v);
        }
        Ok(Status::Success)
    }
}

/// `PUSH imm` (68 imm, 6A imm8 sign-extended).
struct PushImm;

impl Instruction for PushImm {
    fn shape(&self, sig: &[u8]) -> OperandShape {
        if sig[0] == 0x68 {
            OperandShape::Imm
        } else {
            OperandShape::Imm8
        }
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = push_size(rt);
        let v = if opcodes[0] == 0x68 {
            let imm_size = if rt.cpu.operand_size() == OperandSize::Word {
                OperandSize::Word
            } else {
                OperandSize::Dword
            };
            imm_size.sign_extend(read_imm(&opcodes[1..], imm_size.bytes()))
        } else {
            opcodes[1] as i8 as i64 as u64
        };
        push(rt, size, v & size.mask())?;
        Ok(Status::Success)
    }
}

/// `PUSHF` (9C).
struct Pushf;

impl Instruction for Pushf {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        let size = push_size(rt);
        let v = (rt.cpu.regs.rflags | RFLAGS_FIXED) & !(flags::RF | flags::VM);
        push(rt, size, v & size.mask())?;
        Ok(Status::Success)
    }
}

/// `POPF` (9D).
struct Popf;

impl Instruction for Popf {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        let size = push_size(rt);
        let v = pop(rt, size)?;
        let keep_mask = !size.mask();
        rt.cpu.regs.rflags =
            ((rt.cpu.regs.rflags & keep_mask) | (v & size.mask()) | RFLAGS_FIXED) & !(1 << 3) & !(1 << 5);
        Ok(Status::Success)
    }
}

/// `PUSH Sreg` (06/0E/16/1E, not in long mode).
struct PushSeg;

impl Instruction for PushSeg {
    fn available(&self, mode: CpuMode) -> bool {
        mode != CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let seg = match opcodes[0] {
            0x06 => SegReg::Es,
            0x0E => SegReg::Cs,
            0x16 => SegReg::Ss,
            _ => SegReg::Ds,
        };
        let size = push_size(rt);
        let sel = rt.cpu.regs.seg[seg as usize].selector as u64;
        push(rt, size, sel)?;
        Ok(Status::Success)
    }
}

/// `POP Sreg` (07/17/1F, not in long mode).
struct PopSeg;

impl Instruction for PopSeg {
    fn available(&self, mode: CpuMode) -> bool {
        mode != CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let seg = match opcodes[0] {
            0x07 => SegReg::Es,
            0x17 => SegReg::Ss,
            _ => SegReg::Ds,
        };
        let size = push_size(rt);
        let sel = pop(rt, size)? as u16;
        crate::isa::load_segment(rt, seg, sel)?;
        Ok(Status::Success)
    }
}
