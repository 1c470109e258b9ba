//! Control transfer instructions.
//!
//! RIP already points at the next sequential instruction when a handler
//! runs, so relative branches add their displacement to it directly. Near
//! branch targets are truncated to the operand size outside long mode.

use crate::cpu::CpuMode;
use crate::error::{Result, VmError};
use crate::flags::{self, eval_cc, OperandSize, RFLAGS_FIXED};
use crate::isa::arith::inc_dec_rm;
use crate::isa::encoding::{read_imm, OperandShape};
use crate::isa::operands::{read_rm, rm_operand, RmRef};
use crate::isa::stack::{pop, push, push_size};
use crate::isa::{load_segment, Instruction, InstructionSet, Runtime, Status};
use crate::registers::{Gpr, SegReg};

/// Register the control-transfer handlers.
pub fn register(set: &mut InstructionSet) {
    let sigs: Vec<[u8; 1]> = (0x70u8..=0x7F).map(|b| [b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(JccShort));

    let sigs: Vec<[u8; 2]> = (0x80u8..=0x8F).map(|b| [0x0F, b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(JccNear));

    set.register(&[&[0xEB]], Box::new(JmpShort));
    set.register(&[&[0xE9]], Box::new(JmpNear));
    set.register(&[&[0xE8]], Box::new(CallNear));
    set.register(&[&[0xC3]], Box::new(RetNear));
    set.register(&[&[0xC2]], Box::new(RetNearImm));
    set.register(&[&[0xEA]], Box::new(JmpFar));
    set.register(&[&[0x9A]], Box::new(CallFar));
    set.register(&[&[0xCB]], Box::new(RetFar));
    set.register(&[&[0xE0], &[0xE1], &[0xE2], &[0xE3]], Box::new(LoopFamily));
    set.register(&[&[0xFF]], Box::new(Group5));
    set.register(&[&[0xCC]], Box::new(Int3));
    set.register(&[&[0xCD]], Box::new(IntImm));
    set.register(&[&[0xCE]], Box::new(IntO));
    set.register(&[&[0xCF]], Box::new(Iret));
    set.register(&[&[0xF4]], Box::new(Hlt));
}

/// Truncate a near branch target to the in-force instruction width.
fn branch_mask(cpu: &crate::cpu::Cpu) -> u64 {
    match cpu.mode {
        CpuMode::Long64 => u64::MAX,
        _ => {
            if cpu.operand_size() == OperandSize::Word {
                0xFFFF
            } else {
                0xFFFF_FFFF
            }
        }
    }
}

/// Apply a relative displacement to RIP.
pub(crate) fn branch_rel(cpu: &mut crate::cpu::Cpu, disp: i64) {
    cpu.regs.rip = cpu.regs.rip.wrapping_add(disp as u64) & branch_mask(cpu);
}

/// Read the relative displacement of a `Rel`-shaped instruction.
fn rel_operand(rt: &Runtime<'_>, bytes: &[u8]) -> i64 {
    if rt.cpu.mode == CpuMode::Long64 || rt.cpu.operand_size() != OperandSize::Word {
        read_imm(bytes, 4) as u32 as i32 as i64
    } else {
        read_imm(bytes, 2) as u16 as i16 as i64
    }
}

/// `Jcc rel8` (70-7F).
struct JccShort;

impl Instruction for JccShort {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel8
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        if eval_cc(opcodes[0] & 0x0F, rt.cpu.regs.rflags) {
            branch_rel(rt.cpu, opcodes[1] as i8 as i64);
        }
        Ok(Status::Success)
    }
}

/// `Jcc rel16/32` (0F 80-8F).
struct JccNear;

impl Instruction for JccNear {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        if eval_cc(opcodes[1] & 0x0F, rt.cpu.regs.rflags) {
            let disp = rel_operand(rt, &opcodes[2..]);
            branch_rel(rt.cpu, disp);
        }
        Ok(Status::Success)
    }
}

/// `JMP rel8` (EB).
struct JmpShort;

impl Instruction for JmpShort {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel8
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        branch_rel(rt.cpu, opcodes[1] as i8 as i64);
        Ok(Status::Success)
    }
}

/// `JMP rel16/32` (E9).
struct JmpNear;

impl Instruction for JmpNear {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let disp = rel_operand(rt, &opcodes[1..]);
        branch_rel(rt.cpu, disp);
        Ok(Status::Success)
    }
}

/// `CALL rel16/32` (E8).
struct CallNear;

impl Instruction for CallNear {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let disp = rel_operand(rt, &opcodes[1..]);
        let size = push_size(rt);
        let ret = rt.cpu.regs.rip & size.mask();
        push(rt, size, ret)?;
        branch_rel(rt.cpu, disp);
        Ok(Status::Success)
    }
}

/// `RET` (C3).
struct RetNear;

impl Instruction for RetNear {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        let size = push_size(rt);
        let target = pop(rt, size)?;
        rt.cpu.regs.rip = target & branch_mask(rt.cpu);
        Ok(Status::Success)
    }
}

/// `RET imm16` (C2) — pop the return address, then release `imm16` bytes of
/// arguments.
struct RetNearImm;

impl Instruction for RetNearImm {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Imm16
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let size = push_size(rt);
        let target = pop(rt, size)?;
        rt.cpu.regs.rip = target & branch_mask(rt.cpu);

        let release = read_imm(&opcodes[1..], 2);
        let sp_size = rt.cpu.stack_size();
        let sp = rt.cpu.regs.read_sized(Gpr::Rsp as u8, sp_size, true);
        rt.cpu.regs.write_sized(
            Gpr::Rsp as u8,
            sp_size,
            true,
            sp.wrapping_add(release) & sp_size.mask(),
        );
        Ok(Status::Success)
    }
}

/// Shared far-transfer tail: load CS, re-derive the mode, set RIP.
fn far_transfer(rt: &mut Runtime<'_>, selector: u16, offset: u64) -> Result<()> {
    load_segment(rt, SegReg::Cs, selector)?;
    rt.cpu.update_mode();
    rt.cpu.request_cache_invalidation();
    rt.cpu.regs.rip = offset;
    Ok(())
}

/// `JMP ptr16:16/32` (EA, not in long mode).
struct JmpFar;

impl Instruction for JmpFar {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::FarPtr
    }

    fn available(&self, mode: CpuMode) -> bool {
        mode != CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let width = if rt.cpu.operand_size() == OperandSize::Word { 2 } else { 4 };
        let offset = read_imm(&opcodes[1..], width);
        let selector = read_imm(&opcodes[1 + width as usize..], 2) as u16;
        far_transfer(rt, selector, offset)?;
        Ok(Status::Success)
    }
}

/// `CALL ptr16:16/32` (9A, not in long mode).
struct CallFar;

impl Instruction for CallFar {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::FarPtr
    }

    fn available(&self, mode: CpuMode) -> bool {
        mode != CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let width = if rt.cpu.operand_size() == OperandSize::Word { 2 } else { 4 };
        let offset = read_imm(&opcodes[1..], width);
        let selector = read_imm(&opcodes[1 + width as usize..], 2) as u16;

        let size = rt.cpu.operand_size();
        let cs = rt.cpu.regs.seg[SegReg::Cs as usize].selector as u64;
        push(rt, size, cs)?;
        let ret = rt.cpu.regs.rip & size.mask();
        push(rt, size, ret)?;
        far_transfer(rt, selector, offset)?;
        Ok(Status::Success)
    }
}

/// `RETF` (CB).
struct RetFar;

impl Instruction for RetFar {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        let size = rt.cpu.operand_size();
        let offset = pop(rt, size)?;
        let selector = pop(rt, size)? as u16;
        far_transfer(rt, selector, offset & size.mask())?;
        Ok(Status::Success)
    }
}

/// LOOPNE/LOOPE/LOOP/JCXZ (E0-E3), counting in the address-size register.
struct LoopFamily;

impl Instruction for LoopFamily {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Rel8
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let op = opcodes[0];
        let addr = rt.cpu.address_size();
        let zf = (rt.cpu.regs.rflags & flags::ZF) != 0;

        let taken = if op == 0xE3 {
            rt.cpu.regs.read_sized(Gpr::Rcx as u8, addr, true) == 0
        } else {
            let count = rt
                .cpu
                .regs
                .read_sized(Gpr::Rcx as u8, addr, true)
                .wrapping_sub(1)
                & addr.mask();
            rt.cpu.regs.write_sized(Gpr::Rcx as u8, addr, true, count);
            match op {
                0xE0 => count != 0 && !zf,
                0xE1 => count != 0 && zf,
                _ => count != 0,
            }
        };

        if taken {
            branch_rel(rt.cpu, opcodes[1] as i8 as i64);
        }
        Ok(Status::Success)
    }
}

/// Group 5 (FF): INC/DEC/CALL/JMP/PUSH on r/m.
struct Group5;

impl Instruction for Group5 {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let (rm, m) = rm_operand(rt.cpu, &opcodes[1..])?;
        match m.reg(false) & 7 {
            0 => {
                let size = rt.cpu.operand_size();
                inc_dec_rm(rt, &rm, size, true)?;
            }
            1 => {
                let size = rt.cpu.operand_size();
                inc_dec_rm(rt, &rm, size, false)?;
            }
            2 => {
                // CALL near r/m.
                let size = push_size(rt);
                let target = read_rm(rt.cpu, rt.mem, &rm, size)?;
                let ret = rt.cpu.regs.rip & size.mask();
                push(rt, size, ret)?;
                rt.cpu.regs.rip = target & branch_mask(rt.cpu);
            }
            4 => {
                // JMP near r/m.
                let size = push_size(rt);
                let target = read_rm(rt.cpu, rt.mem, &rm, size)?;
                rt.cpu.regs.rip = target & branch_mask(rt.cpu);
            }
            3 | 5 => {
                // CALL/JMP far m16:16/32.
                let linear = match rm {
                    RmRef::Mem { linear, .. } => linear,
                    RmRef::Reg(_) => return Err(VmError::UndefinedOpcode(0xFF)),
                };
                let size = rt.cpu.operand_size();
                let offset = rt.mem.read_sized(linear, size.bytes().min(4))?;
                let selector = rt.mem.read_u16(linear + size.bytes().min(4))?;
                if m.reg(false) & 7 == 3 {
                    let cs = rt.cpu.regs.seg[SegReg::Cs as usize].selector as u64;
                    push(rt, size, cs)?;
                    let ret = rt.cpu.regs.rip & size.mask();
                    push(rt, size, ret)?;
                }
                far_transfer(rt, selector, offset)?;
            }
            6 => {
                let size = push_size(rt);
                let v = read_rm(rt.cpu, rt.mem, &rm, size)?;
                push(rt, size, v)?;
            }
            _ => return Err(VmError::UndefinedOpcode(0xFF)),
        }
        Ok(Status::Success)
    }
}

/// `INT3` (CC) — surfaces as a host breakpoint.
struct Int3;

impl Instruction for Int3 {
    fn process(&self, _rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        Ok(Status::Break)
    }
}

/// `INT imm8` (CD) — software interrupt through the IVT/IDT.
struct IntImm;

impl Instruction for IntImm {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::Imm8
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let vector = opcodes[1];
        rt.interrupts.deliver(vector, None, rt.cpu, rt.mem)?;
        Ok(Status::Success)
    }
}

/// `INTO` (CE, not in long mode).
struct IntO;

impl Instruction for IntO {
    fn available(&self, mode: CpuMode) -> bool {
        mode != CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        if (rt.cpu.regs.rflags & flags::OF) != 0 {
            rt.interrupts.deliver(4, None, rt.cpu, rt.mem)?;
        }
        Ok(Status::Success)
    }
}

/// `IRET` (CF).
struct Iret;

impl Instruction for Iret {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        match rt.cpu.mode {
            CpuMode::Long64 => {
                let rip = pop(rt, OperandSize::Qword)?;
                let cs = pop(rt, OperandSize::Qword)? as u16;
                let rflags = pop(rt, OperandSize::Qword)?;
                let rsp = pop(rt, OperandSize::Qword)?;
                let ss = pop(rt, OperandSize::Qword)? as u16;
                load_segment(rt, SegReg::Cs, cs)?;
                load_segment(rt, SegReg::Ss, ss)?;
                rt.cpu.regs.rflags = rflags | RFLAGS_FIXED;
                rt.cpu.regs.write_sized(Gpr::Rsp as u8, OperandSize::Qword, true, rsp);
                rt.cpu.sync_compatibility_mode_with_cs();
                rt.cpu.regs.rip = rip;
            }
            CpuMode::Real16 => {
                let ip = pop(rt, OperandSize::Word)?;
                let cs = pop(rt, OperandSize::Word)? as u16;
                let fl = pop(rt, OperandSize::Word)?;
                rt.cpu.regs.load_segment_real(SegReg::Cs, cs);
                rt.cpu.regs.rflags =
                    (rt.cpu.regs.rflags & !0xFFFF) | fl | RFLAGS_FIXED;
                rt.cpu.regs.rip = ip;
            }
            _ => {
                let size = rt.cpu.operand_size();
                let ip = pop(rt, size)?;
                let cs = pop(rt, size)? as u16;
                let fl = pop(rt, size)?;
                load_segment(rt, SegReg::Cs, cs)?;
                rt.cpu.update_mode();
                rt.cpu.regs.rflags =
                    (rt.cpu.regs.rflags & !size.mask()) | (fl & size.mask()) | RFLAGS_FIXED;
                rt.cpu.regs.rip = ip & size.mask();
            }
        }
        Ok(Status::Success)
    }
}

/// `HLT` (F4).
struct Hlt;

impl Instruction for Hlt {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        if rt.cpu.is_protected_mode() && rt.cpu.cpl() != 0 {
            return Err(VmError::GeneralProtection(0));
        }
        Ok(Status::Halt)
    }
}
