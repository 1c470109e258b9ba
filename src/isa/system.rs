//! System instructions: flag manipulation, control-register moves, and the
//! descriptor-table group.

use crate::cpu::CpuMode;
use crate::error::{Result, VmError};
use crate::flags::{self, OperandSize};
use crate::isa::encoding::OperandShape;
use crate::isa::operands::{rm_operand, RmRef};
use crate::isa::{Instruction, InstructionSet, Runtime, Status};

/// Register the system handlers.
pub fn register(set: &mut InstructionSet) {
    set.register(&[&[0xF5]], Box::new(FlagOp(Flag::CmcCf)));
    set.register(&[&[0xF8]], Box::new(FlagOp(Flag::Clear(flags::CF))));
    set.register(&[&[0xF9]], Box::new(FlagOp(Flag::Set(flags::CF))));
    set.register(&[&[0xFA]], Box::new(FlagOp(Flag::Clear(flags::IF))));
    set.register(&[&[0xFB]], Box::new(FlagOp(Flag::SetIf)));
    set.register(&[&[0xFC]], Box::new(FlagOp(Flag::Clear(flags::DF))));
    set.register(&[&[0xFD]], Box::new(FlagOp(Flag::Set(flags::DF))));
    set.register(&[&[0x0F, 0x20], &[0x0F, 0x22]], Box::new(MovControl));
    set.register(&[&[0x0F, 0x01]], Box::new(DescriptorGroup));
}

#[derive(Debug, Clone, Copy)]
enum Flag {
    Set(u64),
    Clear(u64),
    /// STI sets IF and shadows interrupts for one instruction.
    SetIf,
    /// CMC complements CF.
    CmcCf,
}

struct FlagOp(Flag);

impl Instruction for FlagOp {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        match self.0 {
            Flag::Set(bit) => rt.cpu.regs.rflags |= bit,
            Flag::Clear(bit) => rt.cpu.regs.rflags &= !bit,
            Flag::SetIf => {
                rt.cpu.regs.rflags |= flags::IF;
                rt.interrupts.interrupt_shadow = true;
            }
            Flag::CmcCf => rt.cpu.regs.rflags ^= flags::CF,
        }
        Ok(Status::Success)
    }
}

/// `MOV r, CRn` / `MOV CRn, r` (0F 20 / 0F 22).
///
/// Writes to CR0/CR3/CR4 re-derive the CPU mode and request a full cache
/// invalidation: the decode/block/pattern caches and the translator's page
/// caches may all describe a world that no longer exists.
struct MovControl;

impl Instruction for MovControl {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::ModRm
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        if rt.cpu.is_protected_mode() && rt.cpu.cpl() != 0 {
            return Err(VmError::GeneralProtection(0));
        }
        let (rm, m) = rm_operand(rt.cpu, &opcodes[2..])?;
        let gpr = match rm {
            RmRef::Reg(r) => r,
            // The mod field is ignored for CR moves; the r/m field always
            // names a register.
            RmRef::Mem { .. } => m.rm(rt.cpu.prefixes.rex_b()),
        };
        let cr = m.reg(rt.cpu.prefixes.rex_r());
        let size = if rt.cpu.mode == CpuMode::Long64 {
            OperandSize::Qword
        } else {
            OperandSize::Dword
        };

        if opcodes[1] == 0x20 {
            let v = match cr {
                0 => rt.cpu.regs.cr0,
                2 => rt.cpu.regs.cr2,
                3 => rt.cpu.regs.cr3,
                4 => rt.cpu.regs.cr4,
                8 => rt.cpu.regs.cr8,
                _ => return Err(VmError::UndefinedOpcode(0x20)),
            };
            rt.cpu.regs.write_sized(gpr, size, true, v);
        } else {
            let v = rt.cpu.regs.read_sized(gpr, size, true);
            match cr {
                0 => rt.cpu.regs.cr0 = v,
                2 => rt.cpu.regs.cr2 = v,
                3 => rt.cpu.regs.cr3 = v,
                4 => rt.cpu.regs.cr4 = v,
                8 => rt.cpu.regs.cr8 = v,
                _ => return Err(VmError::UndefinedOpcode(0x22)),
            }
            if matches!(cr, 0 | 3 | 4) {
                rt.cpu.update_mode();
                rt.cpu.request_cache_invalidation();
            }
        }
        Ok(Status::Success)
    }
}

/// `0F 01` group: SGDT/SIDT/LGDT/LIDT by the reg field.
struct DescriptorGroup;

impl Instruction for DescriptorGroup {
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::DescriptorTable
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let (rm, m) = rm_operand(rt.cpu, &opcodes[2..])?;
        let linear = match rm {
            RmRef::Mem { linear, .. } => linear,
            RmRef::Reg(_) => return Err(VmError::UndefinedOpcode(0x01)),
        };

        // Base width: 24 bits with a 16-bit operand, 32 bits with a 32-bit
        // operand, 64 bits in long mode.
        let (base_bytes, base_mask) = match (rt.cpu.mode, rt.cpu.operand_size()) {
            (CpuMode::Long64, _) => (8u64, u64::MAX),
            (_, OperandSize::Word) => (4, 0x00FF_FFFF),
            _ => (4, 0xFFFF_FFFF),
        };

        match m.reg(false) & 7 {
            0 | 1 => {
                // SGDT / SIDT.
                let table = if m.reg(false) & 7 == 0 {
                    rt.cpu.regs.gdtr
                } else {
                    rt.cpu.regs.idtr
                };
                rt.mem.write_u16(linear, table.limit)?;
                rt.mem
                    .write_sized(linear + 2, base_bytes, table.base & base_mask)?;
            }
            2 | 3 => {
                // LGDT / LIDT.
                let limit = rt.mem.read_u16(linear)?;
                let base = rt.mem.read_sized(linear + 2, base_bytes)? & base_mask;
                let table = crate::registers::TableRegister { base, limit };
                if m.reg(false) & 7 == 2 {
                    rt.cpu.regs.gdtr = table;
                } else {
                    rt.cpu.regs.idtr = table;
                }
                rt.cpu.request_cache_invalidation();
            }
            _ => return Err(VmError::UndefinedOpcode(0x01)),
        }
        Ok(Status::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::interrupts::InterruptController;
    use crate::memory::PagedMemory;

    fn rt_parts() -> (Cpu, PagedMemory, InterruptController) {
        (Cpu::new(), PagedMemory::new(0x10000, 0x10000), InterruptController::new())
    }

    #[test]
    fn flag_ops() {
        let (mut cpu, mut mem, mut ints) = rt_parts();
        let mut rt = Runtime { cpu: &mut cpu, mem: &mut mem, interrupts: &mut ints };

        FlagOp(Flag::Set(flags::CF)).process(&mut rt, &[0xF9]).unwrap();
        assert_ne!(rt.cpu.regs.rflags & flags::CF, 0);
        FlagOp(Flag::CmcCf).process(&mut rt, &[0xF5]).unwrap();
        assert_eq!(rt.cpu.regs.rflags & flags::CF, 0);
        FlagOp(Flag::SetIf).process(&mut rt, &[0xFB]).unwrap();
        assert_ne!(rt.cpu.regs.rflags & flags::IF, 0);
        assert!(rt.interrupts.interrupt_shadow);
    }

    #[test]
    fn cr_write_requests_invalidation() {
        let (mut cpu, mut mem, mut ints) = rt_parts();
        cpu.regs.gpr[0] = crate::registers::CR0_PE;
        let mut rt = Runtime { cpu: &mut cpu, mem: &mut mem, interrupts: &mut ints };

        // 0F 22 C0: MOV CR0, EAX.
        MovControl.process(&mut rt, &[0x0F, 0x22, 0xC0]).unwrap();
        assert!(cpu.is_protected_mode());
        assert!(cpu.take_invalidation_request());
    }
}
