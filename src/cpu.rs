//! CPU context: mode state machine, transient overrides, and the queries the
//! executor and memory subsystem depend on.
//!
//! The execution loop itself lives in `exec`; this module owns everything the
//! loop consults between instructions — the five-mode state derived from
//! CR0/EFER/CS, the A20 gate, the transient prefix overrides, the REP
//! iteration flag, and the cache-invalidation request raised by
//! control-register writes.

use log::debug;

use crate::flags::OperandSize;
use crate::registers::{
    Prefixes, RegisterFile, SegReg, CR0_PE, CR0_PG, EFER_LMA, EFER_LME, MSR_EFER,
};

/// CPU operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real16,
    /// 16-bit protected mode (PE=1, CS.D=0): the window between enabling
    /// PE and loading a 32-bit CS.
    Protected16,
    /// 32-bit protected mode (PE=1, CS.D=1).
    Protected32,
    /// Compatibility mode (EFER.LMA=1, CS.L=0).
    Compat32,
    /// 64-bit long mode (EFER.LMA=1, CS.L=1).
    Long64,
}

impl CpuMode {
    /// Whether this mode executes 64-bit code.
    #[inline]
    pub fn is_long(self) -> bool {
        self == CpuMode::Long64
    }

    /// Default operand size without overrides.
    #[inline]
    pub fn default_operand(self) -> OperandSize {
        match self {
            CpuMode::Real16 | CpuMode::Protected16 => OperandSize::Word,
            CpuMode::Protected32 | CpuMode::Compat32 | CpuMode::Long64 => OperandSize::Dword,
        }
    }

    /// Default address size without overrides.
    #[inline]
    pub fn default_address(self) -> OperandSize {
        match self {
            CpuMode::Real16 | CpuMode::Protected16 => OperandSize::Word,
            CpuMode::Protected32 | CpuMode::Compat32 => OperandSize::Dword,
            CpuMode::Long64 => OperandSize::Qword,
        }
    }
}

/// Virtual CPU context.
pub struct Cpu {
    /// Architectural registers.
    pub regs: RegisterFile,
    /// Current operating mode.
    pub mode: CpuMode,
    /// A20 gate state; when disabled, bit 20 of linear addresses is masked.
    pub a20_enabled: bool,
    /// Transient prefix overrides for the in-flight instruction.
    pub prefixes: Prefixes,
    /// A REP-style string iteration is in progress at the current IP.
    pub iterating: bool,
    /// RIP of the first byte of the current prefix chain (equals the
    /// instruction start when no prefixes are live). REP iterations rewind
    /// here so an interrupt delivered mid-iteration resumes with the
    /// prefixes re-executed.
    pub prefix_chain_start: u64,
    /// Set by control-register writes; the executor polls and clears it.
    invalidate_requested: bool,
    /// Linear IP of the first byte of the last dispatched instruction.
    pub last_exec_ip: u64,
    /// RIP offset of the first byte of the last dispatched instruction
    /// (what fault delivery pushes).
    pub last_exec_rip: u64,
    /// CS selector at the last dispatch (diagnostics).
    pub last_exec_cs: u16,
    /// First opcode byte of the last dispatched instruction (diagnostics).
    pub last_opcode: u8,
}

impl Cpu {
    /// New CPU in real mode at the reset vector.
    pub fn new() -> Self {
        Cpu {
            regs: RegisterFile::new(),
            mode: CpuMode::Real16,
            a20_enabled: true,
            prefixes: Prefixes::default(),
            iterating: false,
            prefix_chain_start: 0,
            invalidate_requested: false,
            last_exec_ip: 0,
            last_exec_rip: 0,
            last_exec_cs: 0,
            last_opcode: 0,
        }
    }

    /// Reset to power-on state.
    pub fn reset(&mut self) {
        *self = Cpu::new();
    }

    // ── Mode queries (the contract the memory subsystem consumes) ──

    #[inline]
    pub fn is_long_mode(&self) -> bool {
        matches!(self.mode, CpuMode::Long64 | CpuMode::Compat32)
    }

    #[inline]
    pub fn is_compatibility_mode(&self) -> bool {
        self.mode == CpuMode::Compat32
    }

    #[inline]
    pub fn is_protected_mode(&self) -> bool {
        (self.regs.cr0 & CR0_PE) != 0
    }

    #[inline]
    pub fn is_paging_enabled(&self) -> bool {
        (self.regs.cr0 & CR0_PG) != 0
    }

    #[inline]
    pub fn is_a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.regs.cpl
    }

    /// Whether a REP-style iteration is currently rewinding at this IP.
    #[inline]
    pub fn iteration_active(&self) -> bool {
        self.iterating
    }

    // ── Transient overrides ──

    /// Drop all transient prefix overrides. Called by the executor after
    /// every instruction that does not return CONTINUE.
    pub fn clear_transient_overrides(&mut self) {
        self.prefixes.clear();
    }

    /// Whether any transient override is in force (a prefix chain is in
    /// flight). Decoding ahead of the current instruction is unsound while
    /// this holds, so the block and pattern tiers stand down.
    pub fn has_live_overrides(&self) -> bool {
        let p = &self.prefixes;
        p.seg_override.is_some()
            || p.operand_size
            || p.address_size
            || p.lock
            || p.rex_present
            || p.rep != crate::registers::RepKind::None
    }

    /// Effective operand size under the live overrides.
    pub fn operand_size(&self) -> OperandSize {
        if self.mode == CpuMode::Long64 && self.prefixes.rex_w() {
            return OperandSize::Qword;
        }
        match self.mode.default_operand() {
            OperandSize::Word => {
                if self.prefixes.operand_size {
                    OperandSize::Dword
                } else {
                    OperandSize::Word
                }
            }
            _ => {
                if self.prefixes.operand_size {
                    OperandSize::Word
                } else {
                    OperandSize::Dword
                }
            }
        }
    }

    /// Effective address size under the live overrides.
    pub fn address_size(&self) -> OperandSize {
        match self.mode.default_address() {
            OperandSize::Word => {
                if self.prefixes.address_size {
                    OperandSize::Dword
                } else {
                    OperandSize::Word
                }
            }
            OperandSize::Dword => {
                if self.prefixes.address_size {
                    OperandSize::Word
                } else {
                    OperandSize::Dword
                }
            }
            _ => {
                if self.prefixes.address_size {
                    OperandSize::Dword
                } else {
                    OperandSize::Qword
                }
            }
        }
    }

    /// Stack pointer width for the current mode and SS descriptor.
    pub fn stack_size(&self) -> OperandSize {
        match self.mode {
            CpuMode::Long64 => OperandSize::Qword,
            CpuMode::Real16 => OperandSize::Word,
            _ => {
                if self.regs.seg[SegReg::Ss as usize].big {
                    OperandSize::Dword
                } else {
                    OperandSize::Word
                }
            }
        }
    }

    // ── Mode maintenance ──

    /// Linear address of the next instruction (CS base + RIP).
    #[inline]
    pub fn linear_ip(&self) -> u64 {
        self.regs.seg[SegReg::Cs as usize]
            .base
            .wrapping_add(self.regs.rip)
    }

    /// Recompute the mode after a CR0/CR4/EFER or CS change.
    ///
    /// EFER.LMA tracks CR0.PG & EFER.LME automatically, matching hardware.
    pub fn update_mode(&mut self) {
        let efer = self.regs.read_msr(MSR_EFER);
        let pg = (self.regs.cr0 & CR0_PG) != 0;
        let lme = (efer & EFER_LME) != 0;
        let new_efer = if pg && lme {
            efer | EFER_LMA
        } else {
            efer & !EFER_LMA
        };
        if new_efer != efer {
            self.regs.write_msr(MSR_EFER, new_efer);
        }

        let old = self.mode;
        self.mode = self.compute_mode();
        if old != self.mode {
            debug!("cpu mode {:?} -> {:?}", old, self.mode);
        }
    }

    /// Re-derive the compatibility-mode split from the current CS
    /// descriptor. Called at the top of every dispatch so far jumps that
    /// change CS.L take effect immediately.
    pub fn sync_compatibility_mode_with_cs(&mut self) {
        let new = self.compute_mode();
        if new != self.mode {
            debug!("cpu mode {:?} -> {:?} (CS sync)", self.mode, new);
            self.mode = new;
        }
    }

    fn compute_mode(&self) -> CpuMode {
        let pe = (self.regs.cr0 & CR0_PE) != 0;
        let lma = (self.regs.read_msr(MSR_EFER) & EFER_LMA) != 0;
        let cs = &self.regs.seg[SegReg::Cs as usize];

        if !pe {
            CpuMode::Real16
        } else if lma {
            if cs.long_mode {
                CpuMode::Long64
            } else {
                CpuMode::Compat32
            }
        } else if cs.big {
            CpuMode::Protected32
        } else {
            CpuMode::Protected16
        }
    }

    // ── Cache invalidation handshake ──

    /// Flag that decode/block/pattern and translation caches must be
    /// flushed (control-register write, descriptor-table reload).
    pub fn request_cache_invalidation(&mut self) {
        self.invalidate_requested = true;
    }

    /// Consume a pending invalidation request.
    pub fn take_invalidation_request(&mut self) -> bool {
        std::mem::take(&mut self.invalidate_requested)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::SegmentDescriptor;

    #[test]
    fn reset_vector() {
        let cpu = Cpu::new();
        assert_eq!(cpu.mode, CpuMode::Real16);
        assert_eq!(cpu.linear_ip(), 0xF_FFF0);
    }

    #[test]
    fn mode_transitions() {
        let mut cpu = Cpu::new();

        // PE alone with a 16-bit CS: Protected16.
        cpu.regs.cr0 |= CR0_PE;
        cpu.update_mode();
        assert_eq!(cpu.mode, CpuMode::Protected16);

        // 32-bit CS descriptor: Protected32.
        cpu.regs.seg[SegReg::Cs as usize] =
            SegmentDescriptor::from_raw(0x08, 0x00CF_9A00_0000_FFFF);
        cpu.update_mode();
        assert_eq!(cpu.mode, CpuMode::Protected32);

        // LME + PG auto-sets LMA; with CS.L the mode is Long64.
        cpu.regs.write_msr(MSR_EFER, EFER_LME);
        cpu.regs.cr0 |= CR0_PG;
        cpu.regs.seg[SegReg::Cs as usize] =
            SegmentDescriptor::from_raw(0x08, 0x00AF_9A00_0000_FFFF);
        cpu.update_mode();
        assert_eq!(cpu.mode, CpuMode::Long64);
        assert_ne!(cpu.regs.read_msr(MSR_EFER) & EFER_LMA, 0);

        // Loading a CS with L=0 while LMA stays set: compatibility mode.
        cpu.regs.seg[SegReg::Cs as usize] =
            SegmentDescriptor::from_raw(0x10, 0x00CF_9A00_0000_FFFF);
        cpu.sync_compatibility_mode_with_cs();
        assert_eq!(cpu.mode, CpuMode::Compat32);
    }

    #[test]
    fn operand_size_overrides() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.operand_size(), OperandSize::Word);
        cpu.prefixes.operand_size = true;
        assert_eq!(cpu.operand_size(), OperandSize::Dword);

        cpu.mode = CpuMode::Long64;
        cpu.prefixes.clear();
        assert_eq!(cpu.operand_size(), OperandSize::Dword);
        cpu.prefixes.rex = 0x08;
        cpu.prefixes.rex_present = true;
        assert_eq!(cpu.operand_size(), OperandSize::Qword);
        assert_eq!(cpu.address_size(), OperandSize::Qword);
    }

    #[test]
    fn invalidation_request_is_one_shot() {
        let mut cpu = Cpu::new();
        assert!(!cpu.take_invalidation_request());
        cpu.request_cache_invalidation();
        assert!(cpu.take_invalidation_request());
        assert!(!cpu.take_invalidation_request());
    }
}
