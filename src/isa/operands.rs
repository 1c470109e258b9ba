//! ModR/M operand parsing and effective-address computation.
//!
//! Handlers re-parse their operand bytes from the cached instruction image;
//! parsing is pure arithmetic over at most a handful of bytes. The resolved
//! form is either a register index or a linear address with its
//! pre-segmentation offset (LEA wants the offset, everything else the
//! linear address).

use crate::cpu::{Cpu, CpuMode};
use crate::error::{Result, VmError};
use crate::flags::OperandSize;
use crate::memory::PagedMemory;
use crate::registers::{Gpr, SegReg};

/// Parsed ModR/M + SIB + displacement fields.
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    /// The ModR/M byte.
    pub byte: u8,
    /// SIB byte when present.
    pub sib: Option<u8>,
    /// Sign-extended displacement.
    pub disp: i64,
    /// Bytes consumed (ModR/M + SIB + displacement).
    pub consumed: usize,
}

impl ModRm {
    /// mod field (bits 7:6).
    #[inline]
    pub fn md(&self) -> u8 {
        self.byte >> 6
    }

    /// reg field with the REX.R extension.
    #[inline]
    pub fn reg(&self, rex_r: bool) -> u8 {
        ((self.byte >> 3) & 7) | if rex_r { 8 } else { 0 }
    }

    /// r/m field with the REX.B extension.
    #[inline]
    pub fn rm(&self, rex_b: bool) -> u8 {
        (self.byte & 7) | if rex_b { 8 } else { 0 }
    }

    /// Whether the r/m operand is a register.
    #[inline]
    pub fn is_reg(&self) -> bool {
        self.md() == 3
    }
}

/// Parse the ModR/M group from `bytes` (starting at the ModR/M byte) under
/// the given address size.
pub fn parse_modrm(bytes: &[u8], addr: OperandSize) -> Result<ModRm> {
    let b = *bytes.first().ok_or(VmError::GeneralProtection(0))?;
    let md = b >> 6;
    let rm = b & 7;
    let mut pos = 1usize;
    let mut sib = None;

    if md == 3 {
        return Ok(ModRm { byte: b, sib, disp: 0, consumed: 1 });
    }

    let take = |n: usize, pos: &mut usize| -> Result<i64> {
        let s = bytes
            .get(*pos..*pos + n)
            .ok_or(VmError::GeneralProtection(0))?;
        *pos += n;
        Ok(match n {
            1 => s[0] as i8 as i64,
            2 => i16::from_le_bytes([s[0], s[1]]) as i64,
            _ => i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as i64,
        })
    };

    let disp;
    if addr == OperandSize::Word {
        disp = match md {
            0 => {
                if rm == 6 {
                    take(2, &mut pos)?
                } else {
                    0
                }
            }
            1 => take(1, &mut pos)?,
            _ => take(2, &mut pos)?,
        };
    } else {
        let mut sib_base = rm;
        if rm == 4 {
            let s = *bytes.get(pos).ok_or(VmError::GeneralProtection(0))?;
            sib = Some(s);
            sib_base = s & 7;
            pos += 1;
        }
        disp = match md {
            0 => {
                if rm == 5 || (rm == 4 && sib_base == 5) {
                    take(4, &mut pos)?
                } else {
                    0
                }
            }
            1 => take(1, &mut pos)?,
            _ => take(4, &mut pos)?,
        };
    }

    Ok(ModRm { byte: b, sib, disp, consumed: pos })
}

/// A resolved r/m operand.
#[derive(Debug, Clone, Copy)]
pub enum RmRef {
    /// Register operand (GPR index with REX applied).
    Reg(u8),
    /// Memory operand.
    Mem {
        /// Linear address (segment base applied).
        linear: u64,
        /// Effective offset before segmentation (what LEA produces).
        offset: u64,
    },
}

/// Resolve the r/m operand to a register or an effective address under the
/// live prefix state.
pub fn resolve_rm(cpu: &Cpu, m: &ModRm) -> Result<RmRef> {
    if m.is_reg() {
        return Ok(RmRef::Reg(m.rm(cpu.prefixes.rex_b())));
    }

    let addr = cpu.address_size();
    let md = m.md();
    let rm = m.byte & 7;

    let mut seg = SegReg::Ds;
    let offset;

    if addr == OperandSize::Word {
        let r = &cpu.regs;
        let bx = r.gpr[Gpr::Rbx as usize];
        let bp = r.gpr[Gpr::Rbp as usize];
        let si = r.gpr[Gpr::Rsi as usize];
        let di = r.gpr[Gpr::Rdi as usize];
        let base = match rm {
            0 => bx.wrapping_add(si),
            1 => bx.wrapping_add(di),
            2 => {
                seg = SegReg::Ss;
                bp.wrapping_add(si)
            }
            3 => {
                seg = SegReg::Ss;
                bp.wrapping_add(di)
            }
            4 => si,
            5 => di,
            6 => {
                if md == 0 {
                    0
                } else {
                    seg = SegReg::Ss;
                    bp
                }
            }
            _ => bx,
        };
        offset = base.wrapping_add(m.disp as u64) & 0xFFFF;
    } else {
        let rex_b = cpu.prefixes.rex_b();
        let rex_x = cpu.prefixes.rex_x();
        let mut base_val = 0u64;

        if rm == 4 {
            let sib = m.sib.ok_or(VmError::Emulator("missing SIB"))?;
            let base_enc = (sib & 7) | if rex_b { 8 } else { 0 };
            let index_enc = ((sib >> 3) & 7) | if rex_x { 8 } else { 0 };
            let scale = 1u64 << (sib >> 6);

            if !(md == 0 && (sib & 7) == 5) {
                base_val = cpu.regs.gpr[base_enc as usize];
                if (base_enc & 7) == 4 || ((base_enc & 7) == 5 && md != 0) {
                    seg = SegReg::Ss;
                }
            }
            // Index encoding 4 without REX.X means "no index".
            if index_enc != 4 {
                base_val =
                    base_val.wrapping_add(cpu.regs.gpr[index_enc as usize].wrapping_mul(scale));
            }
        } else if md == 0 && rm == 5 {
            if cpu.mode == CpuMode::Long64 {
                // RIP-relative: RIP already points at the next instruction.
                base_val = cpu.regs.rip;
            }
        } else {
            let enc = rm | if rex_b { 8 } else { 0 };
            base_val = cpu.regs.gpr[enc as usize];
            if (enc & 7) == 5 {
                seg = SegReg::Ss;
            }
        }

        offset = base_val.wrapping_add(m.disp as u64) & addr.mask();
    }

    if let Some(ovr) = cpu.prefixes.seg_override {
        seg = ovr;
    }
    let linear = cpu.regs.seg[seg as usize].base.wrapping_add(offset);
    Ok(RmRef::Mem { linear, offset })
}

/// Parse and resolve in one step; returns the resolved operand and the
/// parsed fields.
pub fn rm_operand(cpu: &Cpu, bytes_after_sig: &[u8]) -> Result<(RmRef, ModRm)> {
    let m = parse_modrm(bytes_after_sig, cpu.address_size())?;
    let r = resolve_rm(cpu, &m)?;
    Ok((r, m))
}

/// Read an r/m operand at the given width.
pub fn read_rm(cpu: &Cpu, mem: &PagedMemory, rm: &RmRef, size: OperandSize) -> Result<u64> {
    match rm {
        RmRef::Reg(i) => Ok(cpu.regs.read_sized(*i, size, cpu.prefixes.rex_present)),
        RmRef::Mem { linear, .. } => mem.read_sized(*linear, size.bytes()),
    }
}

/// Write an r/m operand at the given width.
pub fn write_rm(
    cpu: &mut Cpu,
    mem: &mut PagedMemory,
    rm: &RmRef,
    size: OperandSize,
    val: u64,
) -> Result<()> {
    match rm {
        RmRef::Reg(i) => {
            let rex = cpu.prefixes.rex_present;
            cpu.regs.write_sized(*i, size, rex, val);
            Ok(())
        }
        RmRef::Mem { linear, .. } => mem.write_sized(*linear, size.bytes(), val),
    }
}
