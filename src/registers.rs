//! Architectural register state.
//!
//! Holds the general-purpose registers, segment registers with their cached
//! descriptors, control registers, descriptor-table registers, MSRs, and the
//! transient prefix overrides that legacy/REX prefix instructions establish
//! for the instruction that follows them.

use std::collections::BTreeMap;

use crate::flags::{OperandSize, RFLAGS_FIXED};

/// General-purpose register indices matching the x86 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Segment register index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    /// Convert a 3-bit segment encoding from ModR/M reg fields.
    pub fn from_encoding(val: u8) -> Option<SegReg> {
        match val & 0x07 {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }
}

// ── Control register and EFER bits ──

/// CR0.PE — protection enable.
pub const CR0_PE: u64 = 1 << 0;
/// CR0.WP — supervisor write protect.
pub const CR0_WP: u64 = 1 << 16;
/// CR0.PG — paging enable.
pub const CR0_PG: u64 = 1 << 31;

/// CR4.PSE — 4 MiB pages in 32-bit paging.
pub const CR4_PSE: u64 = 1 << 4;
/// CR4.PAE — physical address extension.
pub const CR4_PAE: u64 = 1 << 5;

/// EFER MSR number.
pub const MSR_EFER: u32 = 0xC000_0080;
/// EFER.LME — long mode enable.
pub const EFER_LME: u64 = 1 << 8;
/// EFER.LMA — long mode active.
pub const EFER_LMA: u64 = 1 << 10;
/// EFER.NXE — no-execute enable.
pub const EFER_NXE: u64 = 1 << 11;

// ── Segment descriptors ──

/// Cached segment descriptor (the hidden part of a segment register),
/// populated from the GDT on segment loads and from the selector shift in
/// real mode.
#[derive(Debug, Clone, Copy)]
pub struct SegmentDescriptor {
    /// Visible selector value.
    pub selector: u16,
    /// Decoded base address.
    pub base: u64,
    /// Byte-granular limit.
    pub limit: u32,
    /// Descriptor privilege level.
    pub dpl: u8,
    /// Segment present.
    pub present: bool,
    /// Code segment.
    pub is_code: bool,
    /// D/B bit — 32-bit default operand/stack size.
    pub big: bool,
    /// L bit — 64-bit code segment.
    pub long_mode: bool,
    /// Data segment writable (code segments report false).
    pub writable: bool,
}

impl SegmentDescriptor {
    /// Flat real-mode data segment for `selector` (base = selector << 4).
    pub fn real_mode(selector: u16) -> Self {
        SegmentDescriptor {
            selector,
            base: (selector as u64) << 4,
            limit: 0xFFFF,
            dpl: 0,
            present: true,
            is_code: false,
            big: false,
            long_mode: false,
            writable: true,
        }
    }

    /// Flat real-mode code segment for `selector`.
    pub fn real_mode_code(selector: u16) -> Self {
        let mut d = Self::real_mode(selector);
        d.is_code = true;
        d.writable = false;
        d
    }

    /// Decode an 8-byte GDT/LDT entry.
    pub fn from_raw(selector: u16, raw: u64) -> Self {
        let base = ((raw >> 16) & 0xFFFF) | ((raw >> 32) & 0xFF) << 16 | ((raw >> 56) & 0xFF) << 24;

        let mut limit = ((raw & 0xFFFF) | ((raw >> 48) & 0x0F) << 16) as u32;
        let flags = ((raw >> 52) & 0x0F) as u8;
        if (flags & 0x08) != 0 {
            // G bit: limit counts 4 KiB pages.
            limit = (limit << 12) | 0xFFF;
        }

        let access = ((raw >> 40) & 0xFF) as u8;
        let is_system = (access & 0x10) == 0;
        let is_code = !is_system && (access & 0x08) != 0;

        SegmentDescriptor {
            selector,
            base,
            limit,
            dpl: (access >> 5) & 0x03,
            present: (access & 0x80) != 0,
            is_code,
            big: (flags & 0x04) != 0,
            long_mode: (flags & 0x02) != 0,
            writable: !is_code && (access & 0x02) != 0,
        }
    }
}

/// GDTR/IDTR register (linear base + limit).
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

// ── Transient prefix overrides ──

/// REP prefix kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepKind {
    #[default]
    None,
    /// REP/REPE (0xF3).
    Rep,
    /// REPNE (0xF2).
    Repne,
}

/// Transient overrides accumulated by prefix instructions.
///
/// Prefix instructions return CONTINUE and write here; the overrides stay
/// live through the following non-prefix instruction and are cleared by the
/// executor once that instruction completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    /// Segment override, if any.
    pub seg_override: Option<SegReg>,
    /// Operand-size override (0x66).
    pub operand_size: bool,
    /// Address-size override (0x67).
    pub address_size: bool,
    /// LOCK prefix (0xF0).
    pub lock: bool,
    /// REP/REPNE prefix.
    pub rep: RepKind,
    /// REX byte low nibble (W R X B); 0 when absent.
    pub rex: u8,
    /// A REX prefix was seen, even 0x40 (changes 8-bit register encoding).
    pub rex_present: bool,
}

impl Prefixes {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    #[inline]
    pub fn rex_r(&self) -> bool {
        self.rex & 0x04 != 0
    }

    #[inline]
    pub fn rex_x(&self) -> bool {
        self.rex & 0x02 != 0
    }

    #[inline]
    pub fn rex_b(&self) -> bool {
        self.rex & 0x01 != 0
    }

    /// Reset all overrides to the no-prefix state.
    pub fn clear(&mut self) {
        *self = Prefixes::default();
    }
}

// ── Register file ──

/// Full architectural register state.
pub struct RegisterFile {
    /// General-purpose registers indexed by [`Gpr`].
    pub gpr: [u64; 16],
    /// Instruction pointer (segment-relative offset).
    pub rip: u64,
    /// RFLAGS.
    pub rflags: u64,
    /// Segment registers indexed by [`SegReg`].
    pub seg: [SegmentDescriptor; 6],
    /// CR0 — protection/paging control.
    pub cr0: u64,
    /// CR2 — page fault linear address.
    pub cr2: u64,
    /// CR3 — page table base.
    pub cr3: u64,
    /// CR4 — feature control.
    pub cr4: u64,
    /// CR8 — task priority.
    pub cr8: u64,
    /// GDTR.
    pub gdtr: TableRegister,
    /// IDTR.
    pub idtr: TableRegister,
    /// Current privilege level.
    pub cpl: u8,
    /// Model-specific registers.
    msr: BTreeMap<u32, u64>,
}

impl RegisterFile {
    /// Power-on reset state: real mode at CS:IP = F000:FFF0.
    pub fn new() -> Self {
        let mut seg = [SegmentDescriptor::real_mode(0); 6];
        seg[SegReg::Cs as usize] = SegmentDescriptor::real_mode_code(0xF000);
        RegisterFile {
            gpr: [0; 16],
            rip: 0xFFF0,
            rflags: RFLAGS_FIXED,
            seg,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            gdtr: TableRegister::default(),
            idtr: TableRegister::default(),
            cpl: 0,
            msr: BTreeMap::new(),
        }
    }

    /// Read an MSR (0 when never written).
    pub fn read_msr(&self, index: u32) -> u64 {
        self.msr.get(&index).copied().unwrap_or(0)
    }

    /// Write an MSR.
    pub fn write_msr(&mut self, index: u32, val: u64) {
        self.msr.insert(index, val);
    }

    /// Read a GPR at a given width, honoring the legacy AH/CH/DH/BH
    /// encoding for byte accesses without a REX prefix.
    pub fn read_sized(&self, index: u8, size: OperandSize, rex_present: bool) -> u64 {
        let i = index as usize & 0x0F;
        match size {
            OperandSize::Byte => {
                if !rex_present && (4..8).contains(&i) {
                    (self.gpr[i - 4] >> 8) & 0xFF
                } else {
                    self.gpr[i] & 0xFF
                }
            }
            OperandSize::Word => self.gpr[i] & 0xFFFF,
            OperandSize::Dword => self.gpr[i] & 0xFFFF_FFFF,
            OperandSize::Qword => self.gpr[i],
        }
    }

    /// Write a GPR at a given width. Byte/word writes merge into the
    /// register; dword writes zero the upper half (the 64-bit rule, which is
    /// unobservable in narrower modes).
    pub fn write_sized(&mut self, index: u8, size: OperandSize, rex_present: bool, val: u64) {
        let i = index as usize & 0x0F;
        match size {
            OperandSize::Byte => {
                if !rex_present && (4..8).contains(&i) {
                    self.gpr[i - 4] = (self.gpr[i - 4] & !0xFF00) | ((val & 0xFF) << 8);
                } else {
                    self.gpr[i] = (self.gpr[i] & !0xFF) | (val & 0xFF);
                }
            }
            OperandSize::Word => {
                self.gpr[i] = (self.gpr[i] & !0xFFFF) | (val & 0xFFFF);
            }
            OperandSize::Dword => {
                self.gpr[i] = val & 0xFFFF_FFFF;
            }
            OperandSize::Qword => {
                self.gpr[i] = val;
            }
        }
    }

    /// Load a segment register with real-mode semantics (base = sel << 4).
    pub fn load_segment_real(&mut self, seg: SegReg, selector: u16) {
        let code = seg == SegReg::Cs;
        self.seg[seg as usize] = if code {
            SegmentDescriptor::real_mode_code(selector)
        } else {
            SegmentDescriptor::real_mode(selector)
        };
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_decode_flat_code() {
        // Classic flat 4 GiB ring-0 code descriptor: base 0, limit 0xFFFFF
        // pages, access 0x9A, flags 0xC (G + D).
        let raw: u64 = 0x00CF_9A00_0000_FFFF;
        let d = SegmentDescriptor::from_raw(0x08, raw);
        assert_eq!(d.base, 0);
        assert_eq!(d.limit, 0xFFFF_FFFF);
        assert!(d.present);
        assert!(d.is_code);
        assert!(d.big);
        assert!(!d.long_mode);
        assert_eq!(d.dpl, 0);
    }

    #[test]
    fn descriptor_decode_long_code() {
        // 64-bit code descriptor: access 0x9A, flags 0xA (G + L).
        let raw: u64 = 0x00AF_9A00_0000_FFFF;
        let d = SegmentDescriptor::from_raw(0x08, raw);
        assert!(d.long_mode);
        assert!(!d.big);
    }

    #[test]
    fn high_byte_registers_without_rex() {
        let mut r = RegisterFile::new();
        r.gpr[Gpr::Rax as usize] = 0x1234;
        // Encoding 4 with no REX is AH.
        assert_eq!(r.read_sized(4, OperandSize::Byte, false), 0x12);
        r.write_sized(4, OperandSize::Byte, false, 0x56);
        assert_eq!(r.gpr[Gpr::Rax as usize], 0x5634);
        // With REX present, encoding 4 is SPL.
        r.gpr[Gpr::Rsp as usize] = 0xAA;
        assert_eq!(r.read_sized(4, OperandSize::Byte, true), 0xAA);
    }

    #[test]
    fn dword_write_zero_extends() {
        let mut r = RegisterFile::new();
        r.gpr[0] = 0xFFFF_FFFF_FFFF_FFFF;
        r.write_sized(0, OperandSize::Dword, false, 0x1234_5678);
        assert_eq!(r.gpr[0], 0x1234_5678);
        r.write_sized(0, OperandSize::Word, false, 0xAAAA_BBBB);
        assert_eq!(r.gpr[0], 0x1234_BBBB);
    }
}
