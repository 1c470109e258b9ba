//! Hot-pattern recognition and compiled execution.
//!
//! A recognizer matches a byte signature at an IP and compiles it into a
//! [`CompiledPattern`] — a tagged value that replays the whole sequence
//! atomically against the register file and memory, leaving IP just past
//! the pattern. Compiled patterns may refuse at runtime (`Skip`) when a
//! precondition fails — live prefix overrides, direction flag, paging, or
//! overlapping ranges — and the executor falls back to normal dispatch,
//! which keeps pattern execution byte-for-byte equivalent to
//! single-stepping the source instructions.
//!
//! Probing is gated by a per-IP occurrence threshold so cold code never
//! pays for signature matching; both hits and compile failures are cached
//! per IP.

use std::collections::HashMap;

use crate::cpu::CpuMode;
use crate::error::Result;
use crate::exec::decode::peek_window;
use crate::flags::{self, update_status, OperandSize};
use crate::isa::{Runtime, Status};
use crate::registers::{Gpr, SegReg};

/// Upper bound on elements a compiled pattern will touch in one shot;
/// larger counts fall back to the interpreter.
const MAX_PATTERN_ELEMS: u64 = 1 << 24;

/// How far the strcpy pattern scans for a NUL before giving up.
const MAX_STRCPY_SCAN: u64 = 1 << 16;

/// Outcome of running a compiled pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRun {
    /// The pattern executed; IP is past the sequence.
    Done,
    /// A precondition failed; nothing changed. Fall back to dispatch.
    Skip,
}

/// A compiled hot pattern, closed over its start IP and encoding choices.
#[derive(Debug, Clone, Copy)]
pub enum CompiledPattern {
    /// `F3 A4` — REP MOVSB block copy.
    ByteCopy { len: u8 },
    /// `F3 AB` / `F3 66 AB` — REP STOS fill.
    StosFill { len: u8, wide_prefix: bool },
    /// `85 C9 74 08 89 07 83 C7 04 49 75 F8` — top-tested dword memset:
    /// `test ecx,ecx; jz done; l: mov [edi],eax; add edi,4; dec ecx; jnz l`.
    MemsetDword { len: u8 },
    /// `8A 06 88 07 46 47 84 C0 75 F6` — byte strcpy until NUL:
    /// `l: mov al,[esi]; mov [edi],al; inc esi; inc edi; test al,al; jnz l`.
    StrcpyNul { len: u8 },
}

impl CompiledPattern {
    /// Encoded length of the replaced sequence.
    pub fn byte_len(&self) -> u8 {
        match self {
            CompiledPattern::ByteCopy { len }
            | CompiledPattern::StosFill { len, .. }
            | CompiledPattern::MemsetDword { len }
            | CompiledPattern::StrcpyNul { len } => *len,
        }
    }

    /// Run the pattern atomically, or report `Skip` without side effects.
    /// Live overrides or paging mean the flat-encoding assumptions the
    /// pattern was compiled under do not hold.
    pub fn run(&self, rt: &mut Runtime<'_>) -> Result<PatternRun> {
        if rt.cpu.has_live_overrides() || rt.mem.translator().paging_enabled() {
            return Ok(PatternRun::Skip);
        }
        match *self {
            CompiledPattern::ByteCopy { len } => self.run_byte_copy(rt, len),
            CompiledPattern::StosFill { len, wide_prefix } => {
                self.run_stos_fill(rt, len, wide_prefix)
            }
            CompiledPattern::MemsetDword { len } => self.run_memset_dword(rt, len),
            CompiledPattern::StrcpyNul { len } => self.run_strcpy_nul(rt, len),
        }
    }

    fn run_byte_copy(&self, rt: &mut Runtime<'_>, len: u8) -> Result<PatternRun> {
        if (rt.cpu.regs.rflags & flags::DF) != 0 {
            return Ok(PatternRun::Skip);
        }
        let addr = rt.cpu.address_size();
        let count = rt.cpu.regs.read_sized(Gpr::Rcx as u8, addr, true);
        if count == 0 {
            rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
            return Ok(PatternRun::Done);
        }
        if count > MAX_PATTERN_ELEMS {
            return Ok(PatternRun::Skip);
        }

        let si = rt.cpu.regs.read_sized(Gpr::Rsi as u8, addr, true);
        let di = rt.cpu.regs.read_sized(Gpr::Rdi as u8, addr, true);
        // Index wrap-around inside the copy has per-byte semantics the bulk
        // path cannot honor.
        if si.checked_add(count).map_or(true, |e| e > addr.mask())
            || di.checked_add(count).map_or(true, |e| e > addr.mask())
        {
            return Ok(PatternRun::Skip);
        }

        let tr = rt.mem.translator();
        let src = tr.mask_linear(rt.cpu.regs.seg[SegReg::Ds as usize].base.wrapping_add(si));
        let dst = tr.mask_linear(rt.cpu.regs.seg[SegReg::Es as usize].base.wrapping_add(di));
        if ranges_overlap(src, dst, count) {
            return Ok(PatternRun::Skip);
        }

        let mut buf = vec![0u8; count as usize];
        rt.mem.stream().read_bytes(src, &mut buf);
        rt.mem.copy_from_slice(dst, &buf)?;

        rt.cpu.regs.write_sized(Gpr::Rsi as u8, addr, true, si + count);
        rt.cpu.regs.write_sized(Gpr::Rdi as u8, addr, true, di + count);
        rt.cpu.regs.write_sized(Gpr::Rcx as u8, addr, true, 0);
        rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
        Ok(PatternRun::Done)
    }

    fn run_stos_fill(&self, rt: &mut Runtime<'_>, len: u8, wide_prefix: bool) -> Result<PatternRun> {
        if (rt.cpu.regs.rflags & flags::DF) != 0 {
            return Ok(PatternRun::Skip);
        }
        // Element width the encoded 0x66 (if any) selects in this mode.
        let base = rt.cpu.mode.default_operand();
        let unit = match (base, wide_prefix) {
            (OperandSize::Word, false) | (OperandSize::Dword, true) => OperandSize::Word,
            _ => OperandSize::Dword,
        };

        let addr = rt.cpu.address_size();
        let count = rt.cpu.regs.read_sized(Gpr::Rcx as u8, addr, true);
        if count == 0 {
            rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
            return Ok(PatternRun::Done);
        }
        if count > MAX_PATTERN_ELEMS {
            return Ok(PatternRun::Skip);
        }

        let di = rt.cpu.regs.read_sized(Gpr::Rdi as u8, addr, true);
        let total = count * unit.bytes();
        if di.checked_add(total).map_or(true, |e| e > addr.mask()) {
            return Ok(PatternRun::Skip);
        }

        let val = rt.cpu.regs.read_sized(Gpr::Rax as u8, unit, true);
        let mut buf = Vec::with_capacity(total as usize);
        for _ in 0..count {
            buf.extend_from_slice(&val.to_le_bytes()[..unit.bytes() as usize]);
        }
        let dst = rt
            .mem
            .translator()
            .mask_linear(rt.cpu.regs.seg[SegReg::Es as usize].base.wrapping_add(di));
        rt.mem.copy_from_slice(dst, &buf)?;

        rt.cpu.regs.write_sized(Gpr::Rdi as u8, addr, true, di + total);
        rt.cpu.regs.write_sized(Gpr::Rcx as u8, addr, true, 0);
        rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
        Ok(PatternRun::Done)
    }

    fn run_memset_dword(&self, rt: &mut Runtime<'_>, len: u8) -> Result<PatternRun> {
        let ecx = rt.cpu.regs.read_sized(Gpr::Rcx as u8, OperandSize::Dword, true);
        // Both exits leave the same status image: the final DEC (1 -> 0) or
        // the entry TEST of zero set ZF and PF and clear the rest.
        let final_flags = flags::ZF | flags::PF;

        if ecx == 0 {
            update_status(&mut rt.cpu.regs.rflags, final_flags);
            rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
            return Ok(PatternRun::Done);
        }
        if ecx > MAX_PATTERN_ELEMS {
            return Ok(PatternRun::Skip);
        }

        let edi = rt.cpu.regs.read_sized(Gpr::Rdi as u8, OperandSize::Dword, true);
        let total = ecx * 4;
        if edi.checked_add(total).map_or(true, |e| e > u32::MAX as u64) {
            return Ok(PatternRun::Skip);
        }

        let eax = rt.cpu.regs.read_sized(Gpr::Rax as u8, OperandSize::Dword, true) as u32;
        let mut buf = Vec::with_capacity(total as usize);
        for _ in 0..ecx {
            buf.extend_from_slice(&eax.to_le_bytes());
        }
        // The store in the loop body addresses [EDI] through DS.
        let dst = rt
            .mem
            .translator()
            .mask_linear(rt.cpu.regs.seg[SegReg::Ds as usize].base.wrapping_add(edi));
        rt.mem.copy_from_slice(dst, &buf)?;

        rt.cpu
            .regs
            .write_sized(Gpr::Rdi as u8, OperandSize::Dword, true, edi + total);
        rt.cpu.regs.write_sized(Gpr::Rcx as u8, OperandSize::Dword, true, 0);
        update_status(&mut rt.cpu.regs.rflags, final_flags);
        rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
        Ok(PatternRun::Done)
    }

    fn run_strcpy_nul(&self, rt: &mut Runtime<'_>, len: u8) -> Result<PatternRun> {
        let esi = rt.cpu.regs.read_sized(Gpr::Rsi as u8, OperandSize::Dword, true);
        let edi = rt.cpu.regs.read_sized(Gpr::Rdi as u8, OperandSize::Dword, true);

        let tr = rt.mem.translator();
        let src = tr.mask_linear(rt.cpu.regs.seg[SegReg::Ds as usize].base.wrapping_add(esi));
        let dst = tr.mask_linear(rt.cpu.regs.seg[SegReg::Ds as usize].base.wrapping_add(edi));

        // Scan for the terminator; an unreasonably long string is the
        // interpreter's problem.
        let mut n = None;
        for i in 0..MAX_STRCPY_SCAN {
            if rt.mem.stream().read_u8(src + i) == 0 {
                n = Some(i + 1);
                break;
            }
        }
        let Some(n) = n else {
            return Ok(PatternRun::Skip);
        };

        if esi.checked_add(n).map_or(true, |e| e > u32::MAX as u64)
            || edi.checked_add(n).map_or(true, |e| e > u32::MAX as u64)
            || ranges_overlap(src, dst, n)
        {
            return Ok(PatternRun::Skip);
        }

        let mut buf = vec![0u8; n as usize];
        rt.mem.stream().read_bytes(src, &mut buf);
        rt.mem.copy_from_slice(dst, &buf)?;

        rt.cpu.regs.write_sized(Gpr::Rsi as u8, OperandSize::Dword, true, esi + n);
        rt.cpu.regs.write_sized(Gpr::Rdi as u8, OperandSize::Dword, true, edi + n);
        // AL holds the copied NUL; the final TEST AL,AL leaves ZF|PF.
        rt.cpu.regs.write_sized(Gpr::Rax as u8, OperandSize::Byte, false, 0);
        update_status(&mut rt.cpu.regs.rflags, flags::ZF | flags::PF);
        rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(len as u64);
        Ok(PatternRun::Done)
    }
}

fn ranges_overlap(a: u64, b: u64, len: u64) -> bool {
    a < b.wrapping_add(len) && b < a.wrapping_add(len)
}

// ── Recognizers ──

type Recognizer = fn(&[u8], CpuMode) -> Option<CompiledPattern>;

fn recognize_byte_copy(bytes: &[u8], _mode: CpuMode) -> Option<CompiledPattern> {
    bytes
        .starts_with(&[0xF3, 0xA4])
        .then_some(CompiledPattern::ByteCopy { len: 2 })
}

fn recognize_stos_fill(bytes: &[u8], _mode: CpuMode) -> Option<CompiledPattern> {
    if bytes.starts_with(&[0xF3, 0x66, 0xAB]) {
        Some(CompiledPattern::StosFill { len: 3, wide_prefix: true })
    } else if bytes.starts_with(&[0xF3, 0xAB]) {
        Some(CompiledPattern::StosFill { len: 2, wide_prefix: false })
    } else {
        None
    }
}

/// 32-bit only: the same bytes decode differently under 16-bit defaults,
/// and 0x46-0x49 are REX prefixes in long mode.
fn is_flat32(mode: CpuMode) -> bool {
    matches!(mode, CpuMode::Protected32 | CpuMode::Compat32)
}

fn recognize_memset_dword(bytes: &[u8], mode: CpuMode) -> Option<CompiledPattern> {
    const SIG: [u8; 12] = [
        0x85, 0xC9, 0x74, 0x08, 0x89, 0x07, 0x83, 0xC7, 0x04, 0x49, 0x75, 0xF8,
    ];
    (is_flat32(mode) && bytes.starts_with(&SIG))
        .then_some(CompiledPattern::MemsetDword { len: 12 })
}

fn recognize_strcpy_nul(bytes: &[u8], mode: CpuMode) -> Option<CompiledPattern> {
    const SIG: [u8; 10] = [0x8A, 0x06, 0x88, 0x07, 0x46, 0x47, 0x84, 0xC0, 0x75, 0xF6];
    (is_flat32(mode) && bytes.starts_with(&SIG))
        .then_some(CompiledPattern::StrcpyNul { len: 10 })
}

// ── Registry ──

/// Per-IP pattern cache with threshold-gated probing.
pub struct PatternRegistry {
    recognizers: Vec<Recognizer>,
    /// Probe results: `None` records a signature mismatch so the matcher
    /// never runs twice for a cold IP.
    compiled: HashMap<u64, Option<CompiledPattern>>,
    probes: HashMap<u64, u32>,
    probe_threshold: u32,
    pub hits: u64,
    pub misses: u64,
}

impl PatternRegistry {
    pub fn new(probe_threshold: u32) -> Self {
        PatternRegistry {
            recognizers: vec![
                recognize_byte_copy,
                recognize_stos_fill,
                recognize_memset_dword,
                recognize_strcpy_nul,
            ],
            compiled: HashMap::new(),
            probes: HashMap::new(),
            probe_threshold,
            hits: 0,
            misses: 0,
        }
    }

    /// Drop the per-IP caches (the hit/miss counters survive).
    pub fn clear(&mut self) {
        self.compiled.clear();
        self.probes.clear();
    }

    /// Try the pattern path at `ip`. `Ok(Some(status))` means a pattern ran
    /// and IP has moved past it; `Ok(None)` means the caller should
    /// dispatch normally.
    pub fn try_execute(&mut self, rt: &mut Runtime<'_>, ip: u64) -> Result<Option<Status>> {
        if let Some(slot) = self.compiled.get(&ip) {
            let Some(p) = *slot else { return Ok(None) };
            return self.run_compiled(rt, p);
        }

        let n = self.probes.entry(ip).or_insert(0);
        *n += 1;
        if *n < self.probe_threshold {
            return Ok(None);
        }

        let (window, avail, _fault) = peek_window(rt.mem, ip, crate::isa::encoding::MAX_INST_LEN);
        let mode = rt.cpu.mode;
        let found = self
            .recognizers
            .iter()
            .find_map(|r| r(&window[..avail], mode));
        self.compiled.insert(ip, found);

        match found {
            Some(p) => self.run_compiled(rt, p),
            None => Ok(None),
        }
    }

    fn run_compiled(&mut self, rt: &mut Runtime<'_>, p: CompiledPattern) -> Result<Option<Status>> {
        match p.run(rt)? {
            PatternRun::Done => {
                self.hits += 1;
                Ok(Some(Status::Success))
            }
            PatternRun::Skip => {
                self.misses += 1;
                Ok(None)
            }
        }
    }
}
