//! Linear-to-physical address translation.
//!
//! Applies the mode-dependent linear mask (A20 gate, real/protected/long
//! width) and, when CR0.PG is set, walks the guest page tables. Three
//! walkers match the hardware paging modes:
//!
//! - **2-level (32-bit):** CR3 -> PD[31:22] -> PT[21:12]; CR4.PSE enables
//!   4 MiB pages via PDE bit 7.
//! - **PAE:** CR3 -> PDPT[31:30] -> PD[29:21] -> PT[20:12]; 2 MiB pages.
//! - **4-level (long mode):** CR3 -> PML4[47:39] -> PDPT[38:30] -> PD[29:21]
//!   -> PT[20:12]; 1 GiB and 2 MiB pages.
//!
//! The translator keeps two single-entry caches — the last resolved read
//! page and the last resolved write page — valid only while the mode
//! fingerprint `(linear mask, paging, user)` is unchanged. Hot loops tend to
//! read and write within one page each, which is what makes this tiny cache
//! worthwhile.

use std::cell::Cell;

use crate::cpu::Cpu;
use crate::error::{Result, VmError};
use crate::memory::stream::ByteStream;
use crate::memory::AccessType;
use crate::registers::{CR0_WP, CR4_PAE, CR4_PSE, EFER_LMA, EFER_NXE, MSR_EFER};

/// 4 KiB page size used throughout the core.
pub const PAGE_SIZE: u64 = 4096;

// ── Page table entry bits ──

/// Present.
const PTE_P: u64 = 1 << 0;
/// Writable.
const PTE_RW: u64 = 1 << 1;
/// User accessible.
const PTE_US: u64 = 1 << 2;
/// Huge page (in PDE/PDPTE).
const PTE_PS: u64 = 1 << 7;
/// No-execute (top bit, requires EFER.NXE).
const PTE_NX: u64 = 1u64 << 63;

// ── Translation-error word codec ──

/// The "no fast path" sentinel of the translation-error word contract.
pub const NO_FAST_PATH: u32 = 0xFFFF_FFFF;

/// Failure outcomes of a typed translated access, as carried by the 32-bit
/// translation-error word: `0` is success, [`NO_FAST_PATH`] tells the caller
/// to fall back to byte-wise translate-plus-physical access, and any other
/// value encodes a fault as `(vector << 16) | error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// The access cannot use the fast path (e.g. a device window); recover
    /// locally, never surfaced to the guest.
    NoFastPath,
    /// An architectural fault with its vector and error code.
    Fault { vector: u8, code: u16 },
}

/// Encode an access outcome into the 32-bit error word.
pub fn encode_error_word(err: Option<TranslateError>) -> u32 {
    match err {
        None => 0,
        Some(TranslateError::NoFastPath) => NO_FAST_PATH,
        Some(TranslateError::Fault { vector, code }) => ((vector as u32) << 16) | code as u32,
    }
}

/// Decode a 32-bit error word back into an outcome.
pub fn decode_error_word(word: u32) -> Option<TranslateError> {
    match word {
        0 => None,
        NO_FAST_PATH => Some(TranslateError::NoFastPath),
        w => Some(TranslateError::Fault {
            vector: ((w >> 16) & 0xFF) as u8,
            code: (w & 0xFFFF) as u16,
        }),
    }
}

impl TranslateError {
    /// Wire form of an architectural error (`None` for non-architectural
    /// errors, which have no place in the error-word contract).
    pub fn from_vm_error(err: &VmError) -> Option<TranslateError> {
        err.vector().map(|vector| TranslateError::Fault {
            vector,
            code: err.error_code().unwrap_or(0),
        })
    }
}

// ── Mode context ──

/// Translation inputs derived from the CPU context. The first three fields
/// are the mode fingerprint that keys the page caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModeContext {
    linear_mask: u64,
    paging: bool,
    user: bool,
    cr3: u64,
    pse: bool,
    pae: bool,
    long: bool,
    wp: bool,
    nxe: bool,
}

impl ModeContext {
    fn from_cpu(cpu: &Cpu) -> Self {
        let efer = cpu.regs.read_msr(MSR_EFER);
        let long = (efer & EFER_LMA) != 0;
        // Real mode and a disabled A20 gate clamp to 20 bits; long mode
        // extends to 48; everything else sees the 32-bit space.
        let linear_mask = if !cpu.is_protected_mode() || !cpu.is_a20_enabled() {
            0xF_FFFF
        } else if long {
            0xFFFF_FFFF_FFFF
        } else {
            0xFFFF_FFFF
        };
        ModeContext {
            linear_mask,
            paging: cpu.is_paging_enabled(),
            user: cpu.cpl() == 3,
            cr3: cpu.regs.cr3,
            pse: (cpu.regs.cr4 & CR4_PSE) != 0,
            pae: (cpu.regs.cr4 & CR4_PAE) != 0,
            long,
            wp: (cpu.regs.cr0 & CR0_WP) != 0,
            nxe: (efer & EFER_NXE) != 0,
        }
    }

    fn fingerprint(&self) -> (u64, bool, bool) {
        (self.linear_mask, self.paging, self.user)
    }
}

// ── Translator ──

/// Linear-to-physical translator with single-entry page caches.
pub struct Translator {
    ctx: ModeContext,
    /// Last resolved read page: `(linear page base, physical page base)`.
    read_cache: Cell<Option<(u64, u64)>>,
    /// Last resolved write page.
    write_cache: Cell<Option<(u64, u64)>>,
}

impl Translator {
    /// New translator with real-mode defaults and cold caches.
    pub fn new() -> Self {
        Translator {
            ctx: ModeContext {
                linear_mask: 0xF_FFFF,
                paging: false,
                user: false,
                cr3: 0,
                pse: false,
                pae: false,
                long: false,
                wp: false,
                nxe: false,
            },
            read_cache: Cell::new(None),
            write_cache: Cell::new(None),
        }
    }

    /// Synchronize from the CPU context. A changed mode fingerprint drops
    /// both page caches.
    pub fn sync(&mut self, cpu: &Cpu) {
        let next = ModeContext::from_cpu(cpu);
        if next.fingerprint() != self.ctx.fingerprint() || next.cr3 != self.ctx.cr3 {
            self.invalidate();
        }
        self.ctx = next;
    }

    /// Drop both single-entry page caches.
    pub fn invalidate(&self) {
        self.read_cache.set(None);
        self.write_cache.set(None);
    }

    /// Apply the current linear mask without translating.
    #[inline]
    pub fn mask_linear(&self, linear: u64) -> u64 {
        linear & self.ctx.linear_mask
    }

    /// Whether paging is active in the current context.
    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.ctx.paging
    }

    /// Translate a linear address for the given access.
    ///
    /// Reads (and fetches) probe the read cache then the write cache;
    /// writes probe only the write cache. A walk that succeeds refills the
    /// matching cache.
    pub fn translate(
        &self,
        linear: u64,
        access: AccessType,
        stream: &ByteStream,
    ) -> Result<u64> {
        let linear = linear & self.ctx.linear_mask;
        if !self.ctx.paging {
            return Ok(linear);
        }

        let page = linear & !(PAGE_SIZE - 1);
        let off = linear & (PAGE_SIZE - 1);

        match access {
            AccessType::Read | AccessType::Fetch => {
                if let Some((lp, pp)) = self.read_cache.get() {
                    if lp == page {
                        return Ok(pp | off);
                    }
                }
                if let Some((lp, pp)) = self.write_cache.get() {
                    if lp == page {
                        return Ok(pp | off);
                    }
                }
            }
            AccessType::Write => {
                if let Some((lp, pp)) = self.write_cache.get() {
                    if lp == page {
                        return Ok(pp | off);
                    }
                }
            }
        }

        let phys = self.walk(linear, access, stream)?;
        let phys_page = phys & !(PAGE_SIZE - 1);
        match access {
            AccessType::Read | AccessType::Fetch => self.read_cache.set(Some((page, phys_page))),
            AccessType::Write => self.write_cache.set(Some((page, phys_page))),
        }
        Ok(phys)
    }

    fn walk(&self, linear: u64, access: AccessType, stream: &ByteStream) -> Result<u64> {
        if self.ctx.long {
            self.walk_4level(linear, access, stream)
        } else if self.ctx.pae {
            self.walk_pae(linear, access, stream)
        } else {
            self.walk_2level(linear, access, stream)
        }
    }

    /// Check a table entry against the access, producing a #PF on violation.
    fn check_entry(&self, entry: u64, access: AccessType, linear: u64) -> Result<()> {
        let fault = |present: bool| VmError::PageFault {
            address: linear,
            error_code: access.pf_code(self.ctx.user, present).bits(),
        };

        if (entry & PTE_P) == 0 {
            return Err(fault(false));
        }
        if self.ctx.user && (entry & PTE_US) == 0 {
            return Err(fault(true));
        }
        match access {
            AccessType::Write => {
                if (entry & PTE_RW) == 0 && (self.ctx.user || self.ctx.wp) {
                    return Err(fault(true));
                }
            }
            AccessType::Fetch => {
                if self.ctx.nxe && (entry & PTE_NX) != 0 {
                    return Err(fault(true));
                }
            }
            AccessType::Read => {}
        }
        Ok(())
    }

    fn walk_2level(&self, linear: u64, access: AccessType, stream: &ByteStream) -> Result<u64> {
        let l = linear as u32;

        let pde_addr = (self.ctx.cr3 & 0xFFFF_F000) + ((l >> 22) as u64) * 4;
        let pde = stream.read_u32(pde_addr) as u64;
        self.check_entry(pde, access, linear)?;

        if self.ctx.pse && (pde & PTE_PS) != 0 {
            // 4 MiB page: PDE[31:22] || linear[21:0].
            return Ok((pde & 0xFFC0_0000) | (l & 0x003F_FFFF) as u64);
        }

        let pte_addr = (pde & 0xFFFF_F000) + (((l >> 12) & 0x3FF) as u64) * 4;
        let pte = stream.read_u32(pte_addr) as u64;
        self.check_entry(pte, access, linear)?;

        Ok((pte & 0xFFFF_F000) | (l & 0xFFF) as u64)
    }

    fn walk_pae(&self, linear: u64, access: AccessType, stream: &ByteStream) -> Result<u64> {
        let l = linear as u32;

        let pdpte_addr = (self.ctx.cr3 & 0xFFFF_FFE0) + ((l >> 30) as u64) * 8;
        let pdpte = stream.read_u64(pdpte_addr);
        // PDPT entries carry only the present bit in PAE.
        if (pdpte & PTE_P) == 0 {
            return Err(VmError::PageFault {
                address: linear,
                error_code: access.pf_code(self.ctx.user, false).bits(),
            });
        }

        let pde_addr = (pdpte & 0x000F_FFFF_FFFF_F000) + (((l >> 21) & 0x1FF) as u64) * 8;
        let pde = stream.read_u64(pde_addr);
        self.check_entry(pde, access, linear)?;

        if (pde & PTE_PS) != 0 {
            // 2 MiB page.
            return Ok((pde & 0x000F_FFFF_FFE0_0000) | (l & 0x001F_FFFF) as u64);
        }

        let pte_addr = (pde & 0x000F_FFFF_FFFF_F000) + (((l >> 12) & 0x1FF) as u64) * 8;
        let pte = stream.read_u64(pte_addr);
        self.check_entry(pte, access, linear)?;

        Ok((pte & 0x000F_FFFF_FFFF_F000) | (l & 0xFFF) as u64)
    }

    fn walk_4level(&self, linear: u64, access: AccessType, stream: &ByteStream) -> Result<u64> {
        let pml4e_addr = (self.ctx.cr3 & 0x000F_FFFF_FFFF_F000) + ((linear >> 39) & 0x1FF) * 8;
        let pml4e = stream.read_u64(pml4e_addr);
        self.check_entry(pml4e, access, linear)?;

        let pdpte_addr = (pml4e & 0x000F_FFFF_FFFF_F000) + ((linear >> 30) & 0x1FF) * 8;
        let pdpte = stream.read_u64(pdpte_addr);
        self.check_entry(pdpte, access, linear)?;

        if (pdpte & PTE_PS) != 0 {
            // 1 GiB page.
            return Ok((pdpte & 0x000F_FFFF_C000_0000) | (linear & 0x3FFF_FFFF));
        }

        let pde_addr = (pdpte & 0x000F_FFFF_FFFF_F000) + ((linear >> 21) & 0x1FF) * 8;
        let pde = stream.read_u64(pde_addr);
        self.check_entry(pde, access, linear)?;

        if (pde & PTE_PS) != 0 {
            // 2 MiB page.
            return Ok((pde & 0x000F_FFFF_FFE0_0000) | (linear & 0x1F_FFFF));
        }

        let pte_addr = (pde & 0x000F_FFFF_FFFF_F000) + ((linear >> 12) & 0x1FF) * 8;
        let pte = stream.read_u64(pte_addr);
        self.check_entry(pte, access, linear)?;

        Ok((pte & 0x000F_FFFF_FFFF_F000) | (linear & 0xFFF))
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::registers::{CR0_PE, CR0_PG};

    /// Identity-map the first 4 MiB with a 2-level page table at 0x1000.
    fn setup_2level(stream: &mut ByteStream, user: bool) -> u64 {
        let cr3 = 0x1000u64;
        let pt = 0x2000u64;
        let flags = if user { PTE_P | PTE_RW | PTE_US } else { PTE_P | PTE_RW };
        stream.write_u32(cr3, (pt as u32) | flags as u32);
        for i in 0..1024u64 {
            stream.write_u32(pt + i * 4, ((i * 0x1000) as u32) | flags as u32);
        }
        cr3
    }

    fn paged_cpu(cr3: u64) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.regs.cr0 |= CR0_PE | CR0_PG;
        cpu.regs.cr3 = cr3;
        cpu.update_mode();
        cpu
    }

    #[test]
    fn disabled_paging_is_identity_under_mask() {
        let stream = ByteStream::new(0x10000, 0x10000);
        let mut tr = Translator::new();
        let mut cpu = Cpu::new();
        cpu.regs.cr0 |= CR0_PE;
        tr.sync(&cpu);
        assert_eq!(tr.translate(0x1234, AccessType::Read, &stream).unwrap(), 0x1234);

        // Real mode masks to 20 bits.
        let cpu = Cpu::new();
        tr.sync(&cpu);
        assert_eq!(
            tr.translate(0x10_1234, AccessType::Read, &stream).unwrap(),
            0x1234
        );
    }

    #[test]
    fn two_level_walk_and_not_present_fault() {
        let mut stream = ByteStream::new(0x40_0000, 0x40_0000);
        let cr3 = setup_2level(&mut stream, false);
        let mut tr = Translator::new();
        tr.sync(&paged_cpu(cr3));

        assert_eq!(
            tr.translate(0x3045, AccessType::Read, &stream).unwrap(),
            0x3045
        );

        // Clear one PTE: not-present read fault with P=0, W=0.
        stream.write_u32(0x2000 + 5 * 4, 0);
        tr.invalidate();
        let err = tr.translate(0x5000, AccessType::Read, &stream).unwrap_err();
        assert_eq!(
            err,
            VmError::PageFault { address: 0x5000, error_code: 0 }
        );
    }

    #[test]
    fn user_write_to_supervisor_page_faults() {
        let mut stream = ByteStream::new(0x40_0000, 0x40_0000);
        let cr3 = setup_2level(&mut stream, false);
        let mut cpu = paged_cpu(cr3);
        cpu.regs.cpl = 3;
        let mut tr = Translator::new();
        tr.sync(&cpu);

        let err = tr.translate(0x5000, AccessType::Write, &stream).unwrap_err();
        // P=1 (protection), W=1, U=1.
        assert_eq!(
            err,
            VmError::PageFault { address: 0x5000, error_code: 0b111 }
        );
    }

    #[test]
    fn page_caches_hit_and_die_with_fingerprint() {
        let mut stream = ByteStream::new(0x40_0000, 0x40_0000);
        let cr3 = setup_2level(&mut stream, false);
        let mut tr = Translator::new();
        let mut cpu = paged_cpu(cr3);
        tr.sync(&cpu);

        assert_eq!(tr.translate(0x3000, AccessType::Read, &stream).unwrap(), 0x3000);
        // Destroy the PTE behind the translator's back; the cache still
        // serves the mapping.
        stream.write_u32(0x2000 + 3 * 4, 0);
        assert_eq!(tr.translate(0x3008, AccessType::Read, &stream).unwrap(), 0x3008);

        // A privilege-level change alters the fingerprint: full walk again.
        cpu.regs.cpl = 3;
        tr.sync(&cpu);
        assert!(tr.translate(0x3008, AccessType::Read, &stream).is_err());
    }

    #[test]
    fn write_cache_not_consulted_by_reads_only_rule() {
        let mut stream = ByteStream::new(0x40_0000, 0x40_0000);
        let cr3 = setup_2level(&mut stream, false);
        let mut cpu = paged_cpu(cr3);
        cpu.regs.cr0 |= CR0_WP;
        let mut tr = Translator::new();
        tr.sync(&cpu);

        // Prime the read cache only.
        tr.translate(0x4000, AccessType::Read, &stream).unwrap();
        // Remove write permission; a write must walk and fault despite the
        // read cache holding the page.
        stream.write_u32(0x2000 + 4 * 4, 0x4000 | PTE_P as u32);
        let err = tr.translate(0x4000, AccessType::Write, &stream).unwrap_err();
        assert!(matches!(err, VmError::PageFault { .. }));
    }

    #[test]
    fn error_word_round_trip() {
        assert_eq!(encode_error_word(None), 0);
        assert_eq!(decode_error_word(0), None);
        assert_eq!(
            encode_error_word(Some(TranslateError::NoFastPath)),
            NO_FAST_PATH
        );
        assert_eq!(
            decode_error_word(NO_FAST_PATH),
            Some(TranslateError::NoFastPath)
        );
        let f = TranslateError::Fault { vector: 14, code: 0b10110 };
        let w = encode_error_word(Some(f));
        assert_eq!(w, (14 << 16) | 0b10110);
        assert_eq!(decode_error_word(w), Some(f));
    }
}
