//! The decode cache: `IP -> (handler, opcode bytes, length)`.
//!
//! On a miss the decoder peeks a window of up to the architectural 15-byte
//! maximum, matches it longest-prefix-first against the instruction list,
//! and computes the full encoded length from the handler's operand shape.
//! Peeking reads through the paged view with the instruction-fetch flag
//! raised, one byte at a time and fault-tolerantly: a fetch fault only
//! surfaces if the instruction actually needs the unreadable byte, so an
//! instruction ending flush against a page boundary decodes cleanly.

use std::collections::HashMap;

use crate::cpu::Cpu;
use crate::error::{Result, VmError};
use crate::isa::encoding::{instruction_length, MAX_INST_LEN};
use crate::isa::prefix::is_legacy_prefix;
use crate::isa::{HandlerId, InstructionSet};
use crate::memory::PagedMemory;

/// One cached decode result. The byte image is inline so entries stay
/// `Copy`; only the first `len` bytes are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct CachedInst {
    pub handler: HandlerId,
    pub bytes: [u8; MAX_INST_LEN],
    pub len: u8,
}

impl CachedInst {
    /// The instruction's byte image.
    #[inline]
    pub fn opcodes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Peek up to `limit` instruction bytes at `ip`.
///
/// Returns the window, the bytes actually readable, and the fault that cut
/// the window short, if any.
pub(crate) fn peek_window(
    mem: &PagedMemory,
    ip: u64,
    limit: usize,
) -> ([u8; MAX_INST_LEN], usize, Option<VmError>) {
    let _fetch = mem.fetch_scope();
    let mut window = [0u8; MAX_INST_LEN];
    let mut avail = 0usize;
    let mut fault = None;
    let limit = limit.min(MAX_INST_LEN);

    for i in 0..MAX_INST_LEN {
        // Stop at the base window unless a leading legacy prefix extends it.
        if i >= limit && !(avail > 0 && is_legacy_prefix(window[0])) {
            break;
        }
        match mem.read_u8(ip.wrapping_add(i as u64)) {
            Ok(b) => {
                window[i] = b;
                avail += 1;
            }
            Err(e) => {
                fault = Some(e);
                break;
            }
        }
    }
    (window, avail, fault)
}

/// Decode the instruction at linear `ip` against the instruction list.
pub fn decode_at(
    cpu: &Cpu,
    mem: &PagedMemory,
    set: &InstructionSet,
    ip: u64,
) -> Result<CachedInst> {
    mem.set_offset(ip);
    let (window, avail, fault) = peek_window(mem, ip, MAX_INST_LEN);
    if avail == 0 {
        return Err(fault.unwrap_or(VmError::UndefinedOpcode(0)));
    }

    let (handler, sig_len) = set
        .find_instruction(&window[..avail], cpu.mode)
        .ok_or(VmError::UndefinedOpcode(window[0]))?;

    let shape = set.handler(handler).shape(&window[..sig_len]);
    let len = instruction_length(
        shape,
        &window[..avail],
        sig_len,
        cpu.operand_size(),
        cpu.address_size(),
        cpu.mode,
    )
    .map_err(|e| fault.unwrap_or(e))?;

    mem.set_offset(ip + len as u64);
    Ok(CachedInst {
        handler,
        bytes: window,
        len,
    })
}

/// The decode cache proper.
pub struct DecodeCache {
    map: HashMap<u64, CachedInst>,
}

impl DecodeCache {
    pub fn new() -> Self {
        DecodeCache { map: HashMap::new() }
    }

    /// Number of cached decodes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Cached decode at `ip`, decoding and storing on a miss.
    pub fn get_or_decode(
        &mut self,
        cpu: &Cpu,
        mem: &PagedMemory,
        set: &InstructionSet,
        ip: u64,
    ) -> Result<CachedInst> {
        if let Some(c) = self.map.get(&ip) {
            return Ok(*c);
        }
        let c = decode_at(cpu, mem, set, ip)?;
        self.map.insert(ip, c);
        Ok(c)
    }
}

impl Default for DecodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::CR0_PE;

    fn setup(code: &[u8]) -> (Cpu, PagedMemory, InstructionSet) {
        let mut cpu = Cpu::new();
        cpu.regs.cr0 |= CR0_PE;
        cpu.regs.seg[crate::registers::SegReg::Cs as usize] =
            crate::registers::SegmentDescriptor::from_raw(0x08, 0x00CF_9A00_0000_FFFF);
        cpu.update_mode();
        let mut mem = PagedMemory::new(0x10000, 0x10000);
        mem.sync_context(&cpu);
        mem.stream_mut().load_at(0x100, code);
        (cpu, mem, InstructionSet::standard())
    }

    #[test]
    fn decode_is_idempotent() {
        let (cpu, mem, set) = setup(&[0x05, 0x78, 0x56, 0x34, 0x12]); // ADD EAX, imm32
        let mut cache = DecodeCache::new();
        let a = cache.get_or_decode(&cpu, &mem, &set, 0x100).unwrap();
        let b = decode_at(&cpu, &mem, &set, 0x100).unwrap();
        assert_eq!(a.handler, b.handler);
        assert_eq!(a.len, b.len);
        assert_eq!(a.opcodes(), b.opcodes());
        assert_eq!(a.len, 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unknown_byte_is_undefined_opcode() {
        let (cpu, mem, set) = setup(&[0x0F, 0xFF]);
        let err = decode_at(&cpu, &mem, &set, 0x100).unwrap_err();
        assert_eq!(err, VmError::UndefinedOpcode(0x0F));
    }

    #[test]
    fn prefix_byte_decodes_as_one_byte_continue_instruction() {
        let (cpu, mem, set) = setup(&[0x66, 0x90]);
        let c = decode_at(&cpu, &mem, &set, 0x100).unwrap();
        assert_eq!(c.len, 1);
        assert_eq!(c.opcodes(), &[0x66]);
    }

    #[test]
    fn peek_window_extends_past_base_for_prefix_runs() {
        // Ten 0x66 prefixes then NOP: the window must keep reading past the
        // base signature length.
        let mut code = vec![0x66u8; 10];
        code.push(0x90);
        let (_cpu, mem, _set) = setup(&code);
        let (window, avail, fault) = peek_window(&mem, 0x100, 2);
        assert!(fault.is_none());
        assert_eq!(avail, MAX_INST_LEN);
        assert_eq!(window[10], 0x90);
    }
}
