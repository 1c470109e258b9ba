//! Translation blocks: pre-decoded straight-line instruction runs with
//! per-exit chain tables.
//!
//! A block starts at a hot IP and extends through the decode cache until
//! the first control-flow boundary (which becomes the final entry) or the
//! instruction cap. Blocks live in an arena and refer to each other by
//! index, so chain tables cannot form owning cycles; invalidation clears
//! the arena wholesale.

use std::collections::HashMap;

use crate::cpu::Cpu;
use crate::error::Result;
use crate::exec::decode::{CachedInst, DecodeCache};
use crate::isa::prefix::is_legacy_prefix;
use crate::isa::{InstructionSet, Runtime, Status};
use crate::memory::PagedMemory;

/// Is the byte sequence a control-flow boundary? Leading legacy prefixes
/// are skipped; the first other byte decides.
pub fn is_control_flow_boundary(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() && is_legacy_prefix(bytes[i]) {
        i += 1;
    }
    let Some(&b) = bytes.get(i) else {
        return false;
    };
    match b {
        // REP/REPNE introduce iteration, which blocks must not stride over.
        0xF2 | 0xF3 => true,
        // Jcc short.
        0x70..=0x7F => true,
        // LOOPNE/LOOPE/LOOP/JCXZ.
        0xE0..=0xE3 => true,
        // CALL/JMP near, JMP short.
        0xE8 | 0xE9 | 0xEB => true,
        // CALL/JMP far.
        0x9A | 0xEA => true,
        // RET forms.
        0xC2 | 0xC3 | 0xCA | 0xCB => true,
        // INT3/INT/INTO/IRET.
        0xCC..=0xCF => true,
        // Group 5: CALL/JMP indirect (and INC/DEC/PUSH, conservatively).
        0xFF => true,
        // Jcc near.
        0x0F => matches!(bytes.get(i + 1), Some(0x80..=0x8F)),
        _ => false,
    }
}

/// One pre-decoded instruction inside a block.
pub struct BlockEntry {
    /// Linear IP of the instruction's first byte.
    pub ip: u64,
    pub inst: CachedInst,
}

/// An immutable straight-line run of decoded instructions.
pub struct TranslationBlock {
    pub start_ip: u64,
    pub entries: Vec<BlockEntry>,
    /// Total encoded length of all entries.
    pub byte_len: u64,
    /// Chain table: exit IP to the arena index of the next block.
    pub chain: HashMap<u64, usize>,
}

impl TranslationBlock {
    /// Execute the block.
    ///
    /// For each entry, RIP is first advanced to the instruction's sequential
    /// successor (so relative operands resolve), `before` runs for
    /// bookkeeping, then the handler executes. Returns the terminating
    /// status and the linear IP at which the outer loop must resume.
    pub fn execute<'a>(
        &self,
        rt: &mut Runtime<'a>,
        set: &InstructionSet,
        mut before: impl FnMut(&mut Runtime<'a>, u64, &CachedInst),
    ) -> Result<(Status, u64)> {
        let mut cur = self.start_ip;
        for entry in &self.entries {
            let expected_next = cur + entry.inst.len as u64;

            before(rt, cur, &entry.inst);
            rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(entry.inst.len as u64);

            let status = set
                .handler(entry.inst.handler)
                .process(rt, entry.inst.opcodes())?;

            if status == Status::Continue {
                // Prefix state must stay live for the next dispatch.
                return Ok((Status::Continue, rt.cpu.linear_ip()));
            }
            rt.cpu.clear_transient_overrides();

            if status != Status::Success {
                return Ok((status, rt.cpu.linear_ip()));
            }
            if rt.cpu.linear_ip() != expected_next {
                // An internal jump was taken.
                return Ok((Status::Success, rt.cpu.linear_ip()));
            }
            cur = expected_next;
        }
        Ok((Status::Success, self.start_ip + self.byte_len))
    }
}

/// Arena of translation blocks indexed by start IP.
pub struct BlockArena {
    pub blocks: Vec<TranslationBlock>,
    by_ip: HashMap<u64, usize>,
}

impl BlockArena {
    pub fn new() -> Self {
        BlockArena {
            blocks: Vec::new(),
            by_ip: HashMap::new(),
        }
    }

    /// Arena index of the block starting at `ip`.
    pub fn lookup(&self, ip: u64) -> Option<usize> {
        self.by_ip.get(&ip).copied()
    }

    /// Install a block, returning its index.
    pub fn insert(&mut self, tb: TranslationBlock) -> usize {
        let idx = self.blocks.len();
        self.by_ip.insert(tb.start_ip, idx);
        self.blocks.push(tb);
        idx
    }

    /// Drop every block and chain edge.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.by_ip.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total instructions across all blocks.
    pub fn total_insts(&self) -> usize {
        self.blocks.iter().map(|b| b.entries.len()).sum()
    }
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a block at `start_ip`, decoding through the cache up to
/// `max_insts` instructions and stopping after the first control-flow
/// boundary. The memory offset is saved and restored so construction is
/// transparent to the caller's fetch position. Returns `None` when fewer
/// than two instructions decode (a bare boundary or undecodable bytes are
/// better single-stepped).
pub fn build_block(
    cpu: &Cpu,
    mem: &PagedMemory,
    set: &InstructionSet,
    cache: &mut DecodeCache,
    start_ip: u64,
    max_insts: usize,
) -> Option<TranslationBlock> {
    let saved_offset = mem.offset();
    let mut entries = Vec::new();
    let mut ip = start_ip;

    while entries.len() < max_insts {
        let inst = match cache.get_or_decode(cpu, mem, set, ip) {
            Ok(i) => i,
            // The fault or #UD will surface properly when execution
            // actually reaches this IP.
            Err(_) => break,
        };
        // Never decode past a prefix instruction: the bytes that follow
        // only have a well-defined length under the override it installs,
        // which the builder does not model. (REP runs end the block below
        // as control-flow boundaries.)
        let b0 = inst.bytes[0];
        if is_legacy_prefix(b0)
            || (cpu.mode == crate::cpu::CpuMode::Long64 && (0x40..=0x4F).contains(&b0))
        {
            break;
        }
        let boundary = is_control_flow_boundary(inst.opcodes());
        ip += inst.len as u64;
        entries.push(BlockEntry { ip: ip - inst.len as u64, inst });
        if boundary {
            break;
        }
    }

    mem.set_offset(saved_offset);

    if entries.len() < 2 {
        return None;
    }
    let byte_len = ip - start_ip;
    Some(TranslationBlock {
        start_ip,
        entries,
        byte_len,
        chain: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_recognition() {
        assert!(is_control_flow_boundary(&[0x74, 0x05])); // JZ
        assert!(is_control_flow_boundary(&[0xEB, 0x00])); // JMP short
        assert!(is_control_flow_boundary(&[0xC3])); // RET
        assert!(is_control_flow_boundary(&[0xF3, 0xA4])); // REP MOVSB
        assert!(is_control_flow_boundary(&[0x0F, 0x84, 0, 0, 0, 0])); // JZ near
        assert!(is_control_flow_boundary(&[0xFF, 0xE0])); // JMP EAX
        assert!(is_control_flow_boundary(&[0xCD, 0x10])); // INT
        // Legacy prefixes are skipped before classifying.
        assert!(is_control_flow_boundary(&[0x66, 0x2E, 0xE9, 0, 0]));

        assert!(!is_control_flow_boundary(&[0x90]));
        assert!(!is_control_flow_boundary(&[0x0F, 0xB6, 0xC0])); // MOVZX
        assert!(!is_control_flow_boundary(&[0x89, 0x07]));
        assert!(!is_control_flow_boundary(&[0x66])); // bare prefix run
    }

    #[test]
    fn build_stops_at_boundary_and_restores_offset() {
        let mut cpu = Cpu::new();
        cpu.regs.cr0 |= crate::registers::CR0_PE;
        cpu.regs.seg[crate::registers::SegReg::Cs as usize] =
            crate::registers::SegmentDescriptor::from_raw(0x08, 0x00CF_9A00_0000_FFFF);
        cpu.update_mode();
        let mut mem = PagedMemory::new(0x10000, 0x10000);
        mem.sync_context(&cpu);
        // MOV EAX,1; INC EAX; JMP -7; NOP
        mem.stream_mut()
            .load_at(0x200, &[0xB8, 1, 0, 0, 0, 0x40, 0xEB, 0xF9, 0x90]);
        mem.set_offset(0xDEAD);

        let set = InstructionSet::standard();
        let mut cache = DecodeCache::new();
        let tb = build_block(&cpu, &mem, &set, &mut cache, 0x200, 32).unwrap();

        assert_eq!(tb.entries.len(), 3); // ends with the JMP
        assert_eq!(tb.byte_len, 8);
        assert_eq!(mem.offset(), 0xDEAD);
    }

    #[test]
    fn single_instruction_run_is_not_a_block() {
        let mut cpu = Cpu::new();
        cpu.regs.load_segment_real(crate::registers::SegReg::Cs, 0);
        let mut mem = PagedMemory::new(0x10000, 0x10000);
        mem.sync_context(&cpu);
        mem.stream_mut().load_at(0x300, &[0xC3]); // bare RET

        let set = InstructionSet::standard();
        let mut cache = DecodeCache::new();
        assert!(build_block(&cpu, &mem, &set, &mut cache, 0x300, 32).is_none());
    }
}
