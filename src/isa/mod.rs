//! Instruction list, handler contracts, and the runtime handle.
//!
//! Every instruction is a value implementing [`Instruction`]: the core only
//! sees `process(runtime, opcodes) -> status` and a declared operand shape
//! used for length computation. Handlers are registered against byte
//! signatures in an [`InstructionSet`], which resolves fetched bytes with a
//! longest-prefix-first match.
//!
//! Handler implementations are grouped by category as the execution engine
//! they were adapted from groups them: `arith`, `logic`, `data`, `stack`,
//! `control`, `string`, `system`, plus the prefix instructions in `prefix`.

pub mod arith;
pub mod control;
pub mod data;
pub mod encoding;
pub mod logic;
pub mod operands;
pub mod prefix;
pub mod stack;
pub mod string;
pub mod system;

use crate::cpu::{Cpu, CpuMode};
use crate::error::{Result, VmError};
use crate::interrupts::InterruptController;
use crate::memory::PagedMemory;
use crate::registers::{SegReg, SegmentDescriptor};

pub use encoding::OperandShape;

/// Outcome of one instruction handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Prefix-only work (or a REP iteration that will repeat): transient
    /// overrides stay live for the next dispatch.
    Continue,
    /// Normal completion.
    Success,
    /// HLT executed.
    Halt,
    /// INT3 executed (host breakpoint).
    Break,
}

/// The mutable machine state handed to instruction handlers.
pub struct Runtime<'a> {
    pub cpu: &'a mut Cpu,
    pub mem: &'a mut PagedMemory,
    pub interrupts: &'a mut InterruptController,
}

/// One instruction semantic.
///
/// `opcodes` is the full cached byte image of the instruction (signature
/// plus operand bytes, at most 15). On entry RIP already points at the next
/// sequential instruction, so relative operands resolve against it; a
/// handler only touches RIP to branch.
pub trait Instruction {
    /// Operand shape following the matched signature, for length decoding.
    fn shape(&self, _sig: &[u8]) -> OperandShape {
        OperandShape::None
    }

    /// Whether this instruction exists in the given mode (REX prefixes vs.
    /// INC/DEC row, 64-bit invalid encodings).
    fn available(&self, _mode: CpuMode) -> bool {
        true
    }

    /// Execute the instruction.
    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status>;
}

/// Index of a registered handler.
pub type HandlerId = usize;

/// The instruction list: byte signatures mapped to handler values.
pub struct InstructionSet {
    handlers: Vec<Box<dyn Instruction>>,
    /// `(signature, handler)` sorted by signature length, longest first.
    table: Vec<(Vec<u8>, HandlerId)>,
    max_len: usize,
}

impl InstructionSet {
    /// Empty instruction list.
    pub fn new() -> Self {
        InstructionSet {
            handlers: Vec::new(),
            table: Vec::new(),
            max_len: 0,
        }
    }

    /// The standard ISA: every handler group registered.
    pub fn standard() -> Self {
        let mut set = InstructionSet::new();
        prefix::register(&mut set);
        arith::register(&mut set);
        logic::register(&mut set);
        data::register(&mut set);
        stack::register(&mut set);
        control::register(&mut set);
        string::register(&mut set);
        system::register(&mut set);
        set
    }

    /// Register one handler under one or more byte signatures.
    pub fn register(&mut self, sigs: &[&[u8]], handler: Box<dyn Instruction>) -> HandlerId {
        let id = self.handlers.len();
        self.handlers.push(handler);
        for sig in sigs {
            assert!(!sig.is_empty() && sig.len() <= 15, "bad signature");
            self.max_len = self.max_len.max(sig.len());
            let entry = (sig.to_vec(), id);
            // Keep the table ordered longest-first so lookup is a scan.
            let pos = self
                .table
                .iter()
                .position(|(s, _)| s.len() < sig.len())
                .unwrap_or(self.table.len());
            self.table.insert(pos, entry);
        }
        id
    }

    /// Longest-prefix-first lookup of `bytes` against the registered
    /// signatures. Returns the handler and the matched signature length.
    pub fn find_instruction(&self, bytes: &[u8], mode: CpuMode) -> Option<(HandlerId, usize)> {
        for (sig, id) in &self.table {
            if bytes.len() >= sig.len()
                && bytes[..sig.len()] == sig[..]
                && self.handlers[*id].available(mode)
            {
                return Some((*id, sig.len()));
            }
        }
        None
    }

    /// Longest registered signature, the decode peek window baseline.
    pub fn max_opcode_length(&self) -> usize {
        self.max_len
    }

    /// Access a registered handler.
    pub fn handler(&self, id: HandlerId) -> &dyn Instruction {
        &*self.handlers[id]
    }
}

impl Default for InstructionSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared segment loading ──

/// Load a segment register from a selector under the current mode.
///
/// Real mode shifts the selector; protected and long modes read the GDT
/// entry, with null selectors permitted for data segments only. LDT
/// selectors are looked up in the GDT regardless (local tables are not
/// modeled).
pub fn load_segment(rt: &mut Runtime<'_>, seg: SegReg, selector: u16) -> Result<()> {
    if !rt.cpu.is_protected_mode() {
        rt.cpu.regs.load_segment_real(seg, selector);
        return Ok(());
    }

    if (selector & 0xFFFC) == 0 {
        if matches!(seg, SegReg::Cs | SegReg::Ss) {
            return Err(VmError::GeneralProtection(0));
        }
        let d = &mut rt.cpu.regs.seg[seg as usize];
        *d = SegmentDescriptor::real_mode(0);
        d.selector = selector;
        d.base = 0;
        d.limit = 0;
        d.present = false;
        d.writable = false;
        return Ok(());
    }

    let index = (selector & 0xFFF8) as u64;
    if index + 7 > rt.cpu.regs.gdtr.limit as u64 {
        return Err(VmError::GeneralProtection(selector & 0xFFFC));
    }
    let raw = rt.mem.read_u64(rt.cpu.regs.gdtr.base.wrapping_add(index))?;
    let desc = SegmentDescriptor::from_raw(selector, raw);
    if !desc.present {
        return Err(VmError::SegmentNotPresent(selector & 0xFFFC));
    }
    rt.cpu.regs.seg[seg as usize] = desc;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    impl Instruction for Stub {
        fn process(&self, _rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
            Ok(Status::Success)
        }
    }

    struct LongOnly;
    impl Instruction for LongOnly {
        fn available(&self, mode: CpuMode) -> bool {
            mode == CpuMode::Long64
        }
        fn process(&self, _rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
            Ok(Status::Success)
        }
    }

    #[test]
    fn longest_prefix_first() {
        let mut set = InstructionSet::new();
        let short = set.register(&[&[0x0F]], Box::new(Stub));
        let long = set.register(&[&[0x0F, 0x84]], Box::new(Stub));

        let (id, len) = set
            .find_instruction(&[0x0F, 0x84, 0x00], CpuMode::Protected32)
            .unwrap();
        assert_eq!((id, len), (long, 2));

        let (id, len) = set
            .find_instruction(&[0x0F, 0x85], CpuMode::Protected32)
            .unwrap();
        assert_eq!((id, len), (short, 1));

        assert_eq!(set.max_opcode_length(), 2);
    }

    #[test]
    fn mode_gated_match_falls_through() {
        let mut set = InstructionSet::new();
        let rex = set.register(&[&[0x40]], Box::new(LongOnly));
        let inc = set.register(&[&[0x40]], Box::new(Stub));

        // In long mode the first (REX) registration wins; elsewhere the
        // lookup falls through to the INC handler.
        let (id, _) = set.find_instruction(&[0x40], CpuMode::Long64).unwrap();
        assert_eq!(id, rex);
        let (id, _) = set.find_instruction(&[0x40], CpuMode::Protected32).unwrap();
        assert_eq!(id, inc);
    }

    #[test]
    fn no_match_is_none() {
        let set = InstructionSet::new();
        assert!(set.find_instruction(&[0x90], CpuMode::Real16).is_none());
    }
}
