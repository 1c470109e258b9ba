//! Prefix instructions.
//!
//! Legacy and REX prefixes execute as one-byte instructions returning
//! [`Status::Continue`]: they write their transient override and leave the
//! override state live for the instruction that follows. The executor only
//! clears the overrides after a non-CONTINUE instruction completes.

use crate::cpu::CpuMode;
use crate::error::Result;
use crate::isa::{Instruction, InstructionSet, Runtime, Status};
use crate::registers::{RepKind, SegReg};

/// The nine legacy prefix bytes.
pub const LEGACY_PREFIXES: [u8; 9] = [0x26, 0x2E, 0x36, 0x3E, 0x64, 0x65, 0x66, 0x67, 0xF0];

/// Whether `b` is a legacy prefix byte (used by the decode peek-window
/// extension and the control-flow boundary scan).
pub fn is_legacy_prefix(b: u8) -> bool {
    LEGACY_PREFIXES.contains(&b)
}

/// Register all prefix handlers. Must run before the INC/DEC row so the REX
/// registrations win the 0x40-0x4F bytes in long mode.
pub fn register(set: &mut InstructionSet) {
    set.register(&[&[0x26]], Box::new(SegOverride(SegReg::Es)));
    set.register(&[&[0x2E]], Box::new(SegOverride(SegReg::Cs)));
    set.register(&[&[0x36]], Box::new(SegOverride(SegReg::Ss)));
    set.register(&[&[0x3E]], Box::new(SegOverride(SegReg::Ds)));
    set.register(&[&[0x64]], Box::new(SegOverride(SegReg::Fs)));
    set.register(&[&[0x65]], Box::new(SegOverride(SegReg::Gs)));
    set.register(&[&[0x66]], Box::new(OperandSizeOverride));
    set.register(&[&[0x67]], Box::new(AddressSizeOverride));
    set.register(&[&[0xF0]], Box::new(LockPrefix));
    set.register(&[&[0xF2]], Box::new(RepPrefix(RepKind::Repne)));
    set.register(&[&[0xF3]], Box::new(RepPrefix(RepKind::Rep)));

    let sigs: Vec<[u8; 1]> = (0x40u8..=0x4F).map(|b| [b]).collect();
    let refs: Vec<&[u8]> = sigs.iter().map(|s| &s[..]).collect();
    set.register(&refs, Box::new(RexPrefix));
}

struct SegOverride(SegReg);

impl Instruction for SegOverride {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        rt.cpu.prefixes.seg_override = Some(self.0);
        Ok(Status::Continue)
    }
}

struct OperandSizeOverride;

impl Instruction for OperandSizeOverride {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        rt.cpu.prefixes.operand_size = true;
        Ok(Status::Continue)
    }
}

struct AddressSizeOverride;

impl Instruction for AddressSizeOverride {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        rt.cpu.prefixes.address_size = true;
        Ok(Status::Continue)
    }
}

struct LockPrefix;

impl Instruction for LockPrefix {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        // A single CPU observes its own locked accesses as ordinary ones.
        rt.cpu.prefixes.lock = true;
        Ok(Status::Continue)
    }
}

struct RepPrefix(RepKind);

impl Instruction for RepPrefix {
    fn process(&self, rt: &mut Runtime<'_>, _opcodes: &[u8]) -> Result<Status> {
        rt.cpu.prefixes.rep = self.0;
        Ok(Status::Continue)
    }
}

/// REX (0x40-0x4F) — long mode only; the same bytes are INC/DEC elsewhere.
struct RexPrefix;

impl Instruction for RexPrefix {
    fn available(&self, mode: CpuMode) -> bool {
        mode == CpuMode::Long64
    }

    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        rt.cpu.prefixes.rex = opcodes[0] & 0x0F;
        rt.cpu.prefixes.rex_present = true;
        Ok(Status::Continue)
    }
}
