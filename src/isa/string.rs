//! String instructions (MOVS/STOS/LODS/SCAS/CMPS) with REP iteration.
//!
//! Under a REP-family prefix the handler performs exactly one architectural
//! iteration per invocation. While iterations remain it winds RIP back to
//! the head of the prefix chain, marks the CPU as iterating, and returns
//! [`Status::Continue`] so the transient REP override stays live; the
//! executor single-steps iterating instructions, which keeps interrupt
//! delivery possible between iterations and the last-instruction bookkeeping
//! exact.

use crate::error::Result;
use crate::flags::{self, flags_sub, update_status, OperandSize};
use crate::isa::{Instruction, InstructionSet, Runtime, Status};
use crate::registers::{Gpr, RepKind, SegReg};

/// Register the string-operation handlers.
pub fn register(set: &mut InstructionSet) {
    set.register(&[&[0xA4], &[0xA5]], Box::new(StringOp(Kind::Movs)));
    set.register(&[&[0xAA], &[0xAB]], Box::new(StringOp(Kind::Stos)));
    set.register(&[&[0xAC], &[0xAD]], Box::new(StringOp(Kind::Lods)));
    set.register(&[&[0xAE], &[0xAF]], Box::new(StringOp(Kind::Scas)));
    set.register(&[&[0xA6], &[0xA7]], Box::new(StringOp(Kind::Cmps)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Movs,
    Stos,
    Lods,
    Scas,
    Cmps,
}

impl Kind {
    fn uses_si(self) -> bool {
        matches!(self, Kind::Movs | Kind::Lods | Kind::Cmps)
    }

    fn uses_di(self) -> bool {
        matches!(self, Kind::Movs | Kind::Stos | Kind::Scas | Kind::Cmps)
    }

    /// SCAS/CMPS terminate REP on the ZF condition as well as the count.
    fn compares(self) -> bool {
        matches!(self, Kind::Scas | Kind::Cmps)
    }
}

struct StringOp(Kind);

impl Instruction for StringOp {
    fn process(&self, rt: &mut Runtime<'_>, opcodes: &[u8]) -> Result<Status> {
        let kind = self.0;
        let wide = opcodes[0] & 1 != 0;
        let unit = if wide {
            rt.cpu.operand_size()
        } else {
            OperandSize::Byte
        };
        let addr = rt.cpu.address_size();
        let rep = rt.cpu.prefixes.rep;

        if rep != RepKind::None {
            let count = rt.cpu.regs.read_sized(Gpr::Rcx as u8, addr, true);
            if count == 0 {
                rt.cpu.iterating = false;
                return Ok(Status::Success);
            }
        }

        step(rt, kind, unit, addr)?;

        if rep == RepKind::None {
            return Ok(Status::Success);
        }

        let count = rt
            .cpu
            .regs
            .read_sized(Gpr::Rcx as u8, addr, true)
            .wrapping_sub(1)
            & addr.mask();
        rt.cpu.regs.write_sized(Gpr::Rcx as u8, addr, true, count);

        let zf = (rt.cpu.regs.rflags & flags::ZF) != 0;
        let done = count == 0
            || (kind.compares()
                && match rep {
                    RepKind::Rep => !zf,
                    RepKind::Repne => zf,
                    RepKind::None => unreachable!(),
                });

        if done {
            rt.cpu.iterating = false;
            Ok(Status::Success)
        } else {
            // Wind RIP back to the head of the prefix chain so an interrupt
            // delivered between iterations resumes with the REP prefix
            // re-executed. The overrides stay live because we return
            // Continue.
            rt.cpu.regs.rip = rt.cpu.prefix_chain_start;
            rt.cpu.iterating = true;
            Ok(Status::Continue)
        }
    }
}

/// One architectural iteration: move/compare/store one unit and advance the
/// index registers along DF.
fn step(rt: &mut Runtime<'_>, kind: Kind, unit: OperandSize, addr: OperandSize) -> Result<()> {
    let bytes = unit.bytes();
    let df = (rt.cpu.regs.rflags & flags::DF) != 0;
    let delta = if df { bytes.wrapping_neg() } else { bytes };

    let src_seg = rt.cpu.prefixes.seg_override.unwrap_or(SegReg::Ds);
    let si = rt.cpu.regs.read_sized(Gpr::Rsi as u8, addr, true);
    let di = rt.cpu.regs.read_sized(Gpr::Rdi as u8, addr, true);
    let src_linear = rt.cpu.regs.seg[src_seg as usize].base.wrapping_add(si);
    // The destination segment is always ES, overrides notwithstanding.
    let dst_linear = rt.cpu.regs.seg[SegReg::Es as usize].base.wrapping_add(di);

    match kind {
        Kind::Movs => {
            let v = rt.mem.read_sized(src_linear, bytes)?;
            rt.mem.write_sized(dst_linear, bytes, v)?;
        }
        Kind::Stos => {
            let v = rt.cpu.regs.read_sized(Gpr::Rax as u8, unit, true);
            rt.mem.write_sized(dst_linear, bytes, v)?;
        }
        Kind::Lods => {
            let v = rt.mem.read_sized(src_linear, bytes)?;
            rt.cpu.regs.write_sized(Gpr::Rax as u8, unit, true, v);
        }
        Kind::Scas => {
            let a = rt.cpu.regs.read_sized(Gpr::Rax as u8, unit, true);
            let b = rt.mem.read_sized(dst_linear, bytes)?;
            let f = flags_sub(a, b, a.wrapping_sub(b), unit);
            update_status(&mut rt.cpu.regs.rflags, f);
        }
        Kind::Cmps => {
            let a = rt.mem.read_sized(src_linear, bytes)?;
            let b = rt.mem.read_sized(dst_linear, bytes)?;
            let f = flags_sub(a, b, a.wrapping_sub(b), unit);
            update_status(&mut rt.cpu.regs.rflags, f);
        }
    }

    if kind.uses_si() {
        rt.cpu
            .regs
            .write_sized(Gpr::Rsi as u8, addr, true, si.wrapping_add(delta) & addr.mask());
    }
    if kind.uses_di() {
        rt.cpu
            .regs
            .write_sized(Gpr::Rdi as u8, addr, true, di.wrapping_add(delta) & addr.mask());
    }
    Ok(())
}
