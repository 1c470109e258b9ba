//! Operand shapes and instruction length computation.
//!
//! The instruction list matches only the signature bytes; the total encoded
//! length additionally depends on the operand bytes that follow — ModR/M,
//! SIB, displacement, and immediates — under the live operand/address sizes.
//! The length decoder here walks those fields without materializing operand
//! values, which is all the decode cache needs.

use crate::cpu::CpuMode;
use crate::error::{Result, VmError};
use crate::flags::OperandSize;

/// Architectural maximum instruction length.
pub const MAX_INST_LEN: usize = 15;

/// Operand bytes that follow a matched signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// Nothing follows the signature.
    None,
    /// ModR/M (+ SIB + displacement).
    ModRm,
    /// ModR/M followed by an 8-bit immediate.
    ModRmImm8,
    /// ModR/M followed by an operand-size immediate (16/32-bit).
    ModRmImm,
    /// 8-bit immediate.
    Imm8,
    /// 16-bit immediate.
    Imm16,
    /// Operand-size immediate (16/32-bit; 32-bit in long mode).
    Imm,
    /// Full operand-size immediate including 64-bit (`MOV r64, imm64`).
    ImmFull,
    /// 8-bit relative displacement.
    Rel8,
    /// Operand-size relative displacement (rel32 in long mode).
    Rel,
    /// Far pointer: operand-size offset + 16-bit selector.
    FarPtr,
    /// Direct memory offset of address-size width (`MOV AL, moffs`).
    Moffs,
    /// Group 3 byte form (`F6 /r`): imm8 present when reg field is 0 or 1.
    Group3Byte,
    /// Group 3 full form (`F7 /r`): operand-size immediate when reg is 0/1.
    Group3Full,
    /// Descriptor-table operand (`0F 01`): ModR/M, never an immediate.
    DescriptorTable,
}

/// Immediate width for the operand-size-dependent shapes.
#[inline]
fn imm_width(op: OperandSize) -> u64 {
    match op {
        OperandSize::Word => 2,
        _ => 4,
    }
}

/// Bytes occupied by ModR/M + SIB + displacement starting at `bytes[0]`.
fn modrm_width(bytes: &[u8], addr: OperandSize) -> Result<u64> {
    let modrm = *bytes.first().ok_or(VmError::GeneralProtection(0))?;
    let md = modrm >> 6;
    let rm = modrm & 7;

    if md == 3 {
        return Ok(1);
    }

    if addr == OperandSize::Word {
        // 16-bit addressing: no SIB, disp8/disp16.
        let disp = match md {
            0 => {
                if rm == 6 {
                    2
                } else {
                    0
                }
            }
            1 => 1,
            _ => 2,
        };
        return Ok(1 + disp);
    }

    // 32/64-bit addressing.
    let mut len = 1u64;
    let mut base = rm;
    if rm == 4 {
        let sib = *bytes.get(1).ok_or(VmError::GeneralProtection(0))?;
        len += 1;
        base = sib & 7;
    }
    len += match md {
        0 => {
            if rm == 5 || (rm == 4 && base == 5) {
                4
            } else {
                0
            }
        }
        1 => 1,
        _ => 4,
    };
    Ok(len)
}

/// Total encoded length of an instruction: matched signature plus the
/// operand bytes its shape describes.
///
/// `bytes` is the peek window starting at the instruction's first byte.
/// Exceeding [`MAX_INST_LEN`] or running out of window raises `#GP(0)`,
/// matching the hardware limit on over-long instructions.
pub fn instruction_length(
    shape: OperandShape,
    bytes: &[u8],
    sig_len: usize,
    op: OperandSize,
    addr: OperandSize,
    mode: CpuMode,
) -> Result<u8> {
    let tail = bytes.get(sig_len..).ok_or(VmError::GeneralProtection(0))?;

    let operand_len = match shape {
        OperandShape::None => 0,
        OperandShape::ModRm | OperandShape::DescriptorTable => modrm_width(tail, addr)?,
        OperandShape::ModRmImm8 => modrm_width(tail, addr)? + 1,
        OperandShape::ModRmImm => modrm_width(tail, addr)? + imm_width(op),
        OperandShape::Imm8 => 1,
        OperandShape::Imm16 => 2,
        OperandShape::Imm => imm_width(op),
        OperandShape::ImmFull => op.bytes(),
        OperandShape::Rel8 => 1,
        OperandShape::Rel => {
            if mode == CpuMode::Long64 {
                4
            } else {
                imm_width(op)
            }
        }
        OperandShape::FarPtr => imm_width(op) + 2,
        OperandShape::Moffs => addr.bytes(),
        OperandShape::Group3Byte | OperandShape::Group3Full => {
            let m = modrm_width(tail, addr)?;
            let reg = (tail[0] >> 3) & 7;
            if reg < 2 {
                let imm = if shape == OperandShape::Group3Byte {
                    1
                } else {
                    imm_width(op)
                };
                m + imm
            } else {
                m
            }
        }
    };

    let total = sig_len as u64 + operand_len;
    if total as usize > MAX_INST_LEN || total as usize > bytes.len() {
        return Err(VmError::GeneralProtection(0));
    }
    Ok(total as u8)
}

/// Read a little-endian immediate of `width` bytes from `bytes`.
pub fn read_imm(bytes: &[u8], width: u64) -> u64 {
    let mut v = 0u64;
    for i in 0..width as usize {
        v |= (bytes[i] as u64) << (i * 8);
    }
    v
}

/// Read the operand-size immediate of an `Imm`/`ModRmImm` shape: 16-bit
/// operands carry imm16, wider ones imm32 sign-extended to the operand
/// (64-bit operands never carry an imm64 here; only `ImmFull` does).
pub fn read_imm_for(op: OperandSize, bytes: &[u8]) -> u64 {
    match op {
        OperandSize::Word => OperandSize::Word.sign_extend(read_imm(bytes, 2)),
        _ => OperandSize::Dword.sign_extend(read_imm(bytes, 4)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M32: CpuMode = CpuMode::Protected32;
    const D: OperandSize = OperandSize::Dword;
    const W: OperandSize = OperandSize::Word;

    #[test]
    fn plain_and_immediate_shapes() {
        let b = [0x90u8, 0, 0, 0, 0, 0];
        assert_eq!(
            instruction_length(OperandShape::None, &b, 1, D, D, M32).unwrap(),
            1
        );
        assert_eq!(
            instruction_length(OperandShape::Imm8, &b, 1, D, D, M32).unwrap(),
            2
        );
        assert_eq!(
            instruction_length(OperandShape::Imm, &b, 1, D, D, M32).unwrap(),
            5
        );
        assert_eq!(
            instruction_length(OperandShape::Imm, &b, 1, W, W, CpuMode::Real16).unwrap(),
            3
        );
    }

    #[test]
    fn modrm_with_sib_and_disp() {
        // 8B 44 91 10 — MOV EAX, [ECX + EDX*4 + 0x10].
        let b = [0x8B, 0x44, 0x91, 0x10];
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, D, D, M32).unwrap(),
            4
        );

        // 8B 05 <disp32> — absolute / RIP-relative.
        let b = [0x8B, 0x05, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, D, D, M32).unwrap(),
            6
        );

        // Register form: 8B C3.
        let b = [0x8B, 0xC3];
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, D, D, M32).unwrap(),
            2
        );
    }

    #[test]
    fn modrm_16bit_addressing() {
        // 8B 40 10 — MOV AX, [BX+SI+0x10] under 16-bit addressing.
        let b = [0x8B, 0x40, 0x10];
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, W, W, CpuMode::Real16).unwrap(),
            3
        );
        // mod=00 rm=110: direct disp16.
        let b = [0x8B, 0x06, 0x34, 0x12];
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, W, W, CpuMode::Real16).unwrap(),
            4
        );
    }

    #[test]
    fn group3_immediate_depends_on_reg_field() {
        // F7 /0 (TEST): imm32 follows.
        let b = [0xF7, 0xC0, 1, 2, 3, 4];
        assert_eq!(
            instruction_length(OperandShape::Group3Full, &b, 1, D, D, M32).unwrap(),
            6
        );
        // F7 /3 (NEG): no immediate.
        let b = [0xF7, 0xD8];
        assert_eq!(
            instruction_length(OperandShape::Group3Full, &b, 1, D, D, M32).unwrap(),
            2
        );
    }

    #[test]
    fn mov_imm64_uses_full_operand() {
        let b = [0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 9];
        // Signature here is the B8 byte at index 1; sig_len counts from the
        // start of the window handed in, so pass the window at the opcode.
        assert_eq!(
            instruction_length(
                OperandShape::ImmFull,
                &b[1..],
                1,
                OperandSize::Qword,
                OperandSize::Qword,
                CpuMode::Long64
            )
            .unwrap(),
            9
        );
    }

    #[test]
    fn over_long_instruction_rejected() {
        let b = [0x8B, 0x44];
        // Window too short for the SIB byte.
        assert_eq!(
            instruction_length(OperandShape::ModRm, &b, 1, D, D, M32),
            Err(VmError::GeneralProtection(0))
        );
    }

    #[test]
    fn immediate_reader() {
        assert_eq!(read_imm(&[0x78, 0x56, 0x34, 0x12], 4), 0x1234_5678);
        assert_eq!(read_imm(&[0xFF], 1), 0xFF);
    }
}
