//! Error types for the execution core.
//!
//! `VmError` doubles as the Rust error type of every fallible operation and
//! as the representation of x86 CPU exceptions. The executor catches
//! architectural variants at the dispatch boundary and routes them to the
//! interrupt-delivery handler; non-architectural variants are terminal and
//! propagate out to the host.

use thiserror::Error;

/// Errors raised during emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No instruction handler matched the fetched bytes (#UD, vector 6).
    #[error("#UD: undefined opcode 0x{0:02X}")]
    UndefinedOpcode(u8),

    /// Divide by zero or quotient overflow (#DE, vector 0).
    #[error("#DE: divide error")]
    DivideError,

    /// Debug exception (#DB, vector 1).
    #[error("#DB: debug exception")]
    DebugException,

    /// Breakpoint (#BP, vector 3).
    #[error("#BP: breakpoint")]
    Breakpoint,

    /// Overflow (#OF, vector 4).
    #[error("#OF: overflow")]
    Overflow,

    /// Bound range exceeded (#BR, vector 5).
    #[error("#BR: bound range exceeded")]
    BoundRange,

    /// Double fault (#DF, vector 8).
    #[error("#DF: double fault")]
    DoubleFault,

    /// Invalid TSS (#TS, vector 10).
    #[error("#TS(0x{0:04X})")]
    InvalidTss(u16),

    /// Segment not present (#NP, vector 11).
    #[error("#NP(0x{0:04X})")]
    SegmentNotPresent(u16),

    /// Stack segment fault (#SS, vector 12).
    #[error("#SS(0x{0:04X})")]
    StackFault(u16),

    /// General protection fault (#GP, vector 13).
    #[error("#GP(0x{0:04X})")]
    GeneralProtection(u16),

    /// Page fault (#PF, vector 14). `address` is the faulting linear address
    /// destined for CR2.
    #[error("#PF at 0x{address:016X} (error=0x{error_code:04X})")]
    PageFault { address: u64, error_code: u16 },

    /// A run of all-zero opcodes exceeded the configured limit. Protects
    /// against runaway fetches from uninitialized memory.
    #[error("runaway zero-opcode run at IP 0x{ip:X} ({run} consecutive)")]
    RunawayZeroRun { ip: u64, run: u32 },

    /// Internal emulator failure. Never delivered to the guest.
    #[error("emulator error: {0}")]
    Emulator(&'static str),
}

impl VmError {
    /// The x86 exception vector for this error, if it is architectural.
    pub fn vector(&self) -> Option<u8> {
        match self {
            VmError::DivideError => Some(0),
            VmError::DebugException => Some(1),
            VmError::Breakpoint => Some(3),
            VmError::Overflow => Some(4),
            VmError::BoundRange => Some(5),
            VmError::UndefinedOpcode(_) => Some(6),
            VmError::DoubleFault => Some(8),
            VmError::InvalidTss(_) => Some(10),
            VmError::SegmentNotPresent(_) => Some(11),
            VmError::StackFault(_) => Some(12),
            VmError::GeneralProtection(_) => Some(13),
            VmError::PageFault { .. } => Some(14),
            _ => None,
        }
    }

    /// The error code pushed on the handler stack, if this exception has one.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            VmError::DoubleFault => Some(0),
            VmError::InvalidTss(ec)
            | VmError::SegmentNotPresent(ec)
            | VmError::StackFault(ec)
            | VmError::GeneralProtection(ec) => Some(*ec),
            VmError::PageFault { error_code, .. } => Some(*error_code),
            _ => None,
        }
    }

    /// Whether this error can be delivered to the guest as an exception.
    pub fn is_architectural(&self) -> bool {
        self.vector().is_some()
    }
}

/// Convenience result alias for core operations.
pub type Result<T> = core::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(VmError::UndefinedOpcode(0xFF).vector(), Some(6));
        assert_eq!(VmError::UndefinedOpcode(0xFF).error_code(), None);
        assert_eq!(VmError::GeneralProtection(0x18).vector(), Some(13));
        assert_eq!(VmError::GeneralProtection(0x18).error_code(), Some(0x18));
        let pf = VmError::PageFault { address: 0x1000, error_code: 0x06 };
        assert_eq!(pf.vector(), Some(14));
        assert_eq!(pf.error_code(), Some(0x06));
        assert!(!VmError::RunawayZeroRun { ip: 0, run: 256 }.is_architectural());
    }
}
