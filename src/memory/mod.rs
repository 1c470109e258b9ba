//! Guest memory subsystem.
//!
//! Three layers mirror the hardware translation pipeline:
//!
//! 1. [`stream::ByteStream`] — flat physical storage: bounded RAM plus an
//!    overflow region, addressed by physical offset.
//! 2. [`translate::Translator`] — linear-to-physical translation: A20 and
//!    mode masking plus the 2-level / PAE / 4-level page-table walkers, with
//!    single-entry read/write page caches keyed by the mode fingerprint.
//! 3. [`paged::PagedMemory`] — the linear-address view the executor and
//!    instruction handlers use, including the instruction-fetch flag and the
//!    executed-pages bookkeeping for self-modifying-code protection.

pub mod paged;
pub mod stream;
pub mod translate;

use bitflags::bitflags;

pub use paged::PagedMemory;
pub use stream::ByteStream;
pub use translate::{decode_error_word, encode_error_word, TranslateError, Translator};

/// The kind of memory access being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Fetch,
}

bitflags! {
    /// x86 #PF error-code bits (Intel SDM Vol. 3A, Table 4-12).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfCode: u16 {
        /// 0 = not-present, 1 = protection violation.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from CPL 3.
        const USER = 1 << 2;
        /// A reserved page-table bit was set.
        const RESERVED = 1 << 3;
        /// The access was an instruction fetch.
        const FETCH = 1 << 4;
    }
}

impl AccessType {
    /// Build the #PF error code for a failed access of this type.
    pub fn pf_code(self, user: bool, present: bool) -> PfCode {
        let mut code = PfCode::empty();
        if present {
            code |= PfCode::PRESENT;
        }
        match self {
            AccessType::Write => code |= PfCode::WRITE,
            AccessType::Fetch => code |= PfCode::FETCH,
            AccessType::Read => {}
        }
        if user {
            code |= PfCode::USER;
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pf_code_bits() {
        let c = AccessType::Write.pf_code(true, true);
        assert_eq!(c.bits(), 0b111);
        let c = AccessType::Fetch.pf_code(false, false);
        assert_eq!(c.bits(), 0b1_0000);
        let c = AccessType::Read.pf_code(true, false);
        assert_eq!(c.bits(), 0b100);
    }
}
