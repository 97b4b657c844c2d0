//! Decode and execute support for the vendor-specific instruction-set extensions.
//!
//! [`pattern`] and [`set`] provide the generic machinery: bit patterns over the opcode space and
//! ordered sets of installed handlers with a custom-CSR registry next to them. [`xpulp`]
//! implements the Xpulp DSP extensions of the CV32E40P core on top of that, and [`bignum`] the
//! 256-bit big-number accelerator core, with [`wide`] supplying its 256-bit arithmetic.

pub mod bignum;
pub mod pattern;
pub mod set;
pub mod wide;
pub mod xpulp;

pub use pattern::{BitPattern, PatternError};
pub use set::{CsrDefinitionError, CsrFile, InstructionSet};
pub use wide::Wide;

use thiserror::Error;

/// Faults an instruction handler can raise instead of completing.
///
/// These map onto the synchronous exceptions a hardware core would take; the embedder decides how
/// to surface them (trap, abort, or an error register).
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("instruction address misaligned or inaccessible")]
    BadInstructionAddress,
    #[error("data address misaligned or inaccessible")]
    BadDataAddress,
    #[error("call stack overflow")]
    CallStackOverflow,
    #[error("call stack underflow")]
    CallStackUnderflow,
    #[error("loop with zero iterations")]
    LoopZeroIterations,
    #[error("loop stack overflow")]
    LoopStackOverflow,
    #[error("unexpected end of loop")]
    LoopStackUnderflow,
    #[error("loop instruction as last instruction of a loop body")]
    LoopAtBodyEnd,
}

/// Error installing an extension's instruction patterns or CSR definitions.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Csr(#[from] CsrDefinitionError),
}

/// Extract `count` bits of `opcode` starting at bit `offset` (bit 0 is the LSB).
///
/// `count` must be in `1..=31`.
pub(crate) fn bits(opcode: u64, offset: u32, count: u32) -> u32 {
    ((opcode >> offset) as u32) & (u32::MAX >> (32 - count))
}
