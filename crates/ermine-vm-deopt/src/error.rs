//! Deoptimization errors

use ermine_vm_core::EXCEPTION_SENTINEL;
use thiserror::Error;

/// The single recoverable deoptimization failure.
///
/// Everything else that can go wrong during a deopt — malformed bundles,
/// unknown frame tags, walking off the stack, missing metadata — is a
/// compiler/runtime contract violation and panics instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeoptError {
    /// Not enough native stack left to carve the interpreter frame
    /// region. Nothing has been written when this is returned.
    #[error("insufficient stack space to rebuild the interpreter frame")]
    StackOverflow,
}

impl DeoptError {
    /// The raw word handed to the resume trampoline in place of a new
    /// stack pointer.
    pub fn into_raw(self) -> u64 {
        match self {
            DeoptError::StackOverflow => EXCEPTION_SENTINEL,
        }
    }
}

/// Result type for deoptimization operations
pub type DeoptResult<T> = std::result::Result<T, DeoptError>;
