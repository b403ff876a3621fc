//! # Ermine VM Deopt
//!
//! Deoptimization for the Ermine VM: when a speculative assumption in
//! compiled code fails, this crate abandons the optimized frame and
//! rebuilds the interpreter frame the function must resume in —
//! reconstructing virtual registers, relocating callee-saved registers,
//! and handing the resume trampoline a ready stack pointer.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bundle;
pub mod deoptimizer;
pub mod error;
pub mod frames;
pub mod stats;

pub use bundle::{
    BaseReg, CALLEE_REG_COUNT, CallSiteInfo, CalleeReg, CompilerMetadata, DeoptBundleEntry,
    Location, SpecVreg, VRegId,
};
pub use deoptimizer::{
    DeoptReason, DeoptTrailer, Deoptimizer, MethodRegistry, deoptimize, deoptimize_raw,
};
pub use error::{DeoptError, DeoptResult};
pub use frames::{FrameIterator, FrameType, InterpreterFrame, backtrace};
pub use stats::{DeoptStats, deopt_stats};
