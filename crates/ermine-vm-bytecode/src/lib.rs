//! # Ermine VM Bytecode
//!
//! Method-level metadata for the Ermine bytecode format: calling-convention
//! flags, register counts, and the mutable optimization state the
//! deoptimizer maintains per method.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod method;

pub use method::{DEFAULT_DEOPT_THRESHOLD, Method, MethodFlags, initial_deopt_threshold};
