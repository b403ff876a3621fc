//! # Ermine VM Core
//!
//! Core value and stack primitives shared by the Ermine execution tiers.
//!
//! ## Design Principles
//!
//! - **NaN-boxing**: Efficient 64-bit value representation
//! - **Opaque heap payloads**: heap references pass through this layer as bits
//! - **Audited stack access**: one bounds-checked word load/store pair

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod stack;
pub mod value;

pub use stack::{StackMemory, ThreadContext, WORD_SIZE};
pub use value::{EXCEPTION_SENTINEL, TaggedValue};
