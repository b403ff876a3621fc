//! Method metadata
//!
//! A [`Method`] describes one bytecode function: its interpreter calling
//! convention (declared argument count, virtual register count, which
//! reserved slots it expects) and the mutable state the deoptimizer
//! maintains — the retry threshold, the last recorded deopt reason, and
//! whether the compiled entry point may still be used.
//!
//! The mutable fields use `Cell` under a single-writer contract: exactly
//! one deoptimization event mutates a method at a time, on the VM thread
//! that hit the trap. Whether two threads can deoptimize the same method
//! concurrently is deployment-dependent; if that becomes possible these
//! fields need atomics.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::OnceLock;

/// Retry threshold assigned to new methods unless overridden by
/// `ERMINE_DEOPT_THRESHOLD`.
///
/// After this many deoptimizations, the method's compiled entry is
/// permanently disabled and it runs in the interpreter only.
pub const DEFAULT_DEOPT_THRESHOLD: u8 = 10;

static INITIAL_DEOPT_THRESHOLD: OnceLock<u8> = OnceLock::new();

/// Initial per-method deopt retry threshold.
///
/// Reads `ERMINE_DEOPT_THRESHOLD` once; falls back to
/// [`DEFAULT_DEOPT_THRESHOLD`] when unset or unparsable.
pub fn initial_deopt_threshold() -> u8 {
    *INITIAL_DEOPT_THRESHOLD.get_or_init(|| {
        std::env::var("ERMINE_DEOPT_THRESHOLD")
            .ok()
            .and_then(|value| value.trim().parse::<u8>().ok())
            .unwrap_or(DEFAULT_DEOPT_THRESHOLD)
    })
}

/// Calling-convention flags carried in a method's call field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFlags {
    /// Frame carries a `this` slot
    pub has_this: bool,
    /// Frame carries a `new.target` slot
    pub has_new_target: bool,
    /// Frame carries a call-target function slot
    pub has_func: bool,
    /// Callable with more arguments than declared (rest/arguments semantics)
    pub has_extra_args: bool,
}

impl MethodFlags {
    /// Number of reserved slots this convention places between the
    /// argument area and the virtual registers.
    pub fn reserved_slot_count(&self) -> u32 {
        self.has_this as u32 + self.has_new_target as u32 + self.has_func as u32
    }
}

/// One bytecode function's metadata, shared across execution tiers.
pub struct Method {
    name: String,
    declared_arg_count: u32,
    vreg_count: u32,
    flags: MethodFlags,
    bytecode: Arc<[u8]>,
    deopt_threshold: Cell<u8>,
    deopt_reason_code: Cell<u8>,
    aot_entry: Cell<bool>,
}

impl Method {
    /// Create a method with the environment-configured retry threshold.
    pub fn new(
        name: impl Into<String>,
        declared_arg_count: u32,
        vreg_count: u32,
        flags: MethodFlags,
        bytecode: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self::with_threshold(
            name,
            declared_arg_count,
            vreg_count,
            flags,
            bytecode,
            initial_deopt_threshold(),
        )
    }

    /// Create a method with an explicit retry threshold.
    pub fn with_threshold(
        name: impl Into<String>,
        declared_arg_count: u32,
        vreg_count: u32,
        flags: MethodFlags,
        bytecode: impl Into<Arc<[u8]>>,
        deopt_threshold: u8,
    ) -> Self {
        Self {
            name: name.into(),
            declared_arg_count,
            vreg_count,
            flags,
            bytecode: bytecode.into(),
            deopt_threshold: Cell::new(deopt_threshold),
            deopt_reason_code: Cell::new(0),
            aot_entry: Cell::new(true),
        }
    }

    /// Method name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of declared formal parameters.
    pub fn declared_arg_count(&self) -> u32 {
        self.declared_arg_count
    }

    /// Number of declared virtual registers.
    pub fn vreg_count(&self) -> u32 {
        self.vreg_count
    }

    /// Calling-convention flags.
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    /// Base address of the bytecode array. Stable for the method's
    /// lifetime; the resume pc is this base plus the deopt pc offset.
    pub fn bytecode_entry(&self) -> u64 {
        self.bytecode.as_ptr() as u64
    }

    /// Opcode byte at `pc_offset`, if in range. Diagnostics only.
    pub fn opcode_at(&self, pc_offset: u32) -> Option<u8> {
        self.bytecode.get(pc_offset as usize).copied()
    }

    /// Remaining deopt retries before the compiled entry is disabled.
    pub fn deopt_threshold(&self) -> u8 {
        self.deopt_threshold.get()
    }

    /// Update the remaining retry count.
    pub fn set_deopt_threshold(&self, threshold: u8) {
        self.deopt_threshold.set(threshold);
    }

    /// Last recorded deopt reason code (0 when never deoptimized).
    pub fn deopt_reason_code(&self) -> u8 {
        self.deopt_reason_code.get()
    }

    /// Record the reason code of the latest deoptimization.
    pub fn set_deopt_reason_code(&self, code: u8) {
        self.deopt_reason_code.set(code);
    }

    /// Whether the compiled entry point may still be used.
    pub fn is_aot_entry_enabled(&self) -> bool {
        self.aot_entry.get()
    }

    /// Permanently disable the compiled entry point. There is no way to
    /// re-enable it; the trampoline must never be re-entered for this
    /// method afterwards.
    pub fn clear_aot_flags(&self) {
        self.aot_entry.set(false);
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("declared_arg_count", &self.declared_arg_count)
            .field("vreg_count", &self.vreg_count)
            .field("flags", &self.flags)
            .field("deopt_threshold", &self.deopt_threshold.get())
            .field("aot_entry", &self.aot_entry.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_method(flags: MethodFlags) -> Method {
        Method::with_threshold("f", 2, 4, flags, vec![0u8; 16], 3)
    }

    #[test]
    fn reserved_slot_count_follows_flags() {
        assert_eq!(MethodFlags::default().reserved_slot_count(), 0);
        let all = MethodFlags {
            has_this: true,
            has_new_target: true,
            has_func: true,
            has_extra_args: false,
        };
        assert_eq!(all.reserved_slot_count(), 3);
        let this_only = MethodFlags {
            has_this: true,
            ..Default::default()
        };
        assert_eq!(this_only.reserved_slot_count(), 1);
    }

    #[test]
    fn aot_flag_clears_permanently() {
        let method = test_method(MethodFlags::default());
        assert!(method.is_aot_entry_enabled());
        method.clear_aot_flags();
        assert!(!method.is_aot_entry_enabled());
        // No API re-enables it
        method.set_deopt_threshold(5);
        assert!(!method.is_aot_entry_enabled());
    }

    #[test]
    fn threshold_and_reason_are_recorded() {
        let method = test_method(MethodFlags::default());
        assert_eq!(method.deopt_threshold(), 3);
        method.set_deopt_reason_code(7);
        method.set_deopt_threshold(2);
        assert_eq!(method.deopt_reason_code(), 7);
        assert_eq!(method.deopt_threshold(), 2);
    }

    #[test]
    fn bytecode_entry_is_stable() {
        let method = test_method(MethodFlags::default());
        assert_eq!(method.bytecode_entry(), method.bytecode_entry());
        assert_eq!(method.opcode_at(0), Some(0));
        assert_eq!(method.opcode_at(16), None);
    }
}
