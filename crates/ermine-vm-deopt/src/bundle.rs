//! Compiler-emitted deopt metadata
//!
//! At every call site that can trigger a deopt trap, the optimizing
//! compiler records how to recover each live virtual register: either a
//! stack slot relative to the call-site sp/fp, or an already-tagged
//! constant. It also records which callee-saved registers the optimized
//! prologue spilled and where. This module defines those records and the
//! per-call-site lookup table keyed by return address.
//!
//! The records are a fixed binary contract between the compiler and this
//! subsystem. A lookup miss or a malformed entry is a compiler bug, not a
//! recoverable condition, and panics.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Interpreter virtual register index. Negative values name the special
/// slots recovered into dedicated fields (see [`SpecVreg`]).
pub type VRegId = i32;

/// Special virtual-register indices the compiler emits alongside the
/// ordinary vregs. These never land in the generic vreg map; the decoder
/// diverts each into its dedicated output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpecVreg {
    /// Bytecode offset to resume at.
    PcOffset = -1,
    /// Accumulator value at the deopt point.
    Acc = -2,
    /// Lexical environment.
    Env = -3,
    /// Call-target function.
    Func = -4,
    /// `new.target` value.
    NewTarget = -5,
    /// `this` value.
    This = -6,
}

impl SpecVreg {
    /// The vreg index this special occupies in a deopt bundle.
    #[inline]
    pub const fn id(self) -> VRegId {
        self as i32
    }

    /// Which special slot, if any, a bundle entry's vreg index names.
    pub const fn from_id(id: VRegId) -> Option<SpecVreg> {
        match id {
            -1 => Some(SpecVreg::PcOffset),
            -2 => Some(SpecVreg::Acc),
            -3 => Some(SpecVreg::Env),
            -4 => Some(SpecVreg::Func),
            -5 => Some(SpecVreg::NewTarget),
            -6 => Some(SpecVreg::This),
            _ => None,
        }
    }
}

/// Base register a spilled vreg is addressed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseReg {
    /// Call-site stack pointer.
    Sp,
    /// Call-site frame pointer.
    Fp,
}

/// Where one virtual register's value lives at the deopt point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A stack slot at `base + offset`. The compiler only ever emits the
    /// call-site sp or fp as the base; anything else is malformed.
    Indirect {
        /// Register the offset is relative to.
        base: BaseReg,
        /// Signed byte offset from the base register.
        offset: i32,
    },
    /// Small already-tagged constant, sign-extended to 64 bits.
    ImmediateSmall(i32),
    /// Full-width already-tagged constant.
    ImmediateWide(i64),
}

impl Location {
    /// Raw tagged bits for an immediate location, if this is one.
    #[inline]
    pub fn immediate_bits(self) -> Option<u64> {
        match self {
            Location::ImmediateSmall(n) => Some(n as i64 as u64),
            Location::ImmediateWide(n) => Some(n as u64),
            Location::Indirect { .. } => None,
        }
    }
}

/// One entry of a deopt bundle: recover `vreg` from `location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptBundleEntry {
    /// Virtual register (or special slot) being recovered.
    pub vreg: VRegId,
    /// Where its value lives.
    pub location: Location,
}

impl DeoptBundleEntry {
    /// Entry for an ordinary or special vreg.
    pub const fn new(vreg: VRegId, location: Location) -> Self {
        Self { vreg, location }
    }

    /// Entry for a special slot.
    pub const fn special(spec: SpecVreg, location: Location) -> Self {
        Self {
            vreg: spec as i32,
            location,
        }
    }
}

/// Callee-saved registers the optimized prologue may spill (SysV x86-64
/// set, frame pointer excluded). The canonical index fixes each
/// register's slot in the bridge frame's save area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeReg {
    /// rbx
    Rbx,
    /// r12
    R12,
    /// r13
    R13,
    /// r14
    R14,
    /// r15
    R15,
}

/// Number of callee-saved registers in the save area.
pub const CALLEE_REG_COUNT: usize = 5;

impl CalleeReg {
    /// All callee-saved registers, in canonical save-area order.
    pub const ALL: [CalleeReg; CALLEE_REG_COUNT] = [
        CalleeReg::Rbx,
        CalleeReg::R12,
        CalleeReg::R13,
        CalleeReg::R14,
        CalleeReg::R15,
    ];

    /// Slot index of this register in the bridge frame's save area.
    #[inline]
    pub const fn canonical_index(self) -> usize {
        match self {
            CalleeReg::Rbx => 0,
            CalleeReg::R12 => 1,
            CalleeReg::R13 => 2,
            CalleeReg::R14 => 3,
            CalleeReg::R15 => 4,
        }
    }
}

/// Callee-save spill table: which register was saved at which fp-relative
/// byte offset.
pub type CalleeSaveTable = SmallVec<[(CalleeReg, i32); CALLEE_REG_COUNT]>;

/// Everything the compiler recorded for one deopt-capable call site.
#[derive(Debug, Clone, Default)]
pub struct CallSiteInfo {
    /// Per-vreg recovery descriptors. Consumed exactly once per event.
    pub deopt_bundle: Vec<DeoptBundleEntry>,
    /// Callee-saved registers spilled by the optimized prologue.
    pub callee_saves: CalleeSaveTable,
    /// Byte distance from the optimized frame's fp down to the call-site
    /// sp (the frame's prologue contract).
    pub callsite_sp_delta: u32,
}

/// Per-module table of call-site metadata, keyed by the return address of
/// the deopt trap call.
#[derive(Debug, Default)]
pub struct CompilerMetadata {
    call_sites: FxHashMap<u64, CallSiteInfo>,
}

impl CompilerMetadata {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metadata for the call site returning to `return_addr`.
    pub fn insert(&mut self, return_addr: u64, info: CallSiteInfo) {
        self.call_sites.insert(return_addr, info);
    }

    /// Metadata for the call site returning to `return_addr`.
    ///
    /// A miss means the compiled code and its metadata are out of sync,
    /// which is fatal.
    pub fn call_site(&self, return_addr: u64) -> &CallSiteInfo {
        self.call_sites
            .get(&return_addr)
            .unwrap_or_else(|| panic!("no deopt metadata for call site {return_addr:#x}"))
    }
}

/// Resolve an indirect location's physical address. Fatal on address
/// arithmetic overflow, which only a corrupt bundle can produce.
#[inline]
pub(crate) fn indirect_address(base: u64, offset: i32) -> u64 {
    base.checked_add_signed(offset as i64)
        .unwrap_or_else(|| panic!("deopt bundle offset {offset} overflows base {base:#x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_indices_are_a_bijection() {
        let mut seen = [false; CALLEE_REG_COUNT];
        for reg in CalleeReg::ALL {
            let index = reg.canonical_index();
            assert!(!seen[index], "{reg:?} duplicates slot {index}");
            seen[index] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn immediate_bits_sign_extend() {
        assert_eq!(
            Location::ImmediateSmall(-1).immediate_bits(),
            Some(u64::MAX)
        );
        assert_eq!(
            Location::ImmediateWide(0x7FF8_0001_0000_002A_u64 as i64).immediate_bits(),
            Some(0x7FF8_0001_0000_002A)
        );
        assert_eq!(
            Location::Indirect {
                base: BaseReg::Sp,
                offset: 8
            }
            .immediate_bits(),
            None
        );
    }

    #[test]
    fn special_ids_are_negative_and_distinct() {
        let ids = [
            SpecVreg::PcOffset.id(),
            SpecVreg::Acc.id(),
            SpecVreg::Env.id(),
            SpecVreg::Func.id(),
            SpecVreg::NewTarget.id(),
            SpecVreg::This.id(),
        ];
        for (i, a) in ids.iter().enumerate() {
            assert!(*a < 0);
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    #[should_panic(expected = "no deopt metadata")]
    fn metadata_miss_is_fatal() {
        CompilerMetadata::new().call_site(0x4100);
    }
}
