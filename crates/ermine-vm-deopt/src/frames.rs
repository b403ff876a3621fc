//! Physical frame kinds and the native frame walk
//!
//! When a deopt trap fires, the stack holds a fixed sequence of frame
//! kinds between the runtime call that caught the trap and the optimized
//! function being abandoned:
//!
//! ```text
//!               +--------------------------+ ---------------
//!               |        caller args       |               ^
//!               |--------------------------|        caller frame
//!               |        ......            |               v
//!               +--------------------------+ ---------------
//!               |       returnAddr         |               ^
//!               |--------------------------|               |
//!               |       callerFp           | <- fp         |
//!               |--------------------------|   optimized JS function
//!               |       frameType          |               |
//!               |--------------------------|               |
//!               |       spill slots        |               v
//!               +--------------------------+ ---------------
//!               |       returnAddr         |               ^
//!               |--------------------------|               |
//!               |       callerFp           | <- fp         |
//!               |--------------------------|   deopt trap call (plain
//!               |       frameType          |    optimized frame)       |
//!               +--------------------------+ ---------------
//!               |       returnAddr         |               ^
//!               |--------------------------|               |
//!               |       callerFp           | <- fp         |
//!               |--------------------------|   trampoline bridge frame
//!               |       frameType          |               |
//!               |--------------------------|               |
//!               |       runtime pointer    |               |
//!               |--------------------------|               |
//!               |   callee-save area       |               v
//!               +--------------------------+ ---------------
//!               |       ......             |    runtime leave frame
//!               +--------------------------+ ---------------
//! ```
//!
//! Every frame shares the link area: saved caller fp at `fp`, return
//! address at `fp + 8`, type tag at `fp - 8`. The walk follows saved
//! frame pointers outward from the leave frame; the vocabulary of tags is
//! closed, and an unknown tag is fatal.

use ermine_vm_core::{StackMemory, TaggedValue, WORD_SIZE};

/// Leading slots of the caller-pushed argument area: call-target
/// function, `new.target`, `this`, then the user-visible arguments.
pub const MANDATORY_CALL_ARGS: u64 = 3;

/// Fixed slots between a bridge frame's type tag and its callee-save
/// area: the tag itself and the runtime pointer.
pub const BRIDGE_RESERVED_SLOTS: usize = 2;

/// Physical frame kind, encoded as a tag word at `fp - 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum FrameType {
    /// Frame of a compiled bytecode function; carries deopt metadata.
    OptimizedJsFunction = 1,
    /// Compiled helper frame with no deopt-relevant state.
    Optimized = 2,
    /// Trampoline frame that caught the deopt trap and spilled the
    /// callee-saved registers.
    Bridge = 3,
    /// Runtime-call boundary frame.
    Leave = 4,
    /// The rebuilt interpreter frame this subsystem produces.
    InterpreterBridge = 5,
}

impl FrameType {
    /// Decode a tag word. The vocabulary is closed; an unknown tag means
    /// compiled code and runtime disagree on the frame contract, which is
    /// fatal.
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => FrameType::OptimizedJsFunction,
            2 => FrameType::Optimized,
            3 => FrameType::Bridge,
            4 => FrameType::Leave,
            5 => FrameType::InterpreterBridge,
            _ => panic!("unknown frame type tag {raw:#x}"),
        }
    }

    /// The tag word written into a frame.
    #[inline]
    pub const fn raw(self) -> u64 {
        self as u64
    }
}

/// Walks physical frames outward by following saved frame pointers.
pub struct FrameIterator<'a> {
    stack: &'a StackMemory,
    fp: u64,
}

impl<'a> FrameIterator<'a> {
    /// Start a walk at `start_fp` (normally the last leave frame).
    pub fn new(stack: &'a StackMemory, start_fp: u64) -> Self {
        Self {
            stack,
            fp: start_fp,
        }
    }

    /// Whether the walk has run off the stack.
    #[inline]
    pub fn done(&self) -> bool {
        self.fp == 0 || !self.stack.contains(self.fp)
    }

    /// Current frame pointer.
    #[inline]
    pub fn fp(&self) -> u64 {
        self.fp
    }

    /// Current frame's type tag.
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_raw(self.stack.read_word(self.fp - WORD_SIZE))
    }

    /// Current frame's return address.
    pub fn return_addr(&self) -> u64 {
        self.stack.read_word(self.fp + WORD_SIZE)
    }

    /// Caller's saved frame pointer.
    pub fn prev_fp(&self) -> u64 {
        self.stack.read_word(self.fp)
    }

    /// Step to the caller's frame.
    pub fn advance(&mut self) {
        self.fp = self.prev_fp();
    }
}

/// Human-readable dump of the physical frame chain starting at
/// `start_fp`, one line per frame. Diagnostics only; never consulted by
/// the reconstruction itself.
pub fn backtrace(stack: &StackMemory, start_fp: u64) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let mut it = FrameIterator::new(stack, start_fp);
    while !it.done() {
        let _ = writeln!(
            out,
            "  {:?} fp={:#x} ret={:#x}",
            it.frame_type(),
            it.fp(),
            it.return_addr()
        );
        it.advance();
    }
    out
}

/// Header of the rebuilt interpreter frame, written at the bottom of the
/// reconstructed register region.
///
/// Slot order from high address to low: `function`, `acc`, `env`,
/// `call_size`, `fp` (self-link placeholder, patched by the interpreter),
/// `this`, `pc`, `prev_frame`, `frame_type`. A stack pointer handed to
/// the interpreter therefore addresses the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterFrame {
    /// Call-target function.
    pub function: TaggedValue,
    /// Accumulator at the resume point.
    pub acc: TaggedValue,
    /// Lexical environment.
    pub env: TaggedValue,
    /// Pending call size; zero for a deopt resume.
    pub call_size: u64,
    /// Frame-pointer self link, left unset for the interpreter to patch.
    pub fp: u64,
    /// `this` value.
    pub this: TaggedValue,
    /// Absolute resume program counter.
    pub pc: u64,
    /// Link to the caller's frame.
    pub prev_frame: u64,
    /// Always [`FrameType::InterpreterBridge`] for rebuilt frames.
    pub frame_type: FrameType,
}

impl InterpreterFrame {
    /// Number of header slots.
    pub const SLOT_COUNT: usize = 9;

    /// Header words in push order (high address first).
    pub fn slots(&self) -> [u64; Self::SLOT_COUNT] {
        [
            self.function.raw(),
            self.acc.raw(),
            self.env.raw(),
            self.call_size,
            self.fp,
            self.this.raw(),
            self.pc,
            self.prev_frame,
            self.frame_type.raw(),
        ]
    }

    /// Read a header back from a stack pointer addressing its type tag.
    pub fn read(stack: &StackMemory, sp: u64) -> Self {
        let word = |slot: u64| stack.read_word(sp + slot * WORD_SIZE);
        Self {
            frame_type: FrameType::from_raw(word(0)),
            prev_frame: word(1),
            pc: word(2),
            this: TaggedValue::from_raw(word(3)),
            fp: word(4),
            call_size: word(5),
            env: TaggedValue::from_raw(word(6)),
            acc: TaggedValue::from_raw(word(7)),
            function: TaggedValue::from_raw(word(8)),
        }
    }
}
