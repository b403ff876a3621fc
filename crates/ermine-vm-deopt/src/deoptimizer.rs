//! Deoptimization driver
//!
//! Abandons an optimized native execution mid-flight and rebuilds the
//! interpreter frame it must resume in. One event runs in three phases on
//! the VM thread that hit the trap, to completion, with no I/O and no
//! suspension:
//!
//! ```text
//! collect_deopt_bundle      walk physical frames, find the optimized
//!          │                function frame, capture its metadata and
//!          ▼                the caller's live argument area
//! collect_vregs             decode each bundle entry into a tagged
//!          │                value; divert the special slots
//!          ▼
//! construct_interpreter_frame
//!                           bookkeeping, then carve the new frame
//!                           region (capacity-checked before any write),
//!                           relocate callee saves, emit the trailer the
//!                           trampoline consumes
//! ```
//!
//! The only recoverable failure is running out of stack while carving;
//! every other irregularity is a compiler/runtime contract violation and
//! panics.

use std::sync::{Arc, OnceLock};

use ermine_vm_bytecode::Method;
use ermine_vm_core::{StackMemory, TaggedValue, ThreadContext, WORD_SIZE};
use rustc_hash::FxHashMap;

use crate::bundle::{
    BaseReg, CALLEE_REG_COUNT, CalleeSaveTable, CompilerMetadata, DeoptBundleEntry, Location,
    SpecVreg, VRegId, indirect_address,
};
use crate::error::{DeoptError, DeoptResult};
use crate::frames::{
    BRIDGE_RESERVED_SLOTS, FrameIterator, FrameType, InterpreterFrame, MANDATORY_CALL_ARGS,
};
use crate::stats;

/// Why an optimized assumption failed. Closed taxonomy; the compiler
/// encodes one of these codes at every deopt trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeoptReason {
    /// Trap fired without a recorded check.
    NotChecked = 0,
    /// Operand was not an int32.
    NotInt = 1,
    /// Operand was not a double.
    NotDouble = 2,
    /// Operand was not a number.
    NotNumber = 3,
    /// Operand was not a boolean.
    NotBool = 4,
    /// Operand was not a heap object.
    NotHeapObject = 5,
    /// Receiver was not the specialized stable array layout.
    NotStableArray = 6,
    /// Receiver was not the specialized float32 array layout.
    NotFloat32Array = 7,
    /// Integer division by zero.
    DivideByZero = 8,
    /// Receiver's hidden class no longer matches the profiled one.
    InconsistentHiddenClass = 9,
    /// Array index out of the specialized range.
    BadArrayIndex = 10,
    /// Float32 array index out of the specialized range.
    BadFloat32ArrayIndex = 11,
    /// Increment overflowed int32.
    IncOverflow = 12,
    /// Decrement overflowed int32.
    DecOverflow = 13,
    /// Negation overflowed int32.
    NegOverflow = 14,
    /// Call target was not the expected function.
    NotCallTarget = 15,
    /// Allocated object did not match the profiled new-object layout.
    NotNewObj = 16,
}

impl DeoptReason {
    /// Number of reasons in the taxonomy.
    pub const COUNT: usize = 17;

    /// All reasons, indexed by code.
    pub const ALL: [DeoptReason; Self::COUNT] = [
        DeoptReason::NotChecked,
        DeoptReason::NotInt,
        DeoptReason::NotDouble,
        DeoptReason::NotNumber,
        DeoptReason::NotBool,
        DeoptReason::NotHeapObject,
        DeoptReason::NotStableArray,
        DeoptReason::NotFloat32Array,
        DeoptReason::DivideByZero,
        DeoptReason::InconsistentHiddenClass,
        DeoptReason::BadArrayIndex,
        DeoptReason::BadFloat32ArrayIndex,
        DeoptReason::IncOverflow,
        DeoptReason::DecOverflow,
        DeoptReason::NegOverflow,
        DeoptReason::NotCallTarget,
        DeoptReason::NotNewObj,
    ];

    /// Stable numeric code, also recorded on the method.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Human-readable label for logs.
    pub const fn label(self) -> &'static str {
        match self {
            DeoptReason::NotChecked => "not checked",
            DeoptReason::NotInt => "not int",
            DeoptReason::NotDouble => "not double",
            DeoptReason::NotNumber => "not number",
            DeoptReason::NotBool => "not bool",
            DeoptReason::NotHeapObject => "not heap object",
            DeoptReason::NotStableArray => "not stable array",
            DeoptReason::NotFloat32Array => "not float32 array",
            DeoptReason::DivideByZero => "div zero",
            DeoptReason::InconsistentHiddenClass => "inconsistent hidden class",
            DeoptReason::BadArrayIndex => "bad array index",
            DeoptReason::BadFloat32ArrayIndex => "bad float32 array index",
            DeoptReason::IncOverflow => "inc overflow",
            DeoptReason::DecOverflow => "dec overflow",
            DeoptReason::NegOverflow => "neg overflow",
            DeoptReason::NotCallTarget => "not call target",
            DeoptReason::NotNewObj => "not new obj",
        }
    }
}

impl std::fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolves call-target values to their [`Method`]s; the boundary to the
/// method/bytecode-file subsystem.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: FxHashMap<u64, Arc<Method>>,
}

impl MethodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a call-target value with its method.
    pub fn register(&mut self, call_target: TaggedValue, method: Arc<Method>) {
        self.methods.insert(call_target.raw(), method);
    }

    /// The method behind a call target. A miss means the compiler
    /// recorded a call target the runtime cannot resolve, which is fatal.
    pub fn lookup(&self, call_target: TaggedValue) -> Arc<Method> {
        self.methods
            .get(&call_target.raw())
            .cloned()
            .unwrap_or_else(|| panic!("deopt call target {call_target:?} has no resolved method"))
    }
}

/// Per-event capture of where the optimized frame sat and what it saved.
/// Created fresh by the frame walk, discarded when the event completes.
#[derive(Debug, Clone, Default)]
struct FrameContext {
    callee_saves: CalleeSaveTable,
    callsite_sp: u64,
    callsite_fp: u64,
    caller_stack_top: u64,
    caller_return_addr: u64,
    caller_fp: u64,
}

/// Special slots diverted out of the generic vreg map during decode.
#[derive(Debug, Clone, Copy)]
struct SpecialVregs {
    pc_offset: u32,
    acc: TaggedValue,
    env: TaggedValue,
    func: TaggedValue,
    new_target: TaggedValue,
    this: TaggedValue,
}

impl Default for SpecialVregs {
    fn default() -> Self {
        Self {
            pc_offset: 0,
            acc: TaggedValue::undefined(),
            env: TaggedValue::undefined(),
            func: TaggedValue::undefined(),
            new_target: TaggedValue::undefined(),
            this: TaggedValue::undefined(),
        }
    }
}

/// Record the trampoline pops to splice the rebuilt frame into the
/// caller's stack, pushed below the interpreter frame header.
///
/// Slot order from the returned stack pointer upward:
/// `output_slot_count`, `caller_stack_top`, `caller_return_addr`,
/// `caller_fp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptTrailer {
    /// Caller's saved frame pointer.
    pub caller_fp: u64,
    /// Return address into the caller.
    pub caller_return_addr: u64,
    /// Caller's call-site stack top.
    pub caller_stack_top: u64,
    /// Total words between region start and the frame header bottom.
    pub output_slot_count: u64,
}

impl DeoptTrailer {
    /// Number of trailer slots.
    pub const SLOT_COUNT: usize = 4;

    /// Read a trailer back from the stack pointer `deoptimize` returned.
    pub fn read(stack: &StackMemory, sp: u64) -> Self {
        Self {
            output_slot_count: stack.read_word(sp),
            caller_stack_top: stack.read_word(sp + WORD_SIZE),
            caller_return_addr: stack.read_word(sp + 2 * WORD_SIZE),
            caller_fp: stack.read_word(sp + 3 * WORD_SIZE),
        }
    }
}

/// Growing-down writer over the interpreter frame region.
///
/// Two-phase: `reserve` checks the whole region against the stack limit
/// before the first `push`, so an overflow aborts with the region
/// untouched.
struct FrameWriter<'a> {
    stack: &'a mut StackMemory,
    start: u64,
    top: u64,
    limit: u64,
}

impl<'a> FrameWriter<'a> {
    fn new(stack: &'a mut StackMemory, thread: &ThreadContext) -> Self {
        Self {
            start: thread.interpreter_frame_end,
            top: thread.interpreter_frame_end,
            limit: thread.stack_limit,
            stack,
        }
    }

    fn reserve(&self, slots: usize) -> bool {
        self.top
            .checked_sub(slots as u64 * WORD_SIZE)
            .is_some_and(|addr| addr >= self.limit)
    }

    fn push_value(&mut self, value: TaggedValue) {
        self.push_raw(value.raw());
    }

    fn push_raw(&mut self, word: u64) {
        self.top -= WORD_SIZE;
        self.stack.write_word(self.top, word);
    }

    fn memory(&mut self) -> &mut StackMemory {
        self.stack
    }

    fn start(&self) -> u64 {
        self.start
    }

    fn top(&self) -> u64 {
        self.top
    }
}

/// One deoptimization event's state machine. See the module docs for the
/// phase ordering; `deoptimize` drives all three phases.
pub struct Deoptimizer<'a> {
    thread: &'a ThreadContext,
    metadata: &'a CompilerMetadata,
    methods: &'a MethodRegistry,
    context: FrameContext,
    callee_save_base: u64,
    frame_argc: u64,
    frame_argv: u64,
    vregs: FxHashMap<VRegId, TaggedValue>,
    specials: SpecialVregs,
}

impl<'a> Deoptimizer<'a> {
    /// Prepare an event for the thread that hit the trap.
    pub fn new(
        thread: &'a ThreadContext,
        metadata: &'a CompilerMetadata,
        methods: &'a MethodRegistry,
    ) -> Self {
        Self {
            thread,
            metadata,
            methods,
            context: FrameContext::default(),
            callee_save_base: 0,
            frame_argc: 0,
            frame_argv: 0,
            vregs: FxHashMap::default(),
            specials: SpecialVregs::default(),
        }
    }

    /// Walk physical frames from the last leave frame outward until the
    /// optimized function frame with a non-empty bundle is found.
    ///
    /// Captures the callee-save table, call-site sp/fp, the caller's live
    /// argument area, and the caller link recorded in the trailer.
    /// Exhausting the stack first is fatal.
    pub fn collect_deopt_bundle(&mut self, stack: &StackMemory) -> Vec<DeoptBundleEntry> {
        let mut bundle: Vec<DeoptBundleEntry> = Vec::new();
        // Return address of the frame below the one being visited; for
        // the optimized function frame this is the deopt trap call's pc,
        // the key its metadata was recorded under.
        let mut trap_return_addr = 0u64;
        let mut it = FrameIterator::new(stack, self.thread.last_leave_frame);
        while !it.done() && bundle.is_empty() {
            match it.frame_type() {
                FrameType::OptimizedJsFunction => {
                    let info = self.metadata.call_site(trap_return_addr);
                    self.context.callee_saves = info.callee_saves.clone();
                    self.context.callsite_fp = it.fp();
                    self.context.callsite_sp = it.fp() - u64::from(info.callsite_sp_delta);
                    // The frame's prologue contract: the caller's sp sits
                    // two link slots above the fp, at the argc slot.
                    let prev_frame_sp = it.fp() + 2 * WORD_SIZE;
                    self.frame_argc = stack.read_word(prev_frame_sp);
                    self.frame_argv = prev_frame_sp + WORD_SIZE;
                    assert!(
                        self.frame_argc >= MANDATORY_CALL_ARGS,
                        "optimized frame argc {} lacks the mandatory argument slots",
                        self.frame_argc
                    );
                    self.context.caller_stack_top = self.frame_argv + self.frame_argc * WORD_SIZE;
                    self.context.caller_return_addr = it.return_addr();
                    self.context.caller_fp = it.prev_fp();
                    bundle = info.deopt_bundle.clone();
                }
                FrameType::Bridge => {
                    // Callee saves sit below the tag and runtime-pointer
                    // slots, lowest canonical index at the lowest address.
                    self.callee_save_base = it.fp()
                        - (BRIDGE_RESERVED_SLOTS + CALLEE_REG_COUNT) as u64 * WORD_SIZE;
                }
                FrameType::Optimized | FrameType::Leave => {}
                ty @ FrameType::InterpreterBridge => {
                    panic!("unexpected frame type {ty:?} in deopt walk")
                }
            }
            trap_return_addr = it.return_addr();
            it.advance();
        }
        assert!(
            !bundle.is_empty(),
            "walked off the native stack without finding an optimized function frame"
        );
        bundle
    }

    /// Decode every bundle entry into a tagged value. Ordinary vregs
    /// populate the map; the six special indices divert into dedicated
    /// fields.
    pub fn collect_vregs(&mut self, stack: &StackMemory, bundle: &[DeoptBundleEntry]) {
        self.vregs.clear();
        for entry in bundle {
            let value = match entry.location {
                Location::Indirect { base, offset } => {
                    let base_addr = match base {
                        BaseReg::Sp => self.context.callsite_sp,
                        BaseReg::Fp => self.context.callsite_fp,
                    };
                    TaggedValue::from_raw(stack.read_word(indirect_address(base_addr, offset)))
                }
                Location::ImmediateSmall(n) => TaggedValue::from_raw(n as i64 as u64),
                Location::ImmediateWide(n) => TaggedValue::from_raw(n as u64),
            };
            match SpecVreg::from_id(entry.vreg) {
                Some(SpecVreg::PcOffset) => self.specials.pc_offset = value.raw() as u32,
                Some(SpecVreg::Acc) => self.specials.acc = value,
                Some(SpecVreg::Env) => self.specials.env = value,
                Some(SpecVreg::Func) => self.specials.func = value,
                Some(SpecVreg::NewTarget) => self.specials.new_target = value,
                Some(SpecVreg::This) => self.specials.this = value,
                None => {
                    self.vregs.insert(entry.vreg, value);
                }
            }
        }
    }

    fn actual_arg_count(&self) -> i64 {
        self.frame_argc as i64 - MANDATORY_CALL_ARGS as i64
    }

    fn actual_frame_arg(&self, stack: &StackMemory, index: i64) -> TaggedValue {
        let addr = self.frame_argv + (MANDATORY_CALL_ARGS + index as u64) * WORD_SIZE;
        TaggedValue::from_raw(stack.read_word(addr))
    }

    fn deopt_value(&self, vreg: VRegId) -> TaggedValue {
        self.vregs
            .get(&vreg)
            .copied()
            .unwrap_or(TaggedValue::undefined())
    }

    /// Lay out the interpreter register region:
    ///
    /// ```text
    /// [maybe argc] [actual args] [reserved slots] [declared vregs]
    /// ```
    ///
    /// Bundle overrides take precedence over the caller's live argument
    /// values slot by slot; declared vregs absent from the bundle default
    /// to undefined. Returns false — having written nothing — when the
    /// region (plus header and trailer) does not fit above the stack
    /// limit.
    fn collect_virtual_registers(&self, method: &Method, writer: &mut FrameWriter<'_>) -> bool {
        let actual_args = self.actual_arg_count();
        let declared_args = i64::from(method.declared_arg_count());
        let vreg_count = i64::from(method.vreg_count());
        let reserved_args = i64::from(method.flags().reserved_slot_count());
        let needs_argc_slot = method.flags().has_extra_args && declared_args != actual_args;

        let arg_slots = actual_args.max(declared_args);
        let region_slots = needs_argc_slot as i64 + arg_slots + vreg_count + reserved_args;
        let total_slots =
            region_slots as usize + InterpreterFrame::SLOT_COUNT + DeoptTrailer::SLOT_COUNT;
        if !writer.reserve(total_slots) {
            return false;
        }

        // [maybe argc]
        if needs_argc_slot {
            writer.push_value(TaggedValue::int32(actual_args as i32));
        }
        let mut virtual_index = arg_slots + vreg_count + reserved_args - 1;

        // [actual args], padding declared-but-missing slots
        if declared_args > actual_args {
            for _ in 0..(declared_args - actual_args) {
                writer.push_value(TaggedValue::undefined());
                virtual_index -= 1;
            }
        }
        for i in (0..actual_args).rev() {
            let value = match self.vregs.get(&(virtual_index as VRegId)) {
                Some(override_value) => *override_value,
                None => self.actual_frame_arg(writer.memory(), i),
            };
            writer.push_value(value);
            virtual_index -= 1;
        }

        // [reserved slots]
        if method.flags().has_this {
            writer.push_value(self.specials.this);
            virtual_index -= 1;
        }
        if method.flags().has_new_target {
            writer.push_value(self.specials.new_target);
            virtual_index -= 1;
        }
        if method.flags().has_func {
            writer.push_value(self.specials.func);
            virtual_index -= 1;
        }

        // [declared vregs]
        while virtual_index >= 0 {
            writer.push_value(self.deopt_value(virtual_index as VRegId));
            virtual_index -= 1;
        }
        debug_assert_eq!(
            (writer.start() - writer.top()) / WORD_SIZE,
            region_slots as u64,
            "register region slot count mismatch"
        );
        true
    }

    /// Copy each spilled callee-saved register from the optimized frame
    /// into the bridge frame's save area at its canonical slot. Runs
    /// after the interpreter frame header is placed; the canonical
    /// ordering is a bridge-frame contract.
    fn relocate_callee_save(&self, stack: &mut StackMemory) {
        for (reg, offset) in &self.context.callee_saves {
            let value = stack.read_word(indirect_address(self.context.callsite_fp, *offset));
            let slot = self.callee_save_base + reg.canonical_index() as u64 * WORD_SIZE;
            stack.write_word(slot, value);
        }
    }

    fn trace_event(&self, stack: &StackMemory, method: &Method, reason: DeoptReason) {
        if !is_deopt_trace_enabled() {
            return;
        }
        tracing::debug!(
            reason = reason.label(),
            method = method.name(),
            pc_offset = self.specials.pc_offset,
            caller_return_addr = self.context.caller_return_addr,
            "deoptimizing compiled frame"
        );
        tracing::debug!(
            "deopt stack:\n{}",
            crate::frames::backtrace(stack, self.thread.last_leave_frame)
        );
        if let Some(opcode) = method.opcode_at(self.specials.pc_offset) {
            tracing::trace!(opcode = u32::from(opcode), "bytecode at resume point");
        }
    }

    /// Bookkeeping, then build the interpreter frame and its trailer.
    ///
    /// Returns the new stack pointer (addressing the trailer) on success,
    /// or [`DeoptError::StackOverflow`] with the region untouched when
    /// the capacity check fails.
    pub fn construct_interpreter_frame(
        &mut self,
        stack: &mut StackMemory,
        reason: DeoptReason,
    ) -> DeoptResult<u64> {
        let call_target = self.specials.func;
        let method = self.methods.lookup(call_target);
        self.trace_event(stack, &method, reason);

        let threshold = method.deopt_threshold();
        if threshold > 0 {
            method.set_deopt_reason_code(reason.code());
            method.set_deopt_threshold(threshold - 1);
        } else {
            method.clear_aot_flags();
        }
        stats::record_event(reason, threshold == 0);

        let mut writer = FrameWriter::new(stack, self.thread);
        if !self.collect_virtual_registers(&method, &mut writer) {
            stats::record_stack_overflow();
            return Err(DeoptError::StackOverflow);
        }

        let frame = InterpreterFrame {
            function: call_target,
            acc: self.specials.acc,
            env: self.specials.env,
            call_size: 0,
            fp: 0, // self link, patched by the interpreter
            this: self.specials.this,
            pc: method.bytecode_entry() + u64::from(self.specials.pc_offset),
            // One return-address slot below the caller's stack top
            prev_frame: self.context.caller_stack_top - WORD_SIZE,
            frame_type: FrameType::InterpreterBridge,
        };
        for word in frame.slots() {
            writer.push_raw(word);
        }
        let output_slot_count = (writer.start() - writer.top()) / WORD_SIZE;

        self.relocate_callee_save(writer.memory());

        writer.push_raw(self.context.caller_fp);
        writer.push_raw(self.context.caller_return_addr);
        writer.push_raw(self.context.caller_stack_top);
        writer.push_raw(output_slot_count);
        Ok(writer.top())
    }
}

/// Run one complete deoptimization event.
///
/// Returns the new stack pointer for the resume trampoline, addressing
/// the [`DeoptTrailer`], or [`DeoptError::StackOverflow`].
pub fn deoptimize(
    stack: &mut StackMemory,
    thread: &ThreadContext,
    metadata: &CompilerMetadata,
    methods: &MethodRegistry,
    reason: DeoptReason,
) -> DeoptResult<u64> {
    let mut deoptimizer = Deoptimizer::new(thread, metadata, methods);
    let bundle = deoptimizer.collect_deopt_bundle(stack);
    deoptimizer.collect_vregs(stack, &bundle);
    deoptimizer.construct_interpreter_frame(stack, reason)
}

/// ABI form of [`deoptimize`] for the trampoline: the new stack pointer
/// on success, the exception sentinel on stack overflow.
pub fn deoptimize_raw(
    stack: &mut StackMemory,
    thread: &ThreadContext,
    metadata: &CompilerMetadata,
    methods: &MethodRegistry,
    reason: DeoptReason,
) -> u64 {
    match deoptimize(stack, thread, metadata, methods, reason) {
        Ok(new_sp) => new_sp,
        Err(error) => error.into_raw(),
    }
}

static TRACE_DEOPT: OnceLock<bool> = OnceLock::new();

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

/// Whether `ERMINE_TRACE_DEOPT` enables per-event trace diagnostics.
pub fn is_deopt_trace_enabled() -> bool {
    *TRACE_DEOPT.get_or_init(|| {
        std::env::var("ERMINE_TRACE_DEOPT")
            .ok()
            .is_some_and(|v| parse_env_truthy(&v))
    })
}
