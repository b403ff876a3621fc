//! Runtime deoptimization counters
//!
//! Process-wide accounting for diagnostics and tooling. The deopt path
//! records into these counters but never reads them; they cannot affect
//! control flow.

use std::sync::{Mutex, OnceLock};

use crate::deoptimizer::DeoptReason;

/// Snapshot of runtime deopt counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeoptStats {
    /// Total deoptimization events.
    pub events: u64,
    /// Events per reason, indexed by [`DeoptReason::code`].
    pub by_reason: [u64; DeoptReason::COUNT],
    /// Methods whose compiled entry was permanently disabled.
    pub methods_disabled: u64,
    /// Events aborted on stack overflow.
    pub stack_overflows: u64,
}

static DEOPT_STATS: OnceLock<Mutex<DeoptStats>> = OnceLock::new();

fn stats_state() -> &'static Mutex<DeoptStats> {
    DEOPT_STATS.get_or_init(|| Mutex::new(DeoptStats::default()))
}

fn lock_stats() -> std::sync::MutexGuard<'static, DeoptStats> {
    stats_state()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn record_event(reason: DeoptReason, method_disabled: bool) {
    let mut stats = lock_stats();
    stats.events += 1;
    stats.by_reason[reason.code() as usize] += 1;
    if method_disabled {
        stats.methods_disabled += 1;
    }
}

pub(crate) fn record_stack_overflow() {
    lock_stats().stack_overflows += 1;
}

/// Snapshot of the current deopt counters.
pub fn deopt_stats() -> DeoptStats {
    *lock_stats()
}
