//! Preemption control.
//!
//! Administrative paths that swap the active user map must not be preempted,
//! because per-CPU state tracks the active map. The scheduler honors this
//! counter before switching threads.

use core::sync::atomic::{AtomicU32, Ordering};

static PREEMPT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Run `f` with preemption disabled. Nestable.
pub fn with_preemption_disabled<R>(f: impl FnOnce() -> R) -> R {
    PREEMPT_COUNT.fetch_add(1, Ordering::Acquire);
    let r = f();
    PREEMPT_COUNT.fetch_sub(1, Ordering::Release);
    r
}

/// Check whether the current CPU may be preempted.
pub fn preemption_disabled() -> bool {
    PREEMPT_COUNT.load(Ordering::Relaxed) > 0
}
