//! Kernel support primitives consumed by the VM subsystem.

pub mod sched;

pub use sched::{preemption_disabled, with_preemption_disabled};
