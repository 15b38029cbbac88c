//! Error kinds surfaced to the system-call layer.

use thiserror::Error;

/// Errors returned by the VM syscall surface.
///
/// Page-fault failures are not represented here; they are delivered to the
/// faulting thread as a signal (see [`crate::vm::vm_fault::FaultError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    /// Invalid argument: bad alignment, out-of-range address, conflicting
    /// flags, or an overlapping fixed mapping
    #[error("invalid argument")]
    Inval,
    /// Address-space or physical-memory shortage at syscall scope
    #[error("out of memory")]
    NoMem,
    /// Operation shape not supported (e.g. partial unmap)
    #[error("operation not supported")]
    NotSup,
    /// File provides no mapping operation
    #[error("no such device")]
    NoDev,
}
