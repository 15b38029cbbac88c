//! VM_R - A Rust implementation of a kernel virtual-memory subsystem
//!
//! This crate provides demand-paged, copy-on-write anonymous memory for
//! user address spaces, built from VM objects, pagers and shadow chains,
//! together with the kernel virtual-address layer used by the rest of a
//! kernel for wired allocations.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

// Core types and constants
pub mod param;

// Error kinds surfaced at the syscall boundary
pub mod errno;

// Scheduling primitives consumed by the VM layer
pub mod kern;

// Virtual memory subsystem
pub mod vm;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name
pub const NAME: &str = "VM_R";

/// Initialize the VM subsystem.
///
/// `phys_start..phys_end` is the managed physical memory window and
/// `dmap_base` the virtual base of its direct map. Must be called once
/// before any other operation.
pub fn init(phys_start: param::Paddr, phys_end: param::Paddr, dmap_base: usize) {
    vm::init(phys_start, phys_end, dmap_base);
}
