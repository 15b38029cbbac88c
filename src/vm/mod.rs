//! Virtual memory subsystem.
//!
//! - `vm_page`: physical frame descriptors and the buddy allocator
//! - `vm_object`: page containers, shadow chains, copy-on-write
//! - `vm_pager`: per-kind fault strategies
//! - `vm_map`: per-address-space segment sets
//! - `vm_fault`: the page-fault resolver
//! - `vmem` / `vm_kern`: kernel virtual-address allocation
//! - `vm_mmap`: the mmap/munmap/mprotect surface
//! - `pmap`: translation tables realizing the mappings

pub mod pmap;
pub mod vm_fault;
pub mod vm_kern;
pub mod vm_map;
pub mod vm_mmap;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pager;
pub mod vmem;

pub use vm_fault::{vm_page_fault, FaultError};
pub use vm_map::{vm_map_activate, vm_map_kernel, vm_map_new, vm_map_user};
pub use vm_map::{MapInsertFlags, VmMap, VmProt, VmSegment};
pub use vm_object::{vm_object_alloc, vm_object_free, vm_object_make_shadow, PagerKind, VmObject};
pub use vm_page::{vm_page_alloc, vm_page_find, vm_page_release, PageFlags, VmPage};

use crate::param::Paddr;

/// Initialize the whole subsystem, bottom up.
pub fn init(phys_start: Paddr, phys_end: Paddr, dmap_base: usize) {
    vm_page::init(phys_start, phys_end, dmap_base);
    pmap::init();
    vm_map::init();
    vm_kern::init_kmem();
}


#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::kern::with_preemption_disabled;

    #[test]
    fn test_activation_switches_user_map() {
        test_support::boot();

        // Reactivating maps must not be preempted: per-CPU state tracks
        // the active user map.
        with_preemption_disabled(|| {
            let orig = vm_map_user();

            let map = vm_map_new();
            vm_map_activate(&map);
            assert!(Arc::ptr_eq(&vm_map_user().unwrap(), &map));

            if let Some(orig) = orig {
                vm_map_activate(&orig);
            }
        });
    }

    #[test]
    fn test_kernel_map_is_global() {
        test_support::boot();
        let a = vm_map_kernel();
        let b = vm_map_kernel();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.pmap().kernel_p());
    }
}
