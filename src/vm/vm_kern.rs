//! Kernel virtual-address layer.
//!
//! Wired kernel memory is carved out of a process-wide boundary-tag arena
//! seeded with the kernel VA window, backed by physical runs allocated
//! largest-first and entered through the kernel pmap.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::param::{page_aligned_p, Paddr, Vaddr, KERNEL_SPACE_BEGIN, KERNEL_SPACE_END, PAGE_SIZE};
use crate::vm::pmap::{self, PmapFlags};
use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::{self, VmPage};
use crate::vm::vmem::{Vmem, VmemFlags};

bitflags! {
    /// Kernel allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KmemFlags: u32 {
        /// Zero the mapped range.
        const ZERO = 0x1;
        /// Fail instead of growing the backing arena.
        const NOGROW = 0x2;
    }
}

/// Kernel virtual address space allocator.
static KVSPACE: spin::Once<Vmem> = spin::Once::new();

/// Initialize the kernel VA arena over the kernel window.
pub fn init_kmem() {
    KVSPACE.call_once(|| {
        let kvspace = Vmem::new("kvspace", PAGE_SIZE);
        kvspace.add(KERNEL_SPACE_BEGIN, KERNEL_SPACE_END - KERNEL_SPACE_BEGIN);
        kvspace
    });
}

fn kvspace() -> &'static Vmem {
    KVSPACE.get().expect("kmem not initialized")
}

/// Out-of-memory escape hatch for allocations that must not fail.
pub fn kick_swapper() -> ! {
    log::error!("kernel memory exhausted");
    panic!("cannot allocate more kernel memory: swapper not implemented!");
}

/// Reserve a kernel VA range. Returns 0 when the arena is exhausted.
pub fn kva_alloc(size: u64) -> Vaddr {
    assert!(page_aligned_p(size));
    let mut start = 0;
    if kvspace().alloc(size, &mut start, VmemFlags::NOGROW).is_err() {
        return 0;
    }
    start
}

/// Return a kernel VA range to the arena.
pub fn kva_free(ptr: Vaddr, size: u64) {
    assert!(page_aligned_p(ptr) && page_aligned_p(size));
    kvspace().free(ptr, size);
}

/// Back `[ptr, ptr + size)` with physical pages, in power-of-two runs from
/// largest to smallest, and map them kernel read-write.
pub fn kva_map(ptr: Vaddr, size: u64, flags: KmemFlags) {
    assert!(page_aligned_p(size));

    let mut npages = size as usize / PAGE_SIZE;
    let mut va = ptr;

    while npages > 0 {
        let pagecnt = 1 << npages.ilog2();
        let pg = vm_page::vm_page_alloc(pagecnt).unwrap_or_else(|| kick_swapper());
        let pa = pg.paddr();
        for i in 0..pagecnt as u64 {
            pmap::pmap_kenter(
                va + i * PAGE_SIZE as u64,
                pa + i * PAGE_SIZE as u64,
                VmProt::READ | VmProt::WRITE,
                PmapFlags::empty(),
            );
        }
        if flags.contains(KmemFlags::ZERO) {
            pmap::pmap_zero_page(&pg);
        }
        npages -= pagecnt;
        va += (pagecnt * PAGE_SIZE) as u64;
    }
}

/// Resolve a mapped kernel VA to its page frame.
pub fn kva_find_page(ptr: Vaddr) -> Option<Arc<VmPage>> {
    let pa = pmap::pmap_kextract(ptr)?;
    vm_page::vm_page_find(pa)
}

/// Release the physical pages behind `[ptr, ptr + size)` and drop the
/// kernel mappings.
pub fn kva_unmap(ptr: Vaddr, size: u64) {
    assert!(page_aligned_p(ptr) && page_aligned_p(size));

    let mut va = ptr;
    let end = ptr + size;
    while va < end {
        let pg = kva_find_page(va).expect("unmapping page that was never mapped");
        va += (pg.size() * PAGE_SIZE) as u64;
        vm_page::vm_page_release(&pg);
    }

    pmap::pmap_kremove(ptr, size);
}

/// Allocate wired, mapped kernel memory.
pub fn kmem_alloc(size: u64, flags: KmemFlags) -> Vaddr {
    assert!(page_aligned_p(size));
    assert!(!flags.contains(KmemFlags::NOGROW));

    let mut start = 0;
    if kvspace().alloc(size, &mut start, VmemFlags::NOGROW).is_err() {
        kick_swapper();
    }
    kva_map(start, size, flags);
    start
}

/// Release memory obtained from [`kmem_alloc`].
pub fn kmem_free(ptr: Vaddr, size: u64) {
    log::debug!("kmem_free: free {:#x} of size {}", ptr, size);
    kva_unmap(ptr, size);
    kvspace().free(ptr, size);
}

/// Map an externally owned physical range (e.g. device memory) into the
/// kernel window.
pub fn kmem_map(pa: Paddr, size: u64) -> Vaddr {
    assert!(page_aligned_p(pa) && page_aligned_p(size));

    let mut start = 0;
    if kvspace().alloc(size, &mut start, VmemFlags::NOGROW).is_err() {
        kick_swapper();
    }

    log::debug!("kmem_map: map {:#x} of size {} at {:#x}", pa, size, start);

    let mut offset = 0;
    while offset < size {
        pmap::pmap_kenter(
            start + offset,
            pa + offset,
            VmProt::READ | VmProt::WRITE,
            PmapFlags::empty(),
        );
        offset += PAGE_SIZE as u64;
    }
    start
}
