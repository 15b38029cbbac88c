//! Page-fault resolution.
//!
//! The resolver validates the access against the segment, asks the
//! segment's object for the page through its pager, and installs the
//! result in the map's pmap. It never returns an error code to the
//! faulting thread; failures are delivered as a signal by the trap layer.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::param::{trunc_page, Vaddr};
use crate::vm::pmap::{pmap_enter, PmapFlags};
use crate::vm::vm_map::{VmMap, VmProt};
use crate::vm::vm_pager::vm_pager_fault;

/// Fault outcomes delivered to the faulting thread as a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// No segment maps the faulting address.
    #[error("no mapping at faulting address")]
    NoMapping,
    /// The segment exists but does not permit the access.
    #[error("protection violation")]
    Protection,
}

/// Fault counters, process-wide.
#[derive(Debug)]
pub struct FaultStats {
    pub total: AtomicU64,
    pub zero_fill: AtomicU64,
    pub cow: AtomicU64,
    pub failures: AtomicU64,
}

static FAULT_STATS: FaultStats = FaultStats {
    total: AtomicU64::new(0),
    zero_fill: AtomicU64::new(0),
    cow: AtomicU64::new(0),
    failures: AtomicU64::new(0),
};

/// Current fault counters.
pub fn fault_stats() -> &'static FaultStats {
    &FAULT_STATS
}

/// Resolve a fault at `fault_va` for an access of kind `access`.
pub fn vm_page_fault(map: &Arc<VmMap>, fault_va: Vaddr, access: VmProt) -> Result<(), FaultError> {
    FAULT_STATS.total.fetch_add(1, Ordering::Relaxed);

    let va = trunc_page(fault_va);

    // The map lock is dropped again before any object lock is taken.
    let seg = map.find_segment(va).ok_or_else(|| {
        FAULT_STATS.failures.fetch_add(1, Ordering::Relaxed);
        log::trace!("fault: no segment at {:#x}", fault_va);
        FaultError::NoMapping
    })?;

    if !seg.prot.contains(access) {
        FAULT_STATS.failures.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "fault: access {:?} denied at {:#x} (prot {:?})",
            access,
            fault_va,
            seg.prot
        );
        return Err(FaultError::Protection);
    }

    let object = match seg.object {
        Some(ref obj) => obj.clone(),
        None => {
            FAULT_STATS.failures.fetch_add(1, Ordering::Relaxed);
            return Err(FaultError::NoMapping);
        }
    };

    let offset = va - seg.start + seg.offset;
    let resident_before = object.page_count();

    let pg = match vm_pager_fault(&object, offset) {
        Some(pg) => pg,
        None => {
            // A dummy-backed segment never pages; treat as a protection
            // fault against the redzone.
            FAULT_STATS.failures.fetch_add(1, Ordering::Relaxed);
            return Err(FaultError::Protection);
        }
    };

    if object.page_count() > resident_before {
        if object.backing_object().is_some() {
            FAULT_STATS.cow.fetch_add(1, Ordering::Relaxed);
        } else {
            FAULT_STATS.zero_fill.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Pages still shared down the chain stay read-only in every mapping.
    let mut prot = seg.prot;
    if pg.readonly_p() {
        prot.remove(VmProt::WRITE);
    }

    pmap_enter(map.pmap(), va, &pg, prot, PmapFlags::empty());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PAGE_SIZE;
    use crate::vm::test_support::{self, user_read_u32, user_write_u32};
    use crate::vm::vm_map::{MapInsertFlags, VmMap, VmSegment};
    use crate::vm::vm_object::{vm_object_alloc, PagerKind};

    const PS: u64 = PAGE_SIZE as u64;

    fn install(map: &Arc<VmMap>, kind: PagerKind, start: u64, end: u64, prot: VmProt) {
        let obj = vm_object_alloc(kind);
        map.insert(VmSegment::new(Some(obj), start, end, prot), MapInsertFlags::FIXED)
            .unwrap();
    }

    // Demand paging with redzones on both sides of a small data segment.
    #[test]
    fn test_paging_on_demand_and_memory_protection() {
        test_support::boot();
        let map = VmMap::with_bounds(0x40_0000, 0x8000_0000);

        let pre_start = 0x100_0000;
        let start = 0x100_1000;
        let end = 0x100_3000;
        let post_end = 0x100_4000;

        install(&map, PagerKind::Dummy, pre_start, start, VmProt::NONE);
        install(&map, PagerKind::Anonymous, start, end, VmProt::READ | VmProt::WRITE);
        install(&map, PagerKind::Dummy, end, post_end, VmProt::NONE);

        map.dump();

        let mut va = start;
        while va != end {
            user_write_u32(&map, va, 0xFEED_BABE).unwrap();
            va += 1024;
        }
        let mut va = start;
        while va != end {
            assert_eq!(user_read_u32(&map, va).unwrap(), 0xFEED_BABE);
            va += 1024;
        }

        // Accesses falling into either redzone raise a protection fault.
        assert_eq!(
            user_write_u32(&map, 0x100_0ff8, 1),
            Err(FaultError::Protection)
        );
        assert_eq!(user_read_u32(&map, end), Err(FaultError::Protection));

        map.delete();
    }

    #[test]
    fn test_unmapped_address_faults() {
        test_support::boot();
        let map = VmMap::with_bounds(0x40_0000, 0x8000_0000);
        assert_eq!(
            user_read_u32(&map, 0x4000_0000),
            Err(FaultError::NoMapping)
        );
    }

    #[test]
    fn test_write_to_readonly_segment_faults() {
        test_support::boot();
        let map = VmMap::with_bounds(0x40_0000, 0x8000_0000);
        install(&map, PagerKind::Anonymous, 0x200_0000, 0x200_1000, VmProt::READ);

        assert_eq!(user_read_u32(&map, 0x200_0000).unwrap(), 0);
        assert_eq!(
            user_write_u32(&map, 0x200_0000, 7),
            Err(FaultError::Protection)
        );
        map.delete();
    }

    // Fork-style copy-on-write: both sides shadow the same backing; writes
    // on either side stay private.
    #[test]
    fn test_copy_on_write() {
        test_support::boot();
        let parent = VmMap::with_bounds(0x40_0000, 0x8000_0000);
        install(
            &parent,
            PagerKind::Anonymous,
            0x1000_0000,
            0x3000_0000,
            VmProt::READ | VmProt::WRITE,
        );

        let probe = 0x1000_1000;
        user_write_u32(&parent, probe, 0xFEED_BABE).unwrap();

        let child = parent.clone_for_fork();

        // Both sides now sit on fresh shadows over the shared backing.
        let pseg = parent.find_segment(probe).unwrap();
        let cseg = child.find_segment(probe).unwrap();
        let pobj = pseg.object.unwrap();
        let cobj = cseg.object.unwrap();
        assert!(!Arc::ptr_eq(&pobj, &cobj));
        assert!(Arc::ptr_eq(
            &pobj.backing_object().unwrap(),
            &cobj.backing_object().unwrap()
        ));

        // The child reads the parent's data through the chain.
        assert_eq!(user_read_u32(&child, probe).unwrap(), 0xFEED_BABE);

        // A child write lands in the child's shadow only.
        user_write_u32(&child, probe, 0xDEAD).unwrap();
        assert_eq!(user_read_u32(&child, probe).unwrap(), 0xDEAD);
        assert_eq!(user_read_u32(&parent, probe).unwrap(), 0xFEED_BABE);

        // A parent write produces a second, independent copy.
        user_write_u32(&parent, probe, 0xBEEF).unwrap();
        assert_eq!(user_read_u32(&parent, probe).unwrap(), 0xBEEF);
        assert_eq!(user_read_u32(&child, probe).unwrap(), 0xDEAD);

        child.delete();
        parent.delete();
    }

    // A parent write after fork must not disturb what the child already
    // sees at the same offset (the backing page stays intact).
    #[test]
    fn test_parent_view_unchanged_after_child_write() {
        test_support::boot();
        let parent = VmMap::with_bounds(0x40_0000, 0x8000_0000);
        install(
            &parent,
            PagerKind::Anonymous,
            0x1000_0000,
            0x1100_0000,
            VmProt::READ | VmProt::WRITE,
        );

        let probe = 0x1080_0000;
        user_write_u32(&parent, probe, 0x1234_5678).unwrap();

        let child = parent.clone_for_fork();
        user_write_u32(&child, probe, 0x9ABC_DEF0).unwrap();

        assert_eq!(user_read_u32(&parent, probe).unwrap(), 0x1234_5678);
        child.delete();
        assert_eq!(user_read_u32(&parent, probe).unwrap(), 0x1234_5678);

        // With the child gone the backing folded into the parent's shadow;
        // the page is exclusively owned again and writable.
        user_write_u32(&parent, probe, 0x0BAD_F00D).unwrap();
        assert_eq!(user_read_u32(&parent, probe).unwrap(), 0x0BAD_F00D);
        parent.delete();
    }

    #[test]
    fn test_fault_counters_move() {
        test_support::boot();
        let map = VmMap::with_bounds(0x40_0000, 0x8000_0000);
        install(&map, PagerKind::Anonymous, 0x300_0000, 0x300_1000, VmProt::READ | VmProt::WRITE);

        let before = fault_stats().zero_fill.load(Ordering::Relaxed);
        user_write_u32(&map, 0x300_0000, 1).unwrap();
        assert!(fault_stats().zero_fill.load(Ordering::Relaxed) > before);
        map.delete();
    }
}
