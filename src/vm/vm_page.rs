//! Page frames and the physical page allocator.
//!
//! Every base frame of managed physical memory has a `VmPage` descriptor.
//! Frames are handed out in power-of-two runs; the descriptor of the first
//! frame (the run leader) carries the run length in `size`. While a page is
//! held by a VM object its run length is always 1.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::param::{atop, page_aligned_p, Paddr, PAGE_SIZE};
use crate::vm::vm_object::VmObject;

/// Largest run order the allocator tracks (2^12 pages = 16 MiB).
const MAX_ORDER: usize = 12;

bitflags! {
    /// Page state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// All mappings of this page have been downgraded to read-only;
        /// writes through upper shadow levels must copy.
        const READONLY = 0x01;
        /// Page has been written through some mapping.
        const MODIFIED = 0x02;
        /// Page has been accessed through some mapping.
        const REFERENCED = 0x04;
    }
}

/// Back-reference from a page to the object holding it.
struct PageOwner {
    object: Weak<VmObject>,
    offset: u64,
}

/// Physical page-frame descriptor.
pub struct VmPage {
    /// Physical address of the first frame of the run.
    paddr: Paddr,
    /// Frame index relative to the managed window.
    idx: usize,
    /// Number of contiguous base frames in the run (power of two).
    size: AtomicUsize,
    flags: AtomicU32,
    ref_counter: AtomicU32,
    owner: Mutex<Option<PageOwner>>,
}

impl VmPage {
    fn new(paddr: Paddr, idx: usize) -> Self {
        Self {
            paddr,
            idx,
            size: AtomicUsize::new(1),
            flags: AtomicU32::new(0),
            ref_counter: AtomicU32::new(0),
            owner: Mutex::new(None),
        }
    }

    /// Physical address of the run.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Run length in base pages.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Offset of this page within its owning object.
    pub fn offset(&self) -> u64 {
        self.owner.lock().as_ref().map_or(0, |o| o.offset)
    }

    /// The object currently holding this page, if any.
    pub fn object(&self) -> Option<Arc<VmObject>> {
        self.owner.lock().as_ref().and_then(|o| o.object.upgrade())
    }

    pub(crate) fn set_owner(&self, object: &Arc<VmObject>, offset: u64) {
        assert!(page_aligned_p(offset));
        *self.owner.lock() = Some(PageOwner {
            object: Arc::downgrade(object),
            offset,
        });
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    pub(crate) fn owned_p(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Current flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    /// Whether all mappings of this page are read-only.
    pub fn readonly_p(&self) -> bool {
        self.flags().contains(PageFlags::READONLY)
    }

    /// Acquire one reference.
    pub fn hold(&self) {
        self.ref_counter.fetch_add(1, Ordering::Acquire);
    }

    /// Release one reference, returning true when it was the last.
    fn release(&self) -> bool {
        self.ref_counter.fetch_sub(1, Ordering::Release) == 1
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_counter.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmPage")
            .field("paddr", &self.paddr)
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// ============================================================================
// Physical allocator
// ============================================================================

struct PageManager {
    /// First managed frame number.
    first_pfn: u64,
    /// One descriptor per base frame.
    frames: Vec<Arc<VmPage>>,
    /// Free run leaders by order, as frame indices.
    free: [BTreeSet<usize>; MAX_ORDER + 1],
    /// Allocated runs: leader index -> run length.
    allocated: BTreeMap<usize, usize>,
    free_count: usize,
}

impl PageManager {
    fn new(phys_start: Paddr, phys_end: Paddr) -> Self {
        assert!(page_aligned_p(phys_start) && page_aligned_p(phys_end));
        assert!(phys_end > phys_start);

        let nframes = ((phys_end - phys_start) as usize) / PAGE_SIZE;
        let first_pfn = atop(phys_start);

        let mut frames = Vec::with_capacity(nframes);
        for i in 0..nframes {
            frames.push(Arc::new(VmPage::new(
                phys_start + (i * PAGE_SIZE) as u64,
                i,
            )));
        }

        let mut mgr = Self {
            first_pfn,
            frames,
            free: core::array::from_fn(|_| BTreeSet::new()),
            allocated: BTreeMap::new(),
            free_count: nframes,
        };

        // Seed the free lists with maximal naturally aligned runs.
        let mut idx = 0;
        while idx < nframes {
            let mut order = MAX_ORDER;
            while order > 0 && (idx % (1 << order) != 0 || idx + (1 << order) > nframes) {
                order -= 1;
            }
            mgr.free[order].insert(idx);
            idx += 1 << order;
        }
        mgr
    }

    fn alloc(&mut self, npages: usize) -> Option<Arc<VmPage>> {
        assert!(npages.is_power_of_two());
        let order = npages.trailing_zeros() as usize;
        if order > MAX_ORDER {
            return None;
        }

        // Find the smallest free run that fits, then split it down.
        let mut have = (order..=MAX_ORDER).find(|&o| !self.free[o].is_empty())?;
        let idx = *self.free[have].iter().next().unwrap();
        self.free[have].remove(&idx);
        while have > order {
            have -= 1;
            self.free[have].insert(idx + (1 << have));
        }

        self.allocated.insert(idx, npages);
        self.free_count -= npages;

        let pg = self.frames[idx].clone();
        pg.size.store(npages, Ordering::Relaxed);
        pg.flags.store(0, Ordering::Relaxed);
        pg.ref_counter.store(1, Ordering::Relaxed);
        Some(pg)
    }

    fn free(&mut self, pg: &VmPage) {
        let npages = pg.size();
        let removed = self.allocated.remove(&pg.idx);
        assert!(removed == Some(npages), "freeing frames not allocated");
        self.free_count += npages;

        // Coalesce with the buddy run while possible.
        let mut idx = pg.idx;
        let mut order = npages.trailing_zeros() as usize;
        while order < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if !self.free[order].remove(&buddy) {
                break;
            }
            idx = idx.min(buddy);
            order += 1;
        }
        self.free[order].insert(idx);
    }

    fn find(&self, pa: Paddr) -> Option<Arc<VmPage>> {
        let pfn = atop(pa);
        if pfn < self.first_pfn {
            return None;
        }
        let idx = (pfn - self.first_pfn) as usize;
        if idx >= self.frames.len() {
            return None;
        }
        let (&lead, &len) = self.allocated.range(..=idx).next_back()?;
        if idx < lead + len {
            Some(self.frames[lead].clone())
        } else {
            None
        }
    }
}

// ============================================================================
// Global state
// ============================================================================

static PAGE_MANAGER: spin::Once<Mutex<PageManager>> = spin::Once::new();

/// Base of the managed physical window.
static PHYS_BASE: AtomicU64 = AtomicU64::new(0);
/// Virtual base of the direct map covering the managed window.
static DMAP_BASE: AtomicUsize = AtomicUsize::new(0);

/// Initialize the physical allocator over `[phys_start, phys_end)`.
/// `dmap_base` is the virtual address at which `phys_start` is mapped.
pub fn init(phys_start: Paddr, phys_end: Paddr, dmap_base: usize) {
    PAGE_MANAGER.call_once(|| {
        PHYS_BASE.store(phys_start, Ordering::Relaxed);
        DMAP_BASE.store(dmap_base, Ordering::Relaxed);
        log::debug!(
            "vm_page: managing {:#x}-{:#x} ({} pages)",
            phys_start,
            phys_end,
            (phys_end - phys_start) as usize / PAGE_SIZE
        );
        Mutex::new(PageManager::new(phys_start, phys_end))
    });
}

fn page_manager() -> &'static Mutex<PageManager> {
    PAGE_MANAGER.get().expect("vm_page not initialized")
}

/// Allocate a run of `npages` contiguous frames (power of two).
/// The returned leader has reference count 1.
pub fn vm_page_alloc(npages: usize) -> Option<Arc<VmPage>> {
    page_manager().lock().alloc(npages)
}

/// Release one reference on `pg`, returning the run to the allocator when
/// the last reference goes away.
pub fn vm_page_release(pg: &Arc<VmPage>) {
    if pg.release() {
        pg.clear_owner();
        page_manager().lock().free(pg);
    }
}

/// Find the run descriptor owning the frame at `pa`.
pub fn vm_page_find(pa: Paddr) -> Option<Arc<VmPage>> {
    page_manager().lock().find(pa)
}

/// Number of currently free base frames.
pub fn vm_page_free_count() -> usize {
    page_manager().lock().free_count
}

/// Direct-map address of the physical address `pa`.
///
/// Valid only for addresses inside the managed window.
pub(crate) fn phys_to_dmap(pa: Paddr) -> *mut u8 {
    let base = PHYS_BASE.load(Ordering::Relaxed);
    debug_assert!(pa >= base);
    (DMAP_BASE.load(Ordering::Relaxed) + (pa - base) as usize) as *mut u8
}
