//! Physical map - translation tables and per-frame mapping index.
//!
//! The pmap realizes virtual-to-physical translations for one address space
//! and tracks, per frame, every place the frame is mapped so protection
//! downgrades reach all of them. This implementation keeps the translations
//! in a software table; an MMU port would mirror each operation into the
//! hardware page tables.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::param::{page_aligned_p, trunc_page, Paddr, Vaddr, PAGE_MASK, PAGE_SIZE};
use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::{self, PageFlags, VmPage};

bitflags! {
    /// Cache attributes passed alongside protection on map entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PmapFlags: u32 {
        const NOCACHE = 0x0100_0000;
        const WRITE_THROUGH = 0x0200_0000;
        const WRITE_BACK = 0x0300_0000;
    }
}

/// One translation entry.
#[derive(Debug, Clone, Copy)]
struct Pte {
    pa: Paddr,
    prot: VmProt,
    flags: PmapFlags,
}

/// Physical map for one address space.
pub struct Pmap {
    kernel: bool,
    ptes: Mutex<BTreeMap<Vaddr, Pte>>,
}

impl Pmap {
    fn new(kernel: bool) -> Self {
        Self {
            kernel,
            ptes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether this is the kernel pmap.
    pub fn kernel_p(&self) -> bool {
        self.kernel
    }

    /// Number of resident translations.
    pub fn resident_count(&self) -> usize {
        self.ptes.lock().len()
    }
}

impl core::fmt::Debug for Pmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmap")
            .field("kernel", &self.kernel)
            .field("resident", &self.resident_count())
            .finish()
    }
}

// ============================================================================
// Per-frame mapping index (pv entries)
// ============================================================================

struct PvEntry {
    pmap: Weak<Pmap>,
    va: Vaddr,
}

/// frame physical address -> all (pmap, va) mapping it
static PV_TABLE: Mutex<BTreeMap<Paddr, Vec<PvEntry>>> = Mutex::new(BTreeMap::new());

fn pv_insert(pa: Paddr, pmap: &Arc<Pmap>, va: Vaddr) {
    let mut pv = PV_TABLE.lock();
    let entries = pv.entry(pa).or_default();
    entries.retain(|e| !(e.va == va && e.pmap.as_ptr() == Arc::as_ptr(pmap)));
    entries.push(PvEntry {
        pmap: Arc::downgrade(pmap),
        va,
    });
}

fn pv_remove(pa: Paddr, pmap: &Arc<Pmap>, va: Vaddr) {
    let mut pv = PV_TABLE.lock();
    if let Some(entries) = pv.get_mut(&pa) {
        entries.retain(|e| !(e.va == va && e.pmap.as_ptr() == Arc::as_ptr(pmap)));
        if entries.is_empty() {
            pv.remove(&pa);
        }
    }
}

// ============================================================================
// Global state
// ============================================================================

static KERNEL_PMAP: spin::Once<Arc<Pmap>> = spin::Once::new();
static ACTIVE_USER_PMAP: Mutex<Option<Arc<Pmap>>> = Mutex::new(None);

/// Initialize the pmap layer and create the kernel pmap.
pub fn init() {
    KERNEL_PMAP.call_once(|| Arc::new(Pmap::new(true)));
}

/// The kernel pmap, shared by every CPU.
pub fn pmap_kernel() -> Arc<Pmap> {
    KERNEL_PMAP.get().expect("pmap not initialized").clone()
}

/// The currently active user pmap.
pub fn pmap_user() -> Option<Arc<Pmap>> {
    ACTIVE_USER_PMAP.lock().clone()
}

/// Create a fresh user pmap.
pub fn pmap_new() -> Arc<Pmap> {
    Arc::new(Pmap::new(false))
}

/// Tear down a user pmap, dropping every translation.
pub fn pmap_delete(pmap: &Arc<Pmap>) {
    assert!(!pmap.kernel);
    let vas: Vec<Vaddr> = pmap.ptes.lock().keys().copied().collect();
    if let (Some(&first), Some(&last)) = (vas.first(), vas.last()) {
        pmap_remove(pmap, first, last + PAGE_SIZE as u64);
    }
}

/// Make `pmap` the active user pmap (loads its root on hardware).
pub fn pmap_activate(pmap: &Arc<Pmap>) {
    if !pmap.kernel {
        *ACTIVE_USER_PMAP.lock() = Some(pmap.clone());
    }
}

// ============================================================================
// Mapping operations
// ============================================================================

/// Install `va -> pg` with protection `prot`, replacing any prior mapping.
pub fn pmap_enter(pmap: &Arc<Pmap>, va: Vaddr, pg: &Arc<VmPage>, prot: VmProt, flags: PmapFlags) {
    assert!(page_aligned_p(va));
    let pa = pg.paddr();

    let old = pmap.ptes.lock().insert(va, Pte { pa, prot, flags });
    if let Some(old) = old {
        if old.pa != pa {
            pv_remove(old.pa, pmap, va);
        }
    }
    pv_insert(pa, pmap, va);
}

/// Drop every mapping in `[start, end)`.
pub fn pmap_remove(pmap: &Arc<Pmap>, start: Vaddr, end: Vaddr) {
    let removed: Vec<(Vaddr, Pte)> = {
        let mut ptes = pmap.ptes.lock();
        let vas: Vec<Vaddr> = ptes.range(start..end).map(|(&va, _)| va).collect();
        vas.iter()
            .filter_map(|va| ptes.remove(va).map(|pte| (*va, pte)))
            .collect()
    };
    for (va, pte) in removed {
        pv_remove(pte.pa, pmap, va);
    }
}

/// Apply `prot` to every existing mapping in `[start, end)`.
pub fn pmap_protect(pmap: &Arc<Pmap>, start: Vaddr, end: Vaddr, prot: VmProt) {
    let mut ptes = pmap.ptes.lock();
    for (_, pte) in ptes.range_mut(start..end) {
        pte.prot = prot;
    }
}

/// Translate `va`, returning the mapped frame address.
pub fn pmap_extract(pmap: &Arc<Pmap>, va: Vaddr) -> Option<Paddr> {
    pmap.ptes.lock().get(&trunc_page(va)).map(|pte| pte.pa)
}

/// Check that an access of kind `access` through `va` is permitted, and
/// translate it. Maintains the referenced/modified bits of managed pages.
pub(crate) fn pmap_probe(pmap: &Arc<Pmap>, va: Vaddr, access: VmProt) -> Option<Paddr> {
    let pte = *pmap.ptes.lock().get(&trunc_page(va))?;
    if !pte.prot.contains(access) {
        return None;
    }
    if let Some(pg) = vm_page::vm_page_find(pte.pa) {
        pg.set_flags(PageFlags::REFERENCED);
        if access.contains(VmProt::WRITE) {
            pg.set_flags(PageFlags::MODIFIED);
        }
    }
    Some(pte.pa + (va & PAGE_MASK))
}

// ============================================================================
// Kernel-window operations
// ============================================================================

/// Install a kernel mapping for an arbitrary frame (may be device memory).
pub fn pmap_kenter(va: Vaddr, pa: Paddr, prot: VmProt, flags: PmapFlags) {
    assert!(page_aligned_p(va) && page_aligned_p(pa));
    pmap_kernel().ptes.lock().insert(va, Pte { pa, prot, flags });
}

/// Remove kernel mappings for `[va, va + size)`.
pub fn pmap_kremove(va: Vaddr, size: u64) {
    assert!(page_aligned_p(va) && page_aligned_p(size));
    let kernel = pmap_kernel();
    let mut ptes = kernel.ptes.lock();
    let vas: Vec<Vaddr> = ptes.range(va..va + size).map(|(&v, _)| v).collect();
    for v in vas {
        ptes.remove(&v);
    }
}

/// Translate a kernel virtual address.
pub fn pmap_kextract(va: Vaddr) -> Option<Paddr> {
    pmap_extract(&pmap_kernel(), va)
}

// ============================================================================
// Frame contents and per-frame protection
// ============================================================================

/// Zero the frames of `pg` through the direct map.
pub fn pmap_zero_page(pg: &VmPage) {
    let len = pg.size() * PAGE_SIZE;
    unsafe {
        core::ptr::write_bytes(vm_page::phys_to_dmap(pg.paddr()), 0, len);
    }
}

/// Copy one base page of contents from `src` to `dst`.
pub fn pmap_copy_page(src: &VmPage, dst: &VmPage) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            vm_page::phys_to_dmap(src.paddr()),
            vm_page::phys_to_dmap(dst.paddr()),
            PAGE_SIZE,
        );
    }
}

/// Downgrade every existing mapping of `pg` to read-only and mark the page
/// so future installs stay read-only.
pub fn pmap_set_page_readonly(pg: &VmPage) {
    pg.set_flags(PageFlags::READONLY);

    let pv = PV_TABLE.lock();
    if let Some(entries) = pv.get(&pg.paddr()) {
        for e in entries {
            if let Some(pmap) = e.pmap.upgrade() {
                if let Some(pte) = pmap.ptes.lock().get_mut(&e.va) {
                    pte.prot.remove(VmProt::WRITE);
                }
            }
        }
    }
}

// ============================================================================
// Modified/referenced queries
// ============================================================================

pub fn pmap_is_modified(pg: &VmPage) -> bool {
    pg.flags().contains(PageFlags::MODIFIED)
}

pub fn pmap_is_referenced(pg: &VmPage) -> bool {
    pg.flags().contains(PageFlags::REFERENCED)
}

pub fn pmap_clear_modified(pg: &VmPage) -> bool {
    let was = pmap_is_modified(pg);
    pg.clear_flags(PageFlags::MODIFIED);
    was
}

pub fn pmap_clear_referenced(pg: &VmPage) -> bool {
    let was = pmap_is_referenced(pg);
    pg.clear_flags(PageFlags::REFERENCED);
    was
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support;
    use crate::vm::vm_page::vm_page_alloc;
    use crate::vm::vm_page::vm_page_release;

    #[test]
    fn test_enter_extract_remove() {
        test_support::boot();
        let pmap = pmap_new();
        let pg = vm_page_alloc(1).unwrap();

        pmap_enter(&pmap, 0x1000_0000, &pg, VmProt::READ | VmProt::WRITE, PmapFlags::empty());
        assert_eq!(pmap_extract(&pmap, 0x1000_0000), Some(pg.paddr()));
        assert_eq!(pmap_extract(&pmap, 0x1000_0ff8), Some(pg.paddr()));
        assert_eq!(pmap_extract(&pmap, 0x1000_1000), None);

        pmap_remove(&pmap, 0x1000_0000, 0x1000_1000);
        assert_eq!(pmap_extract(&pmap, 0x1000_0000), None);
        vm_page_release(&pg);
    }

    #[test]
    fn test_probe_checks_protection() {
        test_support::boot();
        let pmap = pmap_new();
        let pg = vm_page_alloc(1).unwrap();

        pmap_enter(&pmap, 0x2000_0000, &pg, VmProt::READ, PmapFlags::empty());
        assert!(pmap_probe(&pmap, 0x2000_0010, VmProt::READ).is_some());
        assert!(pmap_probe(&pmap, 0x2000_0010, VmProt::WRITE).is_none());

        pmap_remove(&pmap, 0x2000_0000, 0x2000_1000);
        vm_page_release(&pg);
    }

    #[test]
    fn test_set_page_readonly_hits_all_mappings() {
        test_support::boot();
        let p1 = pmap_new();
        let p2 = pmap_new();
        let pg = vm_page_alloc(1).unwrap();
        let rw = VmProt::READ | VmProt::WRITE;

        pmap_enter(&p1, 0x3000_0000, &pg, rw, PmapFlags::empty());
        pmap_enter(&p2, 0x4000_0000, &pg, rw, PmapFlags::empty());
        pmap_set_page_readonly(&pg);

        assert!(pmap_probe(&p1, 0x3000_0000, VmProt::WRITE).is_none());
        assert!(pmap_probe(&p2, 0x4000_0000, VmProt::WRITE).is_none());
        assert!(pmap_probe(&p1, 0x3000_0000, VmProt::READ).is_some());

        pmap_remove(&p1, 0x3000_0000, 0x3000_1000);
        pmap_remove(&p2, 0x4000_0000, 0x4000_1000);
        vm_page_release(&pg);
    }

    #[test]
    fn test_modified_referenced_bits() {
        test_support::boot();
        let pmap = pmap_new();
        let pg = vm_page_alloc(1).unwrap();
        let rw = VmProt::READ | VmProt::WRITE;

        pmap_enter(&pmap, 0x5000_0000, &pg, rw, PmapFlags::empty());
        assert!(!pmap_is_referenced(&pg) && !pmap_is_modified(&pg));

        pmap_probe(&pmap, 0x5000_0000, VmProt::READ).unwrap();
        assert!(pmap_is_referenced(&pg) && !pmap_is_modified(&pg));

        pmap_probe(&pmap, 0x5000_0000, VmProt::WRITE).unwrap();
        assert!(pmap_is_modified(&pg));
        assert!(pmap_clear_modified(&pg));
        assert!(!pmap_is_modified(&pg));

        pmap_remove(&pmap, 0x5000_0000, 0x5000_1000);
        vm_page_release(&pg);
    }
}
