//! VM objects - containers of pages indexed by offset.
//!
//! An object owns its resident pages through an ordered index and serves as
//! the unit of sharing and shadowing. A shadow object resolves misses by
//! consulting its backing object; the backing link holds one reference on
//! the backing, and the backing keeps a non-owning back-index of its live
//! shadows so the chain can be merged when only one shadow remains.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::RwLock;

use crate::param::page_aligned_p;
use crate::vm::pmap::{pmap_copy_page, pmap_set_page_readonly};
use crate::vm::vm_kern::kick_swapper;
use crate::vm::vm_page::{self, VmPage};

/// Pager strategy attached to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerKind {
    /// Faults never produce a page (redzones).
    Dummy,
    /// Faults allocate and zero a fresh page.
    Anonymous,
    /// Faults walk the shadow chain.
    Shadow,
}

/// Object state guarded by the object lock.
pub(crate) struct VmObjectInner {
    /// Resident pages keyed by page-aligned offset.
    pub(crate) pages: BTreeMap<u64, Arc<VmPage>>,
    pub(crate) npages: usize,
    pub(crate) pager: PagerKind,
    /// Backing link; accounts for one reference on the backing.
    pub(crate) shadow: Option<Arc<VmObject>>,
    /// Live objects whose `shadow` is this object. Non-owning.
    pub(crate) shadows_list: Vec<Weak<VmObject>>,
}

/// A VM object.
pub struct VmObject {
    ref_counter: AtomicU32,
    pub(crate) inner: RwLock<VmObjectInner>,
}

/// Create an object of the given pager kind with one reference.
pub fn vm_object_alloc(kind: PagerKind) -> Arc<VmObject> {
    Arc::new(VmObject {
        ref_counter: AtomicU32::new(1),
        inner: RwLock::new(VmObjectInner {
            pages: BTreeMap::new(),
            npages: 0,
            pager: kind,
            shadow: None,
            shadows_list: Vec::new(),
        }),
    })
}

/// Create a shadow object backed by `backing`.
///
/// The new object holds one reference on `backing` and registers itself in
/// the backing's shadow index.
pub fn vm_object_make_shadow(backing: &Arc<VmObject>) -> Arc<VmObject> {
    let shadow = vm_object_alloc(PagerKind::Shadow);

    backing.hold();
    let mut sinner = shadow.inner.write();
    sinner.shadow = Some(backing.clone());
    drop(sinner);

    let mut binner = backing.inner.write();
    binner.shadows_list.push(Arc::downgrade(&shadow));
    drop(binner);

    shadow
}

impl VmObject {
    /// Acquire one reference.
    pub fn hold(&self) {
        self.ref_counter.fetch_add(1, Ordering::Acquire);
    }

    fn release(&self) -> bool {
        self.ref_counter.fetch_sub(1, Ordering::Release) == 1
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_counter.load(Ordering::Relaxed)
    }

    /// Pager kind currently attached.
    pub fn pager_kind(&self) -> PagerKind {
        self.inner.read().pager
    }

    /// The backing object, if this is a shadow.
    pub fn backing_object(&self) -> Option<Arc<VmObject>> {
        self.inner.read().shadow.clone()
    }

    /// Number of resident pages.
    pub fn page_count(&self) -> usize {
        self.inner.read().npages
    }

    /// Look up the page at `offset`.
    pub fn find_page(&self, offset: u64) -> Option<Arc<VmPage>> {
        self.inner.read().pages.get(&offset).cloned()
    }

    pub(crate) fn find_page_nolock(inner: &VmObjectInner, offset: u64) -> Option<Arc<VmPage>> {
        inner.pages.get(&offset).cloned()
    }

    /// Insert `pg` at `offset`. The page must be unowned and no page may
    /// already live at that offset.
    pub fn add_page(self: &Arc<Self>, offset: u64, pg: &Arc<VmPage>) {
        let mut inner = self.inner.write();
        self.add_page_nolock(&mut inner, offset, pg);
    }

    pub(crate) fn add_page_nolock(
        self: &Arc<Self>,
        inner: &mut VmObjectInner,
        offset: u64,
        pg: &Arc<VmPage>,
    ) {
        assert!(page_aligned_p(offset));
        assert!(!pg.owned_p(), "page already owned by an object");

        pg.hold();
        pg.set_owner(self, offset);
        let prev = inner.pages.insert(offset, pg.clone());
        assert!(prev.is_none(), "page already present at offset");
        inner.npages += 1;
    }

    /// Remove `pg` from this object, releasing the index reference.
    pub fn remove_page(&self, pg: &Arc<VmPage>) {
        let mut inner = self.inner.write();
        Self::remove_page_nolock(&mut inner, pg);
    }

    pub(crate) fn remove_page_nolock(inner: &mut VmObjectInner, pg: &Arc<VmPage>) {
        let removed = inner.pages.remove(&pg.offset());
        assert!(removed.is_some(), "removing page not in object");
        pg.clear_owner();
        vm_page::vm_page_release(pg);
        inner.npages -= 1;
    }

    /// Remove every page whose offset lies in `[offset, offset + length)`.
    pub fn remove_range(&self, offset: u64, length: u64) {
        let mut inner = self.inner.write();
        let victims: Vec<Arc<VmPage>> = inner
            .pages
            .range(offset..offset + length)
            .map(|(_, pg)| pg.clone())
            .collect();
        for pg in victims {
            Self::remove_page_nolock(&mut inner, &pg);
        }
    }

    /// Deep-copy this object into a fresh anonymous object, duplicating
    /// every resident page at the same offset.
    pub fn clone_object(&self) -> Arc<VmObject> {
        let new_obj = vm_object_alloc(PagerKind::Anonymous);

        let inner = self.inner.read();
        for (&offset, pg) in inner.pages.iter() {
            let new_pg = vm_page::vm_page_alloc(1).unwrap_or_else(|| kick_swapper());
            pmap_copy_page(pg, &new_pg);
            new_obj.add_page(offset, &new_pg);
            vm_page::vm_page_release(&new_pg);
        }
        new_obj
    }

    /// Downgrade every mapping of every resident page to read-only, so the
    /// next write through any shadow traps and copies.
    pub fn set_readonly(&self) {
        let inner = self.inner.write();
        for pg in inner.pages.values() {
            pmap_set_page_readonly(pg);
        }
    }

    /// Log one line per resident page.
    pub fn dump(&self) {
        let inner = self.inner.read();
        for (offset, pg) in inner.pages.iter() {
            log::debug!(
                "(vm-obj) offset: {:#010x}, size: {}",
                offset,
                pg.size()
            );
        }
    }

    fn unregister_shadow(&self, child: &VmObject) {
        let mut inner = self.inner.write();
        inner
            .shadows_list
            .retain(|w| w.as_ptr() != child as *const _ && w.strong_count() > 0);
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("VmObject")
            .field("refs", &self.ref_count())
            .field("npages", &inner.npages)
            .field("pager", &inner.pager)
            .field("shadowed", &inner.shadow.is_some())
            .finish()
    }
}

/// Release one reference on `obj`. On last release every resident page is
/// released, the backing link (if any) is dropped, and the release of the
/// backing may trigger a shadow-chain merge.
pub fn vm_object_free(obj: &Arc<VmObject>) {
    if !obj.release() {
        // Not the last holder. If the remaining references are exactly one
        // shadow child, fold this object into it.
        merge_single_shadow(obj);
        return;
    }

    log::trace!("vm_object: tearing down {:p}", Arc::as_ptr(obj));

    let backing = {
        let mut inner = obj.inner.write();
        let pages: Vec<Arc<VmPage>> = inner.pages.values().cloned().collect();
        for pg in pages {
            VmObject::remove_page_nolock(&mut inner, &pg);
        }
        inner.shadows_list.clear();
        inner.shadow.take()
    };

    if let Some(backing) = backing {
        backing.unregister_shadow(obj);
        vm_object_free(&backing);
    }
}

/// Merge `backing` into its sole surviving shadow when no other holder
/// remains. Bounds chain growth after serial child exits.
fn merge_single_shadow(backing: &Arc<VmObject>) {
    // Fast precheck under the backing's lock.
    let survivor = {
        let mut inner = backing.inner.write();
        inner.shadows_list.retain(|w| w.strong_count() > 0);
        if backing.ref_count() != 1 || inner.shadows_list.len() != 1 {
            return;
        }
        match inner.shadows_list[0].upgrade() {
            Some(s) => s,
            None => return,
        }
    };

    // Re-lock in chain order (child before backing) and re-validate; a
    // concurrent fork or mapping may have taken new references meanwhile.
    let mut sinner = survivor.inner.write();
    let mut binner = backing.inner.write();

    if backing.ref_count() != 1 {
        return;
    }
    match &sinner.shadow {
        Some(b) if Arc::ptr_eq(b, backing) => {}
        _ => return,
    }
    binner.shadows_list.retain(|w| w.strong_count() > 0);
    if binner.shadows_list.len() != 1 {
        return;
    }

    log::debug!(
        "vm_object: merging {:p} into surviving shadow {:p}",
        Arc::as_ptr(backing),
        Arc::as_ptr(&survivor)
    );

    // Move every page the survivor does not already shadow privately. The
    // page reference transfers with the page. When the survivor is not
    // itself shadowed, the migrated pages become exclusively owned and lose
    // their read-only marker, so later writes stop trapping.
    sinner.shadows_list.retain(|w| w.strong_count() > 0);
    let exclusive = sinner.shadows_list.is_empty();
    let offsets: Vec<u64> = binner.pages.keys().copied().collect();
    for offset in offsets {
        if sinner.pages.contains_key(&offset) {
            continue;
        }
        let pg = binner.pages.remove(&offset).unwrap();
        binner.npages -= 1;
        pg.set_owner(&survivor, offset);
        if exclusive {
            pg.clear_flags(crate::vm::vm_page::PageFlags::READONLY);
        }
        sinner.pages.insert(offset, pg);
        sinner.npages += 1;
    }

    // The survivor inherits the backing's own backing link and pager.
    let next = binner.shadow.take();
    sinner.pager = binner.pager;
    binner.shadows_list.clear();
    sinner.shadow = next.clone();

    drop(binner);
    drop(sinner);

    // Re-register the survivor one level down; the reference the backing
    // held on that level transfers to the survivor.
    if let Some(next) = next {
        let mut ninner = next.inner.write();
        ninner
            .shadows_list
            .retain(|w| w.as_ptr() != Arc::as_ptr(backing) && w.strong_count() > 0);
        ninner.shadows_list.push(Arc::downgrade(&survivor));
        drop(ninner);
    }

    // Release the survivor's reference on the backing, exactly once. Pages
    // left behind (offsets the survivor already had) are freed here.
    vm_object_free(backing);
}
