//! Pagers - per-object-kind strategies for producing a page on fault.
//!
//! A fault is resolved with the faulting object's write lock held across
//! lookup and insert, so one (object, offset) pair can never resolve to two
//! different pages concurrently.

use alloc::sync::Arc;

use crate::vm::pmap::{pmap_copy_page, pmap_zero_page};
use crate::vm::vm_kern::kick_swapper;
use crate::vm::vm_object::{PagerKind, VmObject, VmObjectInner};
use crate::vm::vm_page::{self, PageFlags, VmPage};

trait Pager: Sync {
    /// Produce the page for `offset` in `obj`, whose write-locked state is
    /// `inner`. Returns `None` when the object cannot supply a page.
    fn fault(&self, obj: &Arc<VmObject>, inner: &mut VmObjectInner, offset: u64)
        -> Option<Arc<VmPage>>;
}

struct DummyPager;
struct AnonPager;
struct ShadowPager;

/// Process-wide pager table, indexed by [`PagerKind`].
static PAGERS: [&(dyn Pager + Sync); 3] = [&DummyPager, &AnonPager, &ShadowPager];

fn pager_for(kind: PagerKind) -> &'static dyn Pager {
    match kind {
        PagerKind::Dummy => PAGERS[0],
        PagerKind::Anonymous => PAGERS[1],
        PagerKind::Shadow => PAGERS[2],
    }
}

impl Pager for DummyPager {
    fn fault(&self, _obj: &Arc<VmObject>, _inner: &mut VmObjectInner, _offset: u64)
        -> Option<Arc<VmPage>> {
        None
    }
}

impl Pager for AnonPager {
    fn fault(&self, obj: &Arc<VmObject>, inner: &mut VmObjectInner, offset: u64)
        -> Option<Arc<VmPage>> {
        let new_pg = vm_page::vm_page_alloc(1).unwrap_or_else(|| kick_swapper());
        pmap_zero_page(&new_pg);
        obj.add_page_nolock(inner, offset, &new_pg);
        vm_page::vm_page_release(&new_pg);
        log::trace!("anon fault: zero page at offset {:#x}", offset);
        Some(new_pg)
    }
}

impl Pager for ShadowPager {
    fn fault(&self, obj: &Arc<VmObject>, inner: &mut VmObjectInner, offset: u64)
        -> Option<Arc<VmPage>> {
        // Walk the backing chain toward the root, remembering the root so a
        // full miss can be delegated to its pager.
        let mut found: Option<Arc<VmPage>> = None;
        let mut root_kind = PagerKind::Dummy;
        let mut it = inner.shadow.clone().expect("shadow object without backing");

        loop {
            let cinner = it.inner.read();
            if let Some(pg) = cinner.pages.get(&offset) {
                found = Some(pg.clone());
                break;
            }
            let next = cinner.shadow.clone();
            root_kind = cinner.pager;
            drop(cinner);
            match next {
                Some(n) => it = n,
                None => break,
            }
        }

        match found {
            Some(src) => {
                // Copy the ancestor's page; the private copy inherits its
                // flags with the read-only marker cleared.
                let new_pg = vm_page::vm_page_alloc(1).unwrap_or_else(|| kick_swapper());
                pmap_copy_page(&src, &new_pg);
                new_pg.set_flags(src.flags());
                new_pg.clear_flags(PageFlags::READONLY);
                obj.add_page_nolock(inner, offset, &new_pg);
                vm_page::vm_page_release(&new_pg);
                log::trace!("shadow fault: copied offset {:#x}", offset);
                Some(new_pg)
            }
            None => {
                // No ancestor holds the page: the chain root supplies it,
                // inserted into the faulting object.
                pager_for(root_kind).fault(obj, inner, offset)
            }
        }
    }
}

/// Resolve a fault against `obj` at `offset`, serializing on the object
/// lock. Returns the resident or freshly produced page.
pub fn vm_pager_fault(obj: &Arc<VmObject>, offset: u64) -> Option<Arc<VmPage>> {
    let mut inner = obj.inner.write();

    // A concurrent fault may have resolved this offset while we waited.
    if let Some(pg) = inner.pages.get(&offset) {
        return Some(pg.clone());
    }

    let kind = inner.pager;
    pager_for(kind).fault(obj, &mut inner, offset)
}
