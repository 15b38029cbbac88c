//! VM maps - per-address-space segment sets.
//!
//! A map holds disjoint, start-ordered segments, each backed by one object
//! with uniform protection. The map lock serializes segment mutations and
//! gap searches; it is never held while object locks are taken.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::errno::Errno;
use crate::param::{page_aligned_p, Vaddr, USER_SPACE_BEGIN, USER_SPACE_END};
use crate::vm::pmap::{self, Pmap};
use crate::vm::vm_object::{vm_object_free, VmObject};

bitflags! {
    /// Memory protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl VmProt {
    /// No access permitted.
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Flags for [`VmMap::insert`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapInsertFlags: u32 {
        /// Place the segment exactly where it says; never relocate.
        const FIXED = 0x1;
    }
}

/// A contiguous mapping of one object with uniform protection.
#[derive(Debug)]
pub struct VmSegment {
    pub start: Vaddr,
    pub end: Vaddr,
    pub prot: VmProt,
    /// Base offset into the object of the first page of the segment.
    /// Nonzero only for segments produced by clipping.
    pub offset: u64,
    object: Option<Arc<VmObject>>,
}

impl VmSegment {
    /// Create a segment over `[start, end)`. Consumes one reference on the
    /// object, released again when the segment is dropped.
    pub fn new(object: Option<Arc<VmObject>>, start: Vaddr, end: Vaddr, prot: VmProt) -> Self {
        assert!(page_aligned_p(start) && page_aligned_p(end));
        assert!(start < end);
        Self {
            start,
            end,
            prot,
            offset: 0,
            object,
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// The backing object.
    pub fn object(&self) -> Option<Arc<VmObject>> {
        self.object.clone()
    }

    fn contains(&self, va: Vaddr) -> bool {
        va >= self.start && va < self.end
    }

    /// Split off and return the part above `at`. Both halves keep a
    /// reference to the object; the upper half's offset base is shifted.
    fn split(&mut self, at: Vaddr) -> VmSegment {
        assert!(page_aligned_p(at));
        assert!(at > self.start && at < self.end);

        if let Some(obj) = &self.object {
            obj.hold();
        }
        let upper = VmSegment {
            start: at,
            end: self.end,
            prot: self.prot,
            offset: self.offset + (at - self.start),
            object: self.object.clone(),
        };
        self.end = at;
        upper
    }
}

impl Drop for VmSegment {
    fn drop(&mut self) {
        if let Some(obj) = self.object.take() {
            vm_object_free(&obj);
        }
    }
}

/// Snapshot of a segment taken under the map lock, used by the fault path
/// after the lock is released.
#[derive(Debug, Clone)]
pub struct VmSegmentView {
    pub start: Vaddr,
    pub end: Vaddr,
    pub prot: VmProt,
    pub offset: u64,
    pub object: Option<Arc<VmObject>>,
}

/// An address space: bounds, segment set and physical map.
pub struct VmMap {
    min: Vaddr,
    max: Vaddr,
    entries: Mutex<BTreeMap<Vaddr, VmSegment>>,
    pmap: Arc<Pmap>,
}

impl VmMap {
    fn with_pmap(min: Vaddr, max: Vaddr, pmap: Arc<Pmap>) -> Arc<Self> {
        assert!(page_aligned_p(min) && page_aligned_p(max));
        assert!(min < max);
        Arc::new(Self {
            min,
            max,
            entries: Mutex::new(BTreeMap::new()),
            pmap,
        })
    }

    /// Create a user map over an explicit window with a fresh pmap.
    pub fn with_bounds(min: Vaddr, max: Vaddr) -> Arc<Self> {
        Self::with_pmap(min, max, pmap::pmap_new())
    }

    /// Lowest legal address.
    pub fn min(&self) -> Vaddr {
        self.min
    }

    /// One past the highest legal address.
    pub fn max(&self) -> Vaddr {
        self.max
    }

    /// This map's physical map.
    pub fn pmap(&self) -> &Arc<Pmap> {
        &self.pmap
    }

    /// Whether `va` lies inside the map's window.
    pub fn address_p(&self, va: Vaddr) -> bool {
        va >= self.min && va < self.max
    }

    /// Whether `[start, end)` is a well-formed range inside the window.
    pub fn range_valid(&self, start: Vaddr, end: Vaddr) -> bool {
        start <= end && start >= self.min && end <= self.max
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Find the segment containing `va`.
    pub fn find_segment(&self, va: Vaddr) -> Option<VmSegmentView> {
        let entries = self.entries.lock();
        let (_, seg) = entries.range(..=va).next_back()?;
        if !seg.contains(va) {
            return None;
        }
        Some(VmSegmentView {
            start: seg.start,
            end: seg.end,
            prot: seg.prot,
            offset: seg.offset,
            object: seg.object.clone(),
        })
    }

    /// Set `*hint` to the lowest address `>= *hint` where `length` bytes fit
    /// without overlapping any segment, entirely inside the window.
    pub fn findspace(&self, hint: &mut Vaddr, length: u64) -> Result<(), Errno> {
        assert!(page_aligned_p(*hint) && page_aligned_p(length));
        assert!(length > 0);

        let entries = self.entries.lock();
        *hint = self.gap_search(&entries, *hint, length)?;
        Ok(())
    }

    fn gap_search(
        &self,
        entries: &BTreeMap<Vaddr, VmSegment>,
        hint: Vaddr,
        length: u64,
    ) -> Result<Vaddr, Errno> {
        let mut start = hint.max(self.min);

        for seg in entries.values() {
            if seg.end <= start {
                continue;
            }
            let fits = start
                .checked_add(length)
                .map_or(false, |end| end <= seg.start);
            if fits {
                break;
            }
            start = start.max(seg.end);
        }

        let end = start.checked_add(length).ok_or(Errno::NoMem)?;
        if end > self.max {
            return Err(Errno::NoMem);
        }
        Ok(start)
    }

    /// Insert `seg`, relocating it via [`findspace`](Self::findspace) unless
    /// `FIXED` is given. Returns the address the segment landed at; the
    /// segment's object reference is consumed either way.
    pub fn insert(&self, mut seg: VmSegment, flags: MapInsertFlags) -> Result<Vaddr, Errno> {
        if flags.contains(MapInsertFlags::FIXED) {
            if !self.range_valid(seg.start, seg.end) {
                return Err(Errno::Inval);
            }
            let mut entries = self.entries.lock();
            if overlaps_locked(&entries, seg.start, seg.end) {
                return Err(Errno::Inval);
            }
            let start = seg.start;
            entries.insert(start, seg);
            return Ok(start);
        }

        // Relocate via the gap search, atomically with the insert.
        let length = seg.size();
        let mut entries = self.entries.lock();
        let addr = self.gap_search(&entries, seg.start, length)?;
        seg.start = addr;
        seg.end = addr + length;
        entries.insert(addr, seg);
        Ok(addr)
    }

    /// Remove the segment spanning exactly `[start, start + length)`.
    ///
    /// Partial ranges are refused; unmapped ranges are invalid.
    pub fn remove(&self, start: Vaddr, length: u64) -> Result<(), Errno> {
        assert!(page_aligned_p(start) && page_aligned_p(length));

        let seg = {
            let mut entries = self.entries.lock();
            let (&key, seg) = entries
                .range(..=start)
                .next_back()
                .ok_or(Errno::Inval)?;
            if !seg.contains(start) {
                return Err(Errno::Inval);
            }
            if seg.start != start || seg.end != start + length {
                return Err(Errno::NotSup);
            }
            entries.remove(&key).unwrap()
        };

        pmap::pmap_remove(&self.pmap, seg.start, seg.end);
        // Dropping the segment releases its object reference.
        drop(seg);
        Ok(())
    }

    /// Change protection of `[start, end)`, clipping segments at the range
    /// boundaries, and reflect the change in every current mapping.
    pub fn protect(&self, start: Vaddr, end: Vaddr, prot: VmProt) -> Result<(), Errno> {
        assert!(page_aligned_p(start) && page_aligned_p(end));
        if !self.range_valid(start, end) || start == end {
            return Err(Errno::Inval);
        }

        let mut entries = self.entries.lock();

        // Clip the segments straddling `start` and `end` so protection only
        // changes inside the range.
        for at in [start, end] {
            let upper = match entries.range_mut(..at).next_back() {
                Some((_, seg)) if seg.start < at && seg.end > at => Some(seg.split(at)),
                _ => None,
            };
            if let Some(upper) = upper {
                entries.insert(at, upper);
            }
        }

        for (_, seg) in entries.range_mut(start..end) {
            seg.prot = prot;
            pmap::pmap_protect(&self.pmap, seg.start, seg.end, prot);
        }
        Ok(())
    }

    /// Drop every segment, releasing object references and mappings.
    pub fn delete(&self) {
        let mut entries = self.entries.lock();
        let keys: Vec<Vaddr> = entries.keys().copied().collect();
        for key in keys {
            let seg = entries.remove(&key).unwrap();
            pmap::pmap_remove(&self.pmap, seg.start, seg.end);
            drop(seg);
        }
    }

    /// Log one line per segment.
    pub fn dump(&self) {
        let entries = self.entries.lock();
        log::debug!("vm_map {:#x}-{:#x}:", self.min, self.max);
        for seg in entries.values() {
            log::debug!(
                " * {:#010x}-{:#010x} prot={:?}",
                seg.start,
                seg.end,
                seg.prot
            );
        }
    }

    /// Build a fork-style copy of this address space.
    ///
    /// Writable segments are replaced on both sides by fresh shadows over
    /// the shared backing, whose current mappings are downgraded to
    /// read-only; other segments share their object by reference.
    pub fn clone_for_fork(self: &Arc<Self>) -> Arc<VmMap> {
        use crate::vm::vm_object::vm_object_make_shadow;

        let child = VmMap::with_bounds(self.min, self.max);
        let mut entries = self.entries.lock();
        let mut child_entries = child.entries.lock();

        for (&start, seg) in entries.iter_mut() {
            let child_seg = match seg.object.clone() {
                Some(backing) if seg.prot.contains(VmProt::WRITE) => {
                    let child_shadow = vm_object_make_shadow(&backing);
                    let parent_shadow = vm_object_make_shadow(&backing);

                    backing.set_readonly();

                    // The parent segment moves onto its shadow; its direct
                    // reference on the backing is released only after both
                    // shadows hold theirs.
                    seg.object = Some(parent_shadow);
                    vm_object_free(&backing);

                    let mut child_seg =
                        VmSegment::new(Some(child_shadow), seg.start, seg.end, seg.prot);
                    child_seg.offset = seg.offset;
                    child_seg
                }
                Some(shared) => {
                    shared.hold();
                    let mut child_seg =
                        VmSegment::new(Some(shared.clone()), seg.start, seg.end, seg.prot);
                    child_seg.offset = seg.offset;
                    child_seg
                }
                None => VmSegment::new(None, seg.start, seg.end, seg.prot),
            };
            child_entries.insert(start, child_seg);
        }
        drop(child_entries);
        child
    }
}

impl core::fmt::Debug for VmMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmMap")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("segments", &self.segment_count())
            .finish()
    }
}

fn overlaps_locked(entries: &BTreeMap<Vaddr, VmSegment>, start: Vaddr, end: Vaddr) -> bool {
    entries
        .values()
        .any(|seg| seg.start < end && start < seg.end)
}

// ============================================================================
// Global state
// ============================================================================

static KERNEL_MAP: spin::Once<Arc<VmMap>> = spin::Once::new();
static ACTIVE_USER_MAP: Mutex<Option<Arc<VmMap>>> = Mutex::new(None);

/// Initialize the map layer; creates the kernel map.
pub fn init() {
    use crate::param::{KERNEL_SPACE_BEGIN, KERNEL_SPACE_END};
    KERNEL_MAP.call_once(|| {
        VmMap::with_pmap(KERNEL_SPACE_BEGIN, KERNEL_SPACE_END, pmap::pmap_kernel())
    });
}

/// Create a user map over the default user window.
pub fn vm_map_new() -> Arc<VmMap> {
    VmMap::with_bounds(USER_SPACE_BEGIN, USER_SPACE_END)
}

/// The kernel map.
pub fn vm_map_kernel() -> Arc<VmMap> {
    KERNEL_MAP.get().expect("vm_map not initialized").clone()
}

/// The active user map, if one has been activated.
pub fn vm_map_user() -> Option<Arc<VmMap>> {
    ACTIVE_USER_MAP.lock().clone()
}

/// Make `map` the active user map and activate its pmap. Callers switching
/// maps temporarily must run with preemption disabled, since per-CPU state
/// tracks the active map.
pub fn vm_map_activate(map: &Arc<VmMap>) {
    pmap::pmap_activate(&map.pmap);
    *ACTIVE_USER_MAP.lock() = Some(map.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PAGE_SIZE;
    use crate::vm::test_support;
    use crate::vm::vm_object::{vm_object_alloc, PagerKind};

    const PS: u64 = PAGE_SIZE as u64;

    fn seg(start: Vaddr, end: Vaddr) -> VmSegment {
        VmSegment::new(None, start, end, VmProt::NONE)
    }

    #[test]
    fn test_range_checks() {
        test_support::boot();
        let map = VmMap::with_bounds(0x1000, 0x10000);
        assert!(map.address_p(0x1000));
        assert!(map.address_p(0xffff));
        assert!(!map.address_p(0x10000));
        assert!(map.range_valid(0x2000, 0x4000));
        assert!(!map.range_valid(0x4000, 0x2000));
        assert!(!map.range_valid(0x800, 0x2000));
    }

    #[test]
    fn test_insert_and_lookup() {
        test_support::boot();
        let map = VmMap::with_bounds(0x1000, 0x100000);

        map.insert(seg(0x2000, 0x4000), MapInsertFlags::FIXED).unwrap();
        let found = map.find_segment(0x2500).unwrap();
        assert_eq!((found.start, found.end), (0x2000, 0x4000));
        assert!(map.find_segment(0x5000).is_none());

        // Fixed overlap and out-of-window inserts are rejected.
        assert_eq!(
            map.insert(seg(0x3000, 0x5000), MapInsertFlags::FIXED),
            Err(Errno::Inval)
        );
        assert_eq!(
            map.insert(seg(0x1000, 0x200000), MapInsertFlags::FIXED),
            Err(Errno::Inval)
        );

        map.remove(0x2000, 0x2000).unwrap();
        assert!(map.find_segment(0x2500).is_none());
    }

    #[test]
    fn test_segments_stay_disjoint_and_sorted() {
        test_support::boot();
        let map = VmMap::with_bounds(0x1000, 0x100000);
        map.insert(seg(0x8000, 0xa000), MapInsertFlags::FIXED).unwrap();
        map.insert(seg(0x2000, 0x3000), MapInsertFlags::FIXED).unwrap();
        map.insert(seg(0x5000, 0x6000), MapInsertFlags::FIXED).unwrap();

        let entries = map.entries.lock();
        let mut prev_end = 0;
        for seg in entries.values() {
            assert!(seg.start >= prev_end);
            assert!(seg.start >= map.min && seg.end <= map.max);
            prev_end = seg.end;
        }
    }

    // Gap search over two big segments with a 5-page hole between them.
    #[test]
    fn test_findspace() {
        test_support::boot();
        let map = VmMap::with_bounds(0x0040_0000, 0x8000_0000);
        map.insert(seg(0x1000_0000, 0x3000_0000), MapInsertFlags::FIXED)
            .unwrap();
        map.insert(seg(0x3000_5000, 0x6000_0000), MapInsertFlags::FIXED)
            .unwrap();

        let mut t = 0x0040_0000;
        map.findspace(&mut t, PS).unwrap();
        assert_eq!(t, 0x0040_0000);

        t = 0x1000_0000;
        map.findspace(&mut t, PS).unwrap();
        assert_eq!(t, 0x3000_0000);

        t = 0x1000_0000 + 20 * PS;
        map.findspace(&mut t, PS).unwrap();
        assert_eq!(t, 0x3000_0000);

        t = 0x1000_0000;
        map.findspace(&mut t, 0x6000).unwrap();
        assert_eq!(t, 0x6000_0000);

        t = 0x1000_0000;
        map.findspace(&mut t, 0x5000).unwrap();
        assert_eq!(t, 0x3000_0000);

        // Fill the gap exactly.
        map.insert(seg(0x3000_0000, 0x3000_5000), MapInsertFlags::FIXED)
            .unwrap();

        t = 0x1000_0000;
        map.findspace(&mut t, 0x5000).unwrap();
        assert_eq!(t, 0x6000_0000);

        t = 0x6000_0000;
        map.findspace(&mut t, 0x6000).unwrap();
        assert_eq!(t, 0x6000_0000);

        t = 0;
        assert_eq!(map.findspace(&mut t, 0x4000_0000), Err(Errno::NoMem));
    }

    #[test]
    fn test_insert_relocates_without_fixed() {
        test_support::boot();
        let map = VmMap::with_bounds(0x0040_0000, 0x8000_0000);
        map.insert(seg(0x1000_0000, 0x1000_2000), MapInsertFlags::FIXED)
            .unwrap();

        // Hint collides with the existing segment; the insert slides up.
        let addr = map
            .insert(seg(0x1000_0000, 0x1000_1000), MapInsertFlags::empty())
            .unwrap();
        assert_eq!(addr, 0x1000_2000);
        let found = map.find_segment(addr).unwrap();
        assert_eq!(found.end, addr + PS);
    }

    #[test]
    fn test_remove_partial_unsupported() {
        test_support::boot();
        let map = VmMap::with_bounds(0x0040_0000, 0x8000_0000);
        map.insert(seg(0x2000_0000, 0x2000_5000), MapInsertFlags::FIXED)
            .unwrap();

        assert_eq!(map.remove(0x2000_0000, 0x2000), Err(Errno::NotSup));
        assert_eq!(map.remove(0x3000_0000, 0x1000), Err(Errno::Inval));
        map.remove(0x2000_0000, 0x5000).unwrap();
        assert_eq!(map.remove(0x2000_0000, 0x5000), Err(Errno::Inval));
    }

    #[test]
    fn test_delete_releases_objects() {
        test_support::boot();
        let map = VmMap::with_bounds(0x0040_0000, 0x8000_0000);
        let obj = vm_object_alloc(PagerKind::Anonymous);
        obj.hold();
        map.insert(
            VmSegment::new(Some(obj.clone()), 0x1000_0000, 0x1000_1000, VmProt::READ),
            MapInsertFlags::FIXED,
        )
        .unwrap();

        assert_eq!(obj.ref_count(), 2);
        map.delete();
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(map.segment_count(), 0);
        crate::vm::vm_object::vm_object_free(&obj);
    }

    #[test]
    fn test_protect_clips_segments() {
        test_support::boot();
        let map = VmMap::with_bounds(0x0040_0000, 0x8000_0000);
        let obj = vm_object_alloc(PagerKind::Anonymous);
        obj.hold();
        map.insert(
            VmSegment::new(Some(obj.clone()), 0x1000_0000, 0x1000_4000, VmProt::READ),
            MapInsertFlags::FIXED,
        )
        .unwrap();

        map.protect(0x1000_1000, 0x1000_2000, VmProt::READ | VmProt::WRITE)
            .unwrap();
        assert_eq!(map.segment_count(), 3);

        let low = map.find_segment(0x1000_0000).unwrap();
        let mid = map.find_segment(0x1000_1000).unwrap();
        let high = map.find_segment(0x1000_2000).unwrap();
        assert_eq!(low.prot, VmProt::READ);
        assert_eq!(mid.prot, VmProt::READ | VmProt::WRITE);
        assert_eq!(high.prot, VmProt::READ);

        // Clipped pieces keep addressing the same object pages.
        assert_eq!(mid.offset, 0x1000);
        assert_eq!(high.offset, 0x2000);
        assert_eq!(obj.ref_count(), 4); // ours + three segments

        map.delete();
        assert_eq!(obj.ref_count(), 1);
        crate::vm::vm_object::vm_object_free(&obj);
    }
}
