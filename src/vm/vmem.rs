//! Boundary-tag virtual-address arena.
//!
//! A `Vmem` hands out quantum-aligned address ranges from a set of disjoint
//! spans seeded at boot. Allocation is first-fit over an ordered segment
//! list; freeing coalesces with free neighbors inside the same span.

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use spin::Mutex;

use crate::errno::Errno;

/// Maximum number of disjoint spans a single arena can be seeded with.
/// Spans are added at boot only and never removed.
pub const VMEM_MAX_SPANS: usize = 8;

bitflags! {
    /// Allocation policy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmemFlags: u32 {
        /// Fail instead of growing the arena when no range fits.
        const NOGROW = 0x01;
    }
}

/// One boundary-tag segment: a run of addresses that is entirely free or
/// entirely allocated.
#[derive(Debug, Clone, Copy)]
struct BtSeg {
    size: u64,
    free: bool,
}

struct VmemInner {
    /// Seeded spans, ordered by base.
    spans: heapless::Vec<(u64, u64), VMEM_MAX_SPANS>,
    /// Segments keyed by base address. Invariant: segments exactly tile
    /// every span, and no two free neighbors share a span.
    segs: BTreeMap<u64, BtSeg>,
}

/// Boundary-tag arena over a numeric address space.
pub struct Vmem {
    name: &'static str,
    quantum: u64,
    inner: Mutex<VmemInner>,
}

impl Vmem {
    /// Create an empty arena. `quantum` is the allocation granularity and
    /// must be a power of two.
    pub fn new(name: &'static str, quantum: usize) -> Self {
        assert!(quantum.is_power_of_two());
        Self {
            name,
            quantum: quantum as u64,
            inner: Mutex::new(VmemInner {
                spans: heapless::Vec::new(),
                segs: BTreeMap::new(),
            }),
        }
    }

    /// Seed the arena with the span `[start, start + size)`.
    ///
    /// Spans must be quantum-aligned and disjoint from all existing spans.
    pub fn add(&self, start: u64, size: u64) {
        assert!(start % self.quantum == 0 && size % self.quantum == 0);
        assert!(size > 0);

        let mut inner = self.inner.lock();
        for &(s, e) in inner.spans.iter() {
            assert!(start + size <= s || start >= e, "overlapping span");
        }
        inner
            .spans
            .push((start, start + size))
            .expect("too many arena spans");
        inner.segs.insert(start, BtSeg { size, free: true });
        log::debug!("{}: added span {:#x}-{:#x}", self.name, start, start + size);
    }

    /// Allocate `size` addresses, first fit. On success the chosen base is
    /// stored in `*addrp`.
    pub fn alloc(&self, size: u64, addrp: &mut u64, _flags: VmemFlags) -> Result<(), Errno> {
        assert!(size > 0 && size % self.quantum == 0);

        let mut inner = self.inner.lock();
        let found = inner
            .segs
            .iter()
            .find(|(_, seg)| seg.free && seg.size >= size)
            .map(|(&base, &seg)| (base, seg));

        let (base, seg) = found.ok_or(Errno::NoMem)?;

        inner.segs.insert(base, BtSeg { size, free: false });
        if seg.size > size {
            inner.segs.insert(
                base + size,
                BtSeg {
                    size: seg.size - size,
                    free: true,
                },
            );
        }
        *addrp = base;
        Ok(())
    }

    /// Return `[addr, addr + size)` to the arena. The range must match a
    /// previous allocation exactly.
    pub fn free(&self, addr: u64, size: u64) {
        let mut inner = self.inner.lock();

        let seg = inner.segs.get(&addr).copied().expect("freeing unknown range");
        assert!(!seg.free, "double free of arena range");
        assert!(seg.size == size, "partial free of arena range");

        let (span_start, span_end) = inner
            .spans
            .iter()
            .copied()
            .find(|&(s, e)| addr >= s && addr < e)
            .expect("range outside every span");

        let mut base = addr;
        let mut merged = size;

        // Coalesce with the previous segment when it is free and adjacent
        // within the same span.
        if let Some((&pbase, &pseg)) = inner.segs.range(..addr).next_back() {
            if pseg.free && pbase + pseg.size == addr && pbase >= span_start {
                inner.segs.remove(&pbase);
                base = pbase;
                merged += pseg.size;
            }
        }

        // Coalesce with the next segment likewise.
        if let Some((&nbase, &nseg)) = inner.segs.range(addr + size..).next() {
            if nseg.free && nbase == addr + size && nbase < span_end {
                inner.segs.remove(&nbase);
                merged += nseg.size;
            }
        }

        inner.segs.insert(base, BtSeg { size: merged, free: true });
    }

    /// Total free addresses currently in the arena.
    pub fn free_size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.segs.values().filter(|s| s.free).map(|s| s.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Vmem {
        let vm = Vmem::new("test", 0x1000);
        vm.add(0x10000, 0x10000);
        vm
    }

    #[test]
    fn test_alloc_free_reuse() {
        let vm = arena();
        let mut a = 0;
        let mut b = 0;

        vm.alloc(0x4000, &mut a, VmemFlags::NOGROW).unwrap();
        assert_eq!(a, 0x10000);
        vm.alloc(0x1000, &mut b, VmemFlags::NOGROW).unwrap();
        assert_eq!(b, 0x14000);

        vm.free(a, 0x4000);
        let mut c = 0;
        vm.alloc(0x4000, &mut c, VmemFlags::NOGROW).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let vm = arena();
        let mut a = 0;
        assert_eq!(vm.alloc(0x20000, &mut a, VmemFlags::NOGROW), Err(Errno::NoMem));
        vm.alloc(0x10000, &mut a, VmemFlags::NOGROW).unwrap();
        assert_eq!(vm.alloc(0x1000, &mut a, VmemFlags::NOGROW), Err(Errno::NoMem));
    }

    #[test]
    fn test_coalescing() {
        let vm = arena();
        let mut a = 0;
        let mut b = 0;
        let mut c = 0;
        vm.alloc(0x2000, &mut a, VmemFlags::NOGROW).unwrap();
        vm.alloc(0x2000, &mut b, VmemFlags::NOGROW).unwrap();
        vm.alloc(0x2000, &mut c, VmemFlags::NOGROW).unwrap();

        // Free out of order; the pieces must merge back into one extent.
        vm.free(a, 0x2000);
        vm.free(c, 0x2000);
        vm.free(b, 0x2000);

        let mut d = 0;
        vm.alloc(0x10000, &mut d, VmemFlags::NOGROW).unwrap();
        assert_eq!(d, 0x10000);
    }

    #[test]
    fn test_multiple_spans() {
        let vm = Vmem::new("spans", 0x1000);
        vm.add(0x10000, 0x2000);
        vm.add(0x40000, 0x2000);

        let mut a = 0;
        let mut b = 0;
        vm.alloc(0x2000, &mut a, VmemFlags::NOGROW).unwrap();
        vm.alloc(0x2000, &mut b, VmemFlags::NOGROW).unwrap();
        assert_eq!(a, 0x10000);
        assert_eq!(b, 0x40000);

        // Spans never merge, even when both ends are free.
        vm.free(a, 0x2000);
        vm.free(b, 0x2000);
        let mut c = 0;
        assert_eq!(vm.alloc(0x4000, &mut c, VmemFlags::NOGROW), Err(Errno::NoMem));
    }
}
