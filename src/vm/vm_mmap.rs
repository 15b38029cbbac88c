//! mmap-family syscall surface.
//!
//! Argument normalization and validation for memory-mapping system calls,
//! on top of the map layer. File descriptor resolution happens in the
//! caller; files reach this layer as an optional mapping hook.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::errno::Errno;
use crate::param::{page_aligned_p, round_page, Vaddr, PAGE_MASK, USER_MMAP_BASE};
use crate::vm::vm_map::{MapInsertFlags, VmMap, VmProt, VmSegment};
use crate::vm::vm_object::{vm_object_alloc, PagerKind, VmObject};

bitflags! {
    /// mmap flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        const SHARED = 0x0001;
        const PRIVATE = 0x0002;
        const FIXED = 0x0010;
        const ANON = 0x1000;
    }
}

/// Mapping hook implemented by files that support mmap.
pub trait MmapFile {
    /// Produce the object backing `[pos, pos + len)` of the file.
    fn mmap_object(&self, pos: u64, len: u64, prot: VmProt) -> Result<Arc<VmObject>, Errno>;
}

/// Map `len` bytes at (or near) `addr` into `map`.
///
/// Returns the address of the new mapping. A zero `addr` leaves placement
/// to the kernel; a non-zero hint must be page-aligned and inside the map's
/// window. Without `ANON` the mapping is served by `file`'s mapping hook.
pub fn sys_mmap(
    map: &Arc<VmMap>,
    addr: Vaddr,
    len: u64,
    prot: VmProt,
    flags: MmapFlags,
    file: Option<&dyn MmapFile>,
    pos: u64,
) -> Result<Vaddr, Errno> {
    // A mapping cannot be shared and private at the same time.
    if flags.contains(MmapFlags::SHARED | MmapFlags::PRIVATE) {
        return Err(Errno::Inval);
    }
    if len == 0 {
        return Err(Errno::Inval);
    }

    // Align the file position and fold the discarded low bits into the
    // length.
    let pageoff = pos & PAGE_MASK;
    let pos = pos - pageoff;
    let newlen = round_page(len.checked_add(pageoff).ok_or(Errno::NoMem)?);
    if newlen < len {
        return Err(Errno::NoMem);
    }
    let len = newlen;

    let mut addr = addr;
    if flags.contains(MmapFlags::FIXED) {
        addr = addr.wrapping_sub(pageoff);
        if !page_aligned_p(addr) {
            return Err(Errno::Inval);
        }
        if !map.range_valid(addr, addr.checked_add(len).ok_or(Errno::NoMem)?) {
            return Err(Errno::Inval);
        }
    } else if addr != 0 {
        // An explicit hint must itself name a usable range.
        if !page_aligned_p(addr) {
            return Err(Errno::Inval);
        }
        if !map.range_valid(addr, addr.checked_add(len).ok_or(Errno::NoMem)?) {
            return Err(Errno::Inval);
        }
    } else {
        addr = USER_MMAP_BASE;
    }

    let object = if flags.contains(MmapFlags::ANON) {
        vm_object_alloc(PagerKind::Anonymous)
    } else {
        let file = file.ok_or(Errno::NoDev)?;
        file.mmap_object(pos, len, prot)?
    };

    let seg = VmSegment::new(Some(object), addr, addr + len, prot);
    let insert_flags = if flags.contains(MmapFlags::FIXED) {
        MapInsertFlags::FIXED
    } else {
        MapInsertFlags::empty()
    };
    let at = map.insert(seg, insert_flags)?;

    log::debug!("mmap: {:#x} len {:#x} prot {:?} -> {:#x}", addr, len, prot, at);
    Ok(at)
}

/// Unmap the segment spanning exactly `[addr, addr + len)`.
pub fn sys_munmap(map: &Arc<VmMap>, addr: Vaddr, len: u64) -> Result<(), Errno> {
    if !page_aligned_p(addr) || len == 0 {
        return Err(Errno::Inval);
    }
    let len = round_page(len);
    if !map.range_valid(addr, addr.checked_add(len).ok_or(Errno::Inval)?) {
        return Err(Errno::Inval);
    }
    map.remove(addr, len)
}

/// Change the protection of `[addr, addr + len)`.
pub fn sys_mprotect(map: &Arc<VmMap>, addr: Vaddr, len: u64, prot: VmProt) -> Result<(), Errno> {
    if !page_aligned_p(addr) || len == 0 {
        return Err(Errno::Inval);
    }
    let len = round_page(len);
    let end = addr.checked_add(len).ok_or(Errno::Inval)?;
    map.protect(addr, end, prot)
}
