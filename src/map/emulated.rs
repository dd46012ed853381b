//! Emulated Remapping
//!
//! For platforms without `mremap`. Anonymous mappings first try to grow in place by mapping the
//! address range right after them, and only copy into a fresh region when that range is taken.
//! They never shrink physically: the reservation is kept and reused by later grows. File-backed
//! mappings are released and mapped again over the resized file, so they always come back as a
//! new region.



use std::{os::fd::BorrowedFd, ptr::NonNull};

use log::{debug, warn};

use super::{
    resize_file_len,
    unix::{self, Region},
    Failure, Remap, RemapResult,
};
use crate::Result;



pub(crate) struct Emulated;

impl Remap for Emulated {
    fn resize_anonymous(region: Region, new_len: usize) -> RemapResult {
        // Shrinks, and grows that still fit the pages we hold, only move the logical end.
        if new_len <= region.mapped_end() {
            return Ok(Region {
                len: new_len,
                reserved: region.reserved.max(new_len),
                ..region
            });
        }

        if !region.is_mapped() {
            return unix::map_anonymous(new_len).map_err(|e| Failure::kept(e, region));
        }

        match extend_in_place(&region, new_len) {
            Ok(Some(extended)) => return Ok(extended),
            Ok(None) => debug!("no room after {:p}, relocating {} bytes", region.ptr, new_len),
            Err(e) => debug!("extending {:p} failed ({}), relocating {} bytes", region.ptr, e, new_len),
        }

        relocate(region, new_len, unix::unmap)
    }

    fn resize_file(
        region: Region,
        fd: BorrowedFd<'_>,
        new_len: usize,
        populate: bool,
    ) -> RemapResult {
        resize_file_len(&region, fd, new_len)?;

        unix::unmap(&region).map_err(|e| Failure::kept(e, region))?;

        // The old mapping is gone; if this fails the caller is left with none at all.
        unix::map_file(fd, new_len, populate).map_err(Failure::lost)
    }
}

/// Map the pages right after `region` so that it covers `new_len` bytes without moving.
fn extend_in_place(region: &Region, new_len: usize) -> Result<Option<Region>> {
    let end = region.mapped_end();
    let Some(tail) = NonNull::new((region.ptr.as_ptr() as usize + end) as *mut u8) else {
        return Ok(None);
    };

    let placed = unix::map_anonymous_at(tail, new_len - end)?;

    Ok(placed.map(|_| Region {
        ptr: region.ptr,
        len: new_len,
        reserved: new_len,
    }))
}

/// Copy `region` into a fresh mapping of `new_len` bytes, then `release` the old one.
///
/// A failed release leaks the old region. The new one already holds the data, so the resize
/// still succeeds.
pub(crate) fn relocate<F>(region: Region, new_len: usize, release: F) -> RemapResult
where
    F: FnOnce(&Region) -> Result<()>,
{
    let fresh = unix::map_anonymous(new_len).map_err(|e| Failure::kept(e, region))?;

    let copied = region.len.min(new_len);
    unsafe { std::ptr::copy_nonoverlapping(region.ptr.as_ptr(), fresh.ptr.as_ptr(), copied) };

    if let Err(e) = release(&region) {
        warn!(
            "leaking {} byte region at {:p} after relocating it to {:p}: {}",
            region.reserved, region.ptr, fresh.ptr, e,
        );
    }

    Ok(fresh)
}



#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::AsFd;

    use nix::errno::Errno;

    use crate::{
        fd::{file_len, set_file_len},
        Context, Error, Op,
    };

    fn fill(region: &Region, byte: u8) {
        unsafe { std::ptr::write_bytes(region.ptr.as_ptr(), byte, region.len) };
    }

    fn bytes(region: &Region) -> &[u8] {
        unsafe { std::slice::from_raw_parts(region.ptr.as_ptr(), region.len) }
    }

    #[test]
    fn anonymous_grow_keeps_contents() {
        let region = unix::map_anonymous(4096).unwrap();
        fill(&region, 0xAA);

        let region = Emulated::resize_anonymous(region, 8192).unwrap();
        assert_eq!(region.len, 8192);
        assert!(bytes(&region)[..4096].iter().all(|b| *b == 0xAA));

        unix::unmap(&region).unwrap();
    }

    #[test]
    fn anonymous_grow_relocates_when_blocked() {
        let page = unix::page_size();
        let region = unix::map_anonymous(page).unwrap();
        fill(&region, 0xAA);

        // Park something right after the region, if the kernel lets us.
        let next = NonNull::new((region.ptr.as_ptr() as usize + page) as *mut u8).unwrap();
        let blocker = unix::map_anonymous_at(next, page).unwrap();

        let grown = Emulated::resize_anonymous(region, 4 * page).unwrap();
        assert!(bytes(&grown)[..page].iter().all(|b| *b == 0xAA));
        assert!(bytes(&grown)[page..].iter().all(|b| *b == 0));

        if let Some(blocker) = blocker {
            assert_ne!(grown.ptr, region.ptr);
            assert_eq!(grown.reserved, 4 * page);
            let blocker = Region { ptr: blocker, len: page, reserved: page };
            unix::unmap(&blocker).unwrap();
        }

        unix::unmap(&grown).unwrap();
    }

    #[test]
    fn anonymous_shrink_does_not_reclaim() {
        let region = unix::map_anonymous(8192).unwrap();
        for (i, b) in unsafe { std::slice::from_raw_parts_mut(region.ptr.as_ptr(), 8192) }
            .iter_mut()
            .enumerate()
        {
            *b = (i % 251) as u8;
        }

        let shrunk = Emulated::resize_anonymous(region, 4096).unwrap();
        assert_eq!(shrunk.ptr, region.ptr);
        assert_eq!(shrunk.len, 4096);
        assert_eq!(shrunk.reserved, 8192);

        // Growing back within the reservation is free and leaves the bytes where they were.
        let grown = Emulated::resize_anonymous(shrunk, 8192).unwrap();
        assert_eq!(grown.ptr, region.ptr);
        for (i, b) in bytes(&grown)[..4096].iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8);
        }

        unix::unmap(&grown).unwrap();
    }

    #[test]
    fn anonymous_shrink_to_nothing_keeps_reservation() {
        let region = unix::map_anonymous(4096).unwrap();

        let shrunk = Emulated::resize_anonymous(region, 0).unwrap();
        assert_eq!(shrunk.len, 0);
        assert!(shrunk.is_mapped());

        unix::unmap(&shrunk).unwrap();
    }

    #[test]
    fn anonymous_from_nothing() {
        let region = Emulated::resize_anonymous(Region::empty(), 100).unwrap();
        assert!(region.is_mapped());
        assert_eq!(region.len, 100);
        unix::unmap(&region).unwrap();
    }

    #[test]
    fn failed_release_leaks_old_region() {
        let region = unix::map_anonymous(4096).unwrap();
        fill(&region, 0x42);

        let fresh = relocate(region, 8192, |_| {
            Err(Error::platform(Op::Munmap, Errno::EINVAL, Context::default()))
        })
        .unwrap();

        assert_ne!(fresh.ptr, region.ptr);
        assert_eq!(fresh.len, 8192);
        assert!(bytes(&fresh)[..4096].iter().all(|b| *b == 0x42));
        // The old region was leaked, not released, so it is still readable.
        assert!(bytes(&region).iter().all(|b| *b == 0x42));

        unix::unmap(&region).unwrap();
        unix::unmap(&fresh).unwrap();
    }

    #[test]
    fn file_resize_remaps_over_resized_file() {
        let file = tempfile::tempfile().unwrap();

        let region = unix::map_file(file.as_fd(), 0, false).unwrap();
        let region = Emulated::resize_file(region, file.as_fd(), 1024, false).unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 1024);
        assert_eq!(region.len, 1024);
        fill(&region, 0x33);

        let region = Emulated::resize_file(region, file.as_fd(), 10_000, false).unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 10_000);
        assert!(bytes(&region)[..1024].iter().all(|b| *b == 0x33));
        assert!(bytes(&region)[1024..].iter().all(|b| *b == 0));

        let region = Emulated::resize_file(region, file.as_fd(), 512, false).unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 512);
        assert!(bytes(&region).iter().all(|b| *b == 0x33));

        unix::unmap(&region).unwrap();
    }

    #[test]
    fn file_resize_failure_before_release_keeps_mapping() {
        let file = tempfile::tempfile().unwrap();
        set_file_len(file.as_fd(), 4096).unwrap();
        let region = unix::map_file(file.as_fd(), 4096, false).unwrap();

        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let ro = std::fs::File::open(&path).unwrap();

        let failure = Emulated::resize_file(region, ro.as_fd(), 8192, false).unwrap_err();
        assert_eq!(failure.error.op(), Some(Op::Ftruncate));
        assert_eq!(failure.survivor, Some(region));

        unix::unmap(&region).unwrap();
    }

    #[test]
    fn file_recreate_failure_loses_mapping() {
        let file = tempfile::tempfile().unwrap();
        set_file_len(file.as_fd(), 4096).unwrap();
        let region = unix::map_file(file.as_fd(), 4096, false).unwrap();

        // Can be truncated, but not mapped shared for writing.
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let wo = std::fs::OpenOptions::new().write(true).open(&path).unwrap();

        let failure = Emulated::resize_file(region, wo.as_fd(), 8192, false).unwrap_err();
        assert_eq!(failure.error.op(), Some(Op::Mmap));
        assert_eq!(failure.survivor, None);
        assert_eq!(file_len(wo.as_fd()).unwrap(), 8192);
    }
}
