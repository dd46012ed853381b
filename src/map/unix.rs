//! Unix Implementation



use std::{
    ffi::c_void,
    num::NonZeroUsize,
    os::fd::{AsRawFd, BorrowedFd},
    ptr::NonNull,
};

use log::warn;
use nix::{
    errno::Errno,
    sys::mman::{madvise, mmap, mmap_anonymous, msync, munmap, MapFlags, MmapAdvise, MsFlags, ProtFlags},
    unistd::{sysconf, SysconfVar},
};

use super::{Advice, SyncMode};
use crate::{Context, Error, Op, Result};



/// A raw memory mapping.
///
/// `len` is the logical length handed out to callers. `reserved` is how many bytes are actually
/// mapped starting at `ptr`, and is what gets released. The two only differ after an emulated
/// anonymous shrink. A region with `reserved == 0` holds no mapping at all.
///
/// # Safety
/// - It does NOT release itself when dropped. The owning `Mapping` does that.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Region {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub reserved: usize,
}

impl Region {
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            reserved: 0,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.reserved != 0
    }

    /// The end of the reservation, rounded up to the page the kernel actually handed out.
    pub fn mapped_end(&self) -> usize {
        round_up(self.reserved, page_size())
    }

    fn raw(&self) -> NonNull<c_void> {
        self.ptr.cast()
    }
}

pub(crate) fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        other => {
            warn!("sysconf(PAGE_SIZE) gave {:?}, assuming 4096 byte pages", other);
            4096
        }
    }
}

pub(crate) fn round_up(len: usize, page: usize) -> usize {
    match len % page {
        0 => len,
        rem => len + (page - rem),
    }
}

#[cfg(target_os = "linux")]
fn populate_flags(populate: bool) -> MapFlags {
    if populate {
        MapFlags::MAP_POPULATE
    } else {
        MapFlags::empty()
    }
}

// Nothing to ask for; the mapping is simply faulted in lazily.
#[cfg(not(target_os = "linux"))]
fn populate_flags(_populate: bool) -> MapFlags {
    MapFlags::empty()
}

fn read_write() -> ProtFlags {
    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
}

/// Map `len` bytes of the file behind `fd`, shared with the file.
pub(crate) fn map_file(fd: BorrowedFd<'_>, len: usize, populate: bool) -> Result<Region> {
    let Some(length) = NonZeroUsize::new(len) else {
        return Ok(Region::empty());
    };

    let flags = MapFlags::MAP_SHARED | populate_flags(populate);
    let ptr = unsafe { mmap(None, length, read_write(), flags, fd, 0) }.map_err(|errno| {
        Error::platform(
            Op::Mmap,
            errno,
            Context::default().with_fd(fd.as_raw_fd()).with_len(len),
        )
    })?;

    Ok(Region {
        ptr: ptr.cast(),
        len,
        reserved: len,
    })
}

/// Map `len` bytes of private, zeroed memory wherever the kernel likes.
pub(crate) fn map_anonymous(len: usize) -> Result<Region> {
    let Some(length) = NonZeroUsize::new(len) else {
        return Ok(Region::empty());
    };

    let ptr = unsafe {
        mmap_anonymous(None, length, read_write(), MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS)
    }
    .map_err(|errno| Error::platform(Op::Mmap, errno, Context::default().with_len(len)))?;

    Ok(Region {
        ptr: ptr.cast(),
        len,
        reserved: len,
    })
}

/// Map `len` bytes of private, zeroed memory at exactly `addr`.
///
/// Returns `Ok(None)` if that address range is already taken. Existing mappings are never
/// replaced: the address is only a hint, and a mapping that lands anywhere else is released
/// again.
pub(crate) fn map_anonymous_at(addr: NonNull<u8>, len: usize) -> Result<Option<NonNull<u8>>> {
    let Some(length) = NonZeroUsize::new(len) else {
        return Ok(Some(addr));
    };
    let context = Context::default().with_len(len);

    let hint = NonZeroUsize::new(addr.as_ptr() as usize);
    let ptr = unsafe {
        mmap_anonymous(hint, length, read_write(), MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS)
    }
    .map_err(|errno| Error::platform(Op::Mmap, errno, context))?;

    if ptr.cast::<u8>() == addr {
        return Ok(Some(addr));
    }

    unsafe { munmap(ptr, len) }.map_err(|errno| Error::platform(Op::Munmap, errno, context))?;

    Ok(None)
}

/// Release the whole reservation. A region that maps nothing is left alone.
pub(crate) fn unmap(region: &Region) -> Result<()> {
    if !region.is_mapped() {
        return Ok(());
    }

    unsafe { munmap(region.raw(), region.reserved) }.map_err(|errno| {
        Error::platform(Op::Munmap, errno, Context::default().with_len(region.reserved))
    })
}

pub(crate) fn flush(region: &Region, mode: SyncMode) -> Result<()> {
    if region.len == 0 {
        return Ok(());
    }

    let flags = match mode {
        SyncMode::Async => MsFlags::MS_ASYNC | MsFlags::MS_INVALIDATE,
        SyncMode::Sync => MsFlags::MS_SYNC | MsFlags::MS_INVALIDATE,
    };

    unsafe { msync(region.raw(), region.len, flags) }
        .map_err(|errno| Error::platform(Op::Msync, errno, Context::default().with_len(region.len)))
}

/// Hint at how `[offset, offset + len)` of the region will be accessed.
///
/// The start is rounded down to a page boundary, since the kernel only takes advice for whole
/// pages.
pub(crate) fn advise(region: &Region, offset: usize, len: usize, advice: Advice) -> Result<()> {
    let context = Context::default().with_len(region.len);

    let in_bounds = offset
        .checked_add(len)
        .map_or(false, |end| end <= region.len);
    if !in_bounds {
        return Err(Error::platform(Op::Madvise, Errno::ENOMEM, context));
    }
    if len == 0 {
        return Ok(());
    }

    let aligned = offset - (offset % page_size());
    let start = unsafe { NonNull::new_unchecked(region.ptr.as_ptr().add(aligned)) };
    let advice = match advice {
        Advice::Normal => MmapAdvise::MADV_NORMAL,
        Advice::Sequential => MmapAdvise::MADV_SEQUENTIAL,
    };

    unsafe { madvise(start.cast(), len + (offset - aligned), advice) }
        .map_err(|errno| Error::platform(Op::Madvise, errno, context))
}
