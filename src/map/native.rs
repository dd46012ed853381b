//! Native Remapping
//!
//! Linux can move and resize a live mapping in one call with `mremap`, for anonymous and
//! file-backed mappings alike.



use std::os::fd::{AsRawFd, BorrowedFd};

use log::debug;
use nix::sys::mman::{mremap, MRemapFlags};

use super::{
    resize_file_len,
    unix::{self, Region},
    Failure, Remap, RemapResult,
};
use crate::{Context, Error, Op};



pub(crate) struct Native;

impl Remap for Native {
    fn resize_anonymous(region: Region, new_len: usize) -> RemapResult {
        if !region.is_mapped() {
            return unix::map_anonymous(new_len).map_err(|e| Failure::kept(e, region));
        }

        remap(region, new_len, Context::default())
    }

    fn resize_file(
        region: Region,
        fd: BorrowedFd<'_>,
        new_len: usize,
        populate: bool,
    ) -> RemapResult {
        // From here on the file has its new length. If the remap below fails, the mapping keeps
        // its old length and the two disagree until the caller resizes again.
        resize_file_len(&region, fd, new_len)?;

        if !region.is_mapped() {
            return unix::map_file(fd, new_len, populate).map_err(|e| Failure::kept(e, region));
        }

        remap(region, new_len, Context::default().with_fd(fd.as_raw_fd()))
    }
}

fn remap(region: Region, new_len: usize, context: Context) -> RemapResult {
    // `mremap` cannot produce an empty mapping, so shrinking to nothing is a plain release.
    if new_len == 0 {
        unix::unmap(&region).map_err(|e| Failure::kept(e, region))?;
        return Ok(Region::empty());
    }

    let ptr = unsafe {
        mremap(region.ptr.cast(), region.reserved, new_len, MRemapFlags::MREMAP_MAYMOVE, None)
    }
    .map_err(|errno| {
        let context = context.with_len(region.reserved).with_new_len(new_len);
        Failure::kept(Error::platform(Op::Mremap, errno, context), region)
    })?;

    let ptr = ptr.cast();
    if ptr != region.ptr {
        debug!("mremap moved {} byte mapping from {:p} to {:p}", new_len, region.ptr, ptr);
    }

    Ok(Region {
        ptr,
        len: new_len,
        reserved: new_len,
    })
}
