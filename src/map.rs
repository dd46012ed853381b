//! Mapping



#[cfg_attr(target_os = "linux", allow(dead_code))]
mod emulated;
#[cfg(target_os = "linux")]
mod native;
mod unix;

use std::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd},
};

use log::{debug, trace, warn};

use crate::{fd, Error, Result};

use unix::Region;



/// The resize strategy for the platform this crate is built for.
#[cfg(target_os = "linux")]
pub(crate) type Platform = native::Native;
#[cfg(not(target_os = "linux"))]
pub(crate) type Platform = emulated::Emulated;

/// How a platform resizes a live region.
///
/// Implementations take the old region by value and either return the region to use from now
/// on, or a [`Failure`] saying whether the old region survived.
pub(crate) trait Remap {
    fn resize_anonymous(region: Region, new_len: usize) -> RemapResult;

    /// Resize the file behind `fd` and the region mapping it to `new_len` bytes.
    fn resize_file(region: Region, fd: BorrowedFd<'_>, new_len: usize, populate: bool)
        -> RemapResult;
}

pub(crate) type RemapResult = std::result::Result<Region, Failure>;

#[derive(Debug)]
pub(crate) struct Failure {
    pub error: Error,
    /// The region that is still mapped, if any.
    pub survivor: Option<Region>,
}

impl Failure {
    pub fn kept(error: Error, region: Region) -> Self {
        Self {
            error,
            survivor: Some(region),
        }
    }

    pub fn lost(error: Error) -> Self {
        Self {
            error,
            survivor: None,
        }
    }
}

/// First half of every file-backed resize: bring the file to `new_len` bytes.
///
/// The region is untouched, so on failure it survives.
pub(crate) fn resize_file_len(
    region: &Region,
    fd: BorrowedFd<'_>,
    new_len: usize,
) -> std::result::Result<(), Failure> {
    let old_len = fd::file_len(fd).map_err(|e| Failure::kept(e, *region))?;
    if old_len != region.len as u64 {
        warn!(
            "file behind fd {} is {} bytes but its mapping is {} bytes",
            fd.as_raw_fd(),
            old_len,
            region.len,
        );
    }

    fd::set_file_len(fd, new_len as u64).map_err(|e| Failure::kept(e, *region))
}



/// How [`Mapping::sync`] waits on the flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Start writing dirty pages back and return without waiting.
    #[default]
    Async,
    /// Return only once dirty pages have been written back.
    Sync,
}

/// Expected access pattern for a range of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
}

/// What a mapping is backed by.
#[derive(Clone, Copy, Debug)]
pub enum Backing<'fd> {
    /// Private, zeroed memory. Contents are lost on release.
    Anonymous,
    /// A borrowed file descriptor, whose length always matches the mapping's.
    File(BorrowedFd<'fd>),
}



/// Options for creating a [`Mapping`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MapCfg {
    populate: bool,
    sync_mode: SyncMode,
}

impl MapCfg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-fault the whole mapping when it is created (Linux only; ignored elsewhere).
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// The flush mode used by [`Mapping::sync`].
    pub fn sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Map the whole file behind `file`, shared with the file.
    ///
    /// The descriptor must be open for reading and writing. It is borrowed for as long as the
    /// mapping lives, and never closed by it.
    pub fn map_file<F: AsFd>(self, file: &F) -> Result<Mapping<'_>> {
        let fd = file.as_fd();
        let len = fd::mappable_len(fd)?;
        let region = unix::map_file(fd, len, self.populate)?;

        debug!("mapped fd {} ({} bytes) at {:p}", fd.as_raw_fd(), len, region.ptr);

        Ok(Mapping {
            region,
            backing: Backing::File(fd),
            cfg: self,
        })
    }

    /// Map `len` bytes of private, zeroed memory.
    pub fn map_anonymous(self, len: usize) -> Result<Mapping<'static>> {
        let region = unix::map_anonymous(len)?;

        debug!("mapped {} anonymous bytes at {:p}", len, region.ptr);

        Ok(Mapping {
            region,
            backing: Backing::Anonymous,
            cfg: self,
        })
    }
}



/// A live memory mapping.
///
/// Dereferences to the mapped bytes. Dropping it releases the mapping, ignoring failures; use
/// [`Mapping::destroy`] to observe them.
///
/// There is no internal locking. Every reference into the mapping borrows the handle, so the
/// borrow checker already keeps them from outliving a [`Mapping::resize`] or
/// [`Mapping::destroy`]. Raw pointers from [`Mapping::as_ptr`] get no such protection.
pub struct Mapping<'fd> {
    region: Region,
    backing: Backing<'fd>,
    cfg: MapCfg,
}

// SAFETY: The handle owns its region exclusively, and shared access only ever hands out `&[u8]`.
unsafe impl Send for Mapping<'_> {}
unsafe impl Sync for Mapping<'_> {}

impl<'fd> Mapping<'fd> {
    /// Map the whole file behind `file` with the default [`MapCfg`].
    pub fn file<F: AsFd>(file: &'fd F) -> Result<Self> {
        MapCfg::new().map_file(file)
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    /// Bytes actually reserved for this mapping. Only larger than [`Mapping::len`] after an
    /// anonymous shrink on a platform that cannot shrink in place.
    pub fn reserved_len(&self) -> usize {
        self.region.reserved
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.region.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.region.ptr.as_ptr()
    }

    pub fn backing(&self) -> Backing<'fd> {
        self.backing
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous)
    }

    /// Resize the mapping to `new_len` bytes, keeping the first `min(len, new_len)` bytes.
    ///
    /// File-backed mappings resize their file to match first. The mapping may move, which is why
    /// the handle is consumed and a new one returned.
    ///
    /// Resizing takes several steps that are never rolled back. If a later step fails, the file
    /// may already have its new length; the [`ResizeError`] hands back the mapping if it is
    /// still there.
    pub fn resize(self, new_len: usize) -> std::result::Result<Self, ResizeError<'fd>> {
        let this = ManuallyDrop::new(self);
        let (region, backing, cfg) = (this.region, this.backing, this.cfg);

        debug!(
            "resizing {:?} mapping at {:p} from {} to {} bytes",
            backing, region.ptr, region.len, new_len,
        );

        let resized = match backing {
            Backing::Anonymous => Platform::resize_anonymous(region, new_len),
            Backing::File(fd) => Platform::resize_file(region, fd, new_len, cfg.populate),
        };

        Self::from_remap(resized, backing, cfg, new_len)
    }

    /// Wrap what a [`Remap`] strategy produced back into a handle, or into a [`ResizeError`]
    /// holding whatever survived.
    fn from_remap(
        resized: RemapResult,
        backing: Backing<'fd>,
        cfg: MapCfg,
        new_len: usize,
    ) -> std::result::Result<Self, ResizeError<'fd>> {
        match resized {
            Ok(region) => Ok(Mapping {
                region,
                backing,
                cfg,
            }),
            Err(Failure { error, survivor }) => Err(ResizeError {
                new_len,
                source: error,
                mapping: survivor.map(|region| Mapping {
                    region,
                    backing,
                    cfg,
                }),
            }),
        }
    }

    /// Flush dirty pages toward the file with the configured [`SyncMode`].
    pub fn sync(&self) -> Result<()> {
        self.sync_with(self.cfg.sync_mode)
    }

    /// Flush dirty pages toward the file, and make other mappings of the file see them.
    ///
    /// Anonymous mappings have nothing to flush.
    pub fn sync_with(&self, mode: SyncMode) -> Result<()> {
        let Backing::File(fd) = self.backing else {
            return Ok(());
        };

        trace!("syncing {} bytes of fd {} ({:?})", self.region.len, fd.as_raw_fd(), mode);

        unix::flush(&self.region, mode).map_err(|e| with_fd(e, fd))
    }

    /// Hint how `[offset, offset + len)` will be accessed. Contents are never affected.
    ///
    /// A range reaching past [`Mapping::len`] fails with the same [`Error::Platform`] that
    /// `madvise` reports for unmapped memory (`ENOMEM`), without making the call. The bytes past
    /// the logical end may still be reserved, so the kernel alone would not catch it, and callers
    /// see one error for a bad range whichever side rejected it.
    pub fn advise(&self, offset: usize, len: usize, advice: Advice) -> Result<()> {
        trace!("advising {:?} over {}+{} at {:p}", advice, offset, len, self.region.ptr);

        unix::advise(&self.region, offset, len, advice)
    }

    /// Zero `[offset, offset + len)`.
    pub fn clear(&mut self, offset: usize, len: usize) -> Result<()> {
        let mapping_len = self.len();
        let range = offset
            .checked_add(len)
            .filter(|end| *end <= mapping_len)
            .map(|end| offset..end)
            .ok_or(Error::OutOfRange {
                offset,
                len,
                mapping_len,
            })?;

        self[range].fill(0);

        Ok(())
    }

    /// Release the mapping. Its address must not be used again, even if this fails.
    pub fn destroy(self) -> Result<()> {
        let this = ManuallyDrop::new(self);

        debug!("unmapping {} bytes at {:p}", this.region.reserved, this.region.ptr);

        match this.backing {
            Backing::File(fd) => unix::unmap(&this.region).map_err(|e| with_fd(e, fd)),
            Backing::Anonymous => unix::unmap(&this.region),
        }
    }
}

impl Mapping<'static> {
    /// Map `len` bytes of private, zeroed memory with the default [`MapCfg`].
    pub fn anonymous(len: usize) -> Result<Self> {
        MapCfg::new().map_anonymous(len)
    }
}

fn with_fd(error: Error, fd: BorrowedFd<'_>) -> Error {
    match error {
        Error::Platform { op, errno, context } => Error::Platform {
            op,
            errno,
            context: context.with_fd(fd.as_raw_fd()),
        },
        other => other,
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = unix::unmap(&self.region) {
            warn!("failed to unmap {} bytes at {:p}: {}", self.region.reserved, self.region.ptr, e);
        }
    }
}

impl Deref for Mapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.region.len) }
    }
}

impl DerefMut for Mapping<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr.as_ptr(), self.region.len) }
    }
}

impl fmt::Debug for Mapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.region.ptr)
            .field("len", &self.region.len)
            .field("reserved", &self.region.reserved)
            .field("backing", &self.backing)
            .finish()
    }
}



/// A failed [`Mapping::resize`].
#[derive(Debug, thiserror::Error)]
#[error("resizing mapping to {new_len} bytes failed: {source}")]
pub struct ResizeError<'fd> {
    new_len: usize,
    source: Error,
    mapping: Option<Mapping<'fd>>,
}

impl<'fd> ResizeError<'fd> {
    pub fn error(&self) -> &Error {
        &self.source
    }

    /// The mapping as it was before the call, if the failure left it in place.
    pub fn mapping(&self) -> Option<&Mapping<'fd>> {
        self.mapping.as_ref()
    }

    pub fn into_parts(self) -> (Error, Option<Mapping<'fd>>) {
        (self.source, self.mapping)
    }
}

impl From<ResizeError<'_>> for Error {
    fn from(e: ResizeError<'_>) -> Self {
        e.source
    }
}
