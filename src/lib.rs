//! Resizable memory mappings over files and anonymous memory.
//!
//! A [`Mapping`] owns a contiguous, readable and writable region of the address space. It is
//! either anonymous (zeroed, lost on release) or backed by a borrowed file descriptor whose
//! length always tracks the mapping's length. [`Mapping::resize`] consumes the handle and hands
//! back a new one, because the region may move.

#[cfg(unix)]
pub mod fd;
#[cfg(unix)]
mod map;

#[cfg(unix)]
pub use map::*;

use std::{fmt, os::fd::RawFd};

use nix::errno::Errno;



pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operating system primitive failed.
    #[error("{op} failed: {errno} ({context})")]
    Platform {
        op: Op,
        errno: Errno,
        context: Context,
    },
    /// A byte range did not fit inside the mapping.
    #[error("range {offset}+{len} is outside of a {mapping_len} byte mapping")]
    OutOfRange {
        offset: usize,
        len: usize,
        mapping_len: usize,
    },
}

impl Error {
    pub(crate) fn platform(op: Op, errno: Errno, context: Context) -> Self {
        Self::Platform { op, errno, context }
    }

    /// The numeric OS error code, if this error came from the OS.
    pub fn code(&self) -> Option<i32> {
        self.errno().map(|errno| errno as i32)
    }

    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Platform { errno, .. } => Some(*errno),
            Self::OutOfRange { .. } => None,
        }
    }

    /// The primitive that failed.
    pub fn op(&self) -> Option<Op> {
        match self {
            Self::Platform { op, .. } => Some(*op),
            Self::OutOfRange { .. } => None,
        }
    }
}

/// The OS primitive behind a [`Error::Platform`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Fstat,
    Ftruncate,
    Mmap,
    Munmap,
    Mremap,
    Msync,
    Madvise,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Fstat => "fstat",
            Op::Ftruncate => "ftruncate",
            Op::Mmap => "mmap",
            Op::Munmap => "munmap",
            Op::Mremap => "mremap",
            Op::Msync => "msync",
            Op::Madvise => "madvise",
        })
    }
}

/// What a failing call was working on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub fd: Option<RawFd>,
    /// Length of the mapping (or file) at the time of the call.
    pub len: Option<usize>,
    /// Length the call was asked to produce.
    pub new_len: Option<usize>,
}

impl Context {
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = Some(len);
        self
    }

    pub fn with_new_len(mut self, new_len: usize) -> Self {
        self.new_len = Some(new_len);
        self
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(fd) = self.fd {
            parts.push(format!("fd = {}", fd));
        }
        if let Some(len) = self.len {
            parts.push(format!("length = {}", len));
        }
        if let Some(new_len) = self.new_len {
            parts.push(format!("new length = {}", new_len));
        }

        if parts.is_empty() {
            f.write_str("no context")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_error_reports_code_and_context() {
        let err = Error::platform(
            Op::Mmap,
            Errno::ENOMEM,
            Context::default().with_fd(3).with_len(4096),
        );

        assert_eq!(err.code(), Some(libc::ENOMEM));
        assert_eq!(err.op(), Some(Op::Mmap));

        let msg = err.to_string();
        assert!(msg.starts_with("mmap failed: "));
        assert!(msg.ends_with("(fd = 3, length = 4096)"));
    }

    #[test]
    fn empty_context_is_named() {
        assert_eq!(Context::default().to_string(), "no context");
        assert_eq!(Context::default().with_new_len(8).to_string(), "new length = 8");
    }

    #[test]
    fn out_of_range_has_no_code() {
        let err = Error::OutOfRange { offset: 10, len: 10, mapping_len: 12 };
        assert_eq!(err.code(), None);
        assert_eq!(err.op(), None);
        assert_eq!(err.to_string(), "range 10+10 is outside of a 12 byte mapping");
    }
}
