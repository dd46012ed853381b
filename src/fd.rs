//! Descriptor Lengths
//!
//! The descriptor is always borrowed. Nothing in this crate opens or closes it.



use std::os::fd::{AsRawFd, BorrowedFd};

use nix::{errno::Errno, libc::off_t, sys::stat::fstat, unistd::ftruncate};

use crate::{Context, Error, Op, Result};



/// Returns the length of the file behind `fd`, in bytes.
pub fn file_len(fd: BorrowedFd<'_>) -> Result<u64> {
    let stat = fstat(fd.as_raw_fd()).map_err(|errno| {
        Error::platform(Op::Fstat, errno, Context::default().with_fd(fd.as_raw_fd()))
    })?;

    Ok(stat.st_size as u64)
}

/// Truncates or extends the file behind `fd` to exactly `len` bytes.
///
/// Extended space reads back as zeroes.
pub fn set_file_len(fd: BorrowedFd<'_>, len: u64) -> Result<()> {
    let context = Context::default()
        .with_fd(fd.as_raw_fd())
        .with_new_len(usize::try_from(len).unwrap_or(usize::MAX));

    let len = off_t::try_from(len)
        .map_err(|_| Error::platform(Op::Ftruncate, Errno::EFBIG, context))?;
    ftruncate(fd, len).map_err(|errno| Error::platform(Op::Ftruncate, errno, context))
}

/// Like [`file_len`], but for sizing a mapping.
pub(crate) fn mappable_len(fd: BorrowedFd<'_>) -> Result<usize> {
    let len = file_len(fd)?;
    usize::try_from(len).map_err(|_| {
        Error::platform(Op::Fstat, Errno::EOVERFLOW, Context::default().with_fd(fd.as_raw_fd()))
    })
}



#[cfg(test)]
mod tests {
    use super::*;

    use std::{fs::File, io::Write, os::fd::AsFd};

    #[test]
    fn empty_file_has_zero_len() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 0);
    }

    #[test]
    fn len_follows_writes() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"This is working.").unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 16);
    }

    #[test]
    fn set_len_grows_and_shrinks() {
        let file = tempfile::tempfile().unwrap();

        set_file_len(file.as_fd(), 8192).unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 8192);
        assert_eq!(file.metadata().unwrap().len(), 8192);

        set_file_len(file.as_fd(), 100).unwrap();
        assert_eq!(file_len(file.as_fd()).unwrap(), 100);
    }

    #[test]
    fn set_len_on_read_only_descriptor_fails() {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let file = File::open(&path).unwrap();

        let err = set_file_len(file.as_fd(), 4096).unwrap_err();
        assert_eq!(err.op(), Some(Op::Ftruncate));
        assert!(matches!(err.errno(), Some(Errno::EINVAL) | Some(Errno::EBADF)));
        assert_eq!(file_len(file.as_fd()).unwrap(), 0);
    }

    #[test]
    fn set_len_beyond_file_offsets_fails() {
        let file = tempfile::tempfile().unwrap();

        let err = set_file_len(file.as_fd(), u64::MAX).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EFBIG));
        match err {
            Error::Platform { context, .. } => assert_eq!(context.new_len, Some(usize::MAX)),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(file_len(file.as_fd()).unwrap(), 0);
    }

    #[test]
    fn mappable_len_matches_file_len() {
        let file = tempfile::tempfile().unwrap();
        set_file_len(file.as_fd(), 1024).unwrap();
        assert_eq!(mappable_len(file.as_fd()).unwrap(), 1024);
    }
}
