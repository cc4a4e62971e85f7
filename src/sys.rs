//! File and mapping primitives.
//!
//! These are the only places the crate talks to the operating system. The
//! allocator proper assumes nothing about them beyond their contracts: file
//! growth never shrinks, truncation sets an exact length, and a mapping is
//! either placed at the requested address or not returned at all.

use std::{io, mem::MaybeUninit, num::NonZeroUsize, os::fd::RawFd, ptr::NonNull};

use libc::c_void;

use crate::Error;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FLAGS: libc::c_int = libc::MAP_SHARED | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE;

// Without MAP_FIXED_NOREPLACE the address is only a hint. MAP_FIXED would
// silently replace whatever is already mapped there.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FLAGS: libc::c_int = libc::MAP_SHARED;

fn to_off_t(len: usize) -> io::Result<libc::off_t> {
    libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file length overflows off_t"))
}

/// Returns the current length of the file behind `fd`.
pub fn file_len(fd: RawFd) -> io::Result<u64> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();

    // SAFETY: `stat` is valid for writes of one `libc::stat`.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fstat` succeeded, so it initialized `stat`.
    let size = unsafe { stat.assume_init() }.st_size;

    Ok(size.try_into().unwrap_or(0))
}

/// Grows the file behind `fd` to at least `len` bytes. Never shrinks it.
pub fn ensure_file_len(fd: RawFd, len: usize) -> io::Result<()> {
    if file_len(fd)? >= len as u64 {
        return Ok(());
    }

    truncate_file(fd, len)
}

/// Sets the length of the file behind `fd` to exactly `len` bytes.
pub fn truncate_file(fd: RawFd, len: usize) -> io::Result<()> {
    let len = to_off_t(len)?;

    // SAFETY: `ftruncate` has no memory-safety preconditions.
    if unsafe { libc::ftruncate(fd, len) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Maps `len` bytes of the file behind `fd` at exactly `address`.
///
/// # Safety
///
/// The mapping is shared with the file and with every other process that maps
/// it. The caller is responsible for how the mapped bytes are interpreted.
pub unsafe fn map_fixed(fd: RawFd, address: NonZeroUsize, len: usize) -> Result<NonNull<u8>, Error> {
    let raw = unsafe {
        libc::mmap(
            address.get() as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            MAP_FLAGS,
            fd,
            0,
        )
    };

    if raw == libc::MAP_FAILED {
        return Err(Error::Map {
            address: address.get(),
            source: io::Error::last_os_error(),
        });
    }

    if raw as usize != address.get() {
        // Kernels older than 4.17 ignore MAP_FIXED_NOREPLACE and treat the
        // address as a hint.
        unsafe { libc::munmap(raw, len) };

        return Err(Error::Misplaced {
            requested: address.get(),
            actual: raw as usize,
        });
    }

    // `raw` equals `address`, which is non-zero.
    Ok(NonNull::new(raw.cast::<u8>()).unwrap())
}

/// Unmaps `len` bytes at `ptr`.
///
/// # Safety
///
/// `ptr` and `len` must describe a mapping returned by [`map_fixed`], and no
/// pointer into it may be used afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    if unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) } == -1 {
        log::error!(
            "munmap of {len} bytes at {:p} failed: {}",
            ptr,
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn ensure_file_len_only_grows() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        ensure_file_len(fd, 8192).unwrap();
        assert_eq!(file_len(fd).unwrap(), 8192);

        ensure_file_len(fd, 4096).unwrap();
        assert_eq!(file_len(fd).unwrap(), 8192);

        truncate_file(fd, 4096).unwrap();
        assert_eq!(file_len(fd).unwrap(), 4096);
    }

    #[test]
    fn bad_descriptor_is_an_error() {
        assert!(ensure_file_len(-1, 4096).is_err());
        assert!(truncate_file(-1, 4096).is_err());
    }
}
