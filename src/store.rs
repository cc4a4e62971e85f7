//! The backing store.
//!
//! The store tracks the high-water mark of the backing file: every byte below
//! the mark is backed by the file, every byte above it is mapped but must not
//! be touched. The mark only moves through [`BackingStore::grow_by`] and
//! [`BackingStore::reset`].

use core::{cell::Cell, ptr::NonNull};
use std::os::fd::RawFd;

use log::debug;

use crate::{base::BasePtr, sys, Error, PAGE_SIZE};

/// Hands out page ranges from the region, growing the backing file lazily.
///
/// Lives inside the allocator header, so all state is plain data. The file
/// descriptor is refreshed on every attach since descriptors are not stable
/// across processes.
#[repr(C)]
#[derive(Debug)]
pub struct BackingStore {
    fd: Cell<RawFd>,
    /// Bytes available for data pages, not counting the header page.
    capacity: usize,
    /// Bytes of the file currently committed, including the header page.
    committed: Cell<usize>,
}

impl BackingStore {
    pub fn new(fd: RawFd, capacity: usize) -> BackingStore {
        BackingStore {
            fd: Cell::new(fd),
            capacity,
            committed: Cell::new(PAGE_SIZE),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed.get()
    }

    /// Returns the number of bytes that may still be committed.
    #[inline]
    pub fn remaining(&self) -> usize {
        (self.capacity + PAGE_SIZE).saturating_sub(self.committed.get())
    }

    #[inline]
    pub fn set_fd(&self, fd: RawFd) {
        self.fd.set(fd);
    }

    /// Commits `pages` pages following the high-water mark and returns a
    /// pointer to the first of them.
    ///
    /// The contents of the returned pages are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCapacity`] if the pages do not fit below the
    /// declared capacity, or [`Error::Io`] if the file could not be grown. In
    /// either case the high-water mark is unchanged.
    pub fn grow_by(&self, base: BasePtr, pages: usize) -> Result<NonNull<u8>, Error> {
        let remaining = self.remaining();
        let requested = pages.checked_mul(PAGE_SIZE).ok_or(Error::OutOfCapacity {
            remaining,
            requested: usize::MAX,
        })?;

        if requested > remaining {
            return Err(Error::OutOfCapacity {
                remaining,
                requested,
            });
        }

        let offset = self.committed.get();
        let new_len = offset + requested;

        sys::ensure_file_len(self.fd.get(), new_len)?;
        self.committed.set(new_len);

        debug!("backing store grew by {pages} pages to {new_len} bytes");

        // `new_len` is at most the mapping length, so `offset` is in bounds.
        Ok(base.with_offset(offset).expect("high-water mark outside mapping"))
    }

    /// Rewinds the high-water mark to the header page and truncates the file.
    ///
    /// Every pointer previously returned by `grow_by` is invalid afterwards.
    /// If the file cannot be truncated, the mark is unchanged.
    pub fn reset(&self) -> Result<(), Error> {
        sys::truncate_file(self.fd.get(), PAGE_SIZE)?;
        self.committed.set(PAGE_SIZE);

        debug!("backing store reset to {PAGE_SIZE} bytes");

        Ok(())
    }
}
