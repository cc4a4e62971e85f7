//! Attaching files as regions.

use core::{any, fmt, num::NonZeroUsize, ptr::NonNull};
use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::Path,
    rc::Rc,
};

use log::debug;

#[cfg(not(feature = "unstable"))]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    base::BasePtr,
    header::{AllocatorHeader, HeaderState},
    persist::{Persistent, TypeIdentity},
    sys, Error, FileAllocator, PAGE_SIZE,
};

/// Where and how large a region is mapped.
///
/// A file must always be attached with the configuration it was first
/// attached with: internal links are absolute addresses, and the capacity is
/// recorded in the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionConfig {
    address: NonZeroUsize,
    capacity: usize,
}

impl RegionConfig {
    /// Creates a configuration mapping `capacity` bytes of data at `address`.
    ///
    /// The header page precedes the data, so the mapping spans
    /// `address..address + PAGE_SIZE + capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any of the following is true:
    /// - `address` is zero or not a multiple of [`PAGE_SIZE`].
    /// - `capacity` is zero or not a multiple of [`PAGE_SIZE`].
    /// - The end of the mapping overflows `usize`.
    pub fn new(address: usize, capacity: usize) -> Result<RegionConfig, Error> {
        let address =
            NonZeroUsize::new(address).ok_or(Error::InvalidConfig("address must be non-zero"))?;

        if address.get() % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig("address must be page-aligned"));
        }

        if capacity == 0 || capacity % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig(
                "capacity must be a non-zero multiple of the page size",
            ));
        }

        capacity
            .checked_add(PAGE_SIZE)
            .and_then(|len| address.get().checked_add(len))
            .ok_or(Error::InvalidConfig("mapping overflows the address space"))?;

        Ok(RegionConfig { address, capacity })
    }

    /// Returns the address the header page is mapped at.
    #[inline]
    pub fn address(&self) -> NonZeroUsize {
        self.address
    }

    /// Returns the number of data bytes, excluding the header page.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the length of the whole mapping.
    #[inline]
    pub fn map_len(&self) -> usize {
        self.capacity + PAGE_SIZE
    }
}

/// A live mapping. Unmapped when dropped; the file closes afterwards.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    file: File,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` came from `map_fixed`, and every `Region`
        // borrowing the mapping is gone.
        unsafe { sys::unmap(self.ptr, self.len) };

        debug!("unmapped {} bytes at {:p}", self.len, self.ptr);
    }
}

/// A file attached at a fixed address.
///
/// `Region` is a reference-counted handle: clones share the mapping, which is
/// unmapped when the last clone is dropped.
///
/// A region has a single writer at any instant. Nothing guards against
/// another process attaching the same file concurrently; callers that need
/// that must serialize access themselves, e.g. with a file lock.
#[derive(Clone, Debug)]
pub struct Region {
    mapping: Rc<Mapping>,
}

impl Region {
    /// Attaches `file` as a region described by `config`.
    ///
    /// If the file does not yet hold a header, one is constructed in its
    /// first page. Otherwise the existing header is validated against
    /// `config` and adopts `file` as its backing store.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be grown to one page.
    /// - [`Error::Map`] or [`Error::Misplaced`] if the file cannot be mapped
    ///   at exactly `config.address()`, e.g. because that range is in use.
    /// - [`Error::CapacityMismatch`] or [`Error::AddressMismatch`] if the
    ///   existing header was built with a different configuration.
    ///
    /// On error, nothing stays mapped.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The file contents must either be zero in the first page or have
    ///   been produced by this crate. A corrupt header or span table causes
    ///   undefined behavior.
    /// - No other process or region may modify the file while the returned
    ///   region, or any allocator or pointer derived from it, is in use.
    /// - No [`FileAllocator`], and no pointer or reference obtained from one,
    ///   may be used after the last clone of the returned region is dropped.
    pub unsafe fn attach(file: File, config: RegionConfig) -> Result<Region, Error> {
        let fd = file.as_raw_fd();

        sys::ensure_file_len(fd, PAGE_SIZE)?;

        let ptr = unsafe { sys::map_fixed(fd, config.address(), config.map_len())? };

        // Owning the mapping from here on unmaps it on every error path.
        let mapping = Mapping {
            ptr,
            len: config.map_len(),
            file,
        };

        let header = ptr.cast::<AllocatorHeader>();

        // SAFETY: the mapping is page-aligned and at least one page long.
        match unsafe { AllocatorHeader::state_at(ptr) } {
            HeaderState::Uninitialized => {
                let fresh = AllocatorHeader::new(fd, config.address(), config.capacity());

                // SAFETY: the first page is mapped, writable and unaliased.
                unsafe { header.as_ptr().write(fresh) };

                debug!(
                    "constructed header at {:#x} with capacity {}",
                    config.address(),
                    config.capacity()
                );
            }

            HeaderState::Constructed => {
                // SAFETY: the magic value is present, and the caller vouches
                // for the rest of the header.
                let existing = unsafe { header.as_ref() };

                existing.validate(&config)?;
                existing.set_fd(fd);

                debug!(
                    "reattached header at {:#x}, {} bytes committed",
                    config.address(),
                    existing.committed()
                );
            }
        }

        Ok(Region {
            mapping: Rc::new(mapping),
        })
    }

    /// Opens or creates the file at `path` and attaches it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened for reading and
    /// writing, and otherwise the errors of [`Region::attach`].
    ///
    /// # Safety
    ///
    /// See [`Region::attach`].
    pub unsafe fn open<P: AsRef<Path>>(path: P, config: RegionConfig) -> Result<Region, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        unsafe { Region::attach(file, config) }
    }

    #[inline]
    fn header(&self) -> &AllocatorHeader {
        // SAFETY: a `Region` always holds a mapping with a constructed header,
        // and the mapping outlives `self`.
        unsafe { self.mapping.ptr.cast::<AllocatorHeader>().as_ref() }
    }

    #[inline]
    pub(crate) fn base(&self) -> BasePtr {
        BasePtr::new(self.mapping.ptr, self.mapping.len)
    }

    /// Allocates a block of at least `size` bytes inside the region.
    ///
    /// The block is aligned to the smaller of its rounded-up size and 64 KiB.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCapacity`] if the backing file cannot grow to
    /// accommodate the block, or [`Error::Io`] if growing it failed.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        self.header().allocate(self.base(), size)
    }

    /// Returns a block to the region.
    ///
    /// Pointers outside the region's data pages are ignored with a warning.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Region::allocate`] on this region
    /// (or on a region attached to the same file) and not yet deallocated,
    /// and `size` must round up to the same size class as the size it was
    /// allocated with. Deallocating with a size of another class is not
    /// detected and corrupts the free lists.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.header().deallocate(self.base(), ptr, size) }
    }

    /// Discards every allocation, clears the root slot and shrinks the
    /// backing file to the header page. The mapping and the declared
    /// capacity are unchanged.
    ///
    /// # Safety
    ///
    /// Every pointer previously obtained from this region is dangling
    /// afterwards and must not be used.
    pub unsafe fn reset(&self) -> Result<(), Error> {
        self.header().reset()
    }

    /// Returns an allocator handle for values of type `T`.
    pub fn allocator<T>(&self) -> FileAllocator<T> {
        // SAFETY: the mapping holds a constructed header.
        unsafe { FileAllocator::from_base(self.mapping.ptr) }
    }

    /// Returns the root object, constructing it with `init` if the region
    /// has none.
    ///
    /// A region holds a single root. [`ObjectRegistry`] builds keyed roots
    /// on top of it.
    ///
    /// # Errors
    ///
    /// - [`Error::RootTypeMismatch`] if the root was created with another
    ///   type.
    /// - The errors of [`FileAllocator::allocate`] if the root cannot be
    ///   allocated.
    ///
    /// [`ObjectRegistry`]: crate::ObjectRegistry
    pub fn get_or_create_root<T, F>(&self, init: F) -> Result<NonNull<T>, Error>
    where
        T: Persistent,
        F: FnOnce() -> T,
    {
        let header = self.header();
        let identity = TypeIdentity::of::<T>();

        if let Some((addr, stored)) = header.root() {
            if stored != identity {
                return Err(Error::RootTypeMismatch {
                    requested: any::type_name::<T>(),
                });
            }

            return Ok(self.base().with_addr(addr).cast());
        }

        let alloc = self.allocator::<T>();
        let ptr = alloc.allocate(1)?;

        // SAFETY: `ptr` is a fresh allocation sized and aligned for `T`.
        unsafe { alloc.construct(ptr, init()) };
        header.set_root(ptr.addr(), identity);

        debug!("created root {} at {:p}", any::type_name::<T>(), ptr);

        Ok(ptr)
    }

    /// Returns the number of data bytes the region may hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity()
    }

    /// Returns the current length of the backing file.
    #[inline]
    pub fn committed_len(&self) -> usize {
        self.header().committed()
    }

    /// Returns the number of bytes the backing file may still grow by.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.header().remaining()
    }

    /// Returns the address the region is mapped at.
    #[inline]
    pub fn base_addr(&self) -> NonZeroUsize {
        self.mapping.ptr.addr()
    }

    /// Counts the free blocks of the size class serving `block_size` bytes.
    pub fn free_blocks(&self, block_size: usize) -> usize {
        self.header().free_blocks(self.base(), block_size)
    }

    /// Returns whether the header page holds a constructed header.
    #[inline]
    pub fn is_constructed(&self) -> bool {
        self.header().is_constructed()
    }

    /// Returns the backing file.
    #[inline]
    pub fn file(&self) -> &File {
        &self.mapping.file
    }
}
