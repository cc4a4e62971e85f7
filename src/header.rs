//! The allocator header.
//!
//! The header occupies the first page of every region. It is constructed in
//! place the first time a file is attached, and found again by its magic
//! value on every later attach.

use core::{cell::Cell, mem, num::NonZeroUsize, ptr::NonNull};
use std::os::fd::RawFd;

use log::{debug, warn};

#[cfg(not(feature = "unstable"))]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    base::BasePtr,
    buddy::{self, SpanTable},
    persist::TypeIdentity,
    store::BackingStore,
    Error, RegionConfig, PAGE_SIZE,
};

/// Identifies a constructed header. Zero-filled pages never match it.
pub const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"INFILEAL");

/// Whether the first page of a mapping holds a header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderState {
    /// The magic value is present.
    Constructed,
    /// The page holds anything else, typically zeroes from a fresh file.
    Uninitialized,
}

#[repr(C)]
#[derive(Debug)]
pub struct AllocatorHeader {
    // Must remain the first field, `state_at` reads it through a raw pointer.
    magic: Cell<u64>,
    /// Address the region was first mapped at. Every link in the region is
    /// absolute and only valid at this address.
    base: usize,
    root_addr: Cell<Option<NonZeroUsize>>,
    root_identity: Cell<TypeIdentity>,
    store: BackingStore,
    spans: SpanTable,
}

const _: () = assert!(mem::size_of::<AllocatorHeader>() <= PAGE_SIZE);

impl AllocatorHeader {
    pub fn new(fd: RawFd, base: NonZeroUsize, capacity: usize) -> AllocatorHeader {
        AllocatorHeader {
            magic: Cell::new(HEADER_MAGIC),
            base: base.get(),
            root_addr: Cell::new(None),
            root_identity: Cell::new(TypeIdentity::NONE),
            store: BackingStore::new(fd, capacity),
            spans: SpanTable::new(),
        }
    }

    /// Inspects the page at `ptr` for a constructed header.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of eight bytes and aligned to eight.
    pub unsafe fn state_at(ptr: NonNull<u8>) -> HeaderState {
        let magic = unsafe { ptr.cast::<u64>().as_ptr().read() };

        if magic == HEADER_MAGIC {
            HeaderState::Constructed
        } else {
            HeaderState::Uninitialized
        }
    }

    #[inline]
    pub fn is_constructed(&self) -> bool {
        self.magic.get() == HEADER_MAGIC
    }

    /// Checks that an existing header agrees with `config`.
    pub fn validate(&self, config: &RegionConfig) -> Result<(), Error> {
        if self.store.capacity() != config.capacity() {
            return Err(Error::CapacityMismatch {
                stored: self.store.capacity(),
                requested: config.capacity(),
            });
        }

        if self.base != config.address().get() {
            return Err(Error::AddressMismatch {
                stored: self.base,
                requested: config.address().get(),
            });
        }

        Ok(())
    }

    #[inline]
    pub fn set_fd(&self, fd: RawFd) {
        self.store.set_fd(fd);
    }

    /// Returns the length of the mapping this header describes, header page
    /// included.
    #[inline]
    pub fn extent(&self) -> usize {
        self.store.capacity() + PAGE_SIZE
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.store.committed()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.store.remaining()
    }

    #[inline]
    fn check_base(&self, base: BasePtr) {
        assert_eq!(base.addr().get(), self.base, "header used through a foreign base");
    }

    /// Allocates a block of at least `size` bytes.
    pub fn allocate(&self, base: BasePtr, size: usize) -> Result<NonNull<u8>, Error> {
        self.check_base(base);

        // SAFETY: `base` is this header's region base.
        unsafe { self.spans.allocate(base, &self.store, size) }
    }

    /// Returns the block at `ptr` to the span table.
    ///
    /// Pointers outside the data pages of the region are ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` lies within the region, it must denote a block allocated
    /// from this header with a size of the same size class as `size`, and it
    /// must not be used afterwards.
    pub unsafe fn deallocate(&self, base: BasePtr, ptr: NonNull<u8>, size: usize) {
        self.check_base(base);

        let data_start = self.base + PAGE_SIZE;
        let data_end = data_start + self.store.capacity();
        let addr = ptr.addr().get();

        if !(data_start..data_end).contains(&addr) {
            warn!(
                "ignoring deallocation of {size} bytes at {addr:#x}: outside region \
                 {data_start:#x}..{data_end:#x}"
            );
            return;
        }

        unsafe { self.spans.deallocate(base, ptr, size) };
    }

    /// Discards every allocation and the root slot, and shrinks the backing
    /// file to the header page.
    ///
    /// On error the header is unchanged.
    pub fn reset(&self) -> Result<(), Error> {
        self.store.reset()?;
        self.root_addr.set(None);
        self.root_identity.set(TypeIdentity::NONE);
        self.spans.reset_all();

        debug!("header at {:#x} reset", self.base);

        Ok(())
    }

    /// Returns the recorded root object, if any.
    #[inline]
    pub fn root(&self) -> Option<(NonZeroUsize, TypeIdentity)> {
        self.root_addr
            .get()
            .map(|addr| (addr, self.root_identity.get()))
    }

    #[inline]
    pub fn set_root(&self, addr: NonZeroUsize, identity: TypeIdentity) {
        self.root_identity.set(identity);
        self.root_addr.set(Some(addr));
    }

    /// Counts the free blocks of the size class serving `block_size` bytes.
    pub fn free_blocks(&self, base: BasePtr, block_size: usize) -> usize {
        self.check_base(base);

        match buddy::class_for(block_size) {
            // SAFETY: `base` is this header's region base.
            Some(class) => unsafe { self.spans.free_blocks(base, class) },
            None => 0,
        }
    }
}
