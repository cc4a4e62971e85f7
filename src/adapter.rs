//! A typed allocator handle over a region.

use core::{
    alloc::Layout,
    cmp, fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::{base::BasePtr, header::AllocatorHeader, Error, PAGE_SIZE};

/// An allocator for values of type `T` whose storage lives inside a region.
///
/// A `FileAllocator` is a plain pointer to the region's header: it is `Copy`,
/// can be stored inside the region itself, and stays meaningful when the
/// region is attached again at the same address. Handles for different
/// element types compare equal if they refer to the same region.
///
/// `FileAllocator` implements [`Allocator`], so containers such as
/// `allocator_api2::vec::Vec<T, FileAllocator<T>>` keep their buffers inside
/// the region.
///
/// A handle does not keep its region alive. Using it after the last
/// [`Region`] clone is dropped is undefined behavior, as documented on
/// [`Region::attach`].
///
/// [`Region`]: crate::Region
/// [`Region::attach`]: crate::Region::attach
pub struct FileAllocator<T = u8> {
    base: NonNull<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileAllocator<T> {
    /// # Safety
    ///
    /// `base` must point to a mapped region holding a constructed header.
    pub(crate) unsafe fn from_base(base: NonNull<u8>) -> FileAllocator<T> {
        FileAllocator {
            base,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &AllocatorHeader {
        // SAFETY: `base` points to a live header, see `Region::attach`.
        unsafe { self.base.cast::<AllocatorHeader>().as_ref() }
    }

    #[inline]
    fn base_ptr(&self) -> BasePtr {
        BasePtr::new(self.base, self.header().extent())
    }

    /// Allocates space for `count` values of `T`.
    ///
    /// The returned memory is uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Layout`] if the total size overflows or `T` is
    /// aligned to more than [`PAGE_SIZE`], and [`Error::OutOfCapacity`] if
    /// the region is full.
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>, Error> {
        let layout = Layout::array::<T>(count).map_err(|_| Error::Layout)?;
        let size = block_request(layout)?;

        self.header()
            .allocate(self.base_ptr(), size)
            .map(NonNull::cast)
    }

    /// Returns space for `count` values of `T` to the region.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate(count)` on an allocator for
    /// the same region and element size, with the same `count`, and must not
    /// be used afterwards. Values stored there are not dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        // Such a layout could not have been allocated.
        let Ok(layout) = Layout::array::<T>(count) else {
            return;
        };
        let Ok(size) = block_request(layout) else {
            return;
        };

        unsafe {
            self.header()
                .deallocate(self.base_ptr(), ptr.cast(), size)
        };
    }

    /// Moves `value` into the uninitialized slot at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and aligned for `T`. Any value already
    /// at `ptr` is overwritten without being dropped.
    #[inline]
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        unsafe { ptr.as_ptr().write(value) };
    }

    /// Drops the value at `ptr` in place, leaving the slot uninitialized.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value of `T` that is not used
    /// afterwards.
    #[inline]
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
    }

    /// Returns a handle to the same region for values of type `U`.
    #[inline]
    pub fn rebind<U>(self) -> FileAllocator<U> {
        FileAllocator {
            base: self.base,
            _marker: PhantomData,
        }
    }

    /// Returns the address of the region this handle allocates from.
    #[inline]
    pub fn region_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

/// Returns the number of bytes to request for `layout`.
///
/// Blocks are aligned to their own size up to 64 KiB, so requesting at least
/// `align` bytes aligns the block for any alignment up to a page.
fn block_request(layout: Layout) -> Result<usize, Error> {
    if layout.align() > PAGE_SIZE {
        return Err(Error::Layout);
    }

    Ok(cmp::max(layout.size(), layout.align()))
}

impl<T> Clone for FileAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FileAllocator<T> {}

impl<T> fmt::Debug for FileAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAllocator")
            .field("base", &self.base)
            .field("element", &core::any::type_name::<T>())
            .finish()
    }
}

impl<T, U> PartialEq<FileAllocator<U>> for FileAllocator<T> {
    fn eq(&self, other: &FileAllocator<U>) -> bool {
        self.base == other.base
    }
}

impl<T> Eq for FileAllocator<T> {}

unsafe impl<T> Allocator for FileAllocator<T> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let size = block_request(layout).map_err(|_| AllocError)?;
        let ptr = self
            .header()
            .allocate(self.base_ptr(), size)
            .map_err(|_| AllocError)?;

        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // `allocate` rejected any layout for which this fails.
        if let Ok(size) = block_request(layout) {
            unsafe {
                self.header()
                    .deallocate(self.base_ptr(), ptr, size)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_covers_alignment() {
        let layout = Layout::from_size_align(3, 16).unwrap();
        assert_eq!(block_request(layout).unwrap(), 16);

        let layout = Layout::from_size_align(100, 8).unwrap();
        assert_eq!(block_request(layout).unwrap(), 100);

        let layout = Layout::from_size_align(8, PAGE_SIZE * 2).unwrap();
        assert!(matches!(block_request(layout), Err(Error::Layout)));
    }
}
