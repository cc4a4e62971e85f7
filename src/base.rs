use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(not(feature = "unstable"))]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

/// Leading word of a block that sits on a free list.
///
/// The allocator never inspects payload bytes beyond this word, and it only
/// reads this word to decide whether a buddy can be merged. A live allocation
/// whose first eight bytes happen to equal this value *and* whose next words
/// spell out the buddy's size class will be mistaken for a free block.
pub const FREE_MARKER: u64 = 0x6672_6565_626c_6b21;

/// Written over the marker when a block is handed out.
pub const IN_USE_MARKER: u64 = 0;

/// A pointer to the base of a mapped region.
///
/// All block addresses held in region metadata are converted back into
/// pointers through this type, so that they carry the provenance of the
/// mapping rather than that of any earlier pointer.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Cannot overflow, checked in `new`.
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        block.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        let raw = self.ptr.addr().get().checked_add(offset)?;
        let addr = NonZeroUsize::new(raw)?;

        self.contains_addr(addr).then(|| self.ptr.with_addr(addr))
    }

    /// Writes free-block metadata at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `FreeBlock` values.
    /// - The memory at `addr` must be within the provenance of `self`, backed
    ///   by the file, and valid for writes for `size_of::<FreeBlock>()` bytes.
    /// - The memory at `addr` must not be in use by any caller.
    #[inline]
    pub unsafe fn init_free_at(self, addr: NonZeroUsize, block: FreeBlock) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(
            block.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            block.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe { self.with_addr(addr).cast::<FreeBlock>().as_ptr().write(block) };
    }

    /// Returns a mutable reference to the `FreeBlock` at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `FreeBlock` values.
    /// - The memory at `addr` must contain a properly initialized `FreeBlock`,
    ///   i.e. the block must currently be on a free list.
    #[inline]
    pub unsafe fn free_block_mut<'a>(self, addr: NonZeroUsize) -> &'a mut FreeBlock {
        debug_assert!(self.contains_addr(addr));

        unsafe { self.with_addr(addr).cast::<FreeBlock>().as_mut() }
    }

    /// Reads the marker and recorded size class of the block at `addr`
    /// without asserting that it is free.
    ///
    /// # Safety
    ///
    /// The memory at `addr` must be within the provenance of `self`, backed by
    /// the file, and valid for reads for `size_of::<FreeBlock>()` bytes.
    #[inline]
    pub unsafe fn peek(self, addr: NonZeroUsize) -> (u64, u64) {
        let block = self.with_addr(addr).cast::<FreeBlock>().as_ptr();

        unsafe {
            (
                ptr::addr_of!((*block).marker).read(),
                ptr::addr_of!((*block).class).read(),
            )
        }
    }

    /// Overwrites the marker word of the block at `addr`.
    ///
    /// # Safety
    ///
    /// The memory at `addr` must be within the provenance of `self`, backed by
    /// the file, and owned by the allocator.
    #[inline]
    pub unsafe fn set_marker(self, addr: NonZeroUsize, marker: u64) {
        let block = self.with_addr(addr).cast::<FreeBlock>().as_ptr();

        unsafe { ptr::addr_of_mut!((*block).marker).write(marker) };
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next blocks. The links "point to" other blocks, but by forgoing actual
// pointers, no borrow is implied.
//
// NOTE: Any actual pointer to a block must be acquired via the region base
// pointer, and NOT by casting these addresses directly!

/// The metadata overlay of a free block.
///
/// While a block is free, its first bytes hold this record and form an
/// intrusive doubly linked list within its size class. While a block is
/// allocated, all of its bytes belong to the caller except the marker word,
/// which is cleared when the block is handed out.
#[repr(C)]
#[derive(Debug)]
pub struct FreeBlock {
    pub marker: u64,
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
    pub class: u64,
}

impl FreeBlock {
    #[inline]
    pub fn new(class: usize, prev: Option<NonZeroUsize>, next: Option<NonZeroUsize>) -> FreeBlock {
        FreeBlock {
            marker: FREE_MARKER,
            prev,
            next,
            class: class as u64,
        }
    }
}
