//! Power-of-two size classes with binary-buddy splitting and coalescing.
//!
//! Every size class owns a free list of blocks of exactly its size. Classes
//! below the growth threshold obtain blocks by splitting a block of the next
//! larger class and return them by merging with their buddy; classes at or
//! above the threshold take whole pages straight from the backing store and
//! never merge.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                   |
//! |--------------------------|-----------|------------------------------|
//! | Allocate                 | O(1)      | O(log2 threshold)            |
//! | Deallocate               | O(1)      | O(log2 threshold)            |
//!
//! #### Fragmentation
//!
//! Requests are rounded up to the next power of two, so internal
//! fragmentation is below 50%. Blocks are only ever merged with their buddy,
//! never moved, so a single live block keeps its whole 64 KiB chunk from
//! being reused for larger classes.

use core::{cell::Cell, cmp, num::NonZeroUsize, ptr::NonNull};

use log::{trace, warn};

#[cfg(not(feature = "unstable"))]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    base::{BasePtr, FreeBlock, FREE_MARKER, IN_USE_MARKER},
    store::BackingStore,
    Error, PAGE_SIZE,
};

/// Log2 of the smallest block size; size-class index 0 holds blocks of
/// `1 << INDEX_OFFSET` bytes.
pub const INDEX_OFFSET: u32 = 5;

/// The smallest block the allocator hands out. Large enough to hold a
/// [`FreeBlock`].
pub const MIN_BLOCK_SIZE: usize = 1 << INDEX_OFFSET;

/// Log2 of the smallest block size that is requested from the backing store
/// directly instead of being split from a larger block.
pub const GROWTH_SHIFT: u32 = 16;

/// Number of size classes, from `MIN_BLOCK_SIZE` up to `1 << (usize::BITS - 1)`.
pub const NUM_CLASSES: usize = (usize::BITS - INDEX_OFFSET) as usize;

const _: () = assert!(core::mem::size_of::<FreeBlock>() <= MIN_BLOCK_SIZE);
const _: () = assert!((1 << GROWTH_SHIFT) % PAGE_SIZE == 0);

/// Returns the size-class index that serves requests of `size` bytes.
///
/// This is `ceil(log2(max(size, MIN_BLOCK_SIZE))) - INDEX_OFFSET`, or `None`
/// if no class is large enough.
#[inline]
pub fn class_for(size: usize) -> Option<usize> {
    let block_size = cmp::max(size, MIN_BLOCK_SIZE).checked_next_power_of_two()?;
    let class = (block_size.trailing_zeros() - INDEX_OFFSET) as usize;

    (class < NUM_CLASSES).then_some(class)
}

/// Returns the size in bytes of blocks in size class `class`.
#[inline]
pub const fn block_size(class: usize) -> usize {
    1 << (class as u32 + INDEX_OFFSET)
}

/// Returns whether blocks of size class `class` come straight from the
/// backing store.
#[inline]
fn grows_directly(class: usize) -> bool {
    class as u32 + INDEX_OFFSET >= GROWTH_SHIFT
}

/// The free list of a single size class.
///
/// Blocks are appended at the tail and taken from the head.
#[repr(C)]
#[derive(Debug)]
pub struct Span {
    first: Cell<Option<NonZeroUsize>>,
    last: Cell<Option<NonZeroUsize>>,
}

impl Span {
    const fn new() -> Span {
        Span {
            first: Cell::new(None),
            last: Cell::new(None),
        }
    }

    /// Appends a block to the tail of the free list, marking it free.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a block of size class `class` that is
    /// backed by the file and owned by the allocator, and it must not already
    /// be on any free list.
    unsafe fn push_back(&self, base: BasePtr, block: NonZeroUsize, class: usize) {
        assert_eq!(block.get() % MIN_BLOCK_SIZE, 0);

        let old_tail = self.last.get();

        unsafe { base.init_free_at(block, FreeBlock::new(class, old_tail, None)) };

        match old_tail {
            // Link the old tail forward to the new block.
            Some(t) => unsafe { base.free_block_mut(t).next = Some(block) },

            // The list was empty, so the new block is also the head.
            None => self.first.set(Some(block)),
        }

        self.last.set(Some(block));
    }

    /// Pops a block from the head of the free list.
    ///
    /// If the free list is empty, returns `None`.
    ///
    /// # Safety
    ///
    /// Every block on the list must be backed by the file.
    unsafe fn pop_front(&self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.first.get()?;

        unsafe { self.remove(base, head) };

        Some(head)
    }

    /// Removes the specified block from the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - Every block on the list must be backed by the file.
    /// - `block` must be the address of an element of this list.
    unsafe fn remove(&self, base: BasePtr, block: NonZeroUsize) {
        let (prev, next) = {
            let removed = unsafe { base.free_block_mut(block) };
            (removed.prev.take(), removed.next.take())
        };

        match prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { base.free_block_mut(p).next = next },

            // If there's no previous block, then `block` is the head.
            None => self.first.set(next),
        }

        match next {
            // Link `next` back to `prev`.
            Some(n) => unsafe { base.free_block_mut(n).prev = prev },

            // If there's no next block, then `block` is the tail.
            None => self.last.set(prev),
        }
    }

    /// Counts the blocks on the free list.
    ///
    /// # Safety
    ///
    /// Every block on the list must be backed by the file.
    unsafe fn len(&self, base: BasePtr) -> usize {
        let mut count = 0;
        let mut current = self.first.get();

        while let Some(cur) = current {
            count += 1;
            current = unsafe { base.free_block_mut(cur).next };
        }

        count
    }

    /// Forgets every block on the list. Block contents are left untouched.
    fn reset(&self) {
        self.first.set(None);
        self.last.set(None);
    }
}

/// One span per size class, indexed by size-class index.
#[repr(C)]
#[derive(Debug)]
pub struct SpanTable {
    spans: [Span; NUM_CLASSES],
}

impl SpanTable {
    pub fn new() -> SpanTable {
        SpanTable {
            spans: core::array::from_fn(|_| Span::new()),
        }
    }

    /// Retrieves the address of the buddy of the block at `block` in size
    /// class `class`.
    ///
    /// Offsets are measured from the first data page, which every chunk
    /// below the growth threshold is aligned to.
    #[inline]
    fn buddy_of(base: BasePtr, block: NonZeroUsize, class: usize) -> NonZeroUsize {
        let origin = base.addr().get() + PAGE_SIZE;
        let ofs = base.offset_to(block) - PAGE_SIZE;

        NonZeroUsize::new(origin + (ofs ^ block_size(class))).unwrap()
    }

    /// Returns whether `block` is currently on the free list of `class`.
    ///
    /// # Safety
    ///
    /// `block` must be backed by the file.
    #[inline]
    unsafe fn is_free_in(base: BasePtr, block: NonZeroUsize, class: usize) -> bool {
        let (marker, recorded) = unsafe { base.peek(block) };

        marker == FREE_MARKER && recorded == class as u64
    }

    /// Allocates a block able to hold `size` bytes.
    ///
    /// The contents of the block are unspecified, except that its first word
    /// is zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCapacity`] if a new chunk is needed and does not
    /// fit in the backing store. No span is modified in that case.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the region that `store` and `self` belong
    /// to.
    pub unsafe fn allocate(
        &self,
        base: BasePtr,
        store: &BackingStore,
        size: usize,
    ) -> Result<NonNull<u8>, Error> {
        let class = class_for(size).ok_or(Error::OutOfCapacity {
            remaining: store.remaining(),
            requested: size,
        })?;

        let block = unsafe { self.get_block(base, store, class)? };

        Ok(base.with_addr(block))
    }

    /// Returns the block at `ptr`, allocated for `size` bytes, to its span.
    ///
    /// `size` must be a size that maps to the same size class as the one the
    /// block was allocated with. This is not checked: a block returned with a
    /// size of a different class corrupts the span table.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated from this table with a
    /// size of the same class as `size`.
    pub unsafe fn deallocate(&self, base: BasePtr, ptr: NonNull<u8>, size: usize) {
        let Some(class) = class_for(size) else {
            warn!("ignoring deallocation of {size} bytes at {ptr:p}: no such size class");
            return;
        };

        unsafe { self.put_block(base, ptr.addr(), class) };
    }

    /// Empties every span. Block contents are left untouched.
    pub fn reset_all(&self) {
        for span in &self.spans {
            span.reset();
        }
    }

    /// Counts the free blocks held by size class `class`.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the region that `self` belongs to.
    pub unsafe fn free_blocks(&self, base: BasePtr, class: usize) -> usize {
        unsafe { self.spans[class].len(base) }
    }

    unsafe fn get_block(
        &self,
        base: BasePtr,
        store: &BackingStore,
        class: usize,
    ) -> Result<NonZeroUsize, Error> {
        // Scan increasing block sizes until a free block is found, or until
        // a class that grows directly is reached.
        let mut level = class;
        let block = loop {
            if let Some(block) = unsafe { self.spans[level].pop_front(base) } {
                break block;
            }

            if grows_directly(level) {
                let pages = block_size(level) / PAGE_SIZE;
                break store.grow_by(base, pages)?.addr();
            }

            level += 1;
        };

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for split in (class..level).rev() {
            let back_half = NonZeroUsize::new(block.get() + block_size(split)).unwrap();

            trace!("split {:#x} into class {split}", block.get());

            unsafe { self.spans[split].push_back(base, back_half, split) };
        }

        unsafe { base.set_marker(block, IN_USE_MARKER) };

        Ok(block)
    }

    unsafe fn put_block(&self, base: BasePtr, block: NonZeroUsize, class: usize) {
        let mut block = block;
        let mut level = class;

        // Coalesce with free buddies for as long as they keep matching.
        while !grows_directly(level) {
            let buddy = Self::buddy_of(base, block, level);

            if !unsafe { Self::is_free_in(base, buddy, level) } {
                break;
            }

            trace!(
                "merge {:#x} with buddy {:#x} into class {}",
                block.get(),
                buddy.get(),
                level + 1
            );

            unsafe {
                self.spans[level].remove(base, buddy);

                // The upper half is absorbed into the merged block.
                base.set_marker(cmp::max(block, buddy), IN_USE_MARKER);
            }

            block = cmp::min(block, buddy);
            level += 1;
        }

        unsafe { self.spans[level].push_back(base, block, level) };
    }
}
