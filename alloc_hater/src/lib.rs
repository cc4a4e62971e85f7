//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] replays a sequence of [`AllocatorOp`]s against a
//! [`Subject`]. Every live block is painted with the id of the operation that
//! last wrote it and verified before it is freed, so blocks that overlap or
//! that the allocator scribbles over are caught.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{alloc::Layout, fmt, mem::MaybeUninit, ops::Range, ptr::NonNull, slice};

/// Largest allocation size generated by [`ArbLayout`].
pub const MAX_SIZE: usize = 1 << 20;

/// Largest alignment generated by [`ArbLayout`], expressed as a shift.
pub const MAX_ALIGN_SHIFT: u8 = 14;

/// A wrapper around `Layout` which implements `Arbitrary`.
///
/// Sizes are kept below [`MAX_SIZE`] so that sequences of operations make
/// progress instead of exhausting the subject immediately.
#[derive(Clone, Debug)]
pub struct ArbLayout(pub Layout);

impl arbitrary::Arbitrary<'_> for ArbLayout {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % (MAX_ALIGN_SHIFT + 1);
        let align: usize = 1 << align_shift;

        // Favor small sizes: pick a bit width first, then a size below it.
        let size_bits = u8::arbitrary(u)? % (MAX_SIZE.trailing_zeros() as u8 + 1);
        let size = usize::arbitrary(u)? % (1 << size_bits);

        let layout = match Layout::from_size_align(size, align) {
            Ok(l) => l,
            Err(_) => {
                panic!("invalid layout params: size=0x{size:X} align=0x{align:X}");
            }
        };

        Ok(ArbLayout(layout))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Custom,
}

/// An operation replayed against a [`Subject`].
#[derive(Clone, Debug)]
pub enum AllocatorOp<O> {
    /// Allocates a block with the given layout.
    Alloc(Layout),
    /// Frees a live block. Given `n` live blocks, the block at `idx % n` is
    /// freed.
    Dealloc(usize),
    /// A subject-specific operation.
    Custom(O),
}

impl<'a, O: arbitrary::Arbitrary<'a>> arbitrary::Arbitrary<'a> for AllocatorOp<O> {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbLayout::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Custom => AllocatorOp::Custom(O::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    /// Subject-specific operations, interleaved with allocations.
    type Op: for<'a> arbitrary::Arbitrary<'a> + Clone + fmt::Debug;
    type AllocError;

    /// Allocates a block of memory according to `layout`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory with layout `layout` pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    /// Performs a subject-specific operation.
    ///
    /// Live blocks must keep their contents across the operation.
    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }

    /// Returns a live block overlapping `range`, if any.
    pub fn find_overlap(&self, range: &Range<usize>) -> Option<&Block> {
        self.blocks.iter().find(|b| {
            let other = b.addr_range();
            other.start < range.end && range.start < other.end
        })
    }

    /// Returns the first live block whose contents changed.
    pub fn find_corrupted(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| !b.verify())
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The original allocation layout.
    layout: Layout,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - `ptr` must have been allocated according to `layout`.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, layout: Layout, id: u64) -> Block {
        let mut b = Block { ptr, layout, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the range of addresses covered by the block.
    pub fn addr_range(&self) -> Range<usize> {
        let start = self.ptr.cast::<u8>().as_ptr() as usize;
        start..start + self.ptr.len()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, Layout) {
        (self.ptr, self.layout)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.addr_range())
            .field("layout", &self.layout)
            .field("id", &self.id)
            .finish()
    }
}

/// Why an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A new block overlaps a live one.
    Overlap,
    /// A new block is not aligned as its layout requires.
    Misaligned,
    /// A live block's contents changed.
    Corrupted,
}

#[derive(Clone, Debug)]
pub struct Failed<O> {
    pub completed: Vec<AllocatorOp<O>>,
    pub failed_op: Option<AllocatorOp<O>>,
    pub failure: Failure,
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed<S::Op>>
    where
        I: IntoIterator<Item = AllocatorOp<S::Op>>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        let fail = |completed, failed_op, failure| Failed::<S::Op> {
            completed,
            failed_op,
            failure,
        };

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op {
                AllocatorOp::Alloc(layout) => {
                    let ptr = match self.subject.allocate(layout) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let addr = ptr.cast::<u8>().as_ptr() as usize;
                    let range = addr..addr + ptr.len();

                    if addr % layout.align() != 0 {
                        return Err(fail(completed, Some(op), Failure::Misaligned));
                    }

                    if blocks.find_overlap(&range).is_some() {
                        return Err(fail(completed, Some(op), Failure::Overlap));
                    }

                    let block = unsafe { Block::init(ptr, layout, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(fail(completed, Some(op), Failure::Corrupted));
                    }

                    unsafe {
                        block.paint(op_id);
                        self.subject.deallocate(block.ptr.cast(), block.layout);
                    }
                }

                AllocatorOp::Custom(ref custom) => {
                    self.subject.handle_custom_op(custom.clone());

                    if blocks.find_corrupted().is_some() {
                        return Err(fail(completed, Some(op), Failure::Corrupted));
                    }
                }
            }

            completed.push(op);
        }

        if blocks.find_corrupted().is_some() {
            return Err(fail(completed, None, Failure::Corrupted));
        }

        for block in blocks {
            let (ptr, layout) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr.cast(), layout) };
        }

        Ok(())
    }
}
