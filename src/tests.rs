#![cfg(test)]

use core::{cell::Cell, ptr::NonNull, slice};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock,
    },
};

use allocator_api2::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};
use tempfile::TempDir;

use crate::{
    buddy::GROWTH_SHIFT, sys, Error, FileAllocator, ObjectRegistry, Persistent, Region,
    RegionConfig, PAGE_SIZE,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Tests run in parallel, and a live mapping occupies its address range, so
// every test maps at an address of its own.
static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

const ADDRESS_STRIDE: usize = 0x1_0000_0000;

fn unique_address() -> usize {
    0x5000_0000_0000 + NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed) * ADDRESS_STRIDE
}

/// A backing file in a temporary directory, with the configuration it is
/// attached with.
struct Scratch {
    _dir: TempDir,
    path: PathBuf,
    config: RegionConfig,
}

impl Scratch {
    fn new(capacity: usize) -> Scratch {
        Scratch::at(unique_address(), capacity)
    }

    fn at(address: usize, capacity: usize) -> Scratch {
        init_logging();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");

        Scratch {
            _dir: dir,
            path,
            config: RegionConfig::new(address, capacity).unwrap(),
        }
    }

    fn try_attach(&self, config: RegionConfig) -> Result<Region, Error> {
        unsafe { Region::open(&self.path, config) }
    }

    fn attach(&self) -> Region {
        self.try_attach(self.config).unwrap()
    }

    fn file_len(&self) -> u64 {
        std::fs::metadata(&self.path).unwrap().len()
    }
}

fn data_range(region: &Region) -> core::ops::Range<usize> {
    let start = region.base_addr().get() + PAGE_SIZE;
    start..start + region.capacity()
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

// Property tests =============================================================

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 16;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                len: limited_size(g),
            }
        } else {
            AllocatorOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }

    fn shrink(&self) -> std::boxed::Box<dyn Iterator<Item = Self>> {
        match *self {
            AllocatorOp::Allocate { len } => {
                std::boxed::Box::new(len.shrink().map(|len| AllocatorOp::Allocate { len }))
            }
            AllocatorOp::Free { index } => {
                std::boxed::Box::new(index.shrink().map(|index| AllocatorOp::Free { index }))
            }
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    ptr: NonNull<u32>,
    len: usize,
}

impl Allocation {
    fn size(&self) -> usize {
        self.len * core::mem::size_of::<u32>()
    }

    fn paint(&self) {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }.fill(self.id);
    }

    fn is_intact(&self) -> bool {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
            .iter()
            .all(|&elem| elem == self.id)
    }
}

/// Replays allocator operations against a fresh region, painting every
/// allocation with the id of the operation that created it.
struct AllocatorChecker {
    region: Region,
    allocations: std::vec::Vec<Allocation>,
    num_ops: u32,
}

impl AllocatorChecker {
    fn new(region: Region) -> AllocatorChecker {
        AllocatorChecker {
            region,
            allocations: std::vec::Vec::new(),
            num_ops: 0,
        }
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let size = len * core::mem::size_of::<u32>();

                match self.region.allocate(size) {
                    Ok(ptr) => {
                        let range = data_range(&self.region);
                        if !range.contains(&addr(ptr)) || addr(ptr) + size > range.end {
                            return false;
                        }

                        let allocation = Allocation {
                            id,
                            ptr: ptr.cast(),
                            len,
                        };
                        allocation.paint();
                        self.allocations.push(allocation);
                    }

                    Err(Error::OutOfCapacity { .. }) => (),
                    Err(_) => return false,
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.is_intact() {
                    return false;
                }

                unsafe { self.region.deallocate(a.ptr.cast(), a.size()) };
            }
        }

        true
    }

    fn run(&mut self, ops: std::vec::Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in core::mem::take(&mut self.allocations) {
            if !a.is_intact() {
                return false;
            }

            unsafe { self.region.deallocate(a.ptr.cast(), a.size()) };
        }

        true
    }
}

const MAX_TESTS: u64 = 100;

const PROPERTY_CAPACITY: usize = 16 << 20;

/// Attaches a fresh file at `address`, which the caller reuses across the
/// cases of one property.
fn fresh_region(address: &OnceLock<usize>) -> (Scratch, Region) {
    let scratch = Scratch::at(*address.get_or_init(unique_address), PROPERTY_CAPACITY);
    let region = scratch.attach();

    (scratch, region)
}

fn allocations_are_mutually_exclusive_prop(ops: std::vec::Vec<AllocatorOp>) -> bool {
    static ADDRESS: OnceLock<usize> = OnceLock::new();

    let (_scratch, region) = fresh_region(&ADDRESS);
    AllocatorChecker::new(region).run(ops)
}

#[test]
fn allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(allocations_are_mutually_exclusive_prop as fn(_) -> bool);
}

fn freeing_everything_coalesces_prop(ops: std::vec::Vec<AllocatorOp>) -> bool {
    static ADDRESS: OnceLock<usize> = OnceLock::new();

    let (_scratch, region) = fresh_region(&ADDRESS);
    if !AllocatorChecker::new(region.clone()).run(ops) {
        return false;
    }

    // Every block below the growth threshold merged back into its chunk.
    (5..GROWTH_SHIFT).all(|shift| region.free_blocks(1 << shift) == 0)
}

#[test]
fn freeing_everything_coalesces() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(freeing_everything_coalesces_prop as fn(_) -> bool);
}

// Span table =================================================================

#[test]
fn allocations_stay_in_region_and_are_aligned() {
    let scratch = Scratch::new(4 << 20);
    let region = scratch.attach();
    let range = data_range(&region);

    for size in [1, 31, 32, 33, 100, 4095, 4096, 4097, 65535, 65536, 1 << 20] {
        let ptr = region.allocate(size).unwrap();
        let ofs = addr(ptr) - range.start;

        assert!(range.contains(&addr(ptr)), "size {size}");
        assert!(addr(ptr) + size <= range.end, "size {size}");

        let block = size.max(32).next_power_of_two();
        assert_eq!(ofs % block.min(1 << GROWTH_SHIFT), 0, "size {size}");

        unsafe { region.deallocate(ptr, size) };
        let again = region.allocate(size).unwrap();
        assert!(range.contains(&addr(again)));
        unsafe { region.deallocate(again, size) };
    }
}

#[test]
fn buddies_coalesce_without_growth() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();

    let a = region.allocate(1024).unwrap();
    let b = region.allocate(1024).unwrap();
    assert_eq!(addr(a) ^ addr(b), 1024);

    let committed = region.committed_len();

    unsafe {
        region.deallocate(a, 1024);
        region.deallocate(b, 1024);
    }

    let merged = region.allocate(2048).unwrap();
    assert_eq!(merged, a.min(b));
    assert_eq!(region.committed_len(), committed);
}

#[test]
fn small_region_reports_remaining_and_requested() {
    let scratch = Scratch::new(4096 * 32);
    let region = scratch.attach();

    unsafe {
        region.reset().unwrap();

        let p = region.allocate(1).unwrap();
        region.deallocate(p, 1);
        let p = region.allocate(15).unwrap();
        region.deallocate(p, 15);
    }

    let err = region.allocate(100 * 100 * 100).unwrap_err();
    assert!(
        matches!(
            err,
            Error::OutOfCapacity {
                remaining: 65536,
                requested: 1048576
            }
        ),
        "{err:?}"
    );
    assert_eq!(
        err.to_string(),
        "out of capacity: remaining 65536 bytes, requested 1048576 bytes"
    );

    // The failure left the region usable.
    let p = region.allocate(4096).unwrap();
    unsafe { region.deallocate(p, 4096) };
}

fn allocate_until_exhausted(region: &Region, size: usize) -> (usize, Error) {
    let mut count = 0;

    loop {
        match region.allocate(size) {
            Ok(_) => count += 1,
            Err(err) => return (count, err),
        }
    }
}

#[test]
fn reset_restores_capacity_without_changing_it() {
    let scratch = Scratch::new(64 * PAGE_SIZE);
    let region = scratch.attach();

    let (first_count, first_err) = allocate_until_exhausted(&region, 20_000);
    assert_eq!(first_count, 8);
    assert_eq!(region.remaining(), 0);

    unsafe { region.reset().unwrap() };
    assert_eq!(region.committed_len(), PAGE_SIZE);
    assert_eq!(region.capacity(), 64 * PAGE_SIZE);
    assert_eq!(scratch.file_len(), PAGE_SIZE as u64);

    let (second_count, second_err) = allocate_until_exhausted(&region, 20_000);
    assert_eq!(second_count, first_count);
    assert_eq!(second_err.to_string(), first_err.to_string());
}

#[test]
fn round_robin_sizes_leave_no_free_blocks() {
    let scratch = Scratch::new(4 << 20);
    let region = scratch.attach();

    unsafe { region.reset().unwrap() };
    let before = region.committed_len();

    let sizes: std::vec::Vec<usize> = (3..=12).map(|shift| (1 << shift) - 1).collect();
    let mut live = std::vec::Vec::new();

    for _ in 0..16 {
        for &size in &sizes {
            live.push((region.allocate(size).unwrap(), size));
        }
    }

    for (ptr, size) in live {
        unsafe { region.deallocate(ptr, size) };
    }

    for shift in 5..GROWTH_SHIFT {
        assert_eq!(region.free_blocks(1 << shift), 0, "block size {}", 1 << shift);
    }

    unsafe { region.reset().unwrap() };
    assert_eq!(region.committed_len(), before);
    assert_eq!(scratch.file_len(), PAGE_SIZE as u64);
}

#[test]
fn mismatched_deallocate_size_corrupts_span_state() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();

    let a = region.allocate(32).unwrap();
    let b = region.allocate(32).unwrap();

    // `a` was a 32-byte block; returning it as a 64-byte block is a contract
    // violation the allocator cannot see.
    unsafe { region.deallocate(a, 64) };

    // The bogus block cascaded up to a whole chunk that still contains `b`.
    let chunk = region.allocate(1 << GROWTH_SHIFT).unwrap();
    assert_eq!(chunk, a);
    assert!((addr(chunk)..addr(chunk) + (1 << GROWTH_SHIFT)).contains(&addr(b)));
}

#[test]
fn out_of_region_deallocation_is_ignored() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();

    let mut local = [0u8; 64];
    let committed = region.committed_len();

    unsafe {
        region.deallocate(NonNull::from(&mut local).cast(), 64);
        // The header page is not a data page either.
        region.deallocate(NonNull::new(region.base_addr().get() as *mut u8).unwrap(), 64);
    }

    for shift in 5..=GROWTH_SHIFT {
        assert_eq!(region.free_blocks(1 << shift), 0);
    }
    assert_eq!(region.committed_len(), committed);
}

// Attach =====================================================================

#[test]
fn attach_constructs_then_validates() {
    let scratch = Scratch::new(1 << 20);

    let region = scratch.attach();
    assert!(region.is_constructed());
    assert_eq!(region.committed_len(), PAGE_SIZE);
    assert_eq!(scratch.file_len(), PAGE_SIZE as u64);

    let ptr = region.allocate(100).unwrap();
    let committed = region.committed_len();
    drop(region);

    let region = scratch.attach();
    assert_eq!(region.committed_len(), committed);

    // The block is still allocated: the next one is its neighbor.
    let next = region.allocate(100).unwrap();
    assert_eq!(addr(next), addr(ptr) + 128);
}

#[test]
fn reattach_grows_through_new_descriptor() {
    let scratch = Scratch::new(1 << 20);
    drop(scratch.attach());

    // Takes the descriptor number the first attachment used.
    let _other = tempfile::tempfile().unwrap();

    let region = scratch.attach();
    assert_eq!(scratch.file_len(), PAGE_SIZE as u64);

    let ptr = region.allocate(1 << 17).unwrap();
    assert_eq!(scratch.file_len(), (PAGE_SIZE + (1 << 17)) as u64);

    // The new pages are backed by the file.
    unsafe { ptr.as_ptr().add((1 << 17) - 1).write(0xA5) };
    assert_eq!(unsafe { ptr.as_ptr().add((1 << 17) - 1).read() }, 0xA5);
}

#[test]
fn reattach_with_other_capacity_fails() {
    let scratch = Scratch::new(1 << 20);
    drop(scratch.attach());

    let config = RegionConfig::new(scratch.config.address().get(), 2 << 20).unwrap();
    assert!(matches!(
        scratch.try_attach(config),
        Err(Error::CapacityMismatch {
            stored,
            requested
        }) if stored == 1 << 20 && requested == 2 << 20
    ));

    // Nothing stayed mapped.
    assert!(scratch.try_attach(scratch.config).is_ok());
}

#[test]
fn reattach_at_other_address_fails() {
    let scratch = Scratch::new(1 << 20);
    drop(scratch.attach());

    let config = RegionConfig::new(unique_address(), 1 << 20).unwrap();
    assert!(matches!(
        scratch.try_attach(config),
        Err(Error::AddressMismatch { .. })
    ));
}

#[test]
fn occupied_address_fails_to_map() {
    let scratch = Scratch::new(1 << 20);
    let first = scratch.attach();

    let other = tempfile::tempdir().unwrap();
    let err = unsafe { Region::open(other.path().join("other.bin"), scratch.config) }.unwrap_err();
    assert!(
        matches!(err, Error::Map { .. } | Error::Misplaced { .. }),
        "{err:?}"
    );

    // The existing mapping is unaffected.
    let ptr = first.allocate(64).unwrap();
    unsafe { first.deallocate(ptr, 64) };
}

#[test]
fn clones_share_the_mapping() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();
    let clone = region.clone();

    drop(region);

    let ptr = clone.allocate(64).unwrap();
    unsafe { ptr.as_ptr().write(7) };
    unsafe { clone.deallocate(ptr, 64) };

    assert_eq!(
        sys::file_len(std::os::fd::AsRawFd::as_raw_fd(clone.file())).unwrap(),
        clone.committed_len() as u64
    );
}

#[test]
fn root_is_created_once() {
    let scratch = Scratch::new(1 << 20);

    {
        let region = scratch.attach();
        let root = region.get_or_create_root(|| [1u64, 2, 3]).unwrap();
        unsafe { (*root.as_ptr())[2] = 30 };
    }

    let region = scratch.attach();
    let root = region
        .get_or_create_root::<[u64; 3], _>(|| unreachable!())
        .unwrap();
    assert_eq!(unsafe { *root.as_ptr() }, [1, 2, 30]);

    assert!(matches!(
        region.get_or_create_root(|| 0u8),
        Err(Error::RootTypeMismatch { .. })
    ));
}

// Adapter ====================================================================

#[test]
fn allocators_compare_by_region() {
    let first = Scratch::new(1 << 20);
    let second = Scratch::new(1 << 20);
    let a = first.attach();
    let b = second.attach();

    let bytes: FileAllocator = a.allocator();
    let words: FileAllocator<u64> = a.allocator();
    assert!(bytes == words);
    assert!(bytes.rebind::<u64>() == words);
    assert!(bytes != b.allocator::<u8>());
}

#[test]
fn allocator_counts_elements() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();
    let alloc = region.allocator::<u64>();

    let ptr = alloc.allocate(100).unwrap();
    assert_eq!(addr(ptr.cast()) % 8, 0);

    unsafe {
        for i in 0..100 {
            alloc.construct(NonNull::new(ptr.as_ptr().add(i)).unwrap(), i as u64);
        }
        assert_eq!(*ptr.as_ptr().add(99), 99);

        alloc.deallocate(ptr, 100);
    }

    // The block merged back into its chunk.
    assert_eq!(region.free_blocks(1024), 0);
    assert_eq!(region.free_blocks(1 << GROWTH_SHIFT), 1);
    assert!(matches!(alloc.allocate(usize::MAX), Err(Error::Layout)));
}

#[test]
fn destroy_runs_drop() {
    thread_local! {
        static DROPS: Cell<usize> = Cell::new(0);
    }

    struct Counted;

    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.with(|drops| drops.set(drops.get() + 1));
        }
    }

    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();
    let alloc = region.allocator::<Counted>();

    let ptr = alloc.allocate(1).unwrap();
    unsafe {
        alloc.construct(ptr, Counted);
        alloc.destroy(ptr);
        alloc.deallocate(ptr, 1);
    }

    assert_eq!(DROPS.with(Cell::get), 1);
}

#[test]
fn containers_live_in_region() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();
    let range = data_range(&region);

    let mut v: Vec<u32, _> = Vec::new_in(region.allocator::<u32>());
    v.extend(0..10_000);
    assert!(range.contains(&(v.as_ptr() as usize)));
    assert_eq!(v.iter().copied().map(u64::from).sum::<u64>(), 49_995_000);

    let b = Box::new_in(0xdead_beef_u64, region.allocator::<u64>());
    assert!(range.contains(&(&*b as *const u64 as usize)));
    assert_eq!(*b, 0xdead_beef);

    drop(b);
    drop(v);

    for shift in 5..GROWTH_SHIFT {
        assert_eq!(region.free_blocks(1 << shift), 0);
    }
}

// Registry ===================================================================

thread_local! {
    static CONSTRUCTED: Cell<usize> = Cell::new(0);
}

fn constructed() -> usize {
    CONSTRUCTED.with(Cell::get)
}

#[repr(C)]
#[derive(Debug, PartialEq)]
struct Tester {
    id: u64,
    values: [u32; 4],
}

unsafe impl Persistent for Tester {}

impl Tester {
    fn new(id: u64) -> Tester {
        CONSTRUCTED.with(|count| count.set(count.get() + 1));

        Tester { id, values: [0; 4] }
    }
}

#[test]
fn acquire_constructs_once_per_key() {
    let scratch = Scratch::new(1 << 20);
    let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();
    let start = constructed();

    registry.acquire(3, || Tester::new(3)).unwrap().values[1] = 5;
    registry.acquire(1, || Tester::new(1)).unwrap();

    let again = registry.acquire(3, || Tester::new(99)).unwrap();
    assert_eq!(again.id, 3);
    assert_eq!(again.values, [0, 5, 0, 0]);

    assert_eq!(constructed() - start, 2);
    assert_eq!(registry.len(), 2);
    assert!(registry.contains_key(1));
    assert!(!registry.contains_key(2));
}

#[test]
fn acquire_rejects_other_type() {
    let scratch = Scratch::new(1 << 20);
    let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();

    assert_eq!(*registry.acquire(0, || 6i32).unwrap(), 6);

    let err = registry.acquire(0, || 1.0f32).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { key: 0, .. }), "{err:?}");

    assert_eq!(*registry.acquire(0, || 7i32).unwrap(), 6);
}

#[test]
fn registry_survives_reattach() {
    let scratch = Scratch::new(1 << 20);

    {
        let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();
        let tester = registry.acquire(7, || Tester::new(7)).unwrap();
        tester.values = [1, 2, 3, 4];
    }

    let start = constructed();
    let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();
    let tester = registry.acquire(7, || Tester::new(8)).unwrap();

    assert_eq!(
        *tester,
        Tester {
            id: 7,
            values: [1, 2, 3, 4]
        }
    );
    assert_eq!(constructed(), start);
}

type Words = Vec<u64, FileAllocator<u64>>;
type Rows = Vec<Vec<u32, FileAllocator<u32>>, FileAllocator<Vec<u32, FileAllocator<u32>>>>;

#[test]
fn registry_vectors_survive_reattach() {
    let scratch = Scratch::new(4 << 20);

    {
        let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();

        let words_alloc = registry.allocator::<u64>();
        let words: &mut Words = registry.acquire(1, || Vec::new_in(words_alloc)).unwrap();
        words.extend(0..1000);

        let row_alloc = registry.allocator::<u32>();
        let rows_alloc = registry.allocator();
        let rows: &mut Rows = registry.acquire(2, || Vec::new_in(rows_alloc)).unwrap();
        for len in 0..50 {
            let mut row = Vec::new_in(row_alloc);
            row.extend(0..len);
            rows.push(row);
        }
    }

    let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();

    let words: &mut Words = registry.acquire(1, || unreachable!()).unwrap();
    assert_eq!(words.len(), 1000);
    assert_eq!(words.iter().sum::<u64>(), 499_500);
    words.push(1000);

    let rows: &mut Rows = registry.acquire(2, || unreachable!()).unwrap();
    assert_eq!(rows.len(), 50);
    assert!(rows
        .iter()
        .enumerate()
        .all(|(len, row)| row.len() == len && row.iter().copied().eq(0..len as u32)));
}

#[test]
fn reset_file_empties_registry() {
    let scratch = Scratch::new(1 << 20);
    let mut registry = ObjectRegistry::new(scratch.attach()).unwrap();

    *registry.acquire(5, || 10u64).unwrap() += 1;
    unsafe { registry.reset_file().unwrap() };

    assert!(registry.is_empty());
    assert_eq!(*registry.acquire(5, || 10u64).unwrap(), 10);
}

#[test]
fn registry_rejects_foreign_root() {
    let scratch = Scratch::new(1 << 20);
    let region = scratch.attach();

    region.get_or_create_root(|| 0u64).unwrap();
    assert!(matches!(
        ObjectRegistry::new(region),
        Err(Error::RootTypeMismatch { .. })
    ));
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
