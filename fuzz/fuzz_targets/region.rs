#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use infile_alloc::{RegionConfig, PAGE_SIZE};
use infile_alloc_hater::{RegionOp, RegionSubject};
use libfuzzer_sys::fuzz_target;

const ADDRESS: usize = 0x6000_0000_0000;
const MAX_PAGES: usize = 1 << 14;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    pages: u16,
    ops: Vec<AllocatorOp<RegionOp>>,
}

fuzz_target!(|args: Args| {
    let pages = (args.pages as usize % MAX_PAGES).max(1);
    let config = RegionConfig::new(ADDRESS, pages * PAGE_SIZE).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let subject = unsafe { RegionSubject::new(dir.path().join("fuzz.bin"), config) }.unwrap();

    let mut evaluator = Evaluator::new(subject);
    if let Err(failed) = evaluator.evaluate(args.ops) {
        panic!("{failed:#?}");
    }
});
