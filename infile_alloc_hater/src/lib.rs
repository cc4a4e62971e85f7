#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, path::PathBuf, ptr::NonNull};

use alloc_hater::Subject;
use allocator_api2::alloc::{AllocError, Allocator};
use infile_alloc::{Error, FileAllocator, Region, RegionConfig};

/// Region-specific operations.
#[derive(Clone, Copy, Debug, arbitrary::Arbitrary)]
pub enum RegionOp {
    /// Detaches the file and attaches it again at the same address.
    Reattach,
}

pub struct RegionSubject {
    path: PathBuf,
    config: RegionConfig,
    // Only `None` while reattaching.
    region: Option<Region>,
}

impl RegionSubject {
    /// Attaches the file at `path`, creating it if needed.
    ///
    /// # Safety
    ///
    /// The file must be empty or have been produced by `infile_alloc` with
    /// `config`, and nothing else may use it while the subject is alive.
    pub unsafe fn new(path: impl Into<PathBuf>, config: RegionConfig) -> Result<Self, Error> {
        let path = path.into();
        let region = unsafe { Region::open(&path, config)? };

        Ok(RegionSubject {
            path,
            config,
            region: Some(region),
        })
    }

    pub fn region(&self) -> &Region {
        self.region.as_ref().expect("region detached")
    }

    fn allocator(&self) -> FileAllocator {
        self.region().allocator()
    }

    fn reattach(&mut self) {
        // The old mapping must be gone before the address can be mapped again.
        drop(self.region.take());

        let region = unsafe { Region::open(&self.path, self.config) }
            .unwrap_or_else(|e| panic!("reattaching {} failed: {e}", self.path.display()));

        self.region = Some(region);
    }
}

impl Subject for RegionSubject {
    type Op = RegionOp;
    type AllocError = AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError> {
        Allocator::allocate(&self.allocator(), layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { Allocator::deallocate(&self.allocator(), ptr, layout) };
    }

    fn handle_custom_op(&mut self, op: RegionOp) {
        match op {
            RegionOp::Reattach => self.reattach(),
        }
    }
}
