//! Persistent, file-backed allocation.
//!
//! This crate maps a file at a fixed virtual address and carves it into
//! power-of-two blocks with a binary-buddy allocator. Everything the
//! allocator knows lives in the file itself, so a region can be attached
//! again, by the same or by another process, and every object allocated in
//! it is found where it was left.
//!
//! - [`Region`] attaches a file and hands out raw blocks.
//! - [`FileAllocator`] is a typed, `Copy` handle implementing
//!   [`allocator_api2::alloc::Allocator`], so ordinary containers can keep
//!   their storage in the region.
//! - [`ObjectRegistry`] binds integer keys to typed root objects, which is how
//!   data is recovered after reattaching.
//!
//! ## File layout
//!
//! The first page of the file holds the allocator header: a magic value, the
//! declared capacity, the base address, a root slot, the backing store's
//! high-water mark and one free list per size class. Data pages follow and
//! are committed lazily, 64 KiB at a time for small blocks and one block at a
//! time for blocks of 64 KiB and larger.
//!
//! All links stored in the file are absolute addresses. A file must always be
//! mapped at the address it was created at.
//!
//! ## Concurrency
//!
//! A region assumes a single writer. [`Region`] is neither `Send` nor `Sync`,
//! and nothing coordinates processes attaching the same file.
//!
//! ## Feature flags
//!
//! - `sptr` (default): uses the [`sptr`] crate for strict-provenance pointer
//!   operations.
//! - `unstable`: uses nightly-only features instead, including the standard
//!   library's `Allocator` trait through `allocator-api2`.
//!
//! [`sptr`]: https://crates.io/crates/sptr

#![doc(html_root_url = "https://docs.rs/infile_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(feature = "unstable", feature(allocator_api))]
#![cfg_attr(
    all(feature = "unstable", not(feature = "sptr")),
    feature(strict_provenance)
)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

#[cfg(not(unix))]
compile_error!("infile_alloc requires a Unix target.");

#[cfg(not(any(feature = "sptr", feature = "unstable")))]
compile_error!("At least one of these crate features must be enabled: [\"sptr\", \"unstable\"].");

mod adapter;
mod base;
mod buddy;
mod header;
mod persist;
mod region;
mod registry;
mod store;
mod sys;

#[cfg(not(feature = "unstable"))]
mod polyfill;

#[cfg(test)]
mod tests;

use std::io;

pub use crate::{
    adapter::FileAllocator,
    buddy::MIN_BLOCK_SIZE,
    persist::{Persistent, TypeIdentity},
    region::{Region, RegionConfig},
    registry::ObjectRegistry,
};

/// The unit of file growth and of the header, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The error type for region operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing file would have to grow past the declared capacity.
    ///
    /// `requested` is the size of the growth, rounded up to whole pages.
    #[error("out of capacity: remaining {remaining} bytes, requested {requested} bytes")]
    OutOfCapacity {
        /// Bytes the file may still grow by.
        remaining: usize,
        /// Bytes the failed request needed.
        requested: usize,
    },

    /// Opening, growing or truncating the backing file failed.
    #[error("backing file I/O failed")]
    Io(#[from] io::Error),

    /// The file could not be mapped.
    #[error("failed to map region at {address:#x}")]
    Map {
        /// The requested address.
        address: usize,
        /// The error reported by the operating system.
        #[source]
        source: io::Error,
    },

    /// The file was mapped, but not at the requested address.
    #[error("region mapped at {actual:#x} instead of {requested:#x}")]
    Misplaced {
        /// The requested address.
        requested: usize,
        /// The address the operating system chose.
        actual: usize,
    },

    /// The file was created with a different capacity.
    #[error("capacity mismatch: file holds {stored} bytes, attached with {requested} bytes")]
    CapacityMismatch {
        /// The capacity recorded in the file.
        stored: usize,
        /// The capacity passed to attach.
        requested: usize,
    },

    /// The file was created at a different address.
    #[error("address mismatch: file was created at {stored:#x}, attached at {requested:#x}")]
    AddressMismatch {
        /// The address recorded in the file.
        stored: usize,
        /// The address passed to attach.
        requested: usize,
    },

    /// A [`RegionConfig`] was rejected.
    #[error("invalid region configuration: {0}")]
    InvalidConfig(&'static str),

    /// An allocation size overflowed, or its alignment exceeds [`PAGE_SIZE`].
    #[error("unsupported allocation layout")]
    Layout,

    /// A registry key is bound to a different type.
    #[error("key {key} is bound to a type other than {requested}")]
    TypeMismatch {
        /// The key that was acquired.
        key: u64,
        /// The name of the type it was acquired as.
        requested: &'static str,
    },

    /// The region's root slot holds a different type.
    #[error("region root is not a {requested}")]
    RootTypeMismatch {
        /// The name of the type the root was requested as.
        requested: &'static str,
    },

    /// The registry index could not grow.
    #[error("object registry index is full")]
    RegistryFull,
}
