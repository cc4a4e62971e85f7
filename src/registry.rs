//! Keyed, typed roots.

use core::{any, num::NonZeroUsize, ptr::NonNull};

use allocator_api2::vec::Vec;
use log::debug;

#[cfg(not(feature = "unstable"))]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    persist::{Persistent, TypeIdentity},
    Error, FileAllocator, Region,
};

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct Entry {
    key: u64,
    identity: TypeIdentity,
    addr: NonZeroUsize,
}

// SAFETY: `addr` points into the region.
unsafe impl Persistent for Entry {}

/// Sorted by key. Lives in the region's root slot.
type Index = Vec<Entry, FileAllocator<Entry>>;

/// A map from integer keys to typed objects living in a region.
///
/// The index itself is stored in the region, so objects acquired in one
/// process can be acquired again, by key, after the file is attached anew.
/// Each key is bound to the type it was first acquired with.
///
/// Objects are never dropped or deallocated individually; only
/// [`reset_file`](ObjectRegistry::reset_file) discards them, all at once.
///
/// # Example
///
/// ```no_run
/// use infile_alloc::{ObjectRegistry, Region, RegionConfig};
/// use allocator_api2::vec::Vec;
///
/// let config = RegionConfig::new(0x6000_0000_0000, 1 << 24)?;
/// let region = unsafe { Region::open("objects.bin", config)? };
/// let mut registry = ObjectRegistry::new(region)?;
///
/// let alloc = registry.allocator::<u32>();
/// let numbers = registry.acquire(1, || Vec::new_in(alloc))?;
/// numbers.push(7);
/// # Ok::<(), infile_alloc::Error>(())
/// ```
#[derive(Debug)]
pub struct ObjectRegistry {
    region: Region,
    index: NonNull<Index>,
}

impl ObjectRegistry {
    /// Opens the registry of `region`, creating an empty one if the region
    /// has no root yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RootTypeMismatch`] if the region's root slot holds
    /// something other than a registry, and [`Error::OutOfCapacity`] if an
    /// empty registry cannot be allocated.
    pub fn new(region: Region) -> Result<ObjectRegistry, Error> {
        let index = Self::open_index(&region)?;

        Ok(ObjectRegistry { region, index })
    }

    fn open_index(region: &Region) -> Result<NonNull<Index>, Error> {
        let alloc = region.allocator::<Entry>();

        region.get_or_create_root(|| Vec::new_in(alloc))
    }

    #[inline]
    fn index(&self) -> &Index {
        // SAFETY: the index lives in the region, which `self` keeps mapped.
        unsafe { self.index.as_ref() }
    }

    /// Returns the object bound to `key`, creating it with `init` if the key
    /// is unbound.
    ///
    /// `init` runs only when the key is unbound; a bound key returns the
    /// existing object unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::TypeMismatch`] if `key` is bound to a type other than `T`.
    ///   The existing binding is unaffected.
    /// - [`Error::RegistryFull`] if the index cannot grow to hold a new key.
    /// - The errors of [`FileAllocator::allocate`] if the object cannot be
    ///   allocated.
    pub fn acquire<T, F>(&mut self, key: u64, init: F) -> Result<&mut T, Error>
    where
        T: Persistent,
        F: FnOnce() -> T,
    {
        let identity = TypeIdentity::of::<T>();

        // SAFETY: the index lives in the region and `&mut self` guarantees no
        // other borrow of it.
        let index = unsafe { self.index.as_mut() };

        let pos = match index.binary_search_by_key(&key, |entry| entry.key) {
            Ok(pos) => {
                let entry = index[pos];

                if entry.identity != identity {
                    return Err(Error::TypeMismatch {
                        key,
                        requested: any::type_name::<T>(),
                    });
                }

                let ptr = self.region.base().with_addr(entry.addr).cast::<T>();

                // SAFETY: the entry was recorded with a constructed `T`, and
                // the returned borrow is tied to `&mut self`.
                return Ok(unsafe { &mut *ptr.as_ptr() });
            }

            Err(pos) => pos,
        };

        index.try_reserve(1).map_err(|_| Error::RegistryFull)?;

        let alloc = self.region.allocator::<T>();
        let ptr = alloc.allocate(1)?;

        // SAFETY: `ptr` is a fresh allocation sized and aligned for `T`.
        unsafe { alloc.construct(ptr, init()) };

        index.insert(
            pos,
            Entry {
                key,
                identity,
                addr: ptr.addr(),
            },
        );

        debug!("bound key {key} to {} at {:p}", any::type_name::<T>(), ptr);

        // SAFETY: just constructed, and tied to `&mut self`.
        Ok(unsafe { &mut *ptr.as_ptr() })
    }

    /// Returns whether `key` is bound.
    pub fn contains_key(&self, key: u64) -> bool {
        self.index()
            .binary_search_by_key(&key, |entry| entry.key)
            .is_ok()
    }

    /// Returns the number of bound keys.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    /// Returns whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// Discards every object in the region, including those reached by other
    /// means than this registry, and starts over with an empty registry.
    ///
    /// # Safety
    ///
    /// See [`Region::reset`]. No pointer into the region, from this registry
    /// or any clone of its region, may be used afterwards.
    pub unsafe fn reset_file(&mut self) -> Result<(), Error> {
        unsafe { self.region.reset()? };
        self.index = Self::open_index(&self.region)?;

        Ok(())
    }

    /// Returns an allocator handle for values of type `T` in the registry's
    /// region.
    #[inline]
    pub fn allocator<T>(&self) -> FileAllocator<T> {
        self.region.allocator()
    }

    /// Returns the registry's region.
    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }
}
