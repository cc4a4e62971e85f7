//! Types that can live in a region across attachments.

use core::{
    any,
    mem::{align_of, size_of},
    num::{NonZeroU16, NonZeroU32, NonZeroU64, NonZeroU8, NonZeroUsize},
};

use allocator_api2::{boxed::Box, vec::Vec};

use crate::FileAllocator;

/// A structural identity of a type that is stable across processes running
/// the same build.
///
/// Computed as the 64-bit FNV-1a hash of the type's name, size and
/// alignment. Two distinct types with the same name, size and alignment
/// collide; this only happens across builds of different programs sharing
/// one file.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeIdentity(u64);

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash
}

impl TypeIdentity {
    /// The identity recorded for an empty slot. No type hashes to it in
    /// practice.
    pub(crate) const NONE: TypeIdentity = TypeIdentity(0);

    /// Returns the identity of `T`.
    pub fn of<T>() -> TypeIdentity {
        let mut hash = fnv1a(FNV_OFFSET_BASIS, any::type_name::<T>().as_bytes());
        hash = fnv1a(hash, &(size_of::<T>() as u64).to_le_bytes());
        hash = fnv1a(hash, &(align_of::<T>() as u64).to_le_bytes());

        TypeIdentity(hash)
    }

    /// Returns the raw hash value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Types whose values remain valid when the region holding them is mapped
/// again, possibly by another process.
///
/// # Safety
///
/// Implementors must not contain pointers or handles into process-local
/// memory: no references to memory outside the region, no file descriptors,
/// no heap allocations from the global allocator. Pointers into the region
/// itself are permitted, since a region is always mapped at the same
/// address. Values are never dropped by the registry, so `Drop` impls will
/// not run unless the caller drops them explicitly.
pub unsafe trait Persistent {}

macro_rules! persistent {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Persistent for $t {}
        )*
    };
}

persistent! {
    (), bool, char,
    u8, u16, u32, u64, u128, usize,
    i8, i16, i32, i64, i128, isize,
    f32, f64,
    NonZeroU8, NonZeroU16, NonZeroU32, NonZeroU64, NonZeroUsize,
    TypeIdentity,
}

macro_rules! persistent_tuple {
    ($($name:ident),+) => {
        unsafe impl<$($name: Persistent),+> Persistent for ($($name,)+) {}
    };
}

persistent_tuple!(A);
persistent_tuple!(A, B);
persistent_tuple!(A, B, C);
persistent_tuple!(A, B, C, D);

unsafe impl<T: Persistent, const N: usize> Persistent for [T; N] {}

unsafe impl<T: Persistent> Persistent for Option<T> {}

unsafe impl<T> Persistent for FileAllocator<T> {}

unsafe impl<T: Persistent, U> Persistent for Vec<T, FileAllocator<U>> {}

unsafe impl<T: Persistent, U> Persistent for Box<T, FileAllocator<U>> {}
