//! Polyfills for strict-provenance pointer methods.
//!
//! Region metadata stores block addresses as plain integers; every pointer to
//! a block is rebuilt from the mapping's base pointer with these methods so it
//! keeps the provenance of the mapping.
//!
//! Toolchains that provide these methods inherently never reach the traits,
//! so their imports are allowed to go unused.

#![cfg(not(feature = "unstable"))]

use core::{num::NonZeroUsize, ptr::NonNull};

#[allow(unused_imports)]
pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `ptr::with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_addr_round_trips() {
        let mut word = 0u64;
        let ptr = NonNull::from(&mut word).cast::<u8>();
        let addr = ptr.addr();

        let moved = ptr.with_addr(NonZeroUsize::new(addr.get() + 4).unwrap());
        assert_eq!(moved.addr().get(), addr.get() + 4);
        assert_eq!(moved.with_addr(addr), ptr);
    }
}
