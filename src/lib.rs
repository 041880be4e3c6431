//! General purpose memory allocator that serves variable-size requests from
//! a single contiguous arena and keeps its free chunks in a size-ordered
//! binary search tree. The tree nodes are not allocated anywhere, they are
//! written into the payload bytes of the free chunks themselves, so the
//! allocator's only memory cost is the per-chunk header and footer. Adjacent
//! free chunks are merged on [`Bralloc::free`] and oversized chunks are split
//! on [`Bralloc::allocate`] whenever the remainder is big enough to be
//! tracked.
//!
//! Start reading at [`crate::chunk`] for the memory layout, then
//! [`crate::tree`] for the free tree and [`crate::allocator`] for how both
//! are driven.
//!
//! # Example
//!
//! ```rust
//! use bralloc::Bralloc;
//!
//! let mut allocator = Bralloc::new();
//!
//! let address = allocator.allocate(64).unwrap();
//!
//! unsafe {
//!     address.as_ptr().write_bytes(0xAB, 64);
//!     allocator.free(address);
//! }
//! ```
//!
//! The allocator is single threaded and non-reentrant: every operation takes
//! `&mut self` and callers that share an instance across threads must provide
//! their own mutual exclusion.

use std::{error::Error, fmt, ptr::NonNull};

mod align;
mod allocator;
mod arena;
mod audit;
mod chunk;
mod platform;
mod tree;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for the allocation return type.
pub type AllocResult = Result<NonNull<u8>, AllocError>;

pub use allocator::Bralloc;

/// Returned by [`Bralloc::allocate`] when the arena cannot grow any further.
/// This is the only error the allocator ever reports; caller misuse such as
/// double frees is undefined behaviour, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("arena memory exhausted")
    }
}

impl Error for AllocError {}
