use std::ptr::NonNull;

use crate::{platform, Pointer};

/// The single contiguous region all chunks are carved out of. The arena only
/// ever grows, by appending at its high end, and nothing is ever given back
/// until the arena itself is dropped.
///
/// Contiguity is the whole point: chunk neighbors are found with pointer
/// arithmetic (see [`crate::chunk`]), which only works if consecutive
/// [`Arena::extend`] calls return adjacent bytes. A `brk`/`sbrk` style heap
/// would only give us that for a single arena per process, so instead each
/// arena reserves its own fixed range of address space on first use and
/// bumps a cursor through it. On demand-paged systems the untouched tail of
/// the reservation costs nothing.
pub(crate) struct Arena {
    /// Reservation start, or `None` until the first extension.
    base: Pointer<u8>,
    /// Bytes handed out so far. `base + length` is the current high end.
    length: usize,
    /// Reservation size; extending past it is the out-of-memory condition.
    capacity: usize,
}

impl Arena {
    /// Builds an arena that will reserve `capacity` bytes of address space
    /// when it is first extended. No memory is touched here.
    pub const fn new(capacity: usize) -> Self {
        Self {
            base: None,
            length: 0,
            capacity,
        }
    }

    /// Appends `amount` bytes at the high end of the arena and returns the
    /// address of the first new byte, or `None` when the reservation is (or
    /// cannot be) exhausted. Consecutive calls return adjacent addresses.
    pub unsafe fn extend(&mut self, amount: usize) -> Pointer<u8> {
        if amount > self.capacity - self.length {
            return None;
        }

        let base = match self.base {
            Some(base) => base,
            None => {
                let base = platform::reserve(self.capacity)?;
                self.base = Some(base);
                base
            }
        };

        let address = NonNull::new_unchecked(base.as_ptr().add(self.length));

        if !platform::commit(address, amount) {
            return None;
        }

        self.length += amount;

        Some(address)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            // Invalidates every chunk at once. Fine, because dropping the
            // arena means dropping the allocator that owns it.
            unsafe { platform::release(base, self.capacity) };
        }
    }
}
