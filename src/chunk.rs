use std::{mem, ptr::NonNull};

use crate::tree::FreeNode;

/// Chunk header size in bytes. See [`Chunk`].
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<Chunk>();

/// Chunk footer size in bytes. See [`Footer`].
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<Footer>();

/// Minimum payload size in bytes. A free chunk stores a [`FreeNode`] in its
/// payload, so no chunk may ever have a payload smaller than that. Requests
/// below this size are rounded up by the allocator.
pub(crate) const MIN_PAYLOAD_SIZE: usize = mem::size_of::<FreeNode>();

/// The universal storage unit of the arena. The arena is a seamless sequence
/// of chunks, each laid out as header, payload and footer:
///
/// ```text
/// +--------------------------+  <- chunk address
/// | payload size             |  <---+
/// +--------------------------+      | Chunk (header)
/// | in use flag              |      |
/// +--------------------------+      |
/// | padding (word alignment) |  <---+
/// +--------------------------+
/// |         Payload          |  <---+
/// |           ...            |      | User data while the chunk is in use,
/// |           ...            |      | a FreeNode while the chunk is free.
/// |           ...            |  <---+
/// +--------------------------+
/// | payload size (again)     |  <- Footer
/// +--------------------------+
/// ```
///
/// The payload size is duplicated in the footer so that the chunk sitting
/// immediately *before* this one in the arena can be found in constant time:
/// the bytes right before any header are the previous chunk's footer, and
/// the footer's size field tells us how far back that chunk's header is.
/// That lookup is what makes backward coalescing cheap, see
/// [`crate::allocator`].
///
/// This struct is only the header; payload and footer are reached with
/// pointer arithmetic through the associated functions below. All of them
/// take and return [`NonNull`] instead of going through `&self` references
/// so that we never materialize references to memory the caller may also be
/// holding pointers into (Miri's stacked borrows is unforgiving about that).
#[repr(C)]
pub(crate) struct Chunk {
    /// Payload size in bytes, excluding header and footer. Always a multiple
    /// of the machine word.
    pub size: usize,
    /// Whether the payload currently holds user data.
    pub in_use: bool,
}

/// Chunk trailer. Carries a copy of [`Chunk::size`], nothing else. See the
/// layout diagram at [`Chunk`].
#[repr(C)]
pub(crate) struct Footer {
    pub size: usize,
}

impl Chunk {
    /// Returns the chunk whose payload starts at `address`.
    ///
    /// # Safety
    ///
    /// `address` must point exactly to the first payload byte of a live
    /// chunk. This is mostly used on pointers the allocator previously
    /// returned; anything else is undefined behaviour.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().sub(CHUNK_HEADER_SIZE).cast())
    }

    /// Returns the address of the first payload byte of `chunk`.
    #[inline]
    pub unsafe fn payload_address_of(chunk: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().add(CHUNK_HEADER_SIZE))
    }

    /// Reinterprets the payload of `chunk` as a free tree node. Only
    /// meaningful while the chunk is free; the node and the user data share
    /// the same bytes.
    #[inline]
    pub unsafe fn node_of(chunk: NonNull<Self>) -> NonNull<FreeNode> {
        Self::payload_address_of(chunk).cast()
    }

    /// Returns the footer of `chunk`, located `chunk.size` bytes past the
    /// payload start.
    #[inline]
    pub unsafe fn footer_of(chunk: NonNull<Self>) -> NonNull<Footer> {
        let size = chunk.as_ref().size;
        NonNull::new_unchecked(Self::payload_address_of(chunk).as_ptr().add(size).cast())
    }

    /// Returns the first byte past the footer of `chunk`. Unless `chunk` is
    /// the last chunk in the arena, this is the header address of its
    /// successor.
    #[inline]
    pub unsafe fn after(chunk: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(Self::footer_of(chunk).as_ptr().cast::<u8>().add(FOOTER_SIZE))
    }

    /// Sets the payload size of `chunk`, keeping header and footer in
    /// agreement. The footer is written raw because the bytes at the new
    /// footer position may be uninitialized payload.
    #[inline]
    pub unsafe fn set_size(chunk: NonNull<Self>, size: usize) {
        (*chunk.as_ptr()).size = size;
        Self::footer_of(chunk).as_ptr().write(Footer { size });
    }

    /// Chunk size including header and footer. This is also the distance
    /// between this chunk's address and its successor's.
    #[inline]
    pub fn total_size(&self) -> usize {
        CHUNK_HEADER_SIZE + self.size + FOOTER_SIZE
    }
}

impl Footer {
    /// Returns the chunk this footer belongs to, `footer.size` payload bytes
    /// plus one header behind the footer itself. This is the constant-time
    /// backward step described at [`Chunk`].
    ///
    /// # Safety
    ///
    /// `footer` must point to the footer of a live chunk.
    #[inline]
    pub unsafe fn chunk_of(footer: NonNull<Self>) -> NonNull<Chunk> {
        let size = footer.as_ref().size;
        NonNull::new_unchecked(
            footer
                .as_ptr()
                .cast::<u8>()
                .sub(size + CHUNK_HEADER_SIZE)
                .cast(),
        )
    }
}
