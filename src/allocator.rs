use std::{iter, ptr::NonNull};

use crate::{
    align::{align, WORD_SIZE},
    arena::Arena,
    chunk::{Chunk, Footer, CHUNK_HEADER_SIZE, FOOTER_SIZE, MIN_PAYLOAD_SIZE},
    tree::{FreeNode, FreeTree},
    AllocError, AllocResult, Pointer,
};

/// Address space reserved by [`Bralloc::new`]. On demand-paged systems only
/// the pages the arena actually grows into ever cost anything.
#[cfg(not(miri))]
const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

/// Miri mocks the reservation with a real allocation, so keep it small.
#[cfg(miri)]
const DEFAULT_CAPACITY: usize = 1 << 20;

/// Hard cap on a single request. Anything above this would overflow the
/// chunk arithmetic once headers and rounding are added, so it is rejected
/// upfront as out of memory.
const MAX_REQUEST_SIZE: usize =
    isize::MAX as usize - (CHUNK_HEADER_SIZE + FOOTER_SIZE + MIN_PAYLOAD_SIZE + WORD_SIZE);

/// Rounds a request up to a word multiple and raises it to the minimum
/// payload, so that the chunk can hold a tree node once it is freed.
/// `None` for sizes so large the chunk math would overflow.
fn round_request(size: usize) -> Option<usize> {
    if size > MAX_REQUEST_SIZE {
        return None;
    }

    Some(align(size).max(MIN_PAYLOAD_SIZE))
}

/// General purpose allocator over a single contiguous arena. Free chunks are
/// kept in a size-ordered tree ([`crate::tree::FreeTree`]) whose nodes live
/// inside the free chunks themselves, neighbors are merged on [`free`] and
/// oversized chunks are split on [`allocate`].
///
/// The first allocation reserves the arena's address space and plants the
/// tree's sentinel chunk; constructing the allocator costs nothing.
///
/// Not thread safe: all operations take `&mut self` and the struct is
/// deliberately neither `Send` nor `Sync`. Callers that want to share an
/// instance must wrap it in their own lock.
///
/// [`allocate`]: Bralloc::allocate
/// [`free`]: Bralloc::free
///
/// # Examples
///
/// ```rust
/// use bralloc::Bralloc;
///
/// let mut allocator = Bralloc::new();
///
/// // The returned address is word aligned and good for at least 128 bytes.
/// let address = allocator.allocate(128).unwrap();
///
/// unsafe {
///     address.as_ptr().write_bytes(69, 128);
///     assert_eq!(*address.as_ptr(), 69);
///     allocator.free(address);
/// }
/// ```
pub struct Bralloc {
    /// The backing reservation. See [`Arena`].
    arena: Arena,
    /// Free tree, created together with its sentinel on the first
    /// allocation.
    pub(crate) tree: Option<FreeTree>,
    /// Header of the first real chunk. The sentinel sits before it but has
    /// no footer and takes no part in the chunk sequence, so arena walks
    /// start here.
    pub(crate) first_chunk: Pointer<Chunk>,
    /// One byte past the last chunk's footer. Comparing against this is the
    /// only way to know a chunk is the last one.
    pub(crate) guard: Pointer<u8>,
}

impl Bralloc {
    /// Builds an allocator with the default arena capacity. Nothing is
    /// reserved or touched until the first allocation.
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Builds an allocator whose arena can grow up to `capacity` bytes,
    /// headers included. Exhausting it is the out-of-memory condition.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
            tree: None,
            first_chunk: None,
            guard: None,
        }
    }

    /// Returns the address of a word-aligned payload that can hold at least
    /// `size` bytes, or [`AllocError`] if the arena cannot satisfy the
    /// request. Requests smaller than the minimum payload, the size of a
    /// tree node, are rounded up to it; that includes requests of size 0.
    ///
    /// The payload stays valid until it is passed to [`Bralloc::free`] or
    /// the allocator is dropped, whichever comes first.
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        let Some(size) = round_request(size) else {
            return Err(AllocError);
        };

        unsafe {
            self.init_sentinel()?;
            let tree = self.tree.as_mut().unwrap();

            let mut chunk = match tree.take_fit(size) {
                Some(chunk) => {
                    Self::split_if_possible(tree, chunk, size);
                    chunk
                }
                // Nothing in the tree is big enough, grow the arena by one
                // fresh chunk instead.
                None => {
                    let address = self
                        .arena
                        .extend(CHUNK_HEADER_SIZE + size + FOOTER_SIZE)
                        .ok_or(AllocError)?;

                    let chunk = address.cast::<Chunk>();
                    chunk.as_ptr().write(Chunk {
                        size,
                        in_use: false,
                    });
                    Chunk::footer_of(chunk).as_ptr().write(Footer { size });

                    if self.first_chunk.is_none() {
                        self.first_chunk = Some(chunk);
                    }
                    self.guard = Some(Chunk::after(chunk));

                    chunk
                }
            };

            chunk.as_mut().in_use = true;

            Ok(Chunk::payload_address_of(chunk))
        }
    }

    /// Gives the payload at `address` back to the allocator, merging it with
    /// its arena neighbors when they are free.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Bralloc::allocate`] on this
    /// same instance and not freed since. The caller must not touch the
    /// payload afterwards; its bytes are immediately reused for tree
    /// metadata. Double frees and foreign pointers are undefined behaviour,
    /// they are not detected.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let tree = self.tree.as_mut().unwrap();
        let mut chunk = Chunk::from_payload_address(address);

        // Backward coalesce. Unless this is the very first chunk, the bytes
        // right before its header are the predecessor's footer, which leads
        // to the predecessor's header in constant time. If that chunk is
        // free, it swallows the one being freed.
        if self.first_chunk != Some(chunk) {
            let footer = NonNull::new_unchecked(
                chunk.as_ptr().cast::<u8>().sub(FOOTER_SIZE).cast::<Footer>(),
            );
            let prev = Footer::chunk_of(footer);

            if !prev.as_ref().in_use {
                tree.remove(prev);
                Chunk::set_size(prev, prev.as_ref().size + chunk.as_ref().total_size());
                chunk = prev;
            }
        }

        // Forward coalesce. The byte past the footer is the successor's
        // header, unless it is the guard address and no successor exists.
        let end = Chunk::after(chunk);
        if self.guard != Some(end) {
            let next = end.cast::<Chunk>();

            if !next.as_ref().in_use {
                tree.remove(next);
                Chunk::set_size(chunk, chunk.as_ref().size + next.as_ref().total_size());
            }
        }

        chunk.as_mut().in_use = false;
        tree.insert(chunk);
    }

    /// Plants the sentinel chunk and the free tree on the first allocation.
    /// The sentinel is header plus node only, no footer: it never takes part
    /// in the chunk sequence, it only anchors the tree.
    unsafe fn init_sentinel(&mut self) -> Result<(), AllocError> {
        if self.tree.is_some() {
            return Ok(());
        }

        let address = self
            .arena
            .extend(CHUNK_HEADER_SIZE + MIN_PAYLOAD_SIZE)
            .ok_or(AllocError)?;

        let sentinel = address.cast::<Chunk>();
        sentinel.as_ptr().write(Chunk {
            size: 0,
            in_use: false,
        });
        Chunk::node_of(sentinel).as_ptr().write(FreeNode {
            parent: None,
            left: None,
            right: None,
        });

        self.tree = Some(FreeTree::new(sentinel));

        Ok(())
    }

    /// Chunk splitting algorithm. Say a request for 8 usable bytes is served
    /// from a free chunk that can hold 64:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Chunk   |     +-----------+
    ///         |     |  Payload  | <- 64 bytes.
    ///         |     +-----------+
    ///         |     |   Footer  |
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Chunk 1 |     +-----------+
    ///         |     |  Payload  | <- 8 bytes.
    ///         |     +-----------+
    ///         |     |   Footer  |
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Chunk 2 |     +-----------+
    ///         |     |  Payload  | <- 64 - 8 bytes minus the new headers.
    ///         |     +-----------+
    ///         |     |   Footer  |
    ///         +-->  +-----------+
    /// ```
    ///
    /// Chunk 2 goes straight back into the tree. When the leftover is too
    /// small to hold its own headers plus a tree node nothing happens and
    /// the excess stays inside chunk 1, untracked until the chunk is freed.
    unsafe fn split_if_possible(tree: &mut FreeTree, chunk: NonNull<Chunk>, size: usize) {
        if chunk.as_ref().size < size + FOOTER_SIZE + CHUNK_HEADER_SIZE + MIN_PAYLOAD_SIZE {
            return;
        }

        let rest = NonNull::new_unchecked(
            chunk
                .as_ptr()
                .cast::<u8>()
                .add(CHUNK_HEADER_SIZE + size + FOOTER_SIZE)
                .cast::<Chunk>(),
        );

        rest.as_ptr().write(Chunk {
            size: chunk.as_ref().size - size - FOOTER_SIZE - CHUNK_HEADER_SIZE,
            in_use: false,
        });
        Chunk::footer_of(rest).as_ptr().write(Footer {
            size: rest.as_ref().size,
        });

        tree.insert(rest);

        // The found chunk can only hold `size` bytes from now on.
        Chunk::set_size(chunk, size);
    }

    /// Walks the arena in address order, yielding every real chunk from
    /// `first_chunk` up to the guard address.
    pub(crate) unsafe fn chunks(&self) -> impl Iterator<Item = NonNull<Chunk>> {
        let guard = self.guard;
        let mut current = self.first_chunk;

        iter::from_fn(move || {
            let chunk = current?;
            let end = Chunk::after(chunk);
            current = (Some(end) != guard).then(|| end.cast::<Chunk>());
            Some(chunk)
        })
    }
}

impl Default for Bralloc {
    fn default() -> Self {
        Bralloc::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walks the arena checking seamlessness, header/footer agreement and
    /// that no two free chunks are adjacent. Returns `(chunk, size, in_use)`
    /// for every chunk in address order.
    unsafe fn check_arena(allocator: &Bralloc) -> Vec<(NonNull<Chunk>, usize, bool)> {
        let mut chunks: Vec<(NonNull<Chunk>, usize, bool)> = Vec::new();
        let mut previous_free = false;

        for chunk in allocator.chunks() {
            let size = chunk.as_ref().size;
            let in_use = chunk.as_ref().in_use;

            assert_eq!(Chunk::footer_of(chunk).as_ref().size, size);
            assert!(
                in_use || !previous_free,
                "two adjacent free chunks at {chunk:?}"
            );
            if let Some(&(previous, ..)) = chunks.last() {
                assert_eq!(Chunk::after(previous).cast(), chunk, "gap in the arena");
            }

            previous_free = !in_use;
            chunks.push((chunk, size, in_use));
        }

        if let Some(&(last, ..)) = chunks.last() {
            assert_eq!(Some(Chunk::after(last)), allocator.guard);
        }

        chunks
    }

    /// Collects every chunk reachable from the sentinel, checking BST order
    /// and parent back-pointers along the way.
    unsafe fn check_tree(allocator: &Bralloc) -> Vec<NonNull<Chunk>> {
        let mut reachable = Vec::new();

        if let Some(tree) = &allocator.tree {
            collect(tree.root(), &mut reachable);
        }

        reachable
    }

    unsafe fn collect(chunk: Pointer<Chunk>, out: &mut Vec<NonNull<Chunk>>) {
        let Some(chunk) = chunk else { return };
        out.push(chunk);

        let node = Chunk::node_of(chunk);
        if let Some(left) = node.as_ref().left {
            assert_eq!(Chunk::node_of(left).as_ref().parent, Some(chunk));
            assert!(left.as_ref().size <= chunk.as_ref().size);
            collect(Some(left), out);
        }
        if let Some(right) = node.as_ref().right {
            assert_eq!(Chunk::node_of(right).as_ref().parent, Some(chunk));
            assert!(right.as_ref().size >= chunk.as_ref().size);
            collect(Some(right), out);
        }
    }

    /// The set of free chunks found by walking the arena must be exactly the
    /// set of chunks reachable from the sentinel.
    unsafe fn check_invariants(allocator: &Bralloc) {
        let chunks = check_arena(allocator);

        let mut free: Vec<NonNull<Chunk>> = chunks
            .iter()
            .filter(|(.., in_use)| !in_use)
            .map(|&(chunk, ..)| chunk)
            .collect();
        let mut reachable = check_tree(allocator);

        free.sort();
        reachable.sort();
        assert_eq!(free, reachable);
    }

    #[test]
    fn first_allocation_extends_the_arena() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        let address = allocator.allocate(8).unwrap();
        assert_eq!(address.as_ptr() as usize % WORD_SIZE, 0);

        unsafe {
            let chunks = check_arena(&allocator);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].1, MIN_PAYLOAD_SIZE);
            assert!(chunks[0].2);

            // The tree holds nothing but its sentinel.
            let tree = allocator.tree.as_ref().unwrap();
            assert_eq!(tree.sentinel().as_ref().size, 0);
            assert_eq!(tree.root(), None);

            // The sentinel sits right before the first chunk.
            assert_eq!(
                Chunk::payload_address_of(tree.sentinel())
                    .as_ptr()
                    .add(MIN_PAYLOAD_SIZE),
                chunks[0].0.as_ptr().cast(),
            );
        }
    }

    #[test]
    fn tiny_requests_are_raised_to_the_minimum_payload() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        allocator.allocate(1).unwrap();
        allocator.allocate(0).unwrap();

        unsafe {
            for (_, size, _) in check_arena(&allocator) {
                assert_eq!(size, MIN_PAYLOAD_SIZE);
            }
        }
    }

    #[test]
    fn splitting_leaves_a_trackable_remainder() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        // Big enough that carving a minimum payload out of it leaves a
        // remainder the tree can track.
        let big = MIN_PAYLOAD_SIZE + FOOTER_SIZE + CHUNK_HEADER_SIZE + MIN_PAYLOAD_SIZE + 16;

        let first = allocator.allocate(big).unwrap();
        let _second = allocator.allocate(big).unwrap();

        unsafe {
            allocator.free(first);

            let reused = allocator.allocate(16).unwrap();
            assert_eq!(reused, first);

            let chunks = check_arena(&allocator);
            assert_eq!(chunks.len(), 3);

            // The reused chunk shrank to the rounded request and the
            // remainder became a free chunk between the two in-use ones.
            assert_eq!(chunks[0].1, MIN_PAYLOAD_SIZE);
            assert!(chunks[0].2);
            assert!(!chunks[1].2);
            assert_eq!(
                chunks[1].1,
                big - MIN_PAYLOAD_SIZE - FOOTER_SIZE - CHUNK_HEADER_SIZE
            );
            assert!(chunks[2].2);

            check_invariants(&allocator);
        }
    }

    #[test]
    fn untrackable_excess_stays_inside_the_chunk() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        // The excess after reuse is only one word, too small to split.
        let barely_bigger = MIN_PAYLOAD_SIZE + WORD_SIZE;

        let first = allocator.allocate(barely_bigger).unwrap();
        let _second = allocator.allocate(32).unwrap();

        unsafe {
            allocator.free(first);
            let reused = allocator.allocate(MIN_PAYLOAD_SIZE).unwrap();
            assert_eq!(reused, first);

            // Still two chunks; the first kept its original size.
            let chunks = check_arena(&allocator);
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0].1, barely_bigger);

            check_invariants(&allocator);
        }
    }

    #[test]
    fn freeing_the_middle_chunk_merges_all_three() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        let a = allocator.allocate(32).unwrap();
        let b = allocator.allocate(32).unwrap();
        let c = allocator.allocate(32).unwrap();

        unsafe {
            allocator.free(a);
            allocator.free(c);
            allocator.free(b);

            // a absorbed b backward, then the merged chunk absorbed c
            // forward: one big free chunk spanning all three plus the
            // headers that dissolved between them.
            let chunks = check_arena(&allocator);
            assert_eq!(chunks.len(), 1);
            assert!(!chunks[0].2);
            assert_eq!(
                chunks[0].1,
                3 * 32 + 2 * (FOOTER_SIZE + CHUNK_HEADER_SIZE)
            );

            assert_eq!(check_tree(&allocator).len(), 1);
        }
    }

    #[test]
    fn fit_search_takes_the_first_large_enough_chunk() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        // Three chunks of growing size, separated by in-use chunks so that
        // freeing them cannot coalesce anything.
        let small = allocator.allocate(16).unwrap();
        let _keep1 = allocator.allocate(8).unwrap();
        let medium = allocator.allocate(32).unwrap();
        let _keep2 = allocator.allocate(8).unwrap();
        let large = allocator.allocate(64).unwrap();

        unsafe {
            allocator.free(small);
            allocator.free(medium);
            allocator.free(large);

            // The rightward descent skips 16 and 32 and lands on 64, even
            // though nothing splits off (64 < 40 + headers + node).
            let reused = allocator.allocate(40).unwrap();
            assert_eq!(reused, large);

            let mut remaining: Vec<usize> = check_tree(&allocator)
                .iter()
                .map(|chunk| chunk.as_ref().size)
                .collect();
            remaining.sort();
            assert_eq!(
                remaining,
                vec![round_request(16).unwrap(), round_request(32).unwrap()]
            );
        }
    }

    #[test]
    fn exhausted_arena_reports_out_of_memory() {
        let mut allocator = Bralloc::with_capacity(4096);

        // Way past the capacity, right at the first allocation.
        assert_eq!(allocator.allocate(1 << 20), Err(AllocError));

        // Absurd requests don't get anywhere near the arena.
        assert_eq!(allocator.allocate(usize::MAX), Err(AllocError));

        let address = allocator.allocate(512).unwrap();
        let guard = allocator.guard;

        // A failed allocation mutates nothing.
        assert_eq!(allocator.allocate(1 << 20), Err(AllocError));
        assert_eq!(allocator.guard, guard);

        unsafe {
            check_invariants(&allocator);
            allocator.free(address);
            check_invariants(&allocator);
        }
    }

    #[test]
    fn free_restores_capacity() {
        let mut allocator = Bralloc::with_capacity(1 << 16);

        let keep = allocator.allocate(64).unwrap();
        let released = allocator.allocate(64).unwrap();

        unsafe {
            allocator.free(released);

            let free_bytes = |allocator: &Bralloc| {
                allocator
                    .chunks()
                    .filter(|chunk| !chunk.as_ref().in_use)
                    .map(|chunk| chunk.as_ref().size)
                    .sum::<usize>()
            };

            let before = free_bytes(&allocator);

            let address = allocator.allocate(48).unwrap();
            allocator.free(address);

            // Coalescing never loses capacity.
            assert!(free_bytes(&allocator) >= before);

            allocator.free(keep);
        }
    }

    #[test]
    fn mixed_workload_preserves_invariants() {
        let mut allocator = Bralloc::with_capacity(1 << 21);

        // Miri is really slow, but we don't need as many operations to find
        // bugs with it.
        let rounds = if cfg!(miri) { 60 } else { 3000 };

        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut state: u64 = 0x9E3779B97F4A7C15;

        unsafe {
            for round in 0..rounds {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let roll = (state >> 33) as usize;

                let guard_before = allocator.guard;

                if live.len() > 8 && roll % 3 == 0 {
                    let (address, size, fill) = live.swap_remove(roll % live.len());

                    // No other allocation is allowed to have scribbled over
                    // this payload.
                    for offset in 0..size {
                        assert_eq!(*address.as_ptr().add(offset), fill);
                    }

                    allocator.free(address);
                } else {
                    let size = 1 + roll % 200;
                    let address = allocator.allocate(size).unwrap();

                    let fill = (round % 251) as u8;
                    address.as_ptr().write_bytes(fill, size);
                    live.push((address, size, fill));
                }

                // The guard only ever moves up.
                assert!(allocator.guard >= guard_before);

                if round % 64 == 0 {
                    check_invariants(&allocator);
                }
            }

            for (address, ..) in live.drain(..) {
                allocator.free(address);
            }

            check_invariants(&allocator);

            // With everything freed the whole arena coalesces back into a
            // single chunk.
            assert_eq!(check_tree(&allocator).len(), 1);
        }
    }
}
