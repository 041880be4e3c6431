use std::{cmp::Ordering, ptr::NonNull};

use crate::{chunk::Chunk, Pointer};

/// See [`crate::chunk::Chunk`] first. When a chunk is free we use its payload
/// to store a binary search tree node, that is, three pointers linking the
/// chunk into a tree of _only_ free chunks keyed on their payload size. This
/// is how a free chunk looks like in memory:
///
/// ```text
/// +--------------------------+
/// | payload size             | <--+
/// +--------------------------+    | Chunk (header)
/// | in use flag (false)      | <--+
/// +--------------------------+
/// | pointer to parent chunk  | <--+
/// +--------------------------+    |
/// | pointer to left child    |    | FreeNode
/// +--------------------------+    |
/// | pointer to right child   | <--+
/// +--------------------------+
/// | rest of the payload      | <--+
/// |          ......          |    | Unused while free. Could be 0 bytes.
/// |          ......          | <--+
/// +--------------------------+
/// | payload size             | <- Footer
/// +--------------------------+
/// ```
///
/// The node does not know its own size, the chunk header right above it does,
/// and [`Chunk::node_of`] / [`Chunk::from_node`] convert between the two in
/// constant time. Since no chunk payload is ever smaller than a node (see
/// [`crate::chunk::MIN_PAYLOAD_SIZE`]), every free chunk can hold one.
///
/// Note that we never store pointers into the payload of an *in use* chunk
/// because the user also has pointers to those addresses and we don't want
/// aliasing. Once a chunk has been freed the user's pointers are dead by
/// contract, so the tree is free to take the bytes over.
#[repr(C)]
pub(crate) struct FreeNode {
    pub parent: Pointer<Chunk>,
    pub left: Pointer<Chunk>,
    pub right: Pointer<Chunk>,
}

/// Size-keyed binary search tree of all free chunks. Duplicate keys are
/// allowed and the tree makes no balance guarantees.
///
/// The tree hangs off a sentinel: a permanently free chunk of size 0 that is
/// created once at allocator initialization and never returned, coalesced or
/// handed to a caller. The real root is the sentinel's right child (every
/// real chunk has a payload larger than 0, so an ordinary descent from the
/// sentinel always goes right; the left slot stays empty forever). The
/// sentinel exists so that every real node has a parent, which spares
/// [`FreeTree::remove`] a null-parent special case.
///
/// Two alternation bits fight degeneration:
///
/// * equal keys descend left on odd equal comparisons and right on even
///   ones, so runs of same-size chunks don't pile up into a one-sided chain;
/// * two-child removals alternate between the predecessor and the successor
///   as the replacement, so repeated deletions don't drain one side.
///
/// Neither bit is needed for correctness, they only spread the tree out.
pub(crate) struct FreeTree {
    sentinel: NonNull<Chunk>,
    /// Descend left on the next equal-size comparison during insertion.
    insert_left: bool,
    /// Take the predecessor on the next two-child removal.
    replace_left: bool,
}

impl FreeTree {
    /// Builds a tree rooted at `sentinel`, which must be an initialized
    /// size-0 chunk with a zeroed node. All further accesses to the sentinel
    /// go through this struct.
    pub fn new(sentinel: NonNull<Chunk>) -> Self {
        Self {
            sentinel,
            insert_left: true,
            replace_left: false,
        }
    }

    pub fn sentinel(&self) -> NonNull<Chunk> {
        self.sentinel
    }

    /// The real root of the tree, if any chunk is free at all.
    pub unsafe fn root(&self) -> Pointer<Chunk> {
        Chunk::node_of(self.sentinel).as_ref().right
    }

    /// Links `chunk` into the tree and clears its in-use flag. The chunk's
    /// payload is overwritten with its new node.
    pub unsafe fn insert(&mut self, mut chunk: NonNull<Chunk>) {
        let size = chunk.as_ref().size;
        let mut current = self.sentinel;

        loop {
            let descend_left = match size.cmp(&current.as_ref().size) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => {
                    let left = self.insert_left;
                    self.insert_left = !left;
                    left
                }
            };

            let mut node = Chunk::node_of(current);
            let slot = if descend_left {
                node.as_ref().left
            } else {
                node.as_ref().right
            };

            let Some(next) = slot else {
                Chunk::node_of(chunk).as_ptr().write(FreeNode {
                    parent: Some(current),
                    left: None,
                    right: None,
                });
                if descend_left {
                    node.as_mut().left = Some(chunk);
                } else {
                    node.as_mut().right = Some(chunk);
                }
                chunk.as_mut().in_use = false;
                return;
            };

            current = next;
        }
    }

    /// Finds a chunk whose size is at least `size`, unlinks it and returns
    /// it. Returns `None` if no free chunk is big enough.
    ///
    /// This is not best fit: the descent starts at the root and only ever
    /// goes right, taking the first node that is large enough. A closer fit
    /// may exist further down the left side and will not be considered; what
    /// we get in exchange is a search bounded by the right spine.
    pub unsafe fn take_fit(&mut self, size: usize) -> Pointer<Chunk> {
        let mut current = self.root();

        while let Some(chunk) = current {
            if chunk.as_ref().size < size {
                current = Chunk::node_of(chunk).as_ref().right;
            } else {
                self.remove(chunk);
                return Some(chunk);
            }
        }

        None
    }

    /// Unlinks `chunk` from the tree. The chunk must currently be linked.
    /// Its node bytes are left behind as garbage, which is fine because the
    /// chunk is either about to be handed out or about to be re-inserted.
    pub unsafe fn remove(&mut self, chunk: NonNull<Chunk>) {
        let node = Chunk::node_of(chunk);
        // The sentinel guarantees a parent for every linked chunk.
        let parent = node.as_ref().parent.unwrap();

        match (node.as_ref().left, node.as_ref().right) {
            (None, None) => Self::replace_child(parent, chunk, None),
            (Some(only), None) | (None, Some(only)) => {
                let mut only_node = Chunk::node_of(only);
                only_node.as_mut().parent = Some(parent);
                Self::replace_child(parent, chunk, Some(only));
            }
            (Some(_), Some(_)) => {
                let replacement = self.pick_replacement(chunk);

                // The replacement sits at the far end of one of our
                // subtrees, so it has at most one child and this recursion
                // bottoms out in one of the arms above.
                self.remove(replacement);

                // Removing the replacement may have rewritten our child
                // pointers (it could have been a direct child), so read them
                // only now.
                let (left, right) = {
                    let node = node.as_ref();
                    (node.left, node.right)
                };

                Chunk::node_of(replacement).as_ptr().write(FreeNode {
                    parent: Some(parent),
                    left,
                    right,
                });
                if let Some(left) = left {
                    Chunk::node_of(left).as_mut().parent = Some(replacement);
                }
                if let Some(right) = right {
                    Chunk::node_of(right).as_mut().parent = Some(replacement);
                }
                Self::replace_child(parent, chunk, Some(replacement));
            }
        }
    }

    /// Rewrites the pointer `parent` holds to `child` so that it points at
    /// `new` instead.
    unsafe fn replace_child(parent: NonNull<Chunk>, child: NonNull<Chunk>, new: Pointer<Chunk>) {
        let mut node = Chunk::node_of(parent);
        if node.as_ref().left == Some(child) {
            node.as_mut().left = new;
        } else {
            node.as_mut().right = new;
        }
    }

    /// Picks the node that will take the place of `chunk` on a two-child
    /// removal, alternating between the largest chunk of the left subtree
    /// and the smallest chunk of the right one.
    unsafe fn pick_replacement(&mut self, chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        let node = Chunk::node_of(chunk);
        self.replace_left = !self.replace_left;

        if self.replace_left {
            Self::find_largest(node.as_ref().left.unwrap())
        } else {
            Self::find_smallest(node.as_ref().right.unwrap())
        }
    }

    /// Rightmost chunk of the subtree rooted at `chunk`.
    unsafe fn find_largest(mut chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        while let Some(right) = Chunk::node_of(chunk).as_ref().right {
            chunk = right;
        }
        chunk
    }

    /// Leftmost chunk of the subtree rooted at `chunk`.
    unsafe fn find_smallest(mut chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        while let Some(left) = Chunk::node_of(chunk).as_ref().left {
            chunk = left;
        }
        chunk
    }
}
