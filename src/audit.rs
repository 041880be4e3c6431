use std::io::{self, Write};

use crate::{
    allocator::Bralloc,
    chunk::{Chunk, CHUNK_HEADER_SIZE, FOOTER_SIZE, MIN_PAYLOAD_SIZE},
    Pointer,
};

impl Bralloc {
    /// Dumps the complete allocator state into `out`: arena bounds, layout
    /// constants, every chunk in arena order and the free tree from its
    /// sentinel down.
    ///
    /// Diagnostic only. The format is meant for human eyes and is not a
    /// stable contract of any kind.
    pub fn audit(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "audit begin")?;
        writeln!(out, "header pad: {CHUNK_HEADER_SIZE}")?;
        writeln!(out, "footer pad: {FOOTER_SIZE}")?;
        writeln!(out, "node pad: {MIN_PAYLOAD_SIZE}")?;

        let Some(tree) = &self.tree else {
            writeln!(out, "uninitialized, no allocation made yet")?;
            return writeln!(out, "audit end");
        };

        writeln!(out, "sentinel: {:?}", tree.sentinel())?;
        writeln!(out, "first chunk: {:?}", self.first_chunk)?;
        writeln!(out, "guard: {:?}", self.guard)?;

        unsafe {
            for chunk in self.chunks() {
                let size = chunk.as_ref().size;
                let in_use = chunk.as_ref().in_use;

                writeln!(
                    out,
                    "    chunk: {:?} size: {} in_use: {} footer size: {}",
                    chunk,
                    size,
                    in_use,
                    Chunk::footer_of(chunk).as_ref().size,
                )?;

                // A free payload holds the chunk's tree node, dump it too.
                if !in_use {
                    let node = Chunk::node_of(chunk);
                    writeln!(
                        out,
                        "        node parent: {:?} left: {:?} right: {:?}",
                        node.as_ref().parent,
                        node.as_ref().left,
                        node.as_ref().right,
                    )?;
                }
            }

            writeln!(out, "free tree:")?;
            dump_tree(out, Some(tree.sentinel()), 1)?;
        }

        writeln!(out, "audit end")
    }
}

/// Renders the subtree under `chunk` in order, one node per line, indented
/// by tree depth so the shape stays readable.
unsafe fn dump_tree(out: &mut dyn Write, chunk: Pointer<Chunk>, depth: usize) -> io::Result<()> {
    let pad = depth * 4;

    let Some(chunk) = chunk else {
        return writeln!(out, "{:pad$}(none)", "");
    };

    let node = Chunk::node_of(chunk);
    dump_tree(out, node.as_ref().left, depth + 1)?;

    writeln!(
        out,
        "{:pad$}chunk: {:?} size: {}",
        "",
        chunk,
        chunk.as_ref().size,
    )?;

    dump_tree(out, node.as_ref().right, depth + 1)
}
