use std::io;

use bralloc::Bralloc;

fn main() {
    let mut allocator = Bralloc::new();

    let first = allocator.allocate(24).unwrap();
    let second = allocator.allocate(512).unwrap();
    let third = allocator.allocate(64).unwrap();

    println!("allocated {first:?}, {second:?} and {third:?}");

    unsafe {
        second.as_ptr().write_bytes(69, 512);

        // Freeing the middle chunk leaves a hole between two in-use chunks;
        // the audit below shows it sitting in the free tree.
        allocator.free(second);
    }

    allocator.audit(&mut io::stdout()).unwrap();

    unsafe {
        allocator.free(first);
        allocator.free(third);
    }
}
