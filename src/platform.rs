use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The arena needs one
/// contiguous range of address space that it can fill up from the low end,
/// so the platform has to offer three things: reserve a range, make a piece
/// of it usable, and give the whole range back. It doesn't care about the
/// APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Reserves `capacity` bytes of contiguous address space. The memory is
    /// not necessarily usable yet, see [`Self::commit`].
    unsafe fn reserve(capacity: usize) -> Pointer<u8>;

    /// Makes `length` bytes starting at `address` readable and writable.
    /// `address` must lie inside a reservation. Returns whether it worked.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns an entire reservation to the kernel. `address` and `capacity`
    /// must be exactly the values the reservation was created with.
    unsafe fn release(address: NonNull<u8>, capacity: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Convinience wrapper for [`PlatformSpecificMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(capacity: usize) -> Pointer<u8> {
    Platform::reserve(capacity)
}

/// Convinience wrapper for [`PlatformSpecificMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

/// Convinience wrapper for [`PlatformSpecificMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, capacity: usize) {
    Platform::release(address, capacity)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    /// On Linux we can ask `mmap` not to back the reservation with swap
    /// until pages are actually touched, which makes large reservations
    /// cheap. Other unixes overcommit anonymous mappings anyway.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NORESERVE: libc::c_int = 0;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(capacity: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | NORESERVE;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let address = libc::mmap(ptr::null_mut(), capacity, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            // The reservation is already mapped read-write; the kernel
            // commits pages on first touch.
            true
        }

        unsafe fn release(address: NonNull<u8>, capacity: usize) {
            if libc::munmap(address.cast().as_ptr(), capacity) != 0 {
                // Nothing sensible to do, the mapping just stays alive.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{ffi::c_void, ptr::NonNull};

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(capacity: usize) -> Pointer<u8> {
            // Unlike mmap, VirtualAlloc separates reserving address space
            // from committing usable pages, which is exactly the split this
            // module's interface wants. Reserve everything up front with no
            // access rights; commit happens as the arena grows.
            let address = Memory::VirtualAlloc(
                None,
                capacity,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            NonNull::new(address.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            // Committing is idempotent per page, so we don't need to round
            // `length` ourselves. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(
                Some(address.as_ptr() as *const c_void),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            !address.is_null()
        }

        unsafe fn release(address: NonNull<u8>, _capacity: usize) {
            // MEM_RELEASE requires a length of 0 and frees the whole
            // reservation, committed or not.
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                // Same problem as munmap, the reservation stays alive.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock the reservation. This is also useful for detecting leaks in our
    //! own allocator: an arena that is dropped without releasing its
    //! reservation shows up in Miri's output.

    use std::{alloc, mem, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(capacity: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(capacity, mem::size_of::<usize>()).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(capacity: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(capacity)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn release(address: NonNull<u8>, capacity: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(capacity));
        }
    }
}
