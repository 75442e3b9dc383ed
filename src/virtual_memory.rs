//! OS memory source for pages and big blocks.
//!
//! Pages have to be aligned to their own size so that a block address can be mapped
//! back to the page that owns it. `mmap` only guarantees OS page alignment, so aligned
//! mappings over-allocate and trim the slack on both sides.

use std::ptr::NonNull;

use once_cell::sync::Lazy;

use crate::{error::AllocError, utils::align_usize};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = determine_page_size();
    assert!(size.is_power_of_two(), "OS page size {} is not a power of two", size);
    size
});

/// OS virtual memory page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Length actually reserved for a request of `size` bytes.
pub fn mapping_length(size: usize) -> usize {
    align_usize(size, page_size())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn determine_page_size() -> usize {
            let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

            if val <= 0 {
                panic!("could not determine page size.");
            }

            val as usize
        }

        unsafe fn unmap_range(start: usize, end: usize) {
            let size = end - start;
            if size == 0 {
                return;
            }

            if libc::munmap(start as _, size) != 0 {
                panic!("munmap({:#x}, {:#x}) failed: {}", start, size, errno::errno());
            }
        }

        /// Maps `size` bytes of zeroed read-write memory aligned to `alignment`.
        pub fn map_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
            debug_assert!(alignment.is_power_of_two());
            let size = mapping_length(size);
            let alignment = alignment.max(page_size());
            let allocated_size = size
                .checked_add(alignment - page_size())
                .ok_or(AllocError::out_of_memory(size))?;

            unsafe {
                let addr = libc::mmap(
                    std::ptr::null_mut(),
                    allocated_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                    -1,
                    0,
                );

                if addr == libc::MAP_FAILED {
                    return Err(AllocError::OutOfMemory {
                        requested: size,
                        errno: Some(errno::errno()),
                    });
                }

                let base = addr as usize;
                let aligned_base = align_usize(base, alignment);

                unmap_range(base, aligned_base);
                unmap_range(aligned_base + size, base + allocated_size);

                Ok(NonNull::new_unchecked(aligned_base as *mut u8))
            }
        }

        /// Returns memory obtained from [`map_aligned`] to the OS.
        ///
        /// # Safety
        ///
        /// `address`, `size` and `alignment` must be exactly the values of a live mapping.
        pub unsafe fn unmap(address: NonNull<u8>, size: usize, alignment: usize) {
            let _ = alignment;
            let start = address.as_ptr() as usize;
            unmap_range(start, start + mapping_length(size));
        }
    } else {
        use std::alloc::{alloc_zeroed, dealloc, Layout};

        fn determine_page_size() -> usize {
            4096
        }

        fn layout_for(size: usize, alignment: usize) -> Result<Layout, AllocError> {
            Layout::from_size_align(mapping_length(size), alignment.max(page_size()))
                .map_err(|_| AllocError::out_of_memory(size))
        }

        pub fn map_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
            let layout = layout_for(size, alignment)?;
            NonNull::new(unsafe { alloc_zeroed(layout) })
                .ok_or(AllocError::out_of_memory(layout.size()))
        }

        pub unsafe fn unmap(address: NonNull<u8>, size: usize, alignment: usize) {
            match layout_for(size, alignment) {
                Ok(layout) => dealloc(address.as_ptr(), layout),
                Err(_) => panic!("unmap of {:p} with an impossible layout", address),
            }
        }
    }
}

/// Maps `size` bytes aligned only to the OS page size.
pub fn map(size: usize) -> Result<NonNull<u8>, AllocError> {
    map_aligned(size, page_size())
}
