//! Requests of half a page or more skip the pages and get a mapping of their own.
//!
//! The block header sits at the start of the mapping, so a big block header is always
//! OS page aligned while a page owned header never is.

use std::ptr::{self, NonNull};

use crate::{
    block::{BlockHeader, BlockTag, BLOCK_HEADER_SIZE},
    error::AllocError,
    utils::{checked_align_usize, formatted_size, is_aligned},
    virtual_memory,
};

/// Maps a big block with room for `bytes` of payload.
pub fn alloc(bytes: usize) -> Result<NonNull<u8>, AllocError> {
    let length = bytes
        .checked_add(BLOCK_HEADER_SIZE)
        .and_then(|raw| checked_align_usize(raw, virtual_memory::page_size()))
        .ok_or(AllocError::out_of_memory(bytes))?;

    let memory = virtual_memory::map(length)?;

    unsafe {
        let header = BlockHeader::init(memory.as_ptr(), length, 0, BlockTag::Big);
        log::trace!(target: "segalloc", "big block {:p} mapped ({})", header, formatted_size(length));
        Ok(BlockHeader::payload(header))
    }
}

/// Unmaps a big block.
///
/// # Safety
///
/// `header` must be the header of a live big block.
pub unsafe fn free(header: *mut BlockHeader) {
    debug_assert_eq!((*header).tag(), BlockTag::Big);
    debug_assert!(is_aligned(header as usize, virtual_memory::page_size()));

    let length = (*header).size();
    log::trace!(target: "segalloc", "big block {:p} unmapped ({})", header, formatted_size(length));
    virtual_memory::unmap(
        NonNull::new_unchecked(header.cast()),
        length,
        virtual_memory::page_size(),
    );
}

/// Resizes a big block. Stays in place while the mapping is large enough.
///
/// # Safety
///
/// `header` must be the header of a live big block.
pub unsafe fn realloc(
    header: *mut BlockHeader,
    bytes: usize,
    keep_content: bool,
) -> Result<NonNull<u8>, AllocError> {
    let usable = (*header).usable_size();

    if bytes <= usable && bytes >= usable / 4 {
        return Ok(BlockHeader::payload(header));
    }

    let fresh = alloc(bytes)?;
    if keep_content {
        ptr::copy_nonoverlapping(
            BlockHeader::payload(header).as_ptr(),
            fresh.as_ptr(),
            usable.min(bytes),
        );
    }
    (*BlockHeader::from_payload(fresh)).set_count((*header).count());
    free(header);

    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_block_roundtrip() {
        let ptr = alloc(100_000).unwrap();

        unsafe {
            let header = BlockHeader::from_payload(ptr);
            assert_eq!((*header).tag(), BlockTag::Big);
            assert!(is_aligned(header as usize, virtual_memory::page_size()));
            assert!((*header).usable_size() >= 100_000);

            ptr.as_ptr().write_bytes(0x5A, 100_000);
            (*header).set_count(25_000);

            let grown = realloc(header, 300_000, true).unwrap();
            let grown_header = BlockHeader::from_payload(grown);
            assert_eq!((*grown_header).count(), 25_000);
            assert!(std::slice::from_raw_parts(grown.as_ptr(), 100_000)
                .iter()
                .all(|&b| b == 0x5A));

            // small shrink stays in the same mapping
            let same = realloc(grown_header, 290_000, true).unwrap();
            assert_eq!(same, grown);

            free(grown_header);
        }
    }
}
