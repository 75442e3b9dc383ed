use std::{
    mem::size_of,
    ptr::{null_mut, NonNull},
};

use crate::{page::MAX_PAGE_SIZE, utils::align_usize};

/// Smallest granularity blocks are padded to.
pub const MIN_GRANULARITY_SHIFT: u32 = 4;
/// A page never holds more than `1 << SIZE_FIELD_BITS` granules; larger pages get a
/// coarser granularity instead.
pub const SIZE_FIELD_BITS: u32 = 16;

/// Header size in bytes. Payloads start right after it.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Free blocks keep their list links in the payload.
pub const FREE_LINKS_SIZE: usize = size_of::<FreeLinks>();
/// Smallest block able to carry a free list node.
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + FREE_LINKS_SIZE;

/// Debug fill for freshly handed out payloads.
pub const ALLOC_POISON: u8 = 0xCD;
/// Every payload is aligned at least this much.
pub const PAYLOAD_ALIGNMENT: usize = 1 << MIN_GRANULARITY_SHIFT;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockTag {
    /// On its page's free list.
    Free,
    /// Handed out by a page. `owner` is the distance back to that page.
    Used,
    /// Mapped straight from the OS. `size` is the mapping length.
    Big,
}

impl BlockTag {
    const FREE: u8 = b'F';
    const USED: u8 = b'U';
    const BIG: u8 = b'B';

    const fn encode(self) -> u8 {
        match self {
            Self::Free => Self::FREE,
            Self::Used => Self::USED,
            Self::Big => Self::BIG,
        }
    }

    const fn decode(raw: u8) -> Option<Self> {
        match raw {
            Self::FREE => Some(Self::Free),
            Self::USED => Some(Self::Used),
            Self::BIG => Some(Self::Big),
            _ => None,
        }
    }
}

/// Header in front of every block, free, used or big.
///
/// ```text
/// +----------------------------+
/// | size                       |  whole block, header included
/// +--------------+-------------+
/// | prev_size    | owner       |  size of the block right before (0 for the first one),
/// +--------------+-------------+  offset of a used header from its page base
/// | count                      |  logical item count
/// +----------------------------+
/// | tag                        |
/// +----------------------------+
/// | payload / free list links  |
/// |            ...             |
/// +----------------------------+
/// ```
///
/// Neighbours are reached with plain address arithmetic: `this + size` is the next
/// block and `this - prev_size` the previous one.
///
/// `prev_size` and `owner` are distances inside one page and pages never exceed
/// [`MAX_PAGE_SIZE`], so 32 bits hold them. `size` stays a word: big blocks keep their
/// mapping length there.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    prev_size: u32,
    owner: u32,
    count: usize,
    tag: u8,
}

const _: () = assert!(MAX_PAGE_SIZE <= u32::MAX as usize);

/// Doubly linked, size sorted free list node stored in a free block's payload.
#[repr(C)]
pub struct FreeLinks {
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
}

impl BlockHeader {
    /// Writes a fresh header at `at`.
    pub unsafe fn init(
        at: *mut u8,
        size: usize,
        prev_size: usize,
        tag: BlockTag,
    ) -> *mut BlockHeader {
        let header = at.cast::<BlockHeader>();
        debug_assert!(prev_size <= MAX_PAGE_SIZE);
        header.write(BlockHeader {
            size,
            prev_size: prev_size as u32,
            owner: 0,
            count: 0,
            tag: tag.encode(),
        });
        header
    }

    /// Header of the block whose payload starts at `payload`.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> *mut BlockHeader {
        payload.as_ptr().sub(BLOCK_HEADER_SIZE).cast()
    }

    #[inline]
    pub unsafe fn payload(this: *mut BlockHeader) -> NonNull<u8> {
        NonNull::new_unchecked(this.cast::<u8>().add(BLOCK_HEADER_SIZE))
    }

    #[inline]
    pub unsafe fn links(this: *mut BlockHeader) -> *mut FreeLinks {
        this.cast::<u8>().add(BLOCK_HEADER_SIZE).cast()
    }

    /// Block physically following `this`. May be the end of the page.
    #[inline]
    pub unsafe fn next_physical(this: *mut BlockHeader) -> *mut BlockHeader {
        this.cast::<u8>().add((*this).size).cast()
    }

    /// Block physically preceding `this`, null for the first block of a page.
    #[inline]
    pub unsafe fn prev_physical(this: *mut BlockHeader) -> *mut BlockHeader {
        if (*this).prev_size == 0 {
            null_mut()
        } else {
            this.cast::<u8>().sub((*this).prev_size()).cast()
        }
    }

    /// Panics on an unknown tag: the header was overwritten or never was a block.
    pub fn tag(&self) -> BlockTag {
        match BlockTag::decode(self.tag) {
            Some(tag) => tag,
            None => panic!(
                "corrupted block header at {:p} (tag {:#x})",
                self as *const Self, self.tag
            ),
        }
    }

    pub fn try_tag(&self) -> Option<BlockTag> {
        BlockTag::decode(self.tag)
    }

    pub fn set_tag(&mut self, tag: BlockTag) {
        self.tag = tag.encode();
    }

    pub fn is_free(&self) -> bool {
        self.tag == BlockTag::FREE
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn prev_size(&self) -> usize {
        self.prev_size as usize
    }

    pub fn set_prev_size(&mut self, prev_size: usize) {
        debug_assert!(prev_size <= MAX_PAGE_SIZE);
        self.prev_size = prev_size as u32;
    }

    pub fn owner(&self) -> usize {
        self.owner as usize
    }

    pub fn set_owner(&mut self, owner: usize) {
        debug_assert!(owner <= MAX_PAGE_SIZE);
        self.owner = owner as u32;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    /// Payload bytes available to the caller.
    pub fn usable_size(&self) -> usize {
        self.size - BLOCK_HEADER_SIZE
    }
}

/// Granularity shift for a page of `page_size` bytes.
pub const fn granularity_shift_for(page_size: usize) -> u32 {
    let log2 = page_size.trailing_zeros();
    if log2 > SIZE_FIELD_BITS + MIN_GRANULARITY_SHIFT {
        log2 - SIZE_FIELD_BITS
    } else {
        MIN_GRANULARITY_SHIFT
    }
}

/// Whole block size needed to serve `bytes` of payload, `None` on overflow.
pub fn block_size_for(bytes: usize, granularity: usize) -> Option<usize> {
    let raw = bytes.max(FREE_LINKS_SIZE).checked_add(BLOCK_HEADER_SIZE)?;
    crate::utils::checked_align_usize(raw, granularity)
}

/// Surplus from which a block gets split instead of handed out whole.
pub const fn split_threshold(granularity: usize) -> usize {
    align_usize(MIN_BLOCK_SIZE, granularity)
}
