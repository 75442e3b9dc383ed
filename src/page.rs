//! Intra-page allocator.
//!
//! A page is a power of two sized region aligned to its own size. The [`SegPage`]
//! header sits at the very start of the region, blocks follow it back to back up to
//! the end of the page:
//!
//! ```text
//! page base                                                      page base + page_size
//! +---------+---------+----------+---------+------------------------------+
//! | SegPage | Used    | Free     | Used    | Free                         |
//! +---------+---------+----------+---------+------------------------------+
//!                          ^                        ^
//!                          smallest <-> ... <-> largest
//! ```
//!
//! Free blocks form a doubly linked list sorted by size, ascending from `smallest` to
//! `largest`. Two free blocks are never adjacent: freeing always coalesces with free
//! neighbours, which are found in O(1) through the `size`/`prev_size` header fields.
//! Because the header occupies the page start no block ever begins on a page boundary.

use std::{
    cell::UnsafeCell,
    fmt,
    mem::size_of,
    ops::Deref,
    ptr::{self, null_mut, NonNull},
};

use parking_lot::Mutex;

use crate::{
    block::{
        block_size_for, granularity_shift_for, split_threshold, BlockHeader, BlockTag,
        ALLOC_POISON,
    },
    error::AllocError,
    utils::{align_down, align_usize, formatted_size},
    virtual_memory,
};

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Page size actually used for a request of `size` bytes.
pub fn normalize_page_size(size: usize) -> usize {
    size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE).next_power_of_two()
}

/// Mutable bookkeeping of a page, only touched under the page lock.
pub(crate) struct PageState {
    /// Address this page lived at when the state was written. Differs from the
    /// real base right after a raw restore, until the free list is rebased.
    pub(crate) me: usize,
    pub(crate) used: usize,
    pub(crate) smallest: *mut BlockHeader,
    pub(crate) largest: *mut BlockHeader,
    pub(crate) free_blocks: usize,
}

#[repr(C)]
pub struct SegPage {
    page_size: usize,
    granularity_shift: u32,
    locking: bool,
    /// Next page of the owning allocator. Written once before the page is published.
    pub(crate) next: *mut SegPage,
    lock: Mutex<()>,
    state: UnsafeCell<PageState>,
}

unsafe impl Send for SegPage {}
unsafe impl Sync for SegPage {}

/// Address ordered view of a block, see [`SegPage::blocks`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockInfo {
    /// Offset of the block header from the page base.
    pub offset: usize,
    pub size: usize,
    pub free: bool,
    pub count: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct PageStats {
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

impl SegPage {
    /// Maps a new page of at least `page_size` bytes and resets it to one free block.
    pub fn create(page_size: usize, locking: bool) -> Result<NonNull<SegPage>, AllocError> {
        let page_size = normalize_page_size(page_size);
        let memory = virtual_memory::map_aligned(page_size, page_size)?;

        unsafe {
            let page = memory.cast::<SegPage>();
            page.as_ptr().write(SegPage {
                page_size,
                granularity_shift: granularity_shift_for(page_size),
                locking,
                next: null_mut(),
                lock: Mutex::new(()),
                state: UnsafeCell::new(PageState {
                    me: 0,
                    used: 0,
                    smallest: null_mut(),
                    largest: null_mut(),
                    free_blocks: 0,
                }),
            });
            page.as_ref().reset();
            Ok(page)
        }
    }

    /// Unmaps a page created by [`SegPage::create`].
    ///
    /// # Safety
    ///
    /// No reference to the page or to any of its blocks may outlive this call.
    pub unsafe fn destroy(page: NonNull<SegPage>) {
        let page_size = page.as_ref().page_size;
        ptr::drop_in_place(page.as_ptr());
        virtual_memory::unmap(page.cast(), page_size, page_size);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn granularity(&self) -> usize {
        1 << self.granularity_shift
    }

    pub fn is_locking(&self) -> bool {
        self.locking
    }

    pub fn base(&self) -> usize {
        self as *const Self as usize
    }

    pub fn end(&self) -> usize {
        self.base() + self.page_size
    }

    /// Offset of the first block. The page header lives below it.
    pub fn data_offset(&self) -> usize {
        align_usize(size_of::<SegPage>(), self.granularity())
    }

    /// Bytes covered by blocks, free and used.
    pub fn usable_size(&self) -> usize {
        self.page_size - self.data_offset()
    }

    pub(crate) fn first_block(&self) -> *mut BlockHeader {
        (self.base() + self.data_offset()) as *mut BlockHeader
    }

    pub fn contains(&self, address: usize) -> bool {
        address > self.base() && address < self.end()
    }

    /// Whole block size this page would carve for `bytes` of payload.
    pub fn block_size_for(&self, bytes: usize) -> Option<usize> {
        block_size_for(bytes, self.granularity()).filter(|&size| size <= self.usable_size())
    }

    /// Runs `f` with exclusive access to the page state.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PageState) -> R) -> R {
        if self.locking {
            let _guard = self.lock.lock();
            unsafe { f(&mut *self.state.get()) }
        } else {
            unsafe { f(&mut *self.state.get()) }
        }
    }

    /// Like [`with_state`](Self::with_state) but gives up when the page lock is contended.
    pub(crate) fn try_with_state<R>(&self, f: impl FnOnce(&mut PageState) -> R) -> Option<R> {
        if self.locking {
            let _guard = self.lock.try_lock()?;
            Some(unsafe { f(&mut *self.state.get()) })
        } else {
            Some(unsafe { f(&mut *self.state.get()) })
        }
    }

    /// Drops every block and turns the whole usable area into a single free block.
    pub fn reset(&self) {
        self.with_state(|state| unsafe { self.reset_locked(state) })
    }

    pub(crate) unsafe fn reset_locked(&self, state: &mut PageState) {
        let first = BlockHeader::init(
            self.first_block().cast(),
            self.usable_size(),
            0,
            BlockTag::Free,
        );
        let links = BlockHeader::links(first);
        (*links).prev = null_mut();
        (*links).next = null_mut();

        state.me = self.base();
        state.used = 0;
        state.smallest = first;
        state.largest = first;
        state.free_blocks = 1;
    }

    pub fn used(&self) -> usize {
        self.with_state(|state| state.used)
    }

    pub fn free_bytes(&self) -> usize {
        self.usable_size() - self.used()
    }

    /// Size of the largest free block, header included.
    pub fn largest_free(&self) -> usize {
        self.with_state(|state| unsafe { largest_size(state) })
    }

    /// Peeks the largest free block without blocking. `None` when the page is contended.
    pub fn try_largest_free(&self) -> Option<usize> {
        self.try_with_state(|state| unsafe { largest_size(state) })
    }

    /// Carves a block with at least `bytes` of payload out of this page.
    ///
    /// Returns `None` when no free block is large enough.
    pub fn alloc(&self, bytes: usize) -> Option<NonNull<u8>> {
        let needed = self.block_size_for(bytes)?;
        self.with_state(|state| unsafe { self.alloc_locked(state, needed) })
    }

    /// Releases a block previously returned by this page.
    ///
    /// # Safety
    ///
    /// `payload` must come from [`alloc`](Self::alloc) or [`realloc`](Self::realloc) on
    /// this page and must not have been released already.
    pub unsafe fn free(&self, payload: NonNull<u8>) {
        let block = self.owned_block(payload);
        self.with_state(|state| self.free_locked(state, block))
    }

    /// Resizes a block, in place when the neighbours allow it.
    ///
    /// With `keep_content` the first `min(old, new)` payload bytes survive. On `None` the
    /// original block is untouched when `keep_content` is set and already released
    /// otherwise.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn realloc(
        &self,
        payload: NonNull<u8>,
        bytes: usize,
        keep_content: bool,
    ) -> Option<NonNull<u8>> {
        let block = self.owned_block(payload);

        let needed = match self.block_size_for(bytes) {
            Some(needed) => needed,
            None => {
                if !keep_content {
                    self.with_state(|state| self.free_locked(state, block));
                }
                return None;
            }
        };

        self.with_state(|state| self.realloc_locked(state, block, needed, keep_content))
    }

    /// Logical item count stored with a block. Read under the page lock, as
    /// [`blocks`](Self::blocks) does from other threads.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block of this page.
    pub unsafe fn count(&self, payload: NonNull<u8>) -> usize {
        let block = self.owned_block(payload);
        self.with_state(|_| (*block).count())
    }

    /// # Safety
    ///
    /// `payload` must be a live block of this page.
    pub unsafe fn set_count(&self, payload: NonNull<u8>, count: usize) {
        let block = self.owned_block(payload);
        self.with_state(|_| (*block).set_count(count))
    }

    /// # Safety
    ///
    /// `payload` must be a live block of this page.
    pub unsafe fn usable_size_of(&self, payload: NonNull<u8>) -> usize {
        (*self.owned_block(payload)).usable_size()
    }

    /// Header of a used block of this page. Panics when `payload` is not one.
    pub(crate) unsafe fn owned_block(&self, payload: NonNull<u8>) -> *mut BlockHeader {
        let block = BlockHeader::from_payload(payload);
        let addr = block as usize;

        assert!(
            addr >= self.first_block() as usize && addr < self.end(),
            "{:p} does not belong to page {:#x}",
            payload,
            self.base()
        );
        debug_assert_eq!(
            (addr - self.first_block() as usize) % self.granularity(),
            0,
            "misaligned block {:p}",
            payload
        );

        match (*block).tag() {
            BlockTag::Used => {}
            BlockTag::Free => panic!("double free of {:p}", payload),
            BlockTag::Big => panic!("big block {:p} handed to page {:#x}", payload, self.base()),
        }

        assert_eq!(
            addr.wrapping_sub((*block).owner()),
            self.base(),
            "{:p} is owned by another page",
            payload
        );

        block
    }

    unsafe fn alloc_locked(&self, state: &mut PageState, needed: usize) -> Option<NonNull<u8>> {
        if largest_size(state) < needed {
            return None;
        }

        // best fit from below: the list is sorted, the first fit is the smallest fit
        let mut block = state.smallest;
        while (*block).size() < needed {
            block = (*BlockHeader::links(block)).next;
        }

        self.unlink(state, block);
        if let Some(remainder) = self.split_tail(block, needed) {
            self.insert_sorted(state, remainder);
        }

        (*block).set_tag(BlockTag::Used);
        (*block).set_owner(block as usize - self.base());
        (*block).set_count(0);
        state.used += (*block).size();

        let payload = BlockHeader::payload(block);
        if cfg!(any(debug_assertions, feature = "poison")) {
            ptr::write_bytes(payload.as_ptr(), ALLOC_POISON, (*block).usable_size());
        }

        Some(payload)
    }

    unsafe fn free_locked(&self, state: &mut PageState, block: *mut BlockHeader) {
        state.used -= (*block).size();
        self.mark_free(block);
        let merged = self.coalesce(state, block);
        self.insert_sorted(state, merged);
    }

    unsafe fn realloc_locked(
        &self,
        state: &mut PageState,
        block: *mut BlockHeader,
        needed: usize,
        keep_content: bool,
    ) -> Option<NonNull<u8>> {
        let old_size = (*block).size();

        if needed <= old_size {
            if needed <= old_size / 2 {
                self.give_back_tail(state, block, needed);
            }
            return Some(BlockHeader::payload(block));
        }

        let right = self.free_neighbour(BlockHeader::next_physical(block));
        let left = self.free_neighbour(BlockHeader::prev_physical(block));
        let right_size = right.map_or(0, |right| (*right).size());
        let left_size = left.map_or(0, |left| (*left).size());

        if let Some(right) = right {
            if old_size + right_size >= needed {
                // grow forward, the payload stays where it is
                self.unlink(state, right);
                self.resize_in_place(block, old_size + right_size);
                state.used += right_size;
                self.give_back_tail(state, block, needed);
                return Some(BlockHeader::payload(block));
            }
        }

        if let Some(left) = left {
            if left_size + old_size + right_size >= needed {
                // grow backward, the payload slides down to the new start
                let count = (*block).count();
                let old_payload = BlockHeader::payload(block);
                let usable = (*block).usable_size();

                self.unlink(state, left);
                if let Some(right) = right {
                    self.unlink(state, right);
                }
                self.resize_in_place(left, left_size + old_size + right_size);
                (*left).set_tag(BlockTag::Used);
                (*left).set_owner(left as usize - self.base());
                (*left).set_count(count);
                state.used += left_size + right_size;

                let new_payload = BlockHeader::payload(left);
                if keep_content {
                    ptr::copy(old_payload.as_ptr(), new_payload.as_ptr(), usable);
                }

                self.give_back_tail(state, left, needed);
                return Some(new_payload);
            }
        }

        let count = (*block).count();
        if keep_content {
            let fresh = self.alloc_locked(state, needed)?;
            ptr::copy_nonoverlapping(
                BlockHeader::payload(block).as_ptr(),
                fresh.as_ptr(),
                (*block).usable_size(),
            );
            (*BlockHeader::from_payload(fresh)).set_count(count);
            self.free_locked(state, block);
            Some(fresh)
        } else {
            self.free_locked(state, block);
            let fresh = self.alloc_locked(state, needed)?;
            (*BlockHeader::from_payload(fresh)).set_count(count);
            Some(fresh)
        }
    }

    /// `block` when it is a free block of this page.
    unsafe fn free_neighbour(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        if block.is_null() || block as usize >= self.end() || !(*block).is_free() {
            None
        } else {
            Some(block)
        }
    }

    /// Sets the size of `block` and fixes the back distance of whatever follows it.
    unsafe fn resize_in_place(&self, block: *mut BlockHeader, size: usize) {
        (*block).set_size(size);
        let next = BlockHeader::next_physical(block);
        if (next as usize) < self.end() {
            (*next).set_prev_size(size);
        }
    }

    /// Cuts `block` down to `keep` bytes when the surplus is worth a block of its own.
    /// The cut off tail is returned tagged free but not linked anywhere.
    unsafe fn split_tail(
        &self,
        block: *mut BlockHeader,
        keep: usize,
    ) -> Option<*mut BlockHeader> {
        let surplus = (*block).size() - keep;
        if surplus < split_threshold(self.granularity()) {
            return None;
        }

        let tail = BlockHeader::init(block.cast::<u8>().add(keep), surplus, keep, BlockTag::Free);
        (*block).set_size(keep);
        let after = BlockHeader::next_physical(tail);
        if (after as usize) < self.end() {
            (*after).set_prev_size(surplus);
        }
        Some(tail)
    }

    /// Splits the surplus of a used block and returns it to the free list.
    unsafe fn give_back_tail(&self, state: &mut PageState, block: *mut BlockHeader, keep: usize) {
        if let Some(tail) = self.split_tail(block, keep) {
            state.used -= (*tail).size();
            let merged = self.coalesce(state, tail);
            self.insert_sorted(state, merged);
        }
    }

    unsafe fn mark_free(&self, block: *mut BlockHeader) {
        (*block).set_tag(BlockTag::Free);
        (*block).set_owner(0);
        (*block).set_count(0);
    }

    /// Merges an unlinked free block with its free neighbours. Returns the merged block,
    /// still unlinked.
    unsafe fn coalesce(&self, state: &mut PageState, block: *mut BlockHeader) -> *mut BlockHeader {
        let mut block = block;

        if let Some(right) = self.free_neighbour(BlockHeader::next_physical(block)) {
            self.unlink(state, right);
            self.resize_in_place(block, (*block).size() + (*right).size());
        }

        if let Some(left) = self.free_neighbour(BlockHeader::prev_physical(block)) {
            self.unlink(state, left);
            self.resize_in_place(left, (*left).size() + (*block).size());
            block = left;
        }

        block
    }

    unsafe fn unlink(&self, state: &mut PageState, block: *mut BlockHeader) {
        let links = BlockHeader::links(block);
        let prev = (*links).prev;
        let next = (*links).next;

        if prev.is_null() {
            state.smallest = next;
        } else {
            (*BlockHeader::links(prev)).next = next;
        }

        if next.is_null() {
            state.largest = prev;
        } else {
            (*BlockHeader::links(next)).prev = prev;
        }

        (*links).prev = null_mut();
        (*links).next = null_mut();
        state.free_blocks -= 1;
    }

    /// Links a free block at its size sorted position, scanning from whichever end of the
    /// list is closer in size.
    unsafe fn insert_sorted(&self, state: &mut PageState, block: *mut BlockHeader) {
        let size = (*block).size();
        let links = BlockHeader::links(block);
        state.free_blocks += 1;

        if state.smallest.is_null() {
            (*links).prev = null_mut();
            (*links).next = null_mut();
            state.smallest = block;
            state.largest = block;
            return;
        }

        let small = (*state.smallest).size();
        let large = (*state.largest).size();

        let (prev, next) = if size.saturating_sub(small) <= large.saturating_sub(size) {
            let mut next = state.smallest;
            while !next.is_null() && (*next).size() < size {
                next = (*BlockHeader::links(next)).next;
            }
            let prev = if next.is_null() {
                state.largest
            } else {
                (*BlockHeader::links(next)).prev
            };
            (prev, next)
        } else {
            let mut prev = state.largest;
            while !prev.is_null() && (*prev).size() > size {
                prev = (*BlockHeader::links(prev)).prev;
            }
            let next = if prev.is_null() {
                state.smallest
            } else {
                (*BlockHeader::links(prev)).next
            };
            (prev, next)
        };

        (*links).prev = prev;
        (*links).next = next;

        if prev.is_null() {
            state.smallest = block;
        } else {
            (*BlockHeader::links(prev)).next = block;
        }

        if next.is_null() {
            state.largest = block;
        } else {
            (*BlockHeader::links(next)).prev = block;
        }
    }

    /// Snapshot of all blocks in address order.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.with_state(|_| unsafe {
            let mut blocks = Vec::new();
            let mut block = self.first_block();

            while (block as usize) < self.end() {
                blocks.push(BlockInfo {
                    offset: block as usize - self.base(),
                    size: (*block).size(),
                    free: (*block).is_free(),
                    count: (*block).count(),
                });
                block = BlockHeader::next_physical(block);
            }

            blocks
        })
    }

    /// Free block sizes from the smallest anchor to the largest one.
    pub fn free_list_sizes(&self) -> Vec<usize> {
        self.with_state(|state| unsafe {
            let mut sizes = Vec::with_capacity(state.free_blocks);
            let mut block = state.smallest;

            while !block.is_null() {
                sizes.push((*block).size());
                block = (*BlockHeader::links(block)).next;
            }

            sizes
        })
    }

    pub fn stats(&self) -> PageStats {
        self.blocks().iter().fold(PageStats::default(), |mut stats, block| {
            if block.free {
                stats.free_bytes += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used_bytes += block.size;
                stats.used_blocks += 1;
            }
            stats
        })
    }

    /// Walks every block and the free list and verifies the page invariants:
    ///
    /// - blocks tile the usable area exactly and agree on their back distances
    /// - no two free blocks are adjacent
    /// - every used block records this page as its owner
    /// - the free list is sorted, consistently linked and holds exactly the free blocks
    /// - the used byte counter matches the used blocks
    pub fn check_state(&self) -> Result<PageStats, AllocError> {
        self.with_state(|state| unsafe { self.check_state_locked(state) })
    }

    pub(crate) unsafe fn check_state_locked(&self, state: &PageState) -> Result<PageStats, AllocError> {
        let corrupted = |reason| AllocError::CorruptedState {
            page: self.base(),
            reason,
        };

        if state.me != self.base() {
            return Err(corrupted("page was moved without rebasing"));
        }

        let mut stats = PageStats::default();
        let mut block = self.first_block();
        let mut prev_size = 0;
        let mut prev_free = false;

        while (block as usize) < self.end() {
            let size = (*block).size();

            if size == 0 || size % self.granularity() != 0 {
                return Err(corrupted("block size is not a multiple of the granularity"));
            }
            if block as usize + size > self.end() {
                return Err(corrupted("block runs past the end of the page"));
            }
            if (*block).prev_size() != prev_size {
                return Err(corrupted("back distance does not match the previous block"));
            }

            match (*block).try_tag() {
                Some(BlockTag::Free) => {
                    if prev_free {
                        return Err(corrupted("two adjacent free blocks"));
                    }
                    stats.free_bytes += size;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(size);
                    prev_free = true;
                }
                Some(BlockTag::Used) => {
                    if (block as usize).wrapping_sub((*block).owner()) != self.base() {
                        return Err(corrupted("used block records a foreign owner"));
                    }
                    stats.used_bytes += size;
                    stats.used_blocks += 1;
                    prev_free = false;
                }
                Some(BlockTag::Big) | None => return Err(corrupted("unexpected block tag")),
            }

            prev_size = size;
            block = BlockHeader::next_physical(block);
        }

        if block as usize != self.end() {
            return Err(corrupted("blocks do not end at the page boundary"));
        }
        if stats.free_bytes + stats.used_bytes != self.usable_size() {
            return Err(corrupted("block sizes do not add up to the usable size"));
        }
        if stats.used_bytes != state.used {
            return Err(corrupted("used counter disagrees with used blocks"));
        }

        let mut listed = 0;
        let mut listed_bytes = 0;
        let mut prev: *mut BlockHeader = null_mut();
        let mut node = state.smallest;

        while !node.is_null() {
            if !self.contains(node as usize) || !(*node).is_free() {
                return Err(corrupted("free list holds a block that is not free"));
            }
            if (*BlockHeader::links(node)).prev != prev {
                return Err(corrupted("free list back link is broken"));
            }
            if !prev.is_null() && (*prev).size() > (*node).size() {
                return Err(corrupted("free list is not sorted by size"));
            }

            listed += 1;
            listed_bytes += (*node).size();
            if listed > stats.free_blocks {
                return Err(corrupted("free list is longer than the number of free blocks"));
            }

            prev = node;
            node = (*BlockHeader::links(node)).next;
        }

        if prev != state.largest {
            return Err(corrupted("largest anchor is not the free list tail"));
        }
        if listed != stats.free_blocks || listed != state.free_blocks {
            return Err(corrupted("free list misses free blocks"));
        }
        if listed_bytes != stats.free_bytes {
            return Err(corrupted("free list sizes do not match the free blocks"));
        }

        Ok(stats)
    }
}

impl fmt::Debug for SegPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut page = f.debug_struct("SegPage");
        page.field("base", &format_args!("{:#x}", self.base()))
            .field("page_size", &formatted_size(self.page_size));

        // never block: the page may be locked by the caller printing it
        match self.try_with_state(|state| state.used) {
            Some(used) => page.field("used", &formatted_size(used)),
            None => page.field("used", &format_args!("<locked>")),
        };

        page.finish()
    }
}

unsafe fn largest_size(state: &PageState) -> usize {
    if state.largest.is_null() {
        0
    } else {
        (*state.largest).size()
    }
}

/// Page a page-owned block address belongs to, from alignment alone.
pub fn page_base_of(address: usize, page_size: usize) -> usize {
    align_down(address, page_size)
}

/// Owning handle for a standalone page. Unmaps the page on drop.
pub struct OwnedPage {
    page: NonNull<SegPage>,
}

unsafe impl Send for OwnedPage {}
unsafe impl Sync for OwnedPage {}

impl OwnedPage {
    /// Creates a page that takes its lock on every operation.
    pub fn new(page_size: usize) -> Result<Self, AllocError> {
        Ok(Self {
            page: SegPage::create(page_size, true)?,
        })
    }

    /// Creates a page without a lock.
    ///
    /// # Safety
    ///
    /// The page must only ever be used from one thread at a time.
    pub unsafe fn new_unlocked(page_size: usize) -> Result<Self, AllocError> {
        Ok(Self {
            page: SegPage::create(page_size, false)?,
        })
    }

    pub fn into_raw(self) -> NonNull<SegPage> {
        let page = self.page;
        std::mem::forget(self);
        page
    }

    /// # Safety
    ///
    /// `page` must come from [`SegPage::create`] or [`OwnedPage::into_raw`] and must not
    /// be owned by anything else.
    pub unsafe fn from_raw(page: NonNull<SegPage>) -> Self {
        Self { page }
    }
}

impl Deref for OwnedPage {
    type Target = SegPage;

    fn deref(&self) -> &SegPage {
        unsafe { self.page.as_ref() }
    }
}

impl Drop for OwnedPage {
    fn drop(&mut self) {
        log::trace!(target: "segalloc", "releasing page {:#x} ({})", self.base(), formatted_size(self.page_size()));
        unsafe { SegPage::destroy(self.page) }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::block::BLOCK_HEADER_SIZE;

    fn page(size: usize) -> OwnedPage {
        OwnedPage::new(size).unwrap()
    }

    #[test]
    fn test_fresh_page_is_one_free_block() {
        let page = page(4096);
        let stats = page.check_state().unwrap();

        assert_eq!(page.page_size(), 4096);
        assert_eq!(page.base() % 4096, 0);
        assert!(page.data_offset() > 0);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, page.usable_size());
        assert_eq!(page.free_list_sizes(), vec![page.usable_size()]);
        assert_eq!(page.used(), 0);
    }

    #[test]
    fn test_page_size_rounds_to_power_of_two() {
        let page = page(5000);
        assert_eq!(page.page_size(), 8192);
        assert_eq!(page.base() % 8192, 0);

        assert_eq!(normalize_page_size(1), MIN_PAGE_SIZE);
        assert_eq!(normalize_page_size(65536), 65536);
    }

    #[test]
    fn test_alloc_fits_request() {
        let page = page(64 * 1024);
        let mut blocks = Vec::new();

        for (i, size) in [1usize, 7, 16, 100, 333, 1000, 4000].iter().enumerate() {
            let ptr = page.alloc(*size).unwrap();
            unsafe {
                assert!(page.usable_size_of(ptr) >= *size);
                assert_eq!(ptr.as_ptr() as usize % 16, 0);
                ptr.as_ptr().write_bytes(i as u8, *size);
            }
            blocks.push((ptr, *size, i as u8));
        }

        page.check_state().unwrap();

        for (ptr, size, fill) in blocks {
            unsafe {
                let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size);
                assert!(bytes.iter().all(|&b| b == fill));
                page.free(ptr);
            }
        }

        assert_eq!(page.check_state().unwrap().free_blocks, 1);
    }

    #[test]
    fn test_no_block_starts_at_page_boundary() {
        let page = page(4096);
        let ptr = page.alloc(10).unwrap();
        let header = unsafe { BlockHeader::from_payload(ptr) } as usize;

        assert_ne!(header % 4096, 0);
        assert_eq!(page_base_of(ptr.as_ptr() as usize, 4096), page.base());
        unsafe { page.free(ptr) };
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let page = page(4096);
        let a = page.alloc(100).unwrap();
        let b = page.alloc(100).unwrap();
        let c = page.alloc(100).unwrap();
        let _d = page.alloc(100).unwrap();

        unsafe {
            page.free(a);
            page.free(c);
            assert_eq!(page.check_state().unwrap().free_blocks, 3);

            page.free(b);
        }

        let stats = page.check_state().unwrap();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.used_blocks, 1);
    }

    #[test]
    fn test_small_surplus_is_not_split() {
        let page = page(4096);
        let a = page.alloc(200).unwrap();
        let _guard = page.alloc(8).unwrap();
        let whole = unsafe { page.usable_size_of(a) };
        unsafe { page.free(a) };

        // just below the freed block: the sliver would be too small to be useful
        let b = page.alloc(whole - 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { page.usable_size_of(b) }, whole);
        page.check_state().unwrap();
    }

    #[test]
    fn test_best_fit_from_below() {
        let page = page(64 * 1024);
        let small = page.alloc(64).unwrap();
        let _g1 = page.alloc(8).unwrap();
        let large = page.alloc(1024).unwrap();
        let _g2 = page.alloc(8).unwrap();

        unsafe {
            page.free(large);
            page.free(small);
        }

        // both holes fit; the smaller one wins
        let ptr = page.alloc(32).unwrap();
        assert_eq!(ptr, small);
        let sizes = page.free_list_sizes();
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_exhaust_page() {
        let page = page(4096);
        let mut blocks = Vec::new();

        while let Some(ptr) = page.alloc(64) {
            blocks.push(ptr);
        }

        assert!(!blocks.is_empty());
        assert!(page.alloc(64).is_none());
        assert!(page.alloc(page.page_size()).is_none());
        page.check_state().unwrap();

        unsafe { page.free(blocks[blocks.len() / 2]) };
        assert!(page.alloc(64).is_some());
    }

    #[test]
    fn test_realloc_shrink_in_place() {
        let page = page(4096);
        let ptr = page.alloc(1000).unwrap();
        let _guard = page.alloc(8).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(7, 1000);
            let shrunk = page.realloc(ptr, 100, true).unwrap();
            assert_eq!(shrunk, ptr);
            assert!(page.usable_size_of(shrunk) < 1000);
            assert!(std::slice::from_raw_parts(shrunk.as_ptr(), 100).iter().all(|&b| b == 7));

            // shrinking by less than half keeps the block as is
            let size = page.usable_size_of(shrunk);
            let same = page.realloc(shrunk, size - 32, true).unwrap();
            assert_eq!(page.usable_size_of(same), size);
        }
        page.check_state().unwrap();
    }

    #[test]
    fn test_realloc_grows_forward() {
        let page = page(4096);
        let ptr = page.alloc(100).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(3, 100);
            page.set_count(ptr, 100);

            let grown = page.realloc(ptr, 1500, true).unwrap();
            assert_eq!(grown, ptr);
            assert!(page.usable_size_of(grown) >= 1500);
            assert_eq!(page.count(grown), 100);
            assert!(std::slice::from_raw_parts(grown.as_ptr(), 100).iter().all(|&b| b == 3));
        }
        page.check_state().unwrap();
    }

    #[test]
    fn test_realloc_grows_backward() {
        let page = page(4096);
        let left = page.alloc(300).unwrap();
        let ptr = page.alloc(100).unwrap();
        let _right = page.alloc(100).unwrap();

        unsafe {
            page.free(left);
            for i in 0..100 {
                *ptr.as_ptr().add(i) = i as u8;
            }

            let grown = page.realloc(ptr, 350, true).unwrap();
            assert_eq!(grown, left);
            for i in 0..100 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }
        }
        page.check_state().unwrap();
    }

    #[test]
    fn test_realloc_relocates_within_page() {
        let page = page(4096);
        let ptr = page.alloc(100).unwrap();
        let _pin = page.alloc(100).unwrap();

        unsafe {
            ptr.as_ptr().write_bytes(9, 100);
            let moved = page.realloc(ptr, 1000, true).unwrap();
            assert_ne!(moved, ptr);
            assert!(std::slice::from_raw_parts(moved.as_ptr(), 100).iter().all(|&b| b == 9));
        }
        let stats = page.check_state().unwrap();
        assert_eq!(stats.used_blocks, 2);
    }

    #[test]
    fn test_realloc_failure() {
        let page = page(4096);
        let ptr = page.alloc(100).unwrap();

        unsafe {
            assert!(page.realloc(ptr, 8192, true).is_none());
            // the block survived
            assert_eq!(page.check_state().unwrap().used_blocks, 1);

            assert!(page.realloc(ptr, 8192, false).is_none());
            // and now it is gone
            assert_eq!(page.check_state().unwrap().used_blocks, 0);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let page = page(4096);
        let a = page.alloc(100).unwrap();
        let _b = page.alloc(100).unwrap();
        unsafe {
            page.free(a);
            page.free(a);
        }
    }

    #[test]
    fn test_check_state_detects_corruption() {
        let page = page(4096);
        let ptr = page.alloc(100).unwrap();
        let _b = page.alloc(100).unwrap();

        unsafe {
            let header = BlockHeader::from_payload(ptr);
            (*header).set_owner((*header).owner() + 16);
        }

        match page.check_state() {
            Err(AllocError::CorruptedState { page: base, .. }) => assert_eq!(base, page.base()),
            other => panic!("corruption went unnoticed: {:?}", other),
        }
    }

    #[test]
    fn test_debug_output() {
        let page = page(4096);
        let ptr = page.alloc(100).unwrap();

        let text = format!("{:?}", *page);
        assert!(text.contains(&format!("{:#x}", page.base())));
        assert!(text.contains("4.0K"));
        assert!(text.contains("used"));

        // printing a page whose lock is held does not deadlock
        let locked = page.with_state(|_| format!("{:?}", *page));
        assert!(locked.contains("<locked>"));

        unsafe { page.free(ptr) };
    }

    #[test]
    fn test_count_updates_visible_to_inspection() {
        let page = page(16 * 1024);
        let ptr = page.alloc(64).unwrap();
        let offset = unsafe { BlockHeader::from_payload(ptr) } as usize - page.base();

        std::thread::scope(|scope| {
            let page = &*page;
            let addr = ptr.as_ptr() as usize;
            scope.spawn(move || {
                let ptr = NonNull::new(addr as *mut u8).unwrap();
                for count in 1..=1000 {
                    unsafe { page.set_count(ptr, count) };
                }
            });
            scope.spawn(move || {
                for _ in 0..1000 {
                    let block = page.blocks().into_iter().find(|b| b.offset == offset).unwrap();
                    assert!(block.count <= 1000);
                }
            });
        });

        assert_eq!(unsafe { page.count(ptr) }, 1000);
        unsafe { page.free(ptr) };
    }

    #[test]
    fn test_unlocked_page() {
        let page = unsafe { OwnedPage::new_unlocked(4096).unwrap() };
        assert!(!page.is_locking());
        let ptr = page.alloc(10).unwrap();
        assert_eq!(page.try_largest_free(), Some(page.largest_free()));
        unsafe { page.free(ptr) };
        page.check_state().unwrap();
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let page = page(16 * 1024);
        let mut rng = StdRng::seed_from_u64(0x5e9a110c);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for step in 0..4000 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let size = rng.gen_range(0..600);
                    if let Some(ptr) = page.alloc(size) {
                        let fill = step as u8;
                        unsafe { ptr.as_ptr().write_bytes(fill, size) };
                        live.push((ptr, size, fill));
                    }
                }
                5..=7 if !live.is_empty() => {
                    let (ptr, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe {
                        assert!(std::slice::from_raw_parts(ptr.as_ptr(), size)
                            .iter()
                            .all(|&b| b == fill));
                        page.free(ptr);
                    }
                }
                _ if !live.is_empty() => {
                    let index = rng.gen_range(0..live.len());
                    let (ptr, size, fill) = live[index];
                    let new_size = rng.gen_range(0..1200);
                    if let Some(moved) = unsafe { page.realloc(ptr, new_size, true) } {
                        let kept = size.min(new_size);
                        unsafe {
                            assert!(std::slice::from_raw_parts(moved.as_ptr(), kept)
                                .iter()
                                .all(|&b| b == fill));
                            moved.as_ptr().write_bytes(fill, new_size);
                        }
                        live[index] = (moved, new_size, fill);
                    }
                }
                _ => {}
            }

            let stats = page.check_state().unwrap();
            assert_eq!(stats.used_blocks, live.len());
            for &(ptr, size, _) in &live {
                assert!(unsafe { page.usable_size_of(ptr) } >= size);
            }
        }

        for (ptr, _, _) in live.drain(..) {
            unsafe { page.free(ptr) };
        }

        let stats = page.check_state().unwrap();
        assert_eq!(page.used(), 0);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, page.usable_size());
        assert_eq!(page.free_list_sizes(), vec![page.usable_size()]);
        assert!(page.usable_size() > BLOCK_HEADER_SIZE);
    }
}
