//! Page manager.
//!
//! A [`SegAllocator`] owns a singly linked list of [`SegPage`]s, newest first, and routes
//! every request below half a page to one of them. Requests at or above that threshold
//! become big blocks mapped straight from the OS.
//!
//! Picking a page never blocks: starting from the page that served the last request,
//! pages are peeked with a try-lock and skipped when contended or too full. Only when
//! the whole list fails does a thread take the growth lock and link a fresh page.

use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr::{self, null_mut, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    big_block,
    block::{block_size_for, BlockHeader, BlockTag, BLOCK_HEADER_SIZE, PAYLOAD_ALIGNMENT},
    config::{OomPolicy, SegAllocatorConfig},
    error::AllocError,
    page::{page_base_of, OwnedPage, SegPage},
    utils::{formatted_size, is_aligned},
    virtual_memory,
};

/// What [`SegAllocator::owner_of`] found behind a pointer.
#[derive(Clone, Copy, Debug)]
pub enum BlockOwner<'a> {
    Page(&'a SegPage),
    Big,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct AllocatorStats {
    pub pages: usize,
    /// Bytes held by used page blocks, headers included.
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub big_blocks: usize,
}

pub struct SegAllocator {
    config: SegAllocatorConfig,
    granularity: usize,
    locking: bool,
    /// Head of the page list. Only replaced while `grow_lock` is held.
    pages: AtomicPtr<SegPage>,
    /// Page that served the last request. A stale value only costs a longer scan.
    last_successful: AtomicPtr<SegPage>,
    page_count: AtomicUsize,
    big_blocks: AtomicUsize,
    grow_lock: Mutex<()>,
}

impl SegAllocator {
    pub fn new(config: SegAllocatorConfig) -> Self {
        Self::with_locking(config, true)
    }

    /// Allocator whose pages never take their lock.
    ///
    /// # Safety
    ///
    /// The allocator and every block it hands out must only be used from one thread at
    /// a time.
    pub unsafe fn new_unlocked(config: SegAllocatorConfig) -> Self {
        Self::with_locking(config, false)
    }

    fn with_locking(config: SegAllocatorConfig, locking: bool) -> Self {
        let config = config.normalized();
        log::debug!(target: "segalloc", "new allocator: {}", config);

        Self {
            granularity: config.granularity(),
            config,
            locking,
            pages: AtomicPtr::new(null_mut()),
            last_successful: AtomicPtr::new(null_mut()),
            page_count: AtomicUsize::new(0),
            big_blocks: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SegAllocatorConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn is_locking(&self) -> bool {
        self.locking
    }

    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::Acquire)
    }

    /// Big blocks currently mapped.
    pub fn big_block_count(&self) -> usize {
        self.big_blocks.load(Ordering::Relaxed)
    }

    /// Pages from the newest to the oldest.
    pub fn pages(&self) -> Pages<'_> {
        Pages {
            next: self.pages.load(Ordering::Acquire),
            marker: PhantomData,
        }
    }

    /// Allocates room for `count` elements of `elem_size` bytes and records `count` in
    /// the block header. The payload is aligned to [`PAYLOAD_ALIGNMENT`].
    pub fn alloc(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        let bytes = match count.checked_mul(elem_size) {
            Some(bytes) => bytes,
            None => return self.out_of_memory(AllocError::out_of_memory(usize::MAX)),
        };

        let ptr = self.alloc_bytes(bytes)?;
        unsafe { self.store_count(ptr, count) };
        Ok(ptr)
    }

    /// Typed flavour of [`alloc`](Self::alloc).
    pub fn alloc_array<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        assert!(
            align_of::<T>() <= PAYLOAD_ALIGNMENT,
            "alignment {} is above what blocks guarantee",
            align_of::<T>()
        );
        self.alloc(count, size_of::<T>()).map(NonNull::cast)
    }

    /// Releases a block of this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and must not be used afterwards. Freeing a
    /// block twice panics as long as its page has not reused the memory.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let header = BlockHeader::from_payload(ptr);

        match (*header).tag() {
            BlockTag::Big => {
                big_block::free(header);
                self.big_blocks.fetch_sub(1, Ordering::Relaxed);
            }
            BlockTag::Used => self.page_of(header).free(ptr),
            BlockTag::Free => panic!("double free of {:p}", ptr),
        }
    }

    /// Resizes a block to `count` elements of `elem_size` bytes.
    ///
    /// With `keep_content` the first `min(old, new)` bytes survive the move. On error the
    /// original block is still live when `keep_content` is set and already released
    /// otherwise.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        elem_size: usize,
        keep_content: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let bytes = match count.checked_mul(elem_size) {
            Some(bytes) => bytes,
            None => {
                if !keep_content {
                    self.free(ptr);
                }
                return self.out_of_memory(AllocError::out_of_memory(usize::MAX));
            }
        };

        let moved = self.realloc_bytes(ptr, bytes, keep_content)?;
        self.store_count(moved, count);
        Ok(moved)
    }

    /// Grows or shrinks capacity to `count` elements while keeping the content. The
    /// recorded count becomes the lesser of the old and the requested one.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn reserve(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let old_count = self.count(ptr);
        let moved = self.realloc(ptr, count, elem_size, true)?;
        self.store_count(moved, old_count.min(count));
        Ok(moved)
    }

    /// Logical item count stored with a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn count(&self, ptr: NonNull<u8>) -> usize {
        let header = live_header(ptr);
        match (*header).tag() {
            BlockTag::Used => self.page_of(header).count(ptr),
            _ => (*header).count(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn set_count(&self, ptr: NonNull<u8>, count: usize) {
        live_header(ptr);
        self.store_count(ptr, count)
    }

    /// Payload bytes the caller may use, at least what was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        (*live_header(ptr)).usable_size()
    }

    /// Finds out whether `ptr` lives in one of this allocator's pages or in a big block.
    ///
    /// # Safety
    ///
    /// The [`BLOCK_HEADER_SIZE`] bytes in front of `ptr` must be readable.
    pub unsafe fn owner_of(&self, ptr: NonNull<u8>) -> Result<BlockOwner<'_>, AllocError> {
        let address = ptr.as_ptr() as usize;
        if address < BLOCK_HEADER_SIZE || !is_aligned(address, PAYLOAD_ALIGNMENT) {
            return Err(AllocError::InvalidPointer(address));
        }

        let header = BlockHeader::from_payload(ptr);
        match (*header).try_tag() {
            Some(BlockTag::Big) if is_aligned(header as usize, virtual_memory::page_size()) => {
                Ok(BlockOwner::Big)
            }
            Some(BlockTag::Used) => {
                let base = page_base_of(header as usize, self.page_size());
                if (header as usize).checked_sub((*header).owner()) != Some(base) {
                    return Err(AllocError::InvalidPointer(address));
                }
                self.pages()
                    .find(|page| page.base() == base)
                    .map(BlockOwner::Page)
                    .ok_or(AllocError::InvalidPointer(address))
            }
            _ => Err(AllocError::InvalidPointer(address)),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            big_blocks: self.big_block_count(),
            ..AllocatorStats::default()
        };

        for page in self.pages() {
            let used = page.used();
            stats.pages += 1;
            stats.used_bytes += used;
            stats.free_bytes += page.usable_size() - used;
        }

        stats
    }

    /// Runs [`SegPage::check_state`] on every page and checks the page list itself.
    pub fn check_state(&self) -> Result<AllocatorStats, AllocError> {
        let mut stats = AllocatorStats {
            big_blocks: self.big_block_count(),
            ..AllocatorStats::default()
        };

        for page in self.pages() {
            if page.page_size() != self.page_size() || !is_aligned(page.base(), page.page_size()) {
                return Err(AllocError::CorruptedState {
                    page: page.base(),
                    reason: "page does not match the allocator page size",
                });
            }

            let page_stats = page.check_state()?;
            stats.pages += 1;
            stats.used_bytes += page_stats.used_bytes;
            stats.free_bytes += page_stats.free_bytes;
        }

        if stats.pages != self.page_count() {
            return Err(AllocError::CorruptedState {
                page: 0,
                reason: "page count disagrees with the page list",
            });
        }

        Ok(stats)
    }

    /// Unmaps every page. Blocks still handed out dangle afterwards; big blocks are left
    /// alone and stay valid until freed.
    pub fn discard(&mut self) {
        let mut page = std::mem::replace(self.pages.get_mut(), null_mut());
        *self.last_successful.get_mut() = null_mut();
        let count = std::mem::replace(self.page_count.get_mut(), 0);

        while let Some(current) = NonNull::new(page) {
            unsafe {
                page = current.as_ref().next;
                SegPage::destroy(current);
            }
        }

        if count > 0 {
            log::debug!(
                target: "segalloc",
                "discarded {} pages ({})",
                count,
                formatted_size(count * self.page_size())
            );
        }
    }

    /// Links a page built outside of [`alloc`](Self::alloc), such as a restored one.
    pub(crate) fn adopt(&self, page: OwnedPage) {
        let _guard = self.grow_lock.lock();
        unsafe { self.link_page(page.into_raw()) };
    }

    fn alloc_bytes(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        if bytes >= self.config.big_threshold() {
            return self.alloc_big(bytes);
        }

        match self.alloc_from_pages(bytes) {
            Some(ptr) => Ok(ptr),
            None => self.alloc_from_new_page(bytes),
        }
    }

    fn alloc_big(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        match big_block::alloc(bytes) {
            Ok(ptr) => {
                self.big_blocks.fetch_add(1, Ordering::Relaxed);
                Ok(ptr)
            }
            Err(err) => self.out_of_memory(err),
        }
    }

    /// One round over the page list starting at the last successful page. Contended
    /// pages and pages whose largest free block is too small are skipped.
    fn alloc_from_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
        let needed = block_size_for(bytes, self.granularity)?;
        let head = self.pages.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }

        let hint = self.last_successful.load(Ordering::Acquire);
        let start = if hint.is_null() { head } else { hint };
        let mut page = start;

        // a racing insert can make the list longer than the count we read, never shorter
        for _ in 0..self.page_count().max(1) {
            let current = unsafe { &*page };

            if current.try_largest_free().map_or(false, |largest| largest >= needed) {
                if let Some(ptr) = current.alloc(bytes) {
                    self.last_successful.store(page, Ordering::Release);
                    return Some(ptr);
                }
            }

            page = if current.next.is_null() { head } else { current.next };
            if page == start {
                break;
            }
        }

        None
    }

    fn alloc_from_new_page(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let _guard = self.grow_lock.lock();

        // someone may have linked a page while this thread waited for the lock
        if let Some(ptr) = self.alloc_from_pages(bytes) {
            return Ok(ptr);
        }

        if let Some(max_pages) = self.config.max_pages {
            if self.page_count() >= max_pages {
                return self.out_of_memory(AllocError::out_of_memory(self.page_size()));
            }
        }

        let page = match SegPage::create(self.page_size(), self.locking) {
            Ok(page) => page,
            Err(err) => return self.out_of_memory(err),
        };

        unsafe {
            let ptr = match page.as_ref().alloc(bytes) {
                Some(ptr) => ptr,
                None => {
                    SegPage::destroy(page);
                    return self.out_of_memory(AllocError::out_of_memory(bytes));
                }
            };

            self.link_page(page);
            self.last_successful.store(page.as_ptr(), Ordering::Release);
            Ok(ptr)
        }
    }

    /// Pushes `page` at the head of the list.
    ///
    /// # Safety
    ///
    /// `grow_lock` must be held and `page` must not be linked anywhere.
    unsafe fn link_page(&self, page: NonNull<SegPage>) {
        (*page.as_ptr()).next = self.pages.load(Ordering::Relaxed);
        self.pages.store(page.as_ptr(), Ordering::Release);
        let count = self.page_count.fetch_add(1, Ordering::AcqRel) + 1;

        log::debug!(
            target: "segalloc",
            "page #{} at {:#x} ({})",
            count,
            page.as_ref().base(),
            formatted_size(page.as_ref().page_size())
        );
    }

    unsafe fn realloc_bytes(
        &self,
        ptr: NonNull<u8>,
        bytes: usize,
        keep_content: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let header = BlockHeader::from_payload(ptr);
        let big = bytes >= self.config.big_threshold();

        match ((*header).tag(), big) {
            (BlockTag::Free, _) => panic!("realloc of freed block {:p}", ptr),
            (BlockTag::Big, true) => match big_block::realloc(header, bytes, keep_content) {
                Ok(moved) => Ok(moved),
                Err(err) => {
                    if !keep_content {
                        self.free(ptr);
                    }
                    self.out_of_memory(err)
                }
            },
            (BlockTag::Used, false) => {
                let page = self.page_of(header);
                if let Some(moved) = page.realloc(ptr, bytes, keep_content) {
                    return Ok(moved);
                }

                // the page is too full; move to another one
                if keep_content {
                    self.move_block(ptr, bytes)
                } else {
                    self.alloc_bytes(bytes)
                }
            }
            // crossing the big block threshold in either direction always moves
            _ => {
                if keep_content {
                    self.move_block(ptr, bytes)
                } else {
                    self.free(ptr);
                    self.alloc_bytes(bytes)
                }
            }
        }
    }

    /// Allocates a new home for a live block, copies its content and count over, then
    /// frees it. The block is untouched when the allocation fails.
    unsafe fn move_block(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let header = BlockHeader::from_payload(ptr);
        let fresh = self.alloc_bytes(bytes)?;

        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            fresh.as_ptr(),
            (*header).usable_size().min(bytes),
        );
        self.store_count(fresh, self.count(ptr));
        self.free(ptr);

        Ok(fresh)
    }

    /// Page owning a used block. Panics when the owner offset points outside of an
    /// aligned page.
    unsafe fn page_of(&self, header: *mut BlockHeader) -> &SegPage {
        let base = (header as usize).wrapping_sub((*header).owner());
        assert_eq!(
            base,
            page_base_of(header as usize, self.page_size()),
            "block {:p} does not belong to a page of this allocator",
            header
        );
        debug_assert!(
            self.pages().any(|page| page.base() == base),
            "block {:p} does not belong to this allocator",
            header
        );
        &*(base as *const SegPage)
    }

    /// Writes the item count of a live block. Page blocks are written under their page
    /// lock since [`SegPage::blocks`] reads counts from other threads.
    unsafe fn store_count(&self, ptr: NonNull<u8>, count: usize) {
        let header = BlockHeader::from_payload(ptr);
        match (*header).tag() {
            BlockTag::Used => self.page_of(header).set_count(ptr, count),
            _ => (*header).set_count(count),
        }
    }

    fn out_of_memory<T>(&self, err: AllocError) -> Result<T, AllocError> {
        match self.config.oom_policy {
            OomPolicy::Abort => {
                log::error!(target: "segalloc", "{}", err);
                std::panic::panic_any(err)
            }
            OomPolicy::ReturnError => {
                log::debug!(target: "segalloc", "{}", err);
                Err(err)
            }
        }
    }
}

impl Default for SegAllocator {
    fn default() -> Self {
        Self::new(SegAllocatorConfig::default())
    }
}

impl Drop for SegAllocator {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Header of a used or big block. Panics on a freed or corrupted one.
unsafe fn live_header(ptr: NonNull<u8>) -> *mut BlockHeader {
    let header = BlockHeader::from_payload(ptr);
    if (*header).tag() == BlockTag::Free {
        panic!("use of freed block {:p}", ptr);
    }
    header
}

/// Iterator over the pages of a [`SegAllocator`].
pub struct Pages<'a> {
    next: *mut SegPage,
    marker: PhantomData<&'a SegPage>,
}

impl<'a> Iterator for Pages<'a> {
    type Item = &'a SegPage;

    fn next(&mut self) -> Option<&'a SegPage> {
        let page = unsafe { self.next.as_ref()? };
        self.next = page.next;
        Some(page)
    }
}
