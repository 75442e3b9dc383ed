//! Saving pages to a byte stream and loading them back, possibly at another address.
//!
//! Stream layout, all integers little endian `u64`:
//!
//! ```text
//! +-----------+----+------+-------------+----------+---------+------------------------+
//! | page_size | me | used | free_blocks | smallest | largest | block area (raw bytes) |
//! +-----------+----+------+-------------+----------+---------+------------------------+
//! ```
//!
//! repeated once per page and closed by a `page_size` of zero. The block area is the
//! page from its first block to its end, verbatim. Used blocks record their owner as an
//! offset, so only the free list and its anchors hold absolute addresses: those are
//! shifted by the distance between the saved `me` and the new page base. The page lock
//! and the rest of the page header are never part of the stream.

use std::io::{self, Read, Write};

use crate::{
    block::{BlockHeader, MIN_BLOCK_SIZE},
    error::AllocError,
    page::{OwnedPage, PageState, SegPage},
    seg_allocator::SegAllocator,
    utils::formatted_size,
};

/// `page_size` value closing a multi page stream.
const END_MARKER: u64 = 0;

fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_usize<R: Read>(reader: &mut R) -> Result<usize, AllocError> {
    let value = read_u64(reader)?;
    usize::try_from(value).map_err(|_| {
        AllocError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{:#x} does not fit a machine word", value),
        ))
    })
}

struct SavedHeader {
    me: usize,
    used: usize,
    free_blocks: usize,
    smallest: usize,
    largest: usize,
}

impl SegPage {
    /// Writes this page to `writer`. The page lock is held for the whole dump.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), AllocError> {
        self.with_state(|state| -> Result<(), AllocError> {
            write_u64(writer, self.page_size() as u64)?;
            write_u64(writer, state.me as u64)?;
            write_u64(writer, state.used as u64)?;
            write_u64(writer, state.free_blocks as u64)?;
            write_u64(writer, state.smallest as usize as u64)?;
            write_u64(writer, state.largest as usize as u64)?;

            let area = unsafe {
                std::slice::from_raw_parts(self.first_block().cast::<u8>(), self.usable_size())
            };
            writer.write_all(area)?;
            Ok(())
        })
    }

    /// Replaces the content of this page with one saved by [`save`](Self::save).
    ///
    /// Fails with [`AllocError::SizeMismatch`] before touching the page when the stream
    /// holds a page of another size. Every block of this page is lost on success.
    pub fn restore<R: Read>(&self, reader: &mut R) -> Result<(), AllocError> {
        let found = read_usize(reader)?;
        if found != self.page_size() {
            return Err(AllocError::SizeMismatch {
                expected: self.page_size(),
                found,
            });
        }

        self.restore_body(reader)
    }

    /// Restores everything following the `page_size` field.
    ///
    /// The body is read in full before the page is touched. When the restored state does
    /// not hold up to [`check_state`](Self::check_state) the page is reset to empty and
    /// the error returned.
    pub(crate) fn restore_body<R: Read>(&self, reader: &mut R) -> Result<(), AllocError> {
        let saved = SavedHeader {
            me: read_usize(reader)?,
            used: read_usize(reader)?,
            free_blocks: read_usize(reader)?,
            smallest: read_usize(reader)?,
            largest: read_usize(reader)?,
        };

        let mut area = vec![0u8; self.usable_size()];
        reader.read_exact(&mut area)?;

        self.with_state(|state| unsafe {
            std::ptr::copy_nonoverlapping(
                area.as_ptr(),
                self.first_block().cast::<u8>(),
                area.len(),
            );

            state.me = saved.me;
            state.used = saved.used;
            state.free_blocks = saved.free_blocks;
            state.smallest = saved.smallest as *mut BlockHeader;
            state.largest = saved.largest as *mut BlockHeader;

            let result = self
                .rebase(state)
                .and_then(|()| self.check_state_locked(state).map(|_| ()));

            if let Err(err) = &result {
                log::warn!(target: "segalloc", "dropping restored page {:#x}: {}", self.base(), err);
                self.reset_locked(state);
            }

            result
        })
    }

    /// Shifts the free list anchors and links from the saved base to this page.
    unsafe fn rebase(&self, state: &mut PageState) -> Result<(), AllocError> {
        let diff = self.base().wrapping_sub(state.me);
        let shift = |block: *mut BlockHeader| {
            if block.is_null() {
                block
            } else {
                (block as usize).wrapping_add(diff) as *mut BlockHeader
            }
        };

        state.smallest = shift(state.smallest);
        state.largest = shift(state.largest);

        let mut node = state.smallest;
        let mut seen = 0;

        while !node.is_null() {
            if seen == state.free_blocks || !self.may_hold_block(node as usize) {
                return Err(AllocError::CorruptedState {
                    page: self.base(),
                    reason: "free list link points outside the page",
                });
            }

            let links = BlockHeader::links(node);
            (*links).prev = shift((*links).prev);
            (*links).next = shift((*links).next);

            node = (*links).next;
            seen += 1;
        }

        state.me = self.base();
        Ok(())
    }

    fn may_hold_block(&self, address: usize) -> bool {
        let first = self.first_block() as usize;
        address >= first
            && address
                .checked_add(MIN_BLOCK_SIZE)
                .map_or(false, |end| end <= self.end())
            && (address - first) % self.granularity() == 0
    }
}

impl SegAllocator {
    /// Writes every page, oldest first, followed by the end marker. Big blocks are not
    /// part of the stream. Returns the number of pages written.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<usize, AllocError> {
        let pages: Vec<&SegPage> = self.pages().collect();

        for page in pages.iter().rev() {
            page.save(writer)?;
        }
        write_u64(writer, END_MARKER)?;

        log::info!(
            target: "segalloc",
            "saved {} pages ({})",
            pages.len(),
            formatted_size(pages.len() * self.page_size())
        );
        Ok(pages.len())
    }

    /// Reads pages written by [`save`](Self::save) and links them next to the pages this
    /// allocator already has. Returns the number of pages restored.
    ///
    /// Pages restored before an error stay linked; the failing page is dropped.
    pub fn restore<R: Read>(&self, reader: &mut R) -> Result<usize, AllocError> {
        let mut restored = 0;

        loop {
            let found = read_usize(reader)?;
            if found == END_MARKER as usize {
                break;
            }
            if found != self.page_size() {
                return Err(AllocError::SizeMismatch {
                    expected: self.page_size(),
                    found,
                });
            }

            let page = unsafe { OwnedPage::from_raw(SegPage::create(found, self.is_locking())?) };
            page.restore_body(reader)?;
            self.adopt(page);
            restored += 1;
        }

        log::info!(
            target: "segalloc",
            "restored {} pages ({})",
            restored,
            formatted_size(restored * self.page_size())
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, ptr::NonNull};

    use super::*;

    fn moved(ptr: NonNull<u8>, from: &SegPage, to: &SegPage) -> NonNull<u8> {
        let offset = ptr.as_ptr() as usize - from.base();
        NonNull::new((to.base() + offset) as *mut u8).unwrap()
    }

    #[test]
    fn test_restore_at_another_address() {
        let source = OwnedPage::new(4096).unwrap();
        let a = source.alloc(100).unwrap();
        let gap = source.alloc(300).unwrap();
        let b = source.alloc(200).unwrap();

        unsafe {
            a.as_ptr().write_bytes(0xAA, 100);
            b.as_ptr().write_bytes(0xBB, 200);
            source.set_count(a, 100);
            source.set_count(b, 50);
            source.free(gap);
        }

        let mut stream = Vec::new();
        source.save(&mut stream).unwrap();

        let target = OwnedPage::new(4096).unwrap();
        assert_ne!(target.base(), source.base());
        target.restore(&mut Cursor::new(&stream)).unwrap();

        assert_eq!(target.blocks(), source.blocks());
        assert_eq!(target.free_list_sizes(), source.free_list_sizes());
        assert_eq!(target.used(), source.used());
        target.check_state().unwrap();

        let a2 = moved(a, &source, &target);
        let b2 = moved(b, &source, &target);
        unsafe {
            assert_eq!(target.count(a2), 100);
            assert_eq!(target.count(b2), 50);
            assert!(std::slice::from_raw_parts(a2.as_ptr(), 100).iter().all(|&x| x == 0xAA));
            assert!(std::slice::from_raw_parts(b2.as_ptr(), 200).iter().all(|&x| x == 0xBB));

            // the rebased free list is usable: the gap gets reused first
            let reused = target.alloc(250).unwrap();
            assert_eq!(reused, moved(gap, &source, &target));

            target.free(reused);
            target.free(a2);
            target.free(b2);
        }

        let stats = target.check_state().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(target.used(), 0);
    }

    #[test]
    fn test_restore_rejects_other_page_size() {
        let source = OwnedPage::new(4096).unwrap();
        let _ = source.alloc(10).unwrap();
        let mut stream = Vec::new();
        source.save(&mut stream).unwrap();

        let target = OwnedPage::new(8192).unwrap();
        let kept = target.alloc(64).unwrap();

        match target.restore(&mut Cursor::new(&stream)) {
            Err(AllocError::SizeMismatch { expected, found }) => {
                assert_eq!(expected, 8192);
                assert_eq!(found, 4096);
            }
            other => panic!("expected a size mismatch, got {:?}", other),
        }

        // nothing was applied
        assert_eq!(target.check_state().unwrap().used_blocks, 1);
        unsafe { target.free(kept) };
    }

    #[test]
    fn test_truncated_stream() {
        let source = OwnedPage::new(4096).unwrap();
        let mut stream = Vec::new();
        source.save(&mut stream).unwrap();
        stream.truncate(stream.len() - 1);

        let target = OwnedPage::new(4096).unwrap();
        let kept = target.alloc(64).unwrap();

        match target.restore(&mut Cursor::new(&stream)) {
            Err(AllocError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected an i/o error, got {:?}", other),
        }
        assert_eq!(target.check_state().unwrap().used_blocks, 1);
        unsafe { target.free(kept) };
    }

    #[test]
    fn test_corrupted_stream_resets_page() {
        let source = OwnedPage::new(4096).unwrap();
        let _a = source.alloc(100).unwrap();
        let mut stream = Vec::new();
        source.save(&mut stream).unwrap();

        // shift the saved base so the free list no longer lands on block boundaries
        let me = u64::from_le_bytes(stream[8..16].try_into().unwrap()) + 8;
        stream[8..16].copy_from_slice(&me.to_le_bytes());

        let target = OwnedPage::new(4096).unwrap();
        assert!(matches!(
            target.restore(&mut Cursor::new(&stream)),
            Err(AllocError::CorruptedState { .. })
        ));

        let stats = target.check_state().unwrap();
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_bytes, target.usable_size());
    }
}
