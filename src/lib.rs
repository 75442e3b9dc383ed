//! Segmented free-list allocator.
//!
//! Memory is taken from the OS in power of two sized pages aligned to their own size.
//! Each [`SegPage`] serves variable sized blocks from a size sorted free list and
//! coalesces neighbours on free. A [`SegAllocator`] spreads requests over its pages,
//! grows the page list on demand and maps requests of half a page or more directly.
//! Pages can be written to a byte stream and loaded back at another address.

pub mod big_block;
pub mod block;
pub mod config;
pub mod error;
pub mod page;
pub mod persist;
pub mod seg_allocator;
pub mod utils;
pub mod virtual_memory;

pub use config::{OomPolicy, SegAllocatorConfig};
pub use error::AllocError;
pub use page::{BlockInfo, OwnedPage, PageStats, SegPage};
pub use seg_allocator::{AllocatorStats, BlockOwner, SegAllocator};
pub use utils::formatted_size;
