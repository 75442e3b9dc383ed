use std::fmt;

use crate::{
    block::granularity_shift_for,
    page::{normalize_page_size, MAX_PAGE_SIZE, MIN_PAGE_SIZE},
    utils::{formatted_size, read_string_from_env, read_uint_from_env},
};

pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// What the allocator does when the OS (or the page limit) refuses memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OomPolicy {
    /// Log the failure and raise the [`AllocError`](crate::AllocError) as a panic payload.
    Abort,
    /// Hand `Err(AllocError::OutOfMemory)` back to the caller.
    ReturnError,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegAllocatorConfig {
    /// Size of every page. Rounded up to a power of two in `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`.
    /// Requests of half a page or more bypass pages entirely.
    pub page_size: usize,
    /// Most pages the allocator may own. Going past it is treated as out of memory.
    pub max_pages: Option<usize>,
    pub oom_policy: OomPolicy,
}

impl Default for SegAllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
            oom_policy: OomPolicy::Abort,
        }
    }
}

impl SegAllocatorConfig {
    /// Default configuration overridden by `SEGALLOC_PAGE_SIZE`, `SEGALLOC_MAX_PAGES` and
    /// `SEGALLOC_OOM` (`abort` or `error`).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.page_size = match read_uint_from_env("SEGALLOC_PAGE_SIZE") {
            Some(size) if size > 0 => normalize_page_size(size),
            _ => DEFAULT_PAGE_SIZE,
        };

        config.max_pages = match read_uint_from_env("SEGALLOC_MAX_PAGES") {
            Some(0) | None => None,
            Some(pages) => Some(pages),
        };

        config.oom_policy = match read_string_from_env("SEGALLOC_OOM") {
            Some(policy) => match policy.to_lowercase().as_str() {
                "error" | "return" => OomPolicy::ReturnError,
                _ => OomPolicy::Abort,
            },
            None => OomPolicy::Abort,
        };

        config
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_oom_policy(mut self, policy: OomPolicy) -> Self {
        self.oom_policy = policy;
        self
    }

    /// Same configuration with the page size snapped to what pages really use.
    pub fn normalized(mut self) -> Self {
        self.page_size = normalize_page_size(self.page_size);
        self
    }

    /// Requests of this many bytes or more are served as big blocks.
    pub fn big_threshold(&self) -> usize {
        normalize_page_size(self.page_size) / 2
    }

    pub fn granularity(&self) -> usize {
        1 << granularity_shift_for(normalize_page_size(self.page_size))
    }
}

impl fmt::Display for SegAllocatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegAllocatorConfig")
            .field("page_size", &formatted_size(normalize_page_size(self.page_size)))
            .field("granularity", &self.granularity())
            .field("big_threshold", &formatted_size(self.big_threshold()))
            .field("max_pages", &self.max_pages)
            .field("oom_policy", &self.oom_policy)
            .field("page_size_range", &(MIN_PAGE_SIZE..=MAX_PAGE_SIZE))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SegAllocatorConfig::default();
        assert_eq!(config.page_size, 64 * 1024);
        assert_eq!(config.big_threshold(), 32 * 1024);
        assert_eq!(config.granularity(), 16);
        assert_eq!(config.oom_policy, OomPolicy::Abort);
    }

    #[test]
    fn test_normalized() {
        let config = SegAllocatorConfig::default().with_page_size(100_000).normalized();
        assert_eq!(config.page_size, 128 * 1024);

        let config = SegAllocatorConfig::default().with_page_size(10).normalized();
        assert_eq!(config.page_size, MIN_PAGE_SIZE);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("SEGALLOC_PAGE_SIZE", "256K");
        std::env::set_var("SEGALLOC_MAX_PAGES", "12");
        std::env::set_var("SEGALLOC_OOM", "error");

        let config = SegAllocatorConfig::from_env();

        std::env::remove_var("SEGALLOC_PAGE_SIZE");
        std::env::remove_var("SEGALLOC_MAX_PAGES");
        std::env::remove_var("SEGALLOC_OOM");

        assert_eq!(config.page_size, 256 * 1024);
        assert_eq!(config.max_pages, Some(12));
        assert_eq!(config.oom_policy, OomPolicy::ReturnError);
        assert!(config.to_string().contains("256.0K"));
    }
}
