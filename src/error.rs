use std::{fmt, io};

use errno::Errno;

use crate::utils::formatted_size;

/// Errors surfaced to callers of the allocator.
///
/// Misuse such as freeing a pointer twice is not represented here: it panics at the
/// point of detection.
#[derive(Debug)]
pub enum AllocError {
    /// The OS refused memory for a new page or a big block, or the configured page limit
    /// was reached.
    OutOfMemory {
        requested: usize,
        errno: Option<Errno>,
    },
    /// A persisted page declares a page size different from the receiving allocator.
    SizeMismatch { expected: usize, found: usize },
    /// Pointer does not designate a live block.
    InvalidPointer(usize),
    /// Reported by `check_state` when a page invariant does not hold.
    CorruptedState { page: usize, reason: &'static str },
    Io(io::Error),
}

impl AllocError {
    pub const fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory {
            requested,
            errno: None,
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                errno: Some(errno),
            } => write!(
                f,
                "out of memory while requesting {}: {}",
                formatted_size(*requested),
                errno
            ),
            Self::OutOfMemory { requested, .. } => {
                write!(f, "out of memory while requesting {}", formatted_size(*requested))
            }
            Self::SizeMismatch { expected, found } => write!(
                f,
                "page size mismatch: allocator uses {} but stream holds {}",
                formatted_size(*expected),
                formatted_size(*found)
            ),
            Self::InvalidPointer(addr) => write!(f, "{:#x} is not a live block", addr),
            Self::CorruptedState { page, reason } => {
                write!(f, "page at {:#x} is corrupted: {}", page, reason)
            }
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for AllocError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = AllocError::SizeMismatch {
            expected: 64 * 1024,
            found: 4096,
        };
        assert_eq!(
            err.to_string(),
            "page size mismatch: allocator uses 64.0K but stream holds 4.0K"
        );

        let err = AllocError::out_of_memory(1024 * 1024);
        assert!(err.is_out_of_memory());
        assert_eq!(err.to_string(), "out of memory while requesting 1.0M");

        let err = AllocError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
