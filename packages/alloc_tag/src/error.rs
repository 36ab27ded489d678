use thiserror::Error;

use crate::PageId;

/// Errors that can occur when tracking allocations by call site.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The tag arena has no free range large enough for the requested tag storage,
    /// even after reclaiming the ranges of unloaded components that are no longer in use.
    #[error("no free range of {requested} bytes left in the {capacity}-byte tag arena")]
    OutOfSpace {
        /// Number of bytes requested, including any prepended bytes.
        requested: usize,

        /// Total size of the tag arena in bytes.
        capacity: usize,
    },

    /// The caller provided a parameter value that did not match the expected format.
    #[error("invalid argument: '{invalid_value}' is invalid: {problem}")]
    InvalidArgument {
        /// The value that was rejected.
        invalid_value: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// A page tag handle was requested for a page that has no tag record.
    #[error("page {page} has no tag record")]
    InvalidHandle {
        /// The page for which no handle could be issued.
        page: PageId,
    },

    /// Allocation profiling was switched off for good at startup and cannot be toggled.
    #[error("allocation profiling is permanently disabled and cannot be toggled at runtime")]
    Locked,
}

impl Error {
    pub(crate) fn invalid_argument(
        invalid_value: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            invalid_value: invalid_value.into(),
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for allocation tagging operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
