//! Collective error types.
//!
//! Fallible functions in this crate return [`anyhow::Result`], mirroring the
//! rest of the stack. When a call fails because one of its preconditions was
//! violated, the underlying error is a [`CollectiveError`], which can be
//! recovered with [`anyhow::Error::downcast_ref`].
//!
//! Tally recognizes three flavors of failure:
//! - Precondition violations, such as a buffer whose length does not match the
//!   declared element count, a root rank out of range, or participants that
//!   disagree on the shape of a call. These are fatal.
//! - Encoding and decoding failures inside the
//!   [`SerializeReducer`](crate::reducer::SerializeReducer), such as an object
//!   whose encoding exceeds its slot. These are fatal as well; objects are
//!   never truncated or padded to fit.
//! - Transport faults. These are owned by the [`Engine`](crate::engine::Engine)
//!   and never retried by this layer.
//!
//! ```
//! use tally::error::CollectiveError;
//!
//! let err = anyhow::Error::from(CollectiveError::RootOutOfRange { root: 4, world_size: 4 });
//! assert!(matches!(
//!     err.downcast_ref::<CollectiveError>(),
//!     Some(CollectiveError::RootOutOfRange { root: 4, .. })
//! ));
//! ```
use std::string::FromUtf8Error;

use thiserror::Error;

/// Failures raised by the collective layer.
#[derive(Error, Debug)]
pub enum CollectiveError {
    /// The byte buffer handed to a collective does not hold exactly `count`
    /// elements of `elem_size` bytes.
    #[error("buffer holds {actual} bytes, but {count} elements of {elem_size} bytes were declared")]
    BufferSize {
        actual: usize,
        elem_size: usize,
        count: usize,
    },

    /// A combine function was handed an element size it cannot interpret.
    #[error("combine function expects {expected}-byte elements, got {actual}")]
    ElementSize { expected: usize, actual: usize },

    /// The root of a broadcast is not a rank of the group.
    #[error("root rank {root} is out of range for a group of {world_size}")]
    RootOutOfRange { root: usize, world_size: usize },

    /// A participant disagrees with rank 0 about the shape of a collective
    /// call.
    #[error("rank {rank} disagrees with rank 0 on the {what} of collective call {seq}")]
    Mismatch {
        rank: usize,
        seq: u64,
        what: &'static str,
    },

    /// A participant abandoned a collective call because a local step failed
    /// before it could contribute.
    #[error("rank {rank} abandoned collective call {seq}: {message}")]
    RankFailed {
        rank: usize,
        seq: u64,
        message: String,
    },

    /// A collective call failed on the participant that completed it.
    #[error("collective call {seq} failed: {message}")]
    Aborted { seq: u64, message: String },

    /// The result of a call does not fit the caller's buffer.
    #[error("result of collective call {seq} holds {result} bytes, but the buffer holds {expected}")]
    ResultSize {
        seq: u64,
        result: usize,
        expected: usize,
    },

    /// An encoded object does not fit its slot.
    #[error("encoded object needs {needed} bytes, but the slot budget is {budget}")]
    EncodeOverflow { needed: usize, budget: usize },

    /// A slot declares more payload bytes than it can hold.
    #[error("slot declares {declared} payload bytes, but only {available} are available")]
    DecodeOverflow { declared: usize, available: usize },

    /// A slot is too small to hold even the length header.
    #[error("slot of {size} bytes cannot hold the {header}-byte length header")]
    SlotTooSmall { size: usize, header: usize },

    /// A broadcast string payload is not valid UTF-8.
    #[error("broadcast string is not valid UTF-8")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// A broadcast length does not fit the receiving platform.
    #[error("broadcast length {0} does not fit in this platform's address space")]
    LengthOverflow(u64),

    /// A group needs at least one rank.
    #[error("a group needs at least one rank")]
    EmptyGroup,

    /// A rank outside of the group was requested.
    #[error("rank {rank} is out of range for a group of {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}
