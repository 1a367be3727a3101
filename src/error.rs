//! Shared error taxonomy for the Judy array, range allocator, and
//! red-black tree.
//!
//! `no_std`-friendly: implements [`core::fmt::Display`] directly rather
//! than depending on `thiserror`, matching the teacher crate's
//! zero-external-dependency posture for its own primitives.

use core::fmt;

/// Failure outcomes a caller can observe from any public operation.
///
/// `TransientRace` never escapes a public API: it only drives internal
/// bounded-retry loops (lost races on a recompaction, a concurrently
/// deleted range, a contended RBT mutex) and is mapped to a real
/// outcome or retried before returning to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The backing allocator could not satisfy a request; no partial
    /// state was published.
    AllocationFailure,
    /// A range-allocator `add` target was not wholly contained in one
    /// FREE range, or a Judy array `add_unique` found an existing entry.
    AlreadyExists,
    /// The target of an operation (a range, a tree node) was not found,
    /// including "it existed a moment ago but was concurrently removed."
    NotFound,
    /// A precondition on the arguments was violated (e.g. `start > end`,
    /// or `key_bits` not a multiple of 8 in `[8, 64]`).
    InvalidArgument,
    #[doc(hidden)]
    TransientRace,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::AllocationFailure => "allocation failure",
            Error::AlreadyExists => "entry already exists",
            Error::NotFound => "entry not found",
            Error::InvalidArgument => "invalid argument",
            Error::TransientRace => "transient internal race (retry)",
        };
        f.write_str(msg)
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = core::result::Result<T, Error>;
