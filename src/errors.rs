//! Error surface of the trie and its views.
use thiserror::Error;

/// Errors produced by the database, views, and storage backends.
///
/// `Clone` is required so the result of the one-shot materialisation can be
/// cached inside a view and handed back to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrieError {
    /// The view has already been committed.
    #[error("view has been committed")]
    Committed,

    /// The trie this view was based on has changed, rendering the view
    /// invalid.
    #[error("view is invalid because an ancestor trie has changed")]
    Invalid,

    /// The underlying store only supports whole-byte keys, so a value cannot
    /// be recorded at a key with a partial byte length.
    #[error("cannot record a value at a key with a partial byte length")]
    PartialByteLengthWithValue,

    /// The path walk failed to stop at the closest node; the trie structure
    /// violated its own invariants.
    #[error("path walk failed to return the closest node")]
    GetPathToFailure,

    /// A range operation was given `start > end`.
    #[error("start key is after end key")]
    StartAfterEnd,

    /// The view constructor could not obtain a root node from its parent.
    #[error("no valid root was provided to the view constructor")]
    NoValidRoot,

    /// A view whose parent is not the database reached the database commit
    /// path.
    #[error("parent trie is not the database")]
    ParentNotDatabase,

    /// The trie was mutated after its node changes had been calculated.
    #[error("cannot modify the trie after node changes have been calculated")]
    NodesAlreadyCalculated,

    /// A range proof was requested with a maximum length of zero.
    #[error("range proof max length must be at least 1")]
    InvalidMaxLength,

    /// The requested node or value does not exist.
    #[error("not found")]
    NotFound,

    /// A stored node could not be decoded.
    #[error("malformed node encoding: {0}")]
    Codec(String),

    /// The storage backend failed.
    #[error("storage backend error: {0}")]
    Storage(String),
}
