//! The crate's single structured error type.
//!
//! Every fallible operation in this crate returns [`Error`]. `std::io::Error`
//! is never returned bare -- it is always wrapped in [`Error::Io`] together
//! with the path that was being operated on, so that a caller several frames
//! removed from the failing syscall can still report something actionable.

use std::path::PathBuf;

use crate::checksum::Checksum;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while operating on a repository.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A ref or object was requested but could not be found locally or in
    /// any parent repository.
    #[error("{what} not found: {name}")]
    NotFound {
        /// Kind of thing that was missing, e.g. "object", "ref", "pack".
        what: &'static str,
        /// The name or checksum that could not be resolved.
        name: String,
    },

    /// A staged object's observed checksum did not match what the caller
    /// claimed it would be.
    #[error("corrupted object: expected {expected}, got {actual}")]
    CorruptedObject {
        /// The checksum the caller asserted ahead of time.
        expected: Checksum,
        /// The checksum actually computed from the streamed bytes.
        actual: Checksum,
    },

    /// A ref name failed validation (empty component, path escape, or a
    /// component that is itself a valid checksum).
    #[error("invalid ref {name:?}: {reason}")]
    InvalidRef {
        /// The rejected ref name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A serialized variant failed to parse, or parsed to the wrong shape.
    #[error("invalid format in {context}: {detail}")]
    InvalidFormat {
        /// Where the bad data was encountered, e.g. "pack index foo".
        context: String,
        /// What was wrong with it.
        detail: String,
    },

    /// The repository's `config` file is missing a required key or contains
    /// an unrecognized value.
    #[error("invalid config: {detail}")]
    InvalidConfig {
        /// Description of the configuration problem.
        detail: String,
    },

    /// A staging call was made outside of `prepare`/`commit`, or `commit`
    /// was called without a matching `prepare`.
    #[error("transaction state error: expected {expected}, found {actual}")]
    TransactionState {
        /// The state the caller should have been in.
        expected: &'static str,
        /// The state they were actually in.
        actual: &'static str,
    },

    /// A filesystem operation failed; `path` is the file or directory that
    /// was being operated on when `source` occurred.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path under operation.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A capability was requested that this build or this repository mode
    /// does not provide.
    #[error("unsupported: {feature}")]
    Unsupported {
        /// The missing capability.
        feature: &'static str,
    },

    /// A caller-supplied cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a [`Error::NotFound`] for the given kind of thing.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Error {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }
}

/// Extension trait for attaching a path to an `io::Result` as it crosses a
/// function boundary, so every leaf I/O error carries path context.
pub trait IoContext<T> {
    /// Convert `self` into a crate [`Result`], attaching `path` on failure.
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
