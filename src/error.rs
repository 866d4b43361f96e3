//! Centralized error types for mailstash.

use std::path::PathBuf;
use thiserror::Error;

use crate::parser::decode::DecodeError;
use crate::pipeline::archive::ArchiveError;

/// All errors produced by the mailstash library.
#[derive(Error, Debug)]
pub enum StashError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration is missing a value or holds an unusable one.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The mailbox server or transport reported an error.
    #[error("IMAP error: {0}")]
    Imap(String),

    /// A mailbox operation did not complete in time.
    #[error("Timed out while {0}")]
    Timeout(String),

    /// Transfer-encoded content could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The decryption tool could not be started.
    #[error("Failed to start decryption tool '{program}': {source}")]
    DecryptSpawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// The decryption tool exited with a status outside the accepted set.
    #[error("Decryption of '{path}' failed (exit code {code:?}): {stderr}")]
    DecryptFailed {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    /// The remote archive rejected or failed an upload.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Convenience alias for `Result<T, StashError>`.
pub type Result<T> = std::result::Result<T, StashError>;

impl StashError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (prefer `StashError::io`).
impl From<std::io::Error> for StashError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<async_imap::error::Error> for StashError {
    fn from(err: async_imap::error::Error) -> Self {
        Self::Imap(err.to_string())
    }
}
