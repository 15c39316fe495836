//! Error taxonomy shared by every layer of the store.
//!
//! `Stale` and `Busy` are expected outcomes the caller must branch on; they
//! are kept distinct from `Io` so a commit is never retried over changes the
//! writer never saw.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Result alias used throughout the store.
pub type Result<T, E = PrefsError> = std::result::Result<T, E>;

/// Errors returned by tree, session, lock and commit operations.
#[derive(Debug, Error)]
pub enum PrefsError {
    /// No value, session or document at the requested location.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller passed something the operation cannot work with.
    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// A link node points at a path that cannot be parsed.
    #[error("bad link at {0}")]
    BadLink(String),

    /// Resolution followed more link hops than allowed.
    #[error("too many links while resolving {0}")]
    MaxLinksExceeded(String),

    /// This session already holds (or is acquiring) the lock.
    #[error("preferences already locked by this session")]
    AlreadyLocked,

    /// Another session holds the lock and the caller asked not to wait.
    #[error("preferences locked by another session")]
    Busy,

    /// The backing file changed since this session read it.
    #[error("preferences changed on disk since they were read")]
    Stale,

    /// The authorization check for the command failed.
    #[error("access denied")]
    AccessDenied,

    /// Filesystem or transport failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The tree could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// Malformed or unknown helper message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A blocking wait was cancelled because its connection went away.
    #[error("wait interrupted")]
    Interrupted,
}

impl PrefsError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &Path, source: io::Error) -> Self {
        PrefsError::Io {
            context: path.display().to_string(),
            source,
        }
    }

    /// Wrap an I/O error with a free-form description.
    pub fn io_context(context: impl Into<String>, source: io::Error) -> Self {
        PrefsError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the conditions a caller is expected to recover from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PrefsError::Stale | PrefsError::Busy)
    }
}

impl From<serde_json::Error> for PrefsError {
    fn from(err: serde_json::Error) -> Self {
        PrefsError::Serialize(err.to_string())
    }
}
