//! File signatures for optimistic concurrency.
//!
//! A signature captures the identity of the backing file (volume, file id,
//! modification time, size). It says nothing about the content; it only
//! answers "is this still the file I read?". A missing file has the zero
//! signature, so "no document yet" compares equal to itself.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PrefsError, Result};

/// Identity fingerprint of a backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub volume_id: u64,
    pub file_id: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub size: u64,
}

impl Signature {
    /// The signature of a file that does not exist.
    pub const ZERO: Signature = Signature {
        volume_id: 0,
        file_id: 0,
        mtime_secs: 0,
        mtime_nanos: 0,
        size: 0,
    };

    /// Stat `path`. A missing file yields [`Signature::ZERO`]; any other
    /// failure is an error.
    pub fn of(path: &Path) -> Result<Signature> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Self::from_metadata(&meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Signature::ZERO),
            Err(err) => Err(PrefsError::io(path, err)),
        }
    }

    /// Build a signature from an existing stat snapshot.
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Signature {
        use std::os::unix::fs::MetadataExt;

        Signature {
            volume_id: meta.dev(),
            file_id: meta.ino(),
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec() as u32,
            size: meta.size(),
        }
    }

    /// Build a signature from an existing stat snapshot.
    #[cfg(not(unix))]
    pub fn from_metadata(meta: &fs::Metadata) -> Signature {
        use std::time::UNIX_EPOCH;

        let (mtime_secs, mtime_nanos) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
            .unwrap_or((0, 0));

        Signature {
            volume_id: 0,
            file_id: 0,
            mtime_secs,
            mtime_nanos,
            size: meta.len(),
        }
    }

    /// Field-wise comparison.
    pub fn matches(&self, other: &Signature) -> bool {
        self == other
    }

    /// True for the signature of a missing file.
    pub fn is_zero(&self) -> bool {
        *self == Signature::ZERO
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dev={} ino={} mtime={}.{:09} size={}",
            self.volume_id, self.file_id, self.mtime_secs, self.mtime_nanos, self.size
        )
    }
}
