//! Store settings.
//!
//! Settings are read from a JSON file whose fields are all optional:
//!
//! ```json
//! {
//!   "prefsDir": "/var/db/prefstore",
//!   "defaultDocument": "preferences.json",
//!   "fileMode": 420,
//!   "helperSocket": "/var/run/prefstore-helper.sock"
//! }
//! ```
//!
//! A missing settings file means "all defaults".

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PrefsError, Result};

const DEFAULT_PREFS_DIR: &str = "/var/db/prefstore";
const DEFAULT_DOCUMENT: &str = "preferences.json";
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_HELPER_SOCKET: &str = "/var/run/prefstore-helper.sock";

/// Settings as they appear on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    prefs_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    default_document: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    file_mode: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    helper_socket: Option<PathBuf>,
}

/// Resolved store settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefsSettings {
    /// Directory holding documents addressed by relative id.
    pub prefs_dir: PathBuf,
    /// File name used when no document id is given.
    pub default_document: String,
    /// Permission bits for newly created documents.
    pub file_mode: u32,
    /// Where the privileged helper listens.
    pub helper_socket: PathBuf,
}

impl Default for PrefsSettings {
    fn default() -> Self {
        Self {
            prefs_dir: PathBuf::from(DEFAULT_PREFS_DIR),
            default_document: DEFAULT_DOCUMENT.to_string(),
            file_mode: DEFAULT_FILE_MODE,
            helper_socket: PathBuf::from(DEFAULT_HELPER_SOCKET),
        }
    }
}

impl PrefsSettings {
    /// Settings rooted at `prefs_dir`, everything else default.
    pub fn with_prefs_dir(prefs_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefs_dir: prefs_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(PrefsError::io(path, err)),
        };
        Self::from_json(&bytes)
    }

    /// Parse settings from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let file: SettingsFile = serde_json::from_slice(bytes)?;
        let defaults = Self::default();

        Ok(Self {
            prefs_dir: file.prefs_dir.unwrap_or(defaults.prefs_dir),
            default_document: file.default_document.unwrap_or(defaults.default_document),
            file_mode: file.file_mode.unwrap_or(defaults.file_mode),
            helper_socket: file.helper_socket.unwrap_or(defaults.helper_socket),
        })
    }

    /// Locate the backing file for a document id.
    ///
    /// - no id: the default document inside `prefs_dir`
    /// - relative id: resolved under `prefs_dir`
    /// - absolute id: used as is
    pub fn path_for(&self, prefs_id: Option<&str>) -> PathBuf {
        match prefs_id {
            None => self.prefs_dir.join(&self.default_document),
            Some(id) if Path::new(id).is_absolute() => PathBuf::from(id),
            Some(id) => self.prefs_dir.join(id),
        }
    }

    /// Like [`PrefsSettings::path_for`], but the id must stay inside
    /// `prefs_dir`: absolute ids and `..` components are refused.
    pub fn confined_path_for(&self, prefs_id: Option<&str>) -> Result<PathBuf> {
        if let Some(id) = prefs_id {
            let id_path = Path::new(id);
            if id_path.is_absolute() || id_path.has_root() {
                return Err(PrefsError::BadArgument(format!(
                    "document id {} must be relative",
                    id
                )));
            }
            if id_path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
            {
                return Err(PrefsError::BadArgument(format!(
                    "document id {} leaves the preferences directory",
                    id
                )));
            }
            if id_path.file_name().is_none() {
                return Err(PrefsError::BadArgument(format!(
                    "document id {} names no file",
                    id
                )));
            }
        }
        Ok(self.path_for(prefs_id))
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically, so every
/// spelling of a document maps to one identity.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| PrefsError::io_context("current directory", e))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.file_name().is_none() {
        return Err(PrefsError::BadArgument(format!(
            "{} is not a document path",
            path.display()
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = PrefsSettings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, PrefsSettings::default());
    }

    #[test]
    fn test_partial_file() {
        let settings =
            PrefsSettings::from_json(br#"{"prefsDir": "/tmp/prefs", "fileMode": 384}"#).unwrap();
        assert_eq!(settings.prefs_dir, PathBuf::from("/tmp/prefs"));
        assert_eq!(settings.file_mode, 0o600);
        assert_eq!(settings.default_document, "preferences.json");
    }

    #[test]
    fn test_invalid_file() {
        assert!(matches!(
            PrefsSettings::from_json(b"{\"fileMode\": \"rw\"}"),
            Err(PrefsError::Serialize(_))
        ));
    }

    #[test]
    fn test_path_for() {
        let settings = PrefsSettings::with_prefs_dir("/data");
        assert_eq!(settings.path_for(None), PathBuf::from("/data/preferences.json"));
        assert_eq!(
            settings.path_for(Some("network.json")),
            PathBuf::from("/data/network.json")
        );
        assert_eq!(
            settings.path_for(Some("/etc/other.json")),
            PathBuf::from("/etc/other.json")
        );
    }

    #[test]
    fn test_confined_path_for() {
        let settings = PrefsSettings::with_prefs_dir("/data");
        assert_eq!(
            settings.confined_path_for(Some("net/wifi.json")).unwrap(),
            PathBuf::from("/data/net/wifi.json")
        );
        assert_eq!(
            settings.confined_path_for(None).unwrap(),
            PathBuf::from("/data/preferences.json")
        );
        for id in ["/etc/passwd", "../outside.json", "net/../../x.json", ""] {
            assert!(
                matches!(
                    settings.confined_path_for(Some(id)),
                    Err(PrefsError::BadArgument(_))
                ),
                "{id} accepted"
            );
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/data/./net/../doc.json")).unwrap(),
            PathBuf::from("/data/doc.json")
        );
        assert_eq!(
            normalize_path(Path::new("/../doc.json")).unwrap(),
            PathBuf::from("/doc.json")
        );
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            normalize_path(Path::new("./doc.json")).unwrap(),
            cwd.join("doc.json")
        );
        assert!(matches!(
            normalize_path(Path::new("/")),
            Err(PrefsError::BadArgument(_))
        ));
    }
}
