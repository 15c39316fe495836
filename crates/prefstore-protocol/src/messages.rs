//! Helper channel commands, status codes and payloads.
//!
//! Every request is a command code plus an optional JSON payload; every
//! response is a status code plus an optional JSON payload. Failed
//! responses carry an [`ErrorReply`] describing the error.

use std::io;

use prefstore_core::{Mapping, PrefsError, Signature};
use serde::{Deserialize, Serialize};

/// Version carried in [`OpenRequest`]. The helper refuses other versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests understood by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Open = 1,
    Access = 2,
    Lock = 3,
    Commit = 4,
    Apply = 5,
    Unlock = 6,
    Close = 7,
    Synchronize = 8,

    SecretGet = 100,
    SecretSet = 101,
    SecretRemove = 102,

    Refresh = 200,

    Auth = 300,
    Exit = 999,
}

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Command> {
        let command = match code {
            1 => Command::Open,
            2 => Command::Access,
            3 => Command::Lock,
            4 => Command::Commit,
            5 => Command::Apply,
            6 => Command::Unlock,
            7 => Command::Close,
            8 => Command::Synchronize,
            100 => Command::SecretGet,
            101 => Command::SecretSet,
            102 => Command::SecretRemove,
            200 => Command::Refresh,
            300 => Command::Auth,
            999 => Command::Exit,
            _ => return None,
        };
        Some(command)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Open => "OPEN",
            Command::Access => "ACCESS",
            Command::Lock => "LOCK",
            Command::Commit => "COMMIT",
            Command::Apply => "APPLY",
            Command::Unlock => "UNLOCK",
            Command::Close => "CLOSE",
            Command::Synchronize => "SYNCHRONIZE",
            Command::SecretGet => "SECRET_GET",
            Command::SecretSet => "SECRET_SET",
            Command::SecretRemove => "SECRET_REMOVE",
            Command::Refresh => "REFRESH",
            Command::Auth => "AUTH",
            Command::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// I/O failure in the helper
    Failed = 1001,
    InvalidArgument = 1002,
    AccessError = 1003,
    NoKey = 1004,
    Locked = 1006,
    Serialize = 1010,
    Protocol = 1011,
    Interrupted = 1012,
    PrefsBusy = 3002,
    NoLink = 3004,
    Stale = 3005,
    MaxLink = 3006,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Status> {
        let status = match code {
            0 => Status::Ok,
            1001 => Status::Failed,
            1002 => Status::InvalidArgument,
            1003 => Status::AccessError,
            1004 => Status::NoKey,
            1006 => Status::Locked,
            1010 => Status::Serialize,
            1011 => Status::Protocol,
            1012 => Status::Interrupted,
            3002 => Status::PrefsBusy,
            3004 => Status::NoLink,
            3005 => Status::Stale,
            3006 => Status::MaxLink,
            _ => return None,
        };
        Some(status)
    }

    /// The status reported for `err`.
    pub fn for_error(err: &PrefsError) -> Status {
        match err {
            PrefsError::NotFound(_) => Status::NoKey,
            PrefsError::BadArgument(_) => Status::InvalidArgument,
            PrefsError::BadLink(_) => Status::NoLink,
            PrefsError::MaxLinksExceeded(_) => Status::MaxLink,
            PrefsError::AlreadyLocked => Status::Locked,
            PrefsError::Busy => Status::PrefsBusy,
            PrefsError::Stale => Status::Stale,
            PrefsError::AccessDenied => Status::AccessError,
            PrefsError::Io { .. } => Status::Failed,
            PrefsError::Serialize(_) => Status::Serialize,
            PrefsError::Protocol(_) => Status::Protocol,
            PrefsError::Interrupted => Status::Interrupted,
        }
    }

    /// Rebuild the error a failed status stands for. `Ok` has no error and
    /// yields `None`.
    pub fn into_error(self, message: String) -> Option<PrefsError> {
        let err = match self {
            Status::Ok => return None,
            Status::Failed => PrefsError::io_context(message, io::Error::other("helper I/O failure")),
            Status::InvalidArgument => PrefsError::BadArgument(message),
            Status::AccessError => PrefsError::AccessDenied,
            Status::NoKey => PrefsError::NotFound(message),
            Status::Locked => PrefsError::AlreadyLocked,
            Status::Serialize => PrefsError::Serialize(message),
            Status::Protocol => PrefsError::Protocol(message),
            Status::Interrupted => PrefsError::Interrupted,
            Status::PrefsBusy => PrefsError::Busy,
            Status::NoLink => PrefsError::BadLink(message),
            Status::Stale => PrefsError::Stale,
            Status::MaxLink => PrefsError::MaxLinksExceeded(message),
        };
        Some(err)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// `OPEN`: bind the connection to a session on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    pub version: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs_id: Option<String>,
}

impl OpenRequest {
    pub fn new(name: impl Into<String>, prefs_id: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            name: name.into(),
            prefs_id,
        }
    }
}

/// `ACCESS` reply: the document as the helper read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessReply {
    pub signature: Signature,
    pub tree: Mapping,
}

/// `LOCK` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub wait: bool,
    /// Signature the client last saw; the lock fails with `Stale` if the
    /// file changed since.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_signature: Option<Signature>,
}

/// `COMMIT` request. Without a tree the helper commits its own session
/// state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<Mapping>,
}

/// `COMMIT` reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitReply {
    pub signature: Signature,
}

/// `SECRET_GET` and `SECRET_REMOVE` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRequest {
    pub id: String,
}

/// `SECRET_SET` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretSetRequest {
    pub id: String,
    pub data: Vec<u8>,
}

/// `SECRET_GET` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretReply {
    pub data: Vec<u8>,
}

/// `REFRESH` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub resource: String,
}

/// `AUTH` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Payload of every non-`Ok` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

impl From<&PrefsError> for ErrorReply {
    fn from(err: &PrefsError) -> Self {
        // carry the detail only; the status restores the variant
        let message = match err {
            PrefsError::NotFound(m)
            | PrefsError::BadArgument(m)
            | PrefsError::BadLink(m)
            | PrefsError::MaxLinksExceeded(m)
            | PrefsError::Serialize(m)
            | PrefsError::Protocol(m) => m.clone(),
            other => other.to_string(),
        };
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use prefstore_core::Value;

    #[test]
    fn test_command_codes() {
        for command in [
            Command::Open,
            Command::Access,
            Command::Lock,
            Command::Commit,
            Command::Apply,
            Command::Unlock,
            Command::Close,
            Command::Synchronize,
            Command::SecretGet,
            Command::SecretSet,
            Command::SecretRemove,
            Command::Refresh,
            Command::Auth,
            Command::Exit,
        ] {
            assert_eq!(Command::from_code(command.code()), Some(command));
        }
        assert_eq!(Command::from_code(0), None);
        assert_eq!(Command::from_code(42), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let errors = vec![
            PrefsError::NotFound("/a".into()),
            PrefsError::BadArgument("bad".into()),
            PrefsError::BadLink("/l".into()),
            PrefsError::MaxLinksExceeded("/c".into()),
            PrefsError::AlreadyLocked,
            PrefsError::Busy,
            PrefsError::Stale,
            PrefsError::AccessDenied,
            PrefsError::Serialize("json".into()),
            PrefsError::Protocol("frame".into()),
            PrefsError::Interrupted,
        ];

        for err in errors {
            let status = Status::for_error(&err);
            assert_ne!(status, Status::Ok);
            assert_eq!(Status::from_code(status.code()), Some(status));

            let back = status.into_error(ErrorReply::from(&err).message).unwrap();
            assert_eq!(back.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_io_maps_to_failed() {
        let err = PrefsError::io_context("commit", io::Error::other("disk full"));
        let status = Status::for_error(&err);
        assert_eq!(status, Status::Failed);
        assert!(matches!(
            status.into_error("commit".into()),
            Some(PrefsError::Io { .. })
        ));
        assert!(Status::Ok.into_error(String::new()).is_none());
    }

    #[test]
    fn test_stale_and_busy_stay_distinct() {
        assert_ne!(
            Status::for_error(&PrefsError::Stale),
            Status::for_error(&PrefsError::Busy)
        );
        assert_ne!(
            Status::for_error(&PrefsError::Stale),
            Status::for_error(&PrefsError::io_context("x", io::Error::other("y")))
        );
    }

    #[test]
    fn test_open_request_json() {
        let request = OpenRequest::new("netconf", Some("network.json".into()));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"version": 1, "name": "netconf", "prefsId": "network.json"})
        );

        let bare = OpenRequest::new("netconf", None);
        assert!(serde_json::to_string(&bare).unwrap().find("prefsId").is_none());
    }

    #[test]
    fn test_access_reply_carries_links() {
        let mut tree = Mapping::new();
        tree.insert("Current".into(), Value::link("/Sets/0"));
        let reply = AccessReply {
            signature: Signature::ZERO,
            tree,
        };

        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("__LINK__"));
        let back: AccessReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
